//! Host arrays, their device mirrors and the blocking transfers between them.
//!
//! [`BufferSet`] is the host half: typed arrays addressed by name, plus the
//! optional reference arrays the validator compares against. Hooks only ever
//! see this half. [`DeviceMirrors`] is the device half, indexed identically
//! and owned by the harness for the duration of the offload.

use std::fmt;

use offload_types::{AccessMode, BufferSpec, ElementType, ScalarSpec, ScalarValue};
use tracing::debug;

use crate::backend::Backend;
use crate::device::AcceleratorContext;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum HostArray {
    U8(Vec<u8>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

impl HostArray {
    pub fn zeroed(element: ElementType, len: usize) -> Self {
        match element {
            ElementType::U8 => HostArray::U8(vec![0; len]),
            ElementType::I32 => HostArray::I32(vec![0; len]),
            ElementType::U32 => HostArray::U32(vec![0; len]),
            ElementType::F32 => HostArray::F32(vec![0.0; len]),
            ElementType::I64 => HostArray::I64(vec![0; len]),
            ElementType::F64 => HostArray::F64(vec![0.0; len]),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            HostArray::U8(_) => ElementType::U8,
            HostArray::I32(_) => ElementType::I32,
            HostArray::U32(_) => ElementType::U32,
            HostArray::F32(_) => ElementType::F32,
            HostArray::I64(_) => ElementType::I64,
            HostArray::F64(_) => ElementType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostArray::U8(v) => v.len(),
            HostArray::I32(v) => v.len(),
            HostArray::U32(v) => v.len(),
            HostArray::F32(v) => v.len(),
            HostArray::I64(v) => v.len(),
            HostArray::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HostArray::U8(v) => v,
            HostArray::I32(v) => bytemuck::cast_slice(v),
            HostArray::U32(v) => bytemuck::cast_slice(v),
            HostArray::F32(v) => bytemuck::cast_slice(v),
            HostArray::I64(v) => bytemuck::cast_slice(v),
            HostArray::F64(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            HostArray::U8(v) => v,
            HostArray::I32(v) => bytemuck::cast_slice_mut(v),
            HostArray::U32(v) => bytemuck::cast_slice_mut(v),
            HostArray::F32(v) => bytemuck::cast_slice_mut(v),
            HostArray::I64(v) => bytemuck::cast_slice_mut(v),
            HostArray::F64(v) => bytemuck::cast_slice_mut(v),
        }
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        T::slice_mut(self)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Element types a [`HostArray`] can hold.
pub trait Element: bytemuck::Pod + PartialEq + fmt::Display + sealed::Sealed {
    const TYPE: ElementType;

    fn slice(array: &HostArray) -> Option<&[Self]>;
    fn slice_mut(array: &mut HostArray) -> Option<&mut [Self]>;
}

macro_rules! element {
    ($ty:ty, $variant:ident) => {
        impl sealed::Sealed for $ty {}

        impl Element for $ty {
            const TYPE: ElementType = ElementType::$variant;

            fn slice(array: &HostArray) -> Option<&[Self]> {
                match array {
                    HostArray::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(array: &mut HostArray) -> Option<&mut [Self]> {
                match array {
                    HostArray::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

element!(u8, U8);
element!(i32, I32);
element!(u32, U32);
element!(f32, F32);
element!(i64, I64);
element!(f64, F64);

/// Host half of a managed buffer.
#[derive(Clone, Debug)]
pub struct HostBuffer {
    spec: BufferSpec,
    data: HostArray,
    reference: Option<HostArray>,
    touched: bool,
}

impl HostBuffer {
    fn new(spec: &BufferSpec) -> Self {
        Self {
            data: HostArray::zeroed(spec.element, spec.len),
            reference: spec
                .reference
                .then(|| HostArray::zeroed(spec.element, spec.len)),
            spec: spec.clone(),
            touched: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    pub fn access(&self) -> AccessMode {
        self.spec.access
    }

    pub fn data(&self) -> &HostArray {
        &self.data
    }

    pub fn reference(&self) -> Option<&HostArray> {
        self.reference.as_ref()
    }

    pub fn tolerance(&self) -> Option<f64> {
        self.spec.tolerance
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }
}

fn wrong_type(name: &str, held: ElementType, wanted: ElementType) -> Error {
    Error::InvalidConfig(format!(
        "buffer `{name}` holds {held:?} elements, not {wanted:?}"
    ))
}

/// Every host array of a run, addressed by name.
#[derive(Clone, Debug, Default)]
pub struct BufferSet {
    buffers: Vec<HostBuffer>,
    pending_swaps: Vec<(usize, usize)>,
}

impl BufferSet {
    pub fn from_specs(specs: &[BufferSpec]) -> Self {
        Self {
            buffers: specs.iter().map(HostBuffer::new).collect(),
            pending_swaps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostBuffer> {
        self.buffers.iter()
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.buffers
            .iter()
            .position(|b| b.spec.name == name)
            .ok_or_else(|| Error::InvalidConfig(format!("no buffer named `{name}`")))
    }

    pub fn get(&self, name: &str) -> Result<&HostBuffer> {
        let i = self.index_of(name)?;
        Ok(&self.buffers[i])
    }

    pub(crate) fn at(&self, index: usize) -> &HostBuffer {
        &self.buffers[index]
    }

    pub(crate) fn at_mut(&mut self, index: usize) -> &mut HostBuffer {
        &mut self.buffers[index]
    }

    pub fn slice<T: Element>(&self, name: &str) -> Result<&[T]> {
        let buf = self.get(name)?;
        buf.data
            .as_slice()
            .ok_or_else(|| wrong_type(name, buf.spec.element, T::TYPE))
    }

    /// Mutable host data. Marks the buffer touched so the next upload
    /// includes it.
    pub fn slice_mut<T: Element>(&mut self, name: &str) -> Result<&mut [T]> {
        let i = self.index_of(name)?;
        let buf = &mut self.buffers[i];
        let held = buf.spec.element;
        buf.touched = true;
        buf.data
            .as_mut_slice()
            .ok_or_else(|| wrong_type(name, held, T::TYPE))
    }

    pub fn reference<T: Element>(&self, name: &str) -> Result<&[T]> {
        let buf = self.get(name)?;
        let reference = buf
            .reference
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig(format!("buffer `{name}` has no reference array")))?;
        reference
            .as_slice()
            .ok_or_else(|| wrong_type(name, buf.spec.element, T::TYPE))
    }

    pub fn reference_mut<T: Element>(&mut self, name: &str) -> Result<&mut [T]> {
        let i = self.index_of(name)?;
        let buf = &mut self.buffers[i];
        let held = buf.spec.element;
        let reference = buf
            .reference
            .as_mut()
            .ok_or_else(|| Error::InvalidConfig(format!("buffer `{name}` has no reference array")))?;
        reference
            .as_mut_slice()
            .ok_or_else(|| wrong_type(name, held, T::TYPE))
    }

    pub fn f32(&self, name: &str) -> Result<&[f32]> {
        self.slice(name)
    }

    pub fn f32_mut(&mut self, name: &str) -> Result<&mut [f32]> {
        self.slice_mut(name)
    }

    pub fn u32(&self, name: &str) -> Result<&[u32]> {
        self.slice(name)
    }

    pub fn u32_mut(&mut self, name: &str) -> Result<&mut [u32]> {
        self.slice_mut(name)
    }

    pub fn i32(&self, name: &str) -> Result<&[i32]> {
        self.slice(name)
    }

    pub fn i32_mut(&mut self, name: &str) -> Result<&mut [i32]> {
        self.slice_mut(name)
    }

    /// Exchange the contents of two buffers (ping-pong). Reference arrays
    /// stay with their names; the device mirrors are exchanged before the
    /// next dispatch.
    pub fn swap(&mut self, a: &str, b: &str) -> Result<()> {
        let ia = self.index_of(a)?;
        let ib = self.index_of(b)?;
        if ia == ib {
            return Ok(());
        }
        let (sa, sb) = (&self.buffers[ia].spec, &self.buffers[ib].spec);
        if sa.element != sb.element || sa.len != sb.len || sa.access != sb.access {
            return Err(Error::InvalidConfig(format!(
                "cannot swap `{a}` and `{b}`: element type, length and access mode must match"
            )));
        }

        let (lo, hi) = (ia.min(ib), ia.max(ib));
        let (head, tail) = self.buffers.split_at_mut(hi);
        let (x, y) = (&mut head[lo], &mut tail[0]);
        std::mem::swap(&mut x.data, &mut y.data);
        std::mem::swap(&mut x.touched, &mut y.touched);
        self.pending_swaps.push((ia, ib));
        debug!(a = %a, b = %b, "buffers swapped");
        Ok(())
    }

    pub(crate) fn pending_swaps(&self) -> &[(usize, usize)] {
        &self.pending_swaps
    }

    pub(crate) fn take_pending_swaps(&mut self) -> Vec<(usize, usize)> {
        std::mem::take(&mut self.pending_swaps)
    }

    pub(crate) fn clear_touched(&mut self, index: usize) {
        self.buffers[index].touched = false;
    }
}

/// Scalar kernel arguments, addressed by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScalarSet {
    scalars: Vec<ScalarSpec>,
}

impl ScalarSet {
    pub fn from_specs(specs: &[ScalarSpec]) -> Self {
        Self {
            scalars: specs.to_vec(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScalarSpec> {
        self.scalars.iter()
    }

    pub fn get(&self, name: &str) -> Result<ScalarValue> {
        self.scalars
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.value)
            .ok_or_else(|| Error::InvalidConfig(format!("no scalar named `{name}`")))
    }

    /// Replace a scalar's value. The type is fixed by the descriptor.
    pub fn set(&mut self, name: &str, value: ScalarValue) -> Result<()> {
        let slot = self
            .scalars
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::InvalidConfig(format!("no scalar named `{name}`")))?;
        if std::mem::discriminant(&slot.value) != std::mem::discriminant(&value) {
            return Err(Error::InvalidConfig(format!(
                "scalar `{name}` is declared as {}, cannot assign {value}",
                slot.value
            )));
        }
        slot.value = value;
        Ok(())
    }

    pub fn u32(&self, name: &str) -> Result<u32> {
        match self.get(name)? {
            ScalarValue::U32(v) => Ok(v),
            other => Err(Error::InvalidConfig(format!("scalar `{name}` is {other}, not u32"))),
        }
    }

    pub fn i32(&self, name: &str) -> Result<i32> {
        match self.get(name)? {
            ScalarValue::I32(v) => Ok(v),
            other => Err(Error::InvalidConfig(format!("scalar `{name}` is {other}, not i32"))),
        }
    }

    pub fn f32(&self, name: &str) -> Result<f32> {
        match self.get(name)? {
            ScalarValue::F32(v) => Ok(v),
            other => Err(Error::InvalidConfig(format!("scalar `{name}` is {other}, not f32"))),
        }
    }
}

pub fn allocate<B: Backend>(backend: &B, context: &AcceleratorContext<B>, host: &HostBuffer) -> Result<B::Buffer> {
    let bytes = host.spec.byte_len();
    let buffer = backend.create_buffer(context.raw(), host.name(), bytes, host.access())?;
    debug!(buffer = host.name(), bytes, access = ?host.access(), "device buffer allocated");
    Ok(buffer)
}

pub fn upload<B: Backend>(
    backend: &B,
    context: &AcceleratorContext<B>,
    host: &HostBuffer,
    mirror: &mut B::Buffer,
) -> Result<()> {
    let queue = context.transfer_queue()?;
    backend.write_buffer(context.raw(), queue, mirror, host.data.as_bytes())?;
    debug!(buffer = host.name(), bytes = host.spec.byte_len(), "uploaded");
    Ok(())
}

pub fn download<B: Backend>(
    backend: &B,
    context: &AcceleratorContext<B>,
    mirror: &B::Buffer,
    host: &mut HostBuffer,
) -> Result<()> {
    let queue = context.transfer_queue()?;
    backend.read_buffer(context.raw(), queue, mirror, host.data.as_bytes_mut())?;
    debug!(buffer = %host.spec.name, bytes = host.spec.byte_len(), "downloaded");
    Ok(())
}

/// Device halves of a [`BufferSet`], same order.
pub struct DeviceMirrors<B: Backend> {
    mirrors: Vec<B::Buffer>,
}

impl<B: Backend> DeviceMirrors<B> {
    pub fn allocate(backend: &B, context: &AcceleratorContext<B>, buffers: &BufferSet) -> Result<Self> {
        let mut mirrors = Vec::with_capacity(buffers.len());
        for host in buffers.iter() {
            mirrors.push(allocate(backend, context, host)?);
        }
        Ok(Self { mirrors })
    }

    pub fn get(&self, index: usize) -> &B::Buffer {
        &self.mirrors[index]
    }

    pub fn upload(
        &mut self,
        backend: &B,
        context: &AcceleratorContext<B>,
        buffers: &mut BufferSet,
        index: usize,
    ) -> Result<()> {
        upload(backend, context, buffers.at(index), &mut self.mirrors[index])?;
        buffers.clear_touched(index);
        Ok(())
    }

    pub fn download(
        &self,
        backend: &B,
        context: &AcceleratorContext<B>,
        buffers: &mut BufferSet,
        index: usize,
    ) -> Result<()> {
        download(backend, context, &self.mirrors[index], buffers.at_mut(index))
    }

    /// Apply swaps the hooks made on the host side.
    pub fn apply_swaps(&mut self, buffers: &mut BufferSet) {
        for (a, b) in buffers.take_pending_swaps() {
            self.mirrors.swap(a, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec(name: &str, element: ElementType, access: AccessMode, reference: bool) -> BufferSpec {
        BufferSpec {
            name: name.into(),
            element,
            len: 4,
            access,
            reference,
            tolerance: None,
        }
    }

    #[test]
    fn test_mutable_access_marks_touched() {
        let mut set = BufferSet::from_specs(&[spec("a", ElementType::F32, AccessMode::ReadOnly, false)]);
        assert!(!set.get("a").unwrap().is_touched());
        set.f32("a").unwrap();
        assert!(!set.get("a").unwrap().is_touched());
        set.f32_mut("a").unwrap()[0] = 1.5;
        assert!(set.get("a").unwrap().is_touched());
        assert_eq!(set.f32("a").unwrap(), &[1.5, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_typed_access_rejects_wrong_type() {
        let mut set = BufferSet::from_specs(&[spec("a", ElementType::U32, AccessMode::ReadOnly, false)]);
        assert!(matches!(set.f32("a"), Err(Error::InvalidConfig(_))));
        assert!(matches!(set.i32_mut("a"), Err(Error::InvalidConfig(_))));
        assert!(matches!(set.u32("missing"), Err(Error::InvalidConfig(_))));
        assert!(matches!(set.reference::<u32>("a"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_swap_keeps_references_with_names() {
        let mut set = BufferSet::from_specs(&[
            spec("src", ElementType::F32, AccessMode::ReadWrite, true),
            spec("dst", ElementType::F32, AccessMode::ReadWrite, false),
        ]);
        set.f32_mut("src").unwrap().fill(1.0);
        set.f32_mut("dst").unwrap().fill(2.0);
        set.reference_mut::<f32>("src").unwrap().fill(9.0);
        set.swap("src", "dst").unwrap();

        assert_eq!(set.f32("src").unwrap(), &[2.0; 4]);
        assert_eq!(set.f32("dst").unwrap(), &[1.0; 4]);
        assert_eq!(set.reference::<f32>("src").unwrap(), &[9.0; 4]);
        assert_eq!(set.take_pending_swaps(), vec![(0, 1)]);
    }

    proptest! {
        #[test]
        fn test_repeated_swaps_track_contents(pairs in prop::collection::vec((0usize..3, 0usize..3), 0..12)) {
            let names = ["p", "q", "r"];
            let mut set = BufferSet::from_specs(
                &names.map(|n| spec(n, ElementType::F32, AccessMode::ReadWrite, false)),
            );
            for (i, n) in names.iter().enumerate() {
                set.f32_mut(n).unwrap().fill(i as f32);
            }
            let mut model = [0.0f32, 1.0, 2.0];
            for &(a, b) in &pairs {
                set.swap(names[a], names[b]).unwrap();
                model.swap(a, b);
            }
            for (i, n) in names.iter().enumerate() {
                prop_assert_eq!(set.f32(n).unwrap(), &[model[i]; 4]);
            }
            let recorded = set.take_pending_swaps().len();
            prop_assert_eq!(recorded, pairs.iter().filter(|(a, b)| a != b).count());
        }
    }

    #[test]
    fn test_swap_requires_matching_layout() {
        let mut set = BufferSet::from_specs(&[
            spec("a", ElementType::F32, AccessMode::ReadWrite, false),
            spec("b", ElementType::F32, AccessMode::WriteOnly, false),
        ]);
        assert!(matches!(set.swap("a", "b"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_scalar_set_keeps_declared_type() {
        let mut scalars = ScalarSet::from_specs(&[ScalarSpec {
            name: "n".into(),
            value: ScalarValue::U32(3),
        }]);
        scalars.set("n", ScalarValue::U32(7)).unwrap();
        assert_eq!(scalars.u32("n").unwrap(), 7);
        assert!(matches!(scalars.set("n", ScalarValue::F32(1.0)), Err(Error::InvalidConfig(_))));
        assert!(matches!(scalars.f32("n"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_byte_views_match_element_size() {
        let array = HostArray::zeroed(ElementType::F64, 3);
        assert_eq!(array.as_bytes().len(), 24);
        assert_eq!(array.element_type(), ElementType::F64);
    }
}
