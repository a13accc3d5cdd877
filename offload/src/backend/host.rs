//! Reference accelerator running registered Rust functions as kernels.
//!
//! Device memory is plain host memory kept 8-byte aligned, so kernels can
//! view any buffer as a typed slice. A shared ledger counts every live
//! resource, which is how tests check that nothing outlives a run.

use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use offload_types::{AccessMode, DeviceSelector, DeviceType, Dialect, Platform, ScalarValue, WorkShape};
use tracing::debug;

use super::{Backend, DeviceInfo, KernelArg, SlotKind};
use crate::program::{check_delimiters, opencl_entry_points, wgsl_entry_points, ProgramImage};
use crate::{spirv, Error, Result};

pub type HostKernelFn = Arc<dyn Fn(&HostLaunch<'_>) -> Result<()> + Send + Sync>;

/// Host implementations of kernels, by entry-point name.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, HostKernelFn>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, kernel: F) -> &mut Self
    where
        F: Fn(&HostLaunch<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.into(), Arc::new(kernel));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(&HostLaunch<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(name, kernel);
        self
    }

    /// Merge another registry's kernels into this one.
    pub fn extend(&mut self, other: KernelRegistry) {
        self.kernels.extend(other.kernels);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }
}

#[derive(Default)]
struct Counts {
    contexts: AtomicUsize,
    queues: AtomicUsize,
    programs: AtomicUsize,
    kernels: AtomicUsize,
    buffers: AtomicUsize,
    bytes: AtomicUsize,
}

#[derive(Copy, Clone, Debug)]
enum Resource {
    Context,
    Queue,
    Program,
    Kernel,
    Buffer,
}

#[derive(Clone, Default)]
struct Ledger(Arc<Counts>);

impl Ledger {
    fn counter(&self, resource: Resource) -> &AtomicUsize {
        match resource {
            Resource::Context => &self.0.contexts,
            Resource::Queue => &self.0.queues,
            Resource::Program => &self.0.programs,
            Resource::Kernel => &self.0.kernels,
            Resource::Buffer => &self.0.buffers,
        }
    }

    fn track(&self, resource: Resource, bytes: usize) -> Tracked {
        self.counter(resource).fetch_add(1, Ordering::Relaxed);
        self.0.bytes.fetch_add(bytes, Ordering::Relaxed);
        Tracked {
            ledger: self.clone(),
            resource,
            bytes,
        }
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            contexts: self.0.contexts.load(Ordering::Relaxed),
            queues: self.0.queues.load(Ordering::Relaxed),
            programs: self.0.programs.load(Ordering::Relaxed),
            kernels: self.0.kernels.load(Ordering::Relaxed),
            buffers: self.0.buffers.load(Ordering::Relaxed),
            bytes: self.0.bytes.load(Ordering::Relaxed),
        }
    }
}

struct Tracked {
    ledger: Ledger,
    resource: Resource,
    bytes: usize,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.ledger.counter(self.resource).fetch_sub(1, Ordering::Relaxed);
        self.ledger.0.bytes.fetch_sub(self.bytes, Ordering::Relaxed);
        debug!(resource = ?self.resource, "host resource released");
    }
}

/// Live host resources at one point in time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub contexts: usize,
    pub queues: usize,
    pub programs: usize,
    pub kernels: usize,
    pub buffers: usize,
    pub bytes: usize,
}

impl LedgerSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == LedgerSnapshot::default()
    }
}

pub struct HostBackend {
    registry: KernelRegistry,
    ledger: Ledger,
    capacity: Option<usize>,
}

impl HostBackend {
    pub fn new(registry: KernelRegistry) -> Self {
        Self {
            registry,
            ledger: Ledger::default(),
            capacity: None,
        }
    }

    /// Limit total live device memory to `bytes`.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }
}

pub struct HostContext {
    _tracked: Tracked,
}

pub struct HostQueue {
    label: String,
    _tracked: Tracked,
}

impl HostQueue {
    pub fn label(&self) -> &str {
        &self.label
    }
}

pub struct HostProgram {
    entry_points: Vec<String>,
    _tracked: Tracked,
}

struct DeviceMemory {
    words: Vec<u64>,
    len: usize,
    _tracked: Tracked,
}

impl DeviceMemory {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

pub struct HostBuffer {
    label: String,
    access: AccessMode,
    memory: Rc<RefCell<DeviceMemory>>,
}

impl HostBuffer {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn len(&self) -> usize {
        self.memory.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
enum HostArg {
    Buffer(Rc<RefCell<DeviceMemory>>),
    Scalar(ScalarValue),
    Local(usize),
}

pub struct HostKernel {
    name: String,
    func: HostKernelFn,
    slots: Vec<SlotKind>,
    args: Vec<Option<HostArg>>,
    _tracked: Tracked,
}

impl HostKernel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What a host kernel sees while it runs: its bound arguments and the work
/// shape.
pub struct HostLaunch<'a> {
    kernel: &'a str,
    args: &'a [Option<HostArg>],
    work: &'a WorkShape,
}

impl<'a> HostLaunch<'a> {
    fn fail(&self, reason: String) -> Error {
        Error::Dispatch {
            kernel: self.kernel.to_string(),
            reason,
        }
    }

    fn arg(&self, slot: usize) -> Result<&'a HostArg> {
        let args: &'a [Option<HostArg>] = self.args;
        args.get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| self.fail(format!("slot {slot} is not bound")))
    }

    pub fn global(&self) -> &[usize] {
        &self.work.global
    }

    pub fn local(&self) -> Vec<usize> {
        self.work.local_or_unit()
    }

    pub fn invocations(&self) -> usize {
        self.work.invocations()
    }

    /// Typed view of the buffer bound to `slot`. The view is exclusive
    /// while held.
    pub fn buffer<T: bytemuck::Pod>(&self, slot: usize) -> Result<RefMut<'a, [T]>> {
        let HostArg::Buffer(memory) = self.arg(slot)? else {
            return Err(self.fail(format!("slot {slot} is not a buffer")));
        };
        let guard = memory
            .try_borrow_mut()
            .map_err(|_| self.fail(format!("buffer in slot {slot} is already in use")))?;
        RefMut::filter_map(guard, |m| bytemuck::try_cast_slice_mut::<u8, T>(m.bytes_mut()).ok()).map_err(|_| {
            self.fail(format!(
                "buffer in slot {slot} is not a whole number of {}",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn scalar(&self, slot: usize) -> Result<ScalarValue> {
        match self.arg(slot)? {
            HostArg::Scalar(v) => Ok(*v),
            _ => Err(self.fail(format!("slot {slot} is not a scalar"))),
        }
    }

    pub fn u32(&self, slot: usize) -> Result<u32> {
        match self.scalar(slot)? {
            ScalarValue::U32(v) => Ok(v),
            other => Err(self.fail(format!("slot {slot} holds {other}, not u32"))),
        }
    }

    pub fn i32(&self, slot: usize) -> Result<i32> {
        match self.scalar(slot)? {
            ScalarValue::I32(v) => Ok(v),
            other => Err(self.fail(format!("slot {slot} holds {other}, not i32"))),
        }
    }

    pub fn f32(&self, slot: usize) -> Result<f32> {
        match self.scalar(slot)? {
            ScalarValue::F32(v) => Ok(v),
            other => Err(self.fail(format!("slot {slot} holds {other}, not f32"))),
        }
    }

    pub fn local_bytes(&self, slot: usize) -> Result<usize> {
        match self.arg(slot)? {
            HostArg::Local(n) => Ok(*n),
            _ => Err(self.fail(format!("slot {slot} is not local scratch"))),
        }
    }
}

impl Backend for HostBackend {
    type Context = HostContext;
    type Queue = HostQueue;
    type Program = HostProgram;
    type Kernel = HostKernel;
    type Buffer = HostBuffer;

    fn name(&self) -> &'static str {
        "host"
    }

    fn accepts(&self, dialect: Dialect) -> bool {
        !matches!(dialect, Dialect::ClBinary)
    }

    fn resolve_device(&self, selector: &DeviceSelector) -> Result<(HostContext, DeviceInfo)> {
        let platforms: Vec<Platform> = selector
            .platforms()
            .iter()
            .copied()
            .filter(|p| *p == Platform::Host)
            .collect();
        if platforms.get(selector.platform_index).is_none() {
            return Err(Error::NoPlatformAvailable);
        }
        if !matches!(selector.device_type, DeviceType::Any | DeviceType::Cpu) || selector.device_index != 0 {
            return Err(Error::NoDeviceAvailable);
        }
        let context = HostContext {
            _tracked: self.ledger.track(Resource::Context, 0),
        };
        let info = DeviceInfo {
            platform: Platform::Host,
            name: "host reference device".into(),
            device_type: DeviceType::Cpu,
        };
        Ok((context, info))
    }

    fn create_queue(&self, _context: &HostContext, label: &str) -> Result<HostQueue> {
        Ok(HostQueue {
            label: label.to_string(),
            _tracked: self.ledger.track(Resource::Queue, 0),
        })
    }

    fn build_program(&self, _context: &HostContext, image: &ProgramImage) -> Result<HostProgram> {
        let entry_points = match image.dialect {
            Dialect::Wgsl => {
                let text = image.text()?;
                check_delimiters(text)?;
                wgsl_entry_points(text)
            }
            Dialect::OpenClC => {
                let text = image.text()?;
                check_delimiters(text)?;
                opencl_entry_points(text)
            }
            Dialect::SpirV => spirv::parse(&image.bytes)?.entry_point_names(),
            Dialect::ClBinary => {
                return Err(Error::InvalidBinary(
                    "the host backend cannot load OpenCL device binaries".into(),
                ))
            }
        };
        Ok(HostProgram {
            entry_points,
            _tracked: self.ledger.track(Resource::Program, 0),
        })
    }

    fn entry_points(&self, program: &HostProgram) -> Vec<String> {
        program.entry_points.clone()
    }

    fn create_kernel(
        &self,
        _context: &HostContext,
        _program: &HostProgram,
        name: &str,
        slots: &[SlotKind],
    ) -> Result<HostKernel> {
        let func = self
            .registry
            .kernels
            .get(name)
            .cloned()
            .ok_or_else(|| Error::KernelCreation {
                name: name.to_string(),
                reason: "no host implementation registered".into(),
            })?;
        Ok(HostKernel {
            name: name.to_string(),
            func,
            slots: slots.to_vec(),
            args: vec![None; slots.len()],
            _tracked: self.ledger.track(Resource::Kernel, 0),
        })
    }

    fn create_buffer(&self, _context: &HostContext, label: &str, bytes: usize, access: AccessMode) -> Result<HostBuffer> {
        let fail = |reason: String| Error::Allocation {
            name: label.to_string(),
            bytes,
            reason,
        };
        if bytes == 0 {
            return Err(fail("zero-sized allocation".into()));
        }
        if let Some(capacity) = self.capacity {
            let live = self.ledger.snapshot().bytes;
            if live.saturating_add(bytes) > capacity {
                return Err(fail(format!(
                    "{live} of {capacity} bytes already in use"
                )));
            }
        }
        let n = bytes.div_ceil(8);
        let mut words = Vec::new();
        words
            .try_reserve_exact(n)
            .map_err(|e| fail(e.to_string()))?;
        words.resize(n, 0u64);
        Ok(HostBuffer {
            label: label.to_string(),
            access,
            memory: Rc::new(RefCell::new(DeviceMemory {
                words,
                len: bytes,
                _tracked: self.ledger.track(Resource::Buffer, bytes),
            })),
        })
    }

    fn write_buffer(&self, _context: &HostContext, _queue: &HostQueue, buffer: &mut HostBuffer, data: &[u8]) -> Result<()> {
        let fail = |reason: String| Error::Transfer {
            buffer: buffer.label.clone(),
            reason,
        };
        let mut memory = buffer
            .memory
            .try_borrow_mut()
            .map_err(|_| fail("buffer is in use".into()))?;
        if memory.len != data.len() {
            return Err(fail(format!("{} bytes written to a {}-byte buffer", data.len(), memory.len)));
        }
        memory.bytes_mut().copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, _context: &HostContext, _queue: &HostQueue, buffer: &HostBuffer, out: &mut [u8]) -> Result<()> {
        let fail = |reason: String| Error::Transfer {
            buffer: buffer.label.clone(),
            reason,
        };
        let memory = buffer
            .memory
            .try_borrow()
            .map_err(|_| fail("buffer is in use".into()))?;
        if memory.len != out.len() {
            return Err(fail(format!("{}-byte buffer read into {} bytes", memory.len, out.len())));
        }
        out.copy_from_slice(memory.bytes());
        Ok(())
    }

    fn set_arg(&self, kernel: &mut HostKernel, slot: usize, arg: KernelArg<'_, Self>) -> Result<()> {
        if slot >= kernel.slots.len() {
            return Err(Error::Bind {
                kernel: kernel.name.clone(),
                slot,
                reason: format!("kernel has {} slot(s)", kernel.slots.len()),
            });
        }
        kernel.args[slot] = Some(match arg {
            KernelArg::Buffer(buffer) => HostArg::Buffer(Rc::clone(&buffer.memory)),
            KernelArg::Scalar(value) => HostArg::Scalar(value),
            KernelArg::Local(bytes) => HostArg::Local(bytes),
        });
        Ok(())
    }

    fn dispatch(&self, _context: &HostContext, _queue: &HostQueue, kernel: &mut HostKernel, work: &WorkShape) -> Result<()> {
        if let Some(slot) = kernel.args.iter().position(Option::is_none) {
            return Err(Error::Dispatch {
                kernel: kernel.name.clone(),
                reason: format!("slot {slot} is not bound"),
            });
        }
        let func = Arc::clone(&kernel.func);
        let launch = HostLaunch {
            kernel: &kernel.name,
            args: &kernel.args,
            work,
        };
        func(&launch).map_err(|e| match e {
            Error::Dispatch { .. } => e,
            other => Error::Dispatch {
                kernel: kernel.name.clone(),
                reason: other.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn backend() -> HostBackend {
        HostBackend::new(KernelRegistry::new().with("double", |launch: &HostLaunch<'_>| {
            let mut data = launch.buffer::<f32>(0)?;
            for x in data.iter_mut() {
                *x *= 2.0;
            }
            Ok(())
        }))
    }

    fn image(dialect: Dialect, text: &str) -> ProgramImage {
        ProgramImage {
            dialect,
            mode: dialect.load_mode(),
            path: PathBuf::from("inline"),
            bytes: text.as_bytes().to_vec(),
            build_options: String::new(),
        }
    }

    #[test]
    fn test_selector_filters_platform_and_type() {
        let b = backend();
        let mut selector = DeviceSelector::default();
        assert!(b.resolve_device(&selector).is_ok());

        selector.platforms = vec![Platform::Vulkan];
        assert!(matches!(b.resolve_device(&selector), Err(Error::NoPlatformAvailable)));

        selector.platforms = vec![Platform::Host];
        selector.device_type = DeviceType::Gpu;
        assert!(matches!(b.resolve_device(&selector), Err(Error::NoDeviceAvailable)));
        assert!(b.ledger().is_empty());
    }

    #[test]
    fn test_round_trip_and_dispatch() {
        let b = backend();
        let (ctx, _) = b.resolve_device(&DeviceSelector::default()).unwrap();
        let queue = b.create_queue(&ctx, "double").unwrap();
        let program = b
            .build_program(&ctx, &image(Dialect::Wgsl, "@compute @workgroup_size(1) fn double() {}"))
            .unwrap();
        assert_eq!(b.entry_points(&program), vec!["double"]);

        let slots = [SlotKind::Buffer { access: AccessMode::ReadWrite }];
        let mut kernel = b.create_kernel(&ctx, &program, "double", &slots).unwrap();
        let mut buf = b.create_buffer(&ctx, "data", 12, AccessMode::ReadWrite).unwrap();
        let input: Vec<u8> = [1.0f32, 2.0, 3.5].iter().flat_map(|v| v.to_le_bytes()).collect();
        b.write_buffer(&ctx, &queue, &mut buf, &input).unwrap();

        assert!(matches!(
            b.dispatch(&ctx, &queue, &mut kernel, &WorkShape::linear(3, None)),
            Err(Error::Dispatch { .. })
        ));
        b.set_arg(&mut kernel, 0, KernelArg::Buffer(&buf)).unwrap();
        b.dispatch(&ctx, &queue, &mut kernel, &WorkShape::linear(3, None)).unwrap();

        let mut out = vec![0u8; 12];
        b.read_buffer(&ctx, &queue, &buf, &mut out).unwrap();
        let values: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![2.0, 4.0, 7.0]);

        let live = b.ledger();
        assert_eq!((live.contexts, live.queues, live.programs, live.kernels, live.buffers), (1, 1, 1, 1, 1));
        drop((kernel, buf, program, queue, ctx));
        assert!(b.ledger().is_empty());
    }

    #[test]
    fn test_capacity_limit_fails_allocation() {
        let b = backend().with_capacity(64);
        let (ctx, _) = b.resolve_device(&DeviceSelector::default()).unwrap();
        let first = b.create_buffer(&ctx, "a", 48, AccessMode::ReadOnly).unwrap();
        assert!(matches!(
            b.create_buffer(&ctx, "b", 32, AccessMode::ReadOnly),
            Err(Error::Allocation { .. })
        ));
        drop(first);
        assert!(b.create_buffer(&ctx, "b", 32, AccessMode::ReadOnly).is_ok());
    }

    #[test]
    fn test_program_checks() {
        let b = backend();
        let (ctx, _) = b.resolve_device(&DeviceSelector::default()).unwrap();
        assert!(matches!(
            b.build_program(&ctx, &image(Dialect::OpenClC, "__kernel void k(global float* x) {")),
            Err(Error::BuildFailed(_))
        ));
        let mut bad = image(Dialect::OpenClC, "");
        bad.bytes = vec![0xff, 0xfe, 0x00];
        assert!(matches!(b.build_program(&ctx, &bad), Err(Error::BuildFailed(_))));

        let program = b
            .build_program(&ctx, &image(Dialect::OpenClC, "__kernel void other(global float* x) {}"))
            .unwrap();
        assert!(matches!(
            b.create_kernel(&ctx, &program, "other", &[]),
            Err(Error::KernelCreation { .. })
        ));
    }
}
