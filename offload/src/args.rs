//! Argument binding: positional kernel slots to buffers, scalars or local
//! scratch.

use offload_types::{ArgSpec, KernelDescriptor, KernelSpec, ScalarValue};
use tracing::debug;

use crate::backend::{Backend, KernelArg, SlotKind};
use crate::buffer::{BufferSet, DeviceMirrors, ScalarSet};
use crate::program::KernelHandle;
use crate::{Error, Result};

/// A value ready to be bound to one slot.
pub enum ArgValue<'a, B: Backend> {
    Buffer(&'a B::Buffer),
    Scalar(ScalarValue),
    Local(usize),
}

/// Slot layout of `kernel` as declared by the descriptor.
pub fn slot_kinds(descriptor: &KernelDescriptor, kernel: &KernelSpec) -> Result<Vec<SlotKind>> {
    kernel
        .args
        .iter()
        .map(|arg| match arg {
            ArgSpec::Buffer { name } => descriptor
                .buffer(name)
                .map(|b| SlotKind::Buffer { access: b.access })
                .ok_or_else(|| Error::InvalidConfig(format!("kernel `{}` binds unknown buffer `{name}`", kernel.name))),
            ArgSpec::Scalar { name } => descriptor
                .scalar(name)
                .map(|s| SlotKind::Scalar { bytes: s.value.size() })
                .ok_or_else(|| Error::InvalidConfig(format!("kernel `{}` binds unknown scalar `{name}`", kernel.name))),
            ArgSpec::Local { bytes } => Ok(SlotKind::Local { bytes: *bytes }),
        })
        .collect()
}

/// Bind one slot. Binding the same value twice is harmless.
pub fn bind<B: Backend>(backend: &B, kernel: &mut KernelHandle<B>, slot: usize, value: ArgValue<'_, B>) -> Result<()> {
    let bind_error = |reason: String| Error::Bind {
        kernel: kernel.name().to_string(),
        slot,
        reason,
    };

    let declared = *kernel
        .slots()
        .get(slot)
        .ok_or_else(|| bind_error(format!("kernel has {} slot(s)", kernel.slots().len())))?;

    let arg = match (declared, value) {
        (SlotKind::Buffer { .. }, ArgValue::Buffer(buffer)) => KernelArg::Buffer(buffer),
        (SlotKind::Scalar { bytes }, ArgValue::Scalar(v)) if v.size() == bytes => KernelArg::Scalar(v),
        (SlotKind::Scalar { bytes }, ArgValue::Scalar(v)) => {
            return Err(bind_error(format!("{bytes}-byte scalar slot given {v}")));
        }
        (SlotKind::Local { bytes }, ArgValue::Local(n)) if n == bytes => KernelArg::Local(n),
        (SlotKind::Local { bytes }, ArgValue::Local(n)) => {
            return Err(bind_error(format!("{bytes}-byte local slot given {n} bytes")));
        }
        (declared, value) => {
            return Err(bind_error(format!(
                "{} slot given a {}",
                declared.describe(),
                value.describe()
            )));
        }
    };

    backend.set_arg(&mut kernel.raw, slot, arg)?;
    debug!(kernel = kernel.name(), slot, kind = declared.describe(), "bound");
    Ok(())
}

impl<B: Backend> ArgValue<'_, B> {
    fn describe(&self) -> &'static str {
        match self {
            ArgValue::Buffer(_) => "buffer",
            ArgValue::Scalar(_) => "scalar",
            ArgValue::Local(_) => "local scratch",
        }
    }
}

/// Bind every slot of `kernel` from the current host state.
pub fn bind_all<B: Backend>(
    backend: &B,
    kernel: &mut KernelHandle<B>,
    spec: &KernelSpec,
    buffers: &BufferSet,
    mirrors: &DeviceMirrors<B>,
    scalars: &ScalarSet,
) -> Result<()> {
    for (slot, arg) in spec.args.iter().enumerate() {
        let value = match arg {
            ArgSpec::Buffer { name } => ArgValue::Buffer(mirrors.get(buffers.index_of(name)?)),
            ArgSpec::Scalar { name } => ArgValue::Scalar(scalars.get(name)?),
            ArgSpec::Local { bytes } => ArgValue::Local(*bytes),
        };
        bind(backend, kernel, slot, value)?;
    }
    Ok(())
}
