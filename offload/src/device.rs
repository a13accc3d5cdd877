use offload_types::{DeviceSelector, KernelSpec};
use tracing::{info, info_span};

use crate::backend::{Backend, DeviceInfo};
use crate::{Error, Result};

/// The selected device, its context and one command queue per kernel.
///
/// Fields drop in declaration order, so every queue is released before the
/// context it was created on.
pub struct AcceleratorContext<B: Backend> {
    queues: Vec<(String, B::Queue)>,
    raw: B::Context,
    info: DeviceInfo,
}

impl<B: Backend> AcceleratorContext<B> {
    pub fn raw(&self) -> &B::Context {
        &self.raw
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Queue belonging to the kernel at position `index`.
    pub fn queue(&self, index: usize) -> Result<&B::Queue> {
        self.queues
            .get(index)
            .map(|(_, q)| q)
            .ok_or_else(|| Error::InvalidConfig(format!("no command queue for kernel #{index}")))
    }

    /// Queue used for buffer transfers.
    pub fn transfer_queue(&self) -> Result<&B::Queue> {
        self.queue(0)
    }
}

pub fn resolve_device<B: Backend>(
    backend: &B,
    selector: &DeviceSelector,
    kernels: &[KernelSpec],
) -> Result<AcceleratorContext<B>> {
    let _span = info_span!("resolve_device", backend = backend.name()).entered();

    let (raw, info) = backend.resolve_device(selector)?;
    info!(
        platform = ?info.platform,
        device = %info.name,
        device_type = ?info.device_type,
        "device selected"
    );

    let mut queues = Vec::with_capacity(kernels.len());
    for kernel in kernels {
        let queue = backend.create_queue(&raw, &kernel.name)?;
        queues.push((kernel.name.clone(), queue));
    }

    Ok(AcceleratorContext { queues, raw, info })
}
