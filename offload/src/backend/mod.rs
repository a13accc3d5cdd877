//! The accelerator seam.
//!
//! A [`Backend`] hands out five kinds of resources: a device context, command
//! queues, programs, kernels and buffers. Each associated type owns its
//! underlying handle and releases it on drop, so the harness never frees
//! anything by hand.

use offload_types::{AccessMode, DeviceSelector, DeviceType, Dialect, Platform, ScalarValue, WorkShape};

use crate::program::ProgramImage;
use crate::Result;

pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod wgpu;

/// Declared kind of one positional kernel parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotKind {
    Buffer { access: AccessMode },
    Scalar { bytes: usize },
    Local { bytes: usize },
}

impl SlotKind {
    pub fn describe(&self) -> &'static str {
        match self {
            SlotKind::Buffer { .. } => "buffer",
            SlotKind::Scalar { .. } => "scalar",
            SlotKind::Local { .. } => "local scratch",
        }
    }
}

/// A value bound to a kernel slot.
pub enum KernelArg<'a, B: Backend + ?Sized> {
    Buffer(&'a B::Buffer),
    Scalar(ScalarValue),
    Local(usize),
}

impl<B: Backend + ?Sized> KernelArg<'_, B> {
    pub fn describe(&self) -> &'static str {
        match self {
            KernelArg::Buffer(_) => "buffer",
            KernelArg::Scalar(_) => "scalar",
            KernelArg::Local(_) => "local scratch",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub platform: Platform,
    pub name: String,
    pub device_type: DeviceType,
}

pub trait Backend {
    type Context;
    type Queue;
    type Program;
    type Kernel;
    type Buffer;

    fn name(&self) -> &'static str;

    /// Whether programs in `dialect` can be built by this backend.
    fn accepts(&self, dialect: Dialect) -> bool;

    /// Pick a platform and device according to `selector` and open a context
    /// on it.
    fn resolve_device(&self, selector: &DeviceSelector) -> Result<(Self::Context, DeviceInfo)>;

    fn create_queue(&self, context: &Self::Context, label: &str) -> Result<Self::Queue>;

    fn build_program(&self, context: &Self::Context, image: &ProgramImage) -> Result<Self::Program>;

    fn entry_points(&self, program: &Self::Program) -> Vec<String>;

    fn create_kernel(
        &self,
        context: &Self::Context,
        program: &Self::Program,
        name: &str,
        slots: &[SlotKind],
    ) -> Result<Self::Kernel>;

    fn create_buffer(
        &self,
        context: &Self::Context,
        label: &str,
        bytes: usize,
        access: AccessMode,
    ) -> Result<Self::Buffer>;

    /// Blocking write of the whole buffer.
    fn write_buffer(
        &self,
        context: &Self::Context,
        queue: &Self::Queue,
        buffer: &mut Self::Buffer,
        data: &[u8],
    ) -> Result<()>;

    /// Blocking read of the whole buffer.
    fn read_buffer(
        &self,
        context: &Self::Context,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        out: &mut [u8],
    ) -> Result<()>;

    fn set_arg(&self, kernel: &mut Self::Kernel, slot: usize, arg: KernelArg<'_, Self>) -> Result<()>;

    /// Enqueue `kernel` over `work` and block until it completes.
    fn dispatch(
        &self,
        context: &Self::Context,
        queue: &Self::Queue,
        kernel: &mut Self::Kernel,
        work: &WorkShape,
    ) -> Result<()>;
}
