//! Device-offload execution harness.
//!
//! A run resolves an accelerator, builds the kernel program, mirrors host
//! buffers into device memory, binds kernel arguments, dispatches once or
//! until a host hook stops the loop, times every dispatch and finally
//! compares outputs against reference arrays. Every acquired device resource
//! releases itself on drop, so a failure at any stage unwinds cleanly.
//!
//! Per-program behaviour lives in a [`KernelDescriptor`] (what to allocate,
//! bind and dispatch) and a [`Hooks`] implementation (what the host computes
//! between dispatches).

use std::path::PathBuf;

pub use offload_types::{
    AccessMode, ArgSpec, BufferSpec, DeviceSelector, DeviceType, Dialect, ElementType,
    ExecutionMode, KernelDescriptor, KernelSpec, LoadMode, Platform, ProgramSource, ScalarSpec,
    ScalarValue, WorkShape,
};

pub mod args;
pub mod backend;
pub mod buffer;
pub mod compare;
pub mod controller;
pub mod device;
mod harness;
pub mod profiler;
pub mod program;
pub mod spirv;
mod validation;

pub use backend::host::{HostBackend, HostLaunch, KernelRegistry, LedgerSnapshot};
pub use backend::wgpu::WgpuBackend;
#[cfg(feature = "opencl")]
pub use backend::opencl::OpenClBackend;
pub use backend::{Backend, DeviceInfo, KernelArg, SlotKind};
pub use buffer::{BufferSet, Element, HostArray, ScalarSet};
pub use compare::{Mismatch, ValidationReport, Value};
pub use controller::{Hooks, IterationState, NoHooks};
pub use harness::{launch, BackendChoice, Harness, RunReport, BACKEND_ENV};
pub use profiler::{ProfileReport, Profiler};
pub use validation::validate as validate_descriptor;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no accelerator platform available")]
    NoPlatformAvailable,

    #[error("no device available on the selected platform")]
    NoDeviceAvailable,

    #[error("device initialisation failed: {0}")]
    Device(String),

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid program binary: {0}")]
    InvalidBinary(String),

    #[error("program build failed: {0}")]
    BuildFailed(String),

    #[error("kernel `{0}` is not an entry point of the program")]
    UnresolvedKernel(String),

    #[error("cannot create kernel `{name}`: {reason}")]
    KernelCreation { name: String, reason: String },

    #[error("cannot allocate buffer `{name}` ({bytes} bytes): {reason}")]
    Allocation {
        name: String,
        bytes: usize,
        reason: String,
    },

    #[error("cannot bind slot {slot} of kernel `{kernel}`: {reason}")]
    Bind {
        kernel: String,
        slot: usize,
        reason: String,
    },

    #[error("transfer of buffer `{buffer}` failed: {reason}")]
    Transfer { buffer: String, reason: String },

    #[error("dispatch of kernel `{kernel}` failed: {reason}")]
    Dispatch { kernel: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{stage} hook failed: {reason}")]
    Hook { stage: &'static str, reason: String },

    #[error("aborted after {completed} completed iteration(s): {source}")]
    Aborted {
        completed: u64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The underlying failure, looking through [`Error::Aborted`].
    pub fn root(&self) -> &Error {
        match self {
            Error::Aborted { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
