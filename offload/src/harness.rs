use std::fmt;

use offload_types::KernelDescriptor;
use quanta::Clock;
use tracing::{info, info_span};

use crate::args::slot_kinds;
use crate::backend::host::{HostBackend, KernelRegistry};
use crate::backend::wgpu::WgpuBackend;
use crate::backend::{Backend, DeviceInfo};
use crate::buffer::{BufferSet, DeviceMirrors, ScalarSet};
use crate::compare::{self, ValidationReport};
use crate::controller::{Hooks, IterationController, IterationState, Outcome};
use crate::device::{resolve_device, AcceleratorContext};
use crate::profiler::ProfileReport;
use crate::program::{load_program, KernelHandle};
use crate::validation::validate;
use crate::{Error, Result};

pub const BACKEND_ENV: &str = "OFFLOAD_BACKEND";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BackendChoice {
    Host,
    #[default]
    Wgpu,
    OpenCl,
}

impl BackendChoice {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(BackendChoice::Host),
            "wgpu" => Ok(BackendChoice::Wgpu),
            "opencl" => Ok(BackendChoice::OpenCl),
            other => Err(Error::InvalidConfig(format!(
                "{BACKEND_ENV}={other}: expected host, wgpu or opencl"
            ))),
        }
    }

    /// Backend named by `OFFLOAD_BACKEND`, wgpu when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(BACKEND_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub descriptor: String,
    pub backend: &'static str,
    pub device: DeviceInfo,
    pub state: IterationState,
    pub profile: ProfileReport,
    pub validation: ValidationReport,
    pub buffers: BufferSet,
    pub scalars: ScalarSet,
}

impl RunReport {
    pub fn iterations(&self) -> u64 {
        self.state.iteration
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} on {} ({}, {:?})",
            self.descriptor, self.device.name, self.backend, self.device.platform
        )?;
        writeln!(f, "  dispatch: {}", self.profile)?;
        write!(f, "  validation: {}", self.validation)
    }
}

/// One generic offload run, parameterised by a kernel descriptor.
pub struct Harness<B: Backend> {
    backend: B,
    descriptor: KernelDescriptor,
    clock: Clock,
}

impl<B: Backend> Harness<B> {
    pub fn new(backend: B, descriptor: KernelDescriptor) -> Self {
        Self {
            backend,
            descriptor,
            clock: Clock::new(),
        }
    }

    /// Time dispatches with `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }

    /// Run the descriptor to completion.
    ///
    /// Device resources are released on every exit path, newest first. The
    /// teardown hook runs once whenever the setup hook ran. Validation
    /// mismatches are reported, not returned as errors.
    pub fn run(&self, hooks: &mut dyn Hooks) -> Result<RunReport> {
        let desc = &self.descriptor;
        let backend = &self.backend;
        let _span = info_span!("run", descriptor = %desc.name, backend = backend.name()).entered();

        validate(desc)?;

        let context = resolve_device(backend, &desc.device, &desc.kernels)?;
        let program = load_program(backend, &context, &desc.program)?;
        let mut kernels = Vec::with_capacity(desc.kernels.len());
        for spec in &desc.kernels {
            let slots = slot_kinds(desc, spec)?;
            kernels.push(program.kernel(backend, &context, spec, slots)?);
        }

        let mut buffers = BufferSet::from_specs(&desc.buffers);
        let mut scalars = ScalarSet::from_specs(&desc.scalars);

        let result = hooks
            .setup(&mut buffers, &mut scalars)
            .and_then(|()| self.offload(&context, &mut kernels, &mut buffers, &mut scalars, hooks));
        let validation = result.is_ok().then(|| compare::validate(&buffers));
        hooks.teardown(&buffers, &scalars);

        let Outcome { state, profile } = result?;
        let profile = profile.ok_or_else(|| Error::Dispatch {
            kernel: desc.name.clone(),
            reason: "no dispatch was recorded".into(),
        })?;
        info!(
            iterations = state.iteration,
            total_ms = profile.total.as_secs_f64() * 1e3,
            passed = validation.as_ref().map(|v| v.passed()),
            "run complete"
        );

        Ok(RunReport {
            descriptor: desc.name.clone(),
            backend: backend.name(),
            device: context.info().clone(),
            state,
            profile,
            validation: validation.unwrap_or_default(),
            buffers,
            scalars,
        })
    }

    fn offload(
        &self,
        context: &AcceleratorContext<B>,
        kernels: &mut [KernelHandle<B>],
        buffers: &mut BufferSet,
        scalars: &mut ScalarSet,
        hooks: &mut dyn Hooks,
    ) -> Result<Outcome> {
        let mut mirrors = DeviceMirrors::allocate(&self.backend, context, buffers)?;
        info!(
            buffers = buffers.len(),
            bytes = buffers.iter().map(|b| b.spec().byte_len()).sum::<usize>(),
            "device buffers allocated"
        );
        IterationController::new(
            &self.backend,
            context,
            kernels,
            &self.descriptor.kernels,
            self.descriptor.mode,
            self.clock.clone(),
        )
        .run(buffers, scalars, &mut mirrors, hooks)
    }
}

/// Run `descriptor` on the backend named by `OFFLOAD_BACKEND`.
///
/// `registry` supplies the host implementations of the kernels and is only
/// consulted by the host backend.
pub fn launch(descriptor: KernelDescriptor, hooks: &mut dyn Hooks, registry: KernelRegistry) -> Result<RunReport> {
    match BackendChoice::from_env()? {
        BackendChoice::Host => Harness::new(HostBackend::new(registry), descriptor).run(hooks),
        BackendChoice::Wgpu => Harness::new(WgpuBackend::new(), descriptor).run(hooks),
        BackendChoice::OpenCl => launch_opencl(descriptor, hooks),
    }
}

#[cfg(feature = "opencl")]
fn launch_opencl(descriptor: KernelDescriptor, hooks: &mut dyn Hooks) -> Result<RunReport> {
    Harness::new(crate::backend::opencl::OpenClBackend::new(), descriptor).run(hooks)
}

#[cfg(not(feature = "opencl"))]
fn launch_opencl(_descriptor: KernelDescriptor, _hooks: &mut dyn Hooks) -> Result<RunReport> {
    Err(Error::InvalidConfig(format!(
        "{BACKEND_ENV}=opencl requires the `opencl` feature"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_choice_parse() {
        assert_eq!(BackendChoice::parse("host").unwrap(), BackendChoice::Host);
        assert_eq!(BackendChoice::parse(" WGPU ").unwrap(), BackendChoice::Wgpu);
        assert_eq!(BackendChoice::parse("opencl").unwrap(), BackendChoice::OpenCl);
        assert!(matches!(BackendChoice::parse("cuda"), Err(Error::InvalidConfig(_))));
        assert_eq!(BackendChoice::default(), BackendChoice::Wgpu);
    }
}
