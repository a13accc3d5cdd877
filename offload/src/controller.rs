//! The iteration state machine.
//!
//! `Setup -> {SingleShot | IterateBody} -> Drain -> Done`. Setup uploads
//! every buffer the kernels read and binds every slot once. Single-shot runs
//! each kernel once. The iterative body runs at least once and repeats while
//! the post-iteration hook returns `true`. Drain pulls back whatever output
//! is still only on the device.

use std::time::Duration;

use offload_types::{ExecutionMode, KernelSpec};
use quanta::Clock;
use tracing::{debug, info, info_span};

use crate::args::bind_all;
use crate::backend::Backend;
use crate::buffer::{BufferSet, DeviceMirrors, ScalarSet};
use crate::device::AcceleratorContext;
use crate::profiler::{ProfileReport, Profiler};
use crate::program::KernelHandle;
use crate::{Error, Result};

/// Loop state threaded through the hooks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IterationState {
    /// Index of the current iteration; equals the number of completed
    /// iterations once the loop exits.
    pub iteration: u64,
    pub continue_flag: bool,
    pub elapsed: Duration,
}

/// Host-side logic injected around the offload.
///
/// Hooks get the host buffers by mutable reference but cannot resize them.
/// The post-iteration hook is the only way to keep an iterative run going.
pub trait Hooks {
    /// Fill initial host buffers, reference arrays and scalars.
    fn setup(&mut self, _buffers: &mut BufferSet, _scalars: &mut ScalarSet) -> Result<()> {
        Ok(())
    }

    fn pre_iteration(
        &mut self,
        _state: &IterationState,
        _buffers: &mut BufferSet,
        _scalars: &mut ScalarSet,
    ) -> Result<()> {
        Ok(())
    }

    /// Inspect this iteration's results; the return value is the
    /// continue-flag.
    fn post_iteration(
        &mut self,
        _state: &IterationState,
        _buffers: &mut BufferSet,
        _scalars: &mut ScalarSet,
    ) -> Result<bool> {
        Ok(false)
    }

    fn teardown(&mut self, _buffers: &BufferSet, _scalars: &ScalarSet) {}
}

/// Hooks that do nothing; an iterative run with these stops after one pass.
pub struct NoHooks;

impl Hooks for NoHooks {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Setup,
    SingleShot,
    IterateBody,
    Drain,
    Done,
}

pub struct Outcome {
    pub state: IterationState,
    pub profile: Option<ProfileReport>,
}

pub struct IterationController<'r, B: Backend> {
    backend: &'r B,
    context: &'r AcceleratorContext<B>,
    kernels: &'r mut [KernelHandle<B>],
    specs: &'r [KernelSpec],
    mode: ExecutionMode,
    phase: Phase,
    profiler: Profiler,
    state: IterationState,
    // host copy holds the latest device result
    fresh: Vec<bool>,
}

impl<'r, B: Backend> IterationController<'r, B> {
    pub fn new(
        backend: &'r B,
        context: &'r AcceleratorContext<B>,
        kernels: &'r mut [KernelHandle<B>],
        specs: &'r [KernelSpec],
        mode: ExecutionMode,
        clock: Clock,
    ) -> Self {
        Self {
            backend,
            context,
            kernels,
            specs,
            mode,
            phase: Phase::Setup,
            profiler: Profiler::with_clock(clock),
            state: IterationState::default(),
            fresh: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    pub fn run(
        mut self,
        buffers: &mut BufferSet,
        scalars: &mut ScalarSet,
        mirrors: &mut DeviceMirrors<B>,
        hooks: &mut dyn Hooks,
    ) -> Result<Outcome> {
        self.setup(buffers, scalars, mirrors)?;

        match self.mode {
            ExecutionMode::SingleShot => {
                self.enter(Phase::SingleShot);
                self.single_shot(buffers)?;
            }
            ExecutionMode::Iterative => {
                self.enter(Phase::IterateBody);
                let _span = info_span!("iterate").entered();
                if let Err(e) = self.iterate(buffers, scalars, mirrors, hooks) {
                    return Err(Error::Aborted {
                        completed: self.state.iteration,
                        source: Box::new(e),
                    });
                }
                info!(
                    iterations = self.state.iteration,
                    elapsed_ms = self.state.elapsed.as_secs_f64() * 1e3,
                    "loop finished"
                );
            }
        }

        self.enter(Phase::Drain);
        self.drain(buffers, mirrors)?;
        self.enter(Phase::Done);

        Ok(Outcome {
            profile: self.profiler.report(),
            state: self.state,
        })
    }

    fn setup(&mut self, buffers: &mut BufferSet, scalars: &ScalarSet, mirrors: &mut DeviceMirrors<B>) -> Result<()> {
        // the first upload already carries any swap the setup hook made
        buffers.take_pending_swaps();
        self.fresh = vec![true; buffers.len()];
        for i in 0..buffers.len() {
            if buffers.at(i).access().kernel_reads() {
                mirrors.upload(self.backend, self.context, buffers, i)?;
            }
        }
        for (kernel, spec) in self.kernels.iter_mut().zip(self.specs) {
            bind_all(self.backend, kernel, spec, buffers, mirrors, scalars)?;
        }
        Ok(())
    }

    fn dispatch_all(&mut self) -> Result<Duration> {
        let start = self.profiler.now();
        for (index, kernel) in self.kernels.iter_mut().enumerate() {
            let queue = self.context.queue(index)?;
            let work = kernel.work().clone();
            self.backend
                .dispatch(self.context.raw(), queue, &mut kernel.raw, &work)?;
            debug!(kernel = kernel.name(), iteration = self.state.iteration, "dispatched");
        }
        let end = self.profiler.now();
        Ok(self.profiler.on_iteration_complete(start, end))
    }

    fn mark_stale(&mut self, buffers: &BufferSet) {
        for (i, fresh) in self.fresh.iter_mut().enumerate() {
            if buffers.at(i).access().kernel_writes() {
                *fresh = false;
            }
        }
    }

    fn single_shot(&mut self, buffers: &BufferSet) -> Result<()> {
        let delta = self.dispatch_all()?;
        self.mark_stale(buffers);
        self.state.iteration = 1;
        self.state.elapsed = delta;
        Ok(())
    }

    fn apply_swaps(&mut self, buffers: &mut BufferSet, mirrors: &mut DeviceMirrors<B>) {
        let swaps = buffers.pending_swaps().to_vec();
        mirrors.apply_swaps(buffers);
        for (a, b) in swaps {
            self.fresh.swap(a, b);
        }
    }

    fn iterate(
        &mut self,
        buffers: &mut BufferSet,
        scalars: &mut ScalarSet,
        mirrors: &mut DeviceMirrors<B>,
        hooks: &mut dyn Hooks,
    ) -> Result<()> {
        loop {
            hooks.pre_iteration(&self.state, buffers, scalars)?;
            self.apply_swaps(buffers, mirrors);

            for i in 0..buffers.len() {
                let host = buffers.at(i);
                let access = host.access();
                if access.upload_each_iteration() || (access.kernel_reads() && host.is_touched()) {
                    mirrors.upload(self.backend, self.context, buffers, i)?;
                }
            }
            for (kernel, spec) in self.kernels.iter_mut().zip(self.specs) {
                bind_all(self.backend, kernel, spec, buffers, mirrors, scalars)?;
            }

            let delta = self.dispatch_all()?;
            self.mark_stale(buffers);

            for i in 0..buffers.len() {
                if buffers.at(i).access().kernel_writes() {
                    mirrors.download(self.backend, self.context, buffers, i)?;
                    self.fresh[i] = true;
                }
            }

            let keep_going = hooks.post_iteration(&self.state, buffers, scalars)?;
            self.state.continue_flag = keep_going;
            self.state.iteration += 1;
            self.state.elapsed += delta;
            debug!(
                iteration = self.state.iteration,
                dispatch_us = delta.as_secs_f64() * 1e6,
                continue_flag = keep_going,
                "iteration complete"
            );

            if !self.state.continue_flag {
                return Ok(());
            }
        }
    }

    fn drain(&mut self, buffers: &mut BufferSet, mirrors: &mut DeviceMirrors<B>) -> Result<()> {
        self.apply_swaps(buffers, mirrors);
        for i in 0..buffers.len() {
            if !self.fresh[i] && buffers.at(i).access().kernel_writes() {
                mirrors.download(self.backend, self.context, buffers, i)?;
                self.fresh[i] = true;
            }
        }
        Ok(())
    }
}
