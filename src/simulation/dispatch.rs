//! Dispatch cycle controller
//!
//! One simulation step is one full cycle:
//!
//! ```text
//! Idle -> Acquiring -> Bound -> Executing -> Releasing -> Idle
//! ```
//!
//! The rasterizer is drained before any dual-owned buffer is acquired, the
//! kernel runs to completion before release, and buffers that were acquired
//! are always released, whichever phase failed. Control only returns to the
//! caller in [`CycleState::Idle`].

use std::fmt;

use log::{debug, error, trace, warn};

use crate::backend::{BufferHandle, ComputeBackend, KernelArg, Rasterizer};
use crate::error::{BackendError, SimResult, SimulationError};
use crate::simulation::particles::FieldName;
use crate::simulation::program::{Kernel, KernelParam};
use crate::simulation::registry::{Owner, SharedBufferRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Idle,
    Acquiring,
    Bound,
    Executing,
    Releasing,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::Acquiring => "acquiring",
            CycleState::Bound => "bound",
            CycleState::Executing => "executing",
            CycleState::Releasing => "releasing",
        };
        f.write_str(name)
    }
}

/// Outcome of a completed step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// 1-based number of this cycle.
    pub cycle: u64,
    pub particle_count: u32,
    pub timestep: f32,
    /// Dual-owned buffers that changed hands.
    pub buffers_exchanged: usize,
}

#[derive(Debug, Default)]
pub struct DispatchCycleController {
    state: CycleState,
    cycles: u64,
    failures: u64,
}

fn failed(phase: CycleState) -> impl FnOnce(BackendError) -> SimulationError {
    move |source| SimulationError::DispatchFailure { phase, source }
}

impl DispatchCycleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Cycles that returned an error.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn enter(&mut self, state: CycleState) {
        trace!("dispatch: {} -> {}", self.state, state);
        self.state = state;
    }

    /// Runs one acquire, bind, execute, release cycle of `kernel` over
    /// `particle_count` work-items with `timestep` as the trailing scalar.
    pub fn step<S, C, R>(
        &mut self,
        compute: &mut C,
        raster: &mut R,
        registry: &mut SharedBufferRegistry,
        kernel: &Kernel,
        particle_count: u32,
        timestep: f32,
    ) -> SimResult<StepReport>
    where
        C: ComputeBackend<Shared = S>,
        R: Rasterizer<Shared = S>,
    {
        if self.state != CycleState::Idle {
            return Err(SimulationError::CycleInProgress(self.state));
        }

        let stuck = registry.compute_owned();
        if stuck > 0 {
            return Err(SimulationError::StuckBuffers {
                count: stuck,
                source: BackendError::OwnershipViolation {
                    buffer: "particle buffers".into(),
                    message: "still owned by the compute engine from an earlier cycle".into(),
                },
            });
        }

        let args = resolve_args(registry, kernel, timestep)?;
        if args.len() != kernel.arity() {
            return Err(SimulationError::ArityMismatch {
                entry_point: kernel.signature.entry_point().to_string(),
                declared: kernel.arity(),
                bound: args.len(),
            });
        }

        let mut acquired = Vec::new();
        let outcome = self.run(compute, raster, registry, kernel, &args, particle_count, &mut acquired);
        let released = self.release(compute, registry, &acquired);
        self.enter(CycleState::Idle);

        let result = match (outcome, released) {
            (outcome, Err(stuck)) => {
                if let Err(err) = outcome {
                    error!("Dispatch failed before release: {err}");
                }
                Err(stuck)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        };

        match result {
            Ok(()) => {
                self.cycles += 1;
                debug!("Cycle {} complete: {particle_count} particles, dt {timestep}", self.cycles);
                Ok(StepReport {
                    cycle: self.cycles,
                    particle_count,
                    timestep,
                    buffers_exchanged: acquired.len(),
                })
            }
            Err(err) => {
                self.failures += 1;
                if !err.is_fatal() {
                    warn!("Step aborted: {err}");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run<S, C, R>(
        &mut self,
        compute: &mut C,
        raster: &mut R,
        registry: &mut SharedBufferRegistry,
        kernel: &Kernel,
        args: &[KernelArg],
        particle_count: u32,
        acquired: &mut Vec<(FieldName, BufferHandle)>,
    ) -> SimResult<()>
    where
        C: ComputeBackend<Shared = S>,
        R: Rasterizer<Shared = S>,
    {
        self.enter(CycleState::Acquiring);
        raster.finish().map_err(failed(CycleState::Acquiring))?;
        let dual: Vec<(FieldName, BufferHandle)> = registry
            .dual_owned()
            .map(|entry| (entry.field, entry.handle))
            .collect();
        for (field, handle) in dual {
            compute
                .acquire_shared(handle)
                .map_err(failed(CycleState::Acquiring))?;
            registry.set_owner(field, Owner::Compute);
            acquired.push((field, handle));
        }
        compute.finish().map_err(failed(CycleState::Acquiring))?;

        self.enter(CycleState::Bound);
        for (index, arg) in args.iter().enumerate() {
            compute
                .set_arg(kernel.handle, index as u32, *arg)
                .map_err(failed(CycleState::Bound))?;
        }

        self.enter(CycleState::Executing);
        compute
            .enqueue(kernel.handle, particle_count)
            .map_err(failed(CycleState::Executing))?;
        compute.finish().map_err(failed(CycleState::Executing))?;
        Ok(())
    }

    /// Hands every acquired buffer back, continuing past failures. Buffers
    /// that could not be released stay marked as compute-owned.
    fn release<C: ComputeBackend>(
        &mut self,
        compute: &mut C,
        registry: &mut SharedBufferRegistry,
        acquired: &[(FieldName, BufferHandle)],
    ) -> SimResult<()> {
        self.enter(CycleState::Releasing);
        let mut first_error = None;
        let mut stuck = 0;
        for (field, handle) in acquired {
            match compute.release_shared(*handle) {
                Ok(()) => registry.set_owner(*field, Owner::Rasterizer),
                Err(err) => {
                    error!("Could not release {field} back to the rasterizer: {err}");
                    stuck += 1;
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(source) = first_error {
            return Err(SimulationError::StuckBuffers {
                count: stuck,
                source,
            });
        }
        if acquired.is_empty() {
            return Ok(());
        }
        compute.finish().map_err(failed(CycleState::Releasing))
    }
}

fn resolve_args(
    registry: &SharedBufferRegistry,
    kernel: &Kernel,
    timestep: f32,
) -> SimResult<Vec<KernelArg>> {
    kernel
        .signature
        .params()
        .iter()
        .map(|param| match param {
            KernelParam::Field(field) => registry.handle(*field).map(KernelArg::Buffer),
            KernelParam::Timestep => Ok(KernelArg::Scalar(timestep)),
        })
        .collect()
}
