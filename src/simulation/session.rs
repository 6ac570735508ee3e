//! Simulation session
//!
//! Owns everything one running simulation needs: the opened device's
//! compute engine and rasterizer, the built program and kernel, the buffer
//! registry and the dispatch controller. Dropping the session drains both
//! queues, destroys the particle buffers and then releases the program and
//! its kernel, before the device itself goes away.

use log::{info, warn};

use crate::backend::{Accelerator, ComputeBackend, DeviceInfo, Rasterizer};
use crate::error::{BackendError, SimResult, SimulationError};
use crate::simulation::device::{select_device, AccelerationPolicy};
use crate::simulation::dispatch::{CycleState, DispatchCycleController, StepReport};
use crate::simulation::params::SimulationParameters;
use crate::simulation::particles::{FieldName, ParticleField, Vec4};
use crate::simulation::program::{
    build, create_kernel, particle_kernel_options, Kernel, KernelSignature, Program,
};
use crate::simulation::registry::{BufferRole, SharedBufferRegistry};

pub struct SimulationSession<A: Accelerator> {
    device: DeviceInfo,
    compute: A::Compute,
    raster: A::Raster,
    program: Program,
    kernel: Kernel,
    registry: SharedBufferRegistry,
    controller: DispatchCycleController,
    params: SimulationParameters,
    particle_count: Option<u32>,
}

impl<A: Accelerator> SimulationSession<A> {
    /// Selects a device, opens it, builds `source` and resolves the
    /// particle kernel.
    pub fn initialize(
        accelerator: &mut A,
        source: &str,
        policy: &AccelerationPolicy,
        params: SimulationParameters,
    ) -> SimResult<Self> {
        Self::initialize_with(accelerator, source, policy, params, KernelSignature::particles())
    }

    /// Like [`SimulationSession::initialize`] with a custom kernel signature.
    pub fn initialize_with(
        accelerator: &mut A,
        source: &str,
        policy: &AccelerationPolicy,
        params: SimulationParameters,
        signature: KernelSignature,
    ) -> SimResult<Self> {
        let device = select_device(accelerator, policy)?;
        let (mut compute, raster) =
            accelerator
                .open(&device)
                .map_err(|source| SimulationError::DeviceOpen {
                    device: device.name.clone(),
                    source,
                })?;

        let options = particle_kernel_options(
            params.gravitational_constant,
            params.softening,
            params.escape_radius,
        );
        let program = build(&mut compute, source, &options)?;
        let kernel = create_kernel(&mut compute, &program, &signature)?;

        info!("Session ready on {}", device.name);
        Ok(Self {
            device,
            compute,
            raster,
            program,
            kernel,
            registry: SharedBufferRegistry::new(),
            controller: DispatchCycleController::new(),
            params,
            particle_count: None,
        })
    }

    /// Loads a particle field from parallel arrays.
    pub fn load_particles(
        &mut self,
        positions: &[Vec4],
        velocities: &[Vec4],
        colors: &[Vec4],
        masses: &[f32],
    ) -> SimResult<()> {
        let field = ParticleField::from_slices(positions, velocities, colors, masses)?;
        self.load_field(&field)
    }

    /// Uploads `field`. The first load allocates every buffer; later loads
    /// must keep the particle count and overwrite the existing buffers.
    /// The current positions and velocities also become the reset snapshot.
    ///
    /// Every field is checked before anything is written. If a write still
    /// fails, all particle buffers are destroyed and the session is left
    /// with no particles loaded.
    pub fn load_field(&mut self, field: &ParticleField) -> SimResult<()> {
        if self.controller.state() != CycleState::Idle {
            return Err(SimulationError::CycleInProgress(self.controller.state()));
        }
        let count = u32::try_from(field.count()).map_err(|_| {
            BackendError::call("load particles", format!("{} particles is too many", field.count()))
        })?;
        if let Some(current) = self.particle_count {
            if current != count {
                return Err(SimulationError::SizeMismatch {
                    field: FieldName::Position,
                    expected: current as u64 * FieldName::Position.record_size(),
                    actual: field.byte_len(FieldName::Position),
                });
            }
        }
        for name in FieldName::ALL {
            self.registry
                .check_update(name, field.byte_len(name), name.role())?;
        }

        let reseed = self.particle_count.is_some();
        if let Err(err) = self.write_fields(field) {
            self.discard_particles();
            return Err(err);
        }
        self.particle_count = Some(count);

        if reseed {
            info!("Re-seeded {count} particles");
        } else {
            info!("Loaded {count} particles");
        }
        Ok(())
    }

    /// Compute-only fields go first so a failed raw copy never leaves the
    /// drawn buffers ahead of the velocities.
    fn write_fields(&mut self, field: &ParticleField) -> SimResult<()> {
        let compute_only = FieldName::ALL
            .into_iter()
            .filter(|name| name.role() == BufferRole::ComputeOnly);
        let dual_owned = FieldName::ALL
            .into_iter()
            .filter(|name| name.role() == BufferRole::DualOwned);
        for name in compute_only.chain(dual_owned) {
            self.registry.create_or_update(
                &mut self.compute,
                &mut self.raster,
                name,
                field.bytes(name),
                name.role(),
            )?;
        }
        Ok(())
    }

    /// Destroys whatever a failed load left behind.
    fn discard_particles(&mut self) {
        self.particle_count = None;
        let cleared = self
            .raster
            .finish()
            .and_then(|()| self.compute.finish())
            .map_err(SimulationError::from)
            .and_then(|()| self.registry.clear(&mut self.compute, &mut self.raster));
        match cleared {
            Ok(()) => warn!("Particle load failed; all particle buffers destroyed"),
            Err(err) => warn!("Particle load failed and cleanup failed too: {err}"),
        }
    }

    /// Destroys every buffer and loads `field` from scratch. This is the
    /// only way to change the particle count.
    pub fn recreate_particles(&mut self, field: &ParticleField) -> SimResult<()> {
        if self.controller.state() != CycleState::Idle {
            return Err(SimulationError::CycleInProgress(self.controller.state()));
        }
        self.raster.finish()?;
        self.compute.finish()?;
        self.registry.clear(&mut self.compute, &mut self.raster)?;
        self.particle_count = None;
        info!("Recreating particle buffers for {} particles", field.count());
        self.load_field(field)
    }

    /// Runs one dispatch cycle with the current timestep.
    pub fn step(&mut self) -> SimResult<StepReport> {
        let count = self.particle_count.ok_or(SimulationError::NotLoaded)?;
        self.controller.step(
            &mut self.compute,
            &mut self.raster,
            &mut self.registry,
            &self.kernel,
            count,
            self.params.timestep(),
        )
    }

    /// Draws the dual-owned buffers.
    pub fn render(&mut self) -> SimResult<()> {
        let count = self.particle_count.ok_or(SimulationError::NotLoaded)?;
        if self.controller.state() != CycleState::Idle {
            return Err(SimulationError::CycleInProgress(self.controller.state()));
        }
        self.raster.draw(&self.registry.draw_list(), count)?;
        Ok(())
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.raster.update_viewport(width, height);
    }

    /// Switches between slow and fast timesteps, returning the new one.
    pub fn toggle_speed(&mut self) -> f32 {
        let dt = self.params.toggle_speed();
        info!("Timestep is now {dt}");
        dt
    }

    pub fn set_timestep(&mut self, dt: f32) -> SimResult<()> {
        self.params.set_timestep(dt)
    }

    /// Copies one field back to the host.
    pub fn read_field(&mut self, field: FieldName) -> SimResult<Vec<u8>> {
        if self.controller.state() != CycleState::Idle {
            return Err(SimulationError::CycleInProgress(self.controller.state()));
        }
        let handle = self.registry.handle(field)?;
        Ok(self.compute.read_buffer(handle)?)
    }

    pub fn read_positions(&mut self) -> SimResult<Vec<Vec4>> {
        let bytes = self.read_field(FieldName::Position)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn params(&self) -> &SimulationParameters {
        &self.params
    }

    pub fn cycle_state(&self) -> CycleState {
        self.controller.state()
    }

    pub fn controller(&self) -> &DispatchCycleController {
        &self.controller
    }

    pub fn particle_count(&self) -> Option<u32> {
        self.particle_count
    }

    pub fn registry(&self) -> &SharedBufferRegistry {
        &self.registry
    }

    pub fn compute(&self) -> &A::Compute {
        &self.compute
    }

    pub fn rasterizer(&self) -> &A::Raster {
        &self.raster
    }

    pub fn rasterizer_mut(&mut self) -> &mut A::Raster {
        &mut self.raster
    }
}

impl<A: Accelerator> Drop for SimulationSession<A> {
    fn drop(&mut self) {
        if let Err(err) = self.raster.finish().and_then(|()| self.compute.finish()) {
            warn!("Could not drain queues before teardown: {err}");
        }
        if let Err(err) = self.registry.clear(&mut self.compute, &mut self.raster) {
            warn!("Could not destroy particle buffers: {err}");
        }
        match self.compute.release_program(self.program.handle) {
            Ok(()) => info!("Released program on {}", self.device.name),
            Err(err) => warn!("Could not release program: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{Event, RecordingAccelerator};
    use crate::simulation::program::PARTICLE_KERNEL;

    fn session() -> (RecordingAccelerator, SimulationSession<RecordingAccelerator>) {
        let mut accelerator = RecordingAccelerator::single_gpu();
        let session = SimulationSession::initialize(
            &mut accelerator,
            PARTICLE_KERNEL,
            &AccelerationPolicy::default(),
            SimulationParameters::default(),
        )
        .unwrap();
        (accelerator, session)
    }

    fn particles(n: usize, x: f32) -> ParticleField {
        ParticleField::new(
            vec![Vec4::point(x, 0.0, 0.0); n],
            vec![Vec4::default(); n],
            vec![Vec4::new(1.0, 0.0, 0.0, 1.0); n],
            vec![1.0; n],
        )
        .unwrap()
    }

    #[test]
    fn test_drop_releases_buffers_before_program() {
        let (accelerator, mut session) = session();
        session.load_field(&particles(3, 0.1)).unwrap();
        session.step().unwrap();
        let program = session.program().handle;
        let journal = accelerator.journal();
        journal.clear();

        drop(session);
        let events = journal.events();
        let released = events
            .iter()
            .position(|e| *e == Event::ProgramReleased { program })
            .unwrap();
        assert_eq!(released, events.len() - 1);
        assert_eq!(journal.count(|e| matches!(e, Event::BufferReleased { .. })), 6);
        assert_eq!(journal.count(|e| matches!(e, Event::RasterBufferDestroyed { .. })), 3);
        assert!(matches!(events[0], Event::RasterFinished));
    }

    #[test]
    fn test_step_before_load() {
        let (_accelerator, mut session) = session();
        assert!(matches!(session.step(), Err(SimulationError::NotLoaded)));
        assert!(matches!(session.render(), Err(SimulationError::NotLoaded)));
    }

    #[test]
    fn test_reseed_keeps_handles() {
        let (accelerator, mut session) = session();
        session.load_field(&particles(4, 0.25)).unwrap();
        let program = session.program().handle;
        let kernel = session.kernel().handle;
        let position = session.registry().handle(FieldName::Position).unwrap();

        session.load_field(&particles(4, 0.75)).unwrap();
        assert_eq!(session.program().handle, program);
        assert_eq!(session.kernel().handle, kernel);
        assert_eq!(session.registry().handle(FieldName::Position).unwrap(), position);
        assert_eq!(session.read_positions().unwrap()[0], Vec4::point(0.75, 0.0, 0.0));

        let journal = accelerator.journal();
        assert_eq!(journal.count(|e| matches!(e, Event::ProgramBuilt { .. })), 1);
        assert_eq!(journal.count(|e| matches!(e, Event::RasterBufferCreated { .. })), 3);
    }

    #[test]
    fn test_count_change_requires_recreate() {
        let (_accelerator, mut session) = session();
        session.load_field(&particles(4, 0.25)).unwrap();
        let err = session.load_field(&particles(5, 0.25)).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::SizeMismatch {
                field: FieldName::Position,
                expected: 64,
                actual: 80
            }
        ));

        session.recreate_particles(&particles(5, 0.25)).unwrap();
        assert_eq!(session.particle_count(), Some(5));
        assert_eq!(session.read_field(FieldName::Mass).unwrap().len(), 20);
        assert_eq!(session.rasterizer().live_buffers(), 3);
        assert_eq!(session.compute().live_buffers(), 6);
    }

    #[test]
    fn test_initial_snapshots_follow_load() {
        let (_accelerator, mut session) = session();
        let field = particles(2, 0.5);
        session.load_field(&field).unwrap();
        assert_eq!(
            session.read_field(FieldName::InitialPosition).unwrap(),
            field.bytes(FieldName::Position)
        );
        assert_eq!(
            session.read_field(FieldName::InitialVelocity).unwrap(),
            field.bytes(FieldName::Velocity)
        );
    }

    #[test]
    fn test_render_and_resize_reach_rasterizer() {
        let (accelerator, mut session) = session();
        session.load_field(&particles(3, 0.1)).unwrap();
        session.step().unwrap();
        session.render().unwrap();
        session.resize(640, 480);
        assert_eq!(session.rasterizer().viewport(), (640, 480));

        let journal = accelerator.journal();
        assert!(journal
            .events()
            .contains(&Event::Drawn {
                buffers: session.registry().draw_list(),
                particle_count: 3
            }));
    }

    #[test]
    fn test_speed_toggle_changes_bound_timestep() {
        let (accelerator, mut session) = session();
        session.load_field(&particles(3, 0.1)).unwrap();
        assert_eq!(session.toggle_speed(), 1000.0);
        let report = session.step().unwrap();
        assert_eq!(report.timestep, 1000.0);
        assert!(accelerator.journal().events().iter().any(|e| matches!(
            e,
            Event::ArgSet { index: 6, arg: crate::backend::KernelArg::Scalar(dt), .. } if *dt == 1000.0
        )));
    }
}
