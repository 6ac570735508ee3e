// src/simulation/mod.rs
//! Simulation core
//!
//! Device selection, program building, shared buffer bookkeeping and the
//! per-frame dispatch cycle, composed by [`SimulationSession`].

pub mod device;
pub mod dispatch;
pub mod distribution;
pub mod params;
pub mod particles;
pub mod program;
pub mod registry;
pub mod session;

pub use device::{select_device, AccelerationPolicy, DeviceClass};
pub use dispatch::{CycleState, DispatchCycleController, StepReport};
pub use params::{SimulationParameters, Speed};
pub use particles::{FieldName, ParticleField, Vec4};
pub use program::{BuildLog, BuildOptions, BuildStatus, Kernel, KernelParam, KernelSignature, Program};
pub use registry::{BufferRole, Owner, SharedBufferRegistry};
pub use session::SimulationSession;
