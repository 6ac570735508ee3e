// src/lib.rs
//! Universe
//!
//! A GPU particle simulator. A compute kernel advances the particles in
//! buffers that the point renderer draws directly, so positions never make
//! a round trip through host memory.

pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod render;
pub mod simulation;
pub mod wgpu_utils;

pub use app::UniverseApp;
pub use error::{BackendError, ConfigError, SimResult, SimulationError};
