//! Simulation parameters
//!
//! The timestep is the only value that changes while the simulation runs.
//! Field constants and the particle count are fixed when particles are
//! loaded.

use crate::error::{SimResult, SimulationError};

/// Which of the two configured timesteps is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Speed {
    #[default]
    Slow,
    Fast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParameters {
    pub slow_timestep: f32,
    pub fast_timestep: f32,
    pub gravitational_constant: f32,
    pub softening: f32,
    /// Particles farther than this from the origin are reset to their
    /// initial state.
    pub escape_radius: f32,
    speed: Speed,
    override_timestep: Option<f32>,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self::new(100.0, 1000.0)
    }
}

impl SimulationParameters {
    pub fn new(slow_timestep: f32, fast_timestep: f32) -> Self {
        Self {
            slow_timestep,
            fast_timestep,
            gravitational_constant: 6.674e-11,
            softening: 0.01,
            escape_radius: 4.0,
            speed: Speed::Slow,
            override_timestep: None,
        }
    }

    pub fn with_field_constants(mut self, gravitational_constant: f32, softening: f32) -> Self {
        self.gravitational_constant = gravitational_constant;
        self.softening = softening;
        self
    }

    pub fn with_escape_radius(mut self, escape_radius: f32) -> Self {
        self.escape_radius = escape_radius;
        self
    }

    /// Timestep bound to the next step.
    pub fn timestep(&self) -> f32 {
        self.override_timestep.unwrap_or(match self.speed {
            Speed::Slow => self.slow_timestep,
            Speed::Fast => self.fast_timestep,
        })
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Switches between the slow and fast timestep and drops any explicit
    /// override.
    pub fn toggle_speed(&mut self) -> f32 {
        self.speed = match self.speed {
            Speed::Slow => Speed::Fast,
            Speed::Fast => Speed::Slow,
        };
        self.override_timestep = None;
        self.timestep()
    }

    /// Pins the timestep to `dt` until the next toggle.
    pub fn set_timestep(&mut self, dt: f32) -> SimResult<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(SimulationError::InvalidTimestep(dt));
        }
        self.override_timestep = Some(dt);
        Ok(())
    }
}
