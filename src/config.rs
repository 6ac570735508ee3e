//! Simulation configuration
//!
//! Defaults match the stock simulator. Every field can be overridden from
//! `UNIVERSE_*` environment variables through [`SimulationConfig::from_env`].

use std::borrow::Cow;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::simulation::program::PARTICLE_KERNEL;
use crate::simulation::{AccelerationPolicy, SimulationParameters};

pub const ENV_PARTICLES: &str = "UNIVERSE_PARTICLES";
pub const ENV_DEVICE: &str = "UNIVERSE_DEVICE";
pub const ENV_DEVICE_CLASS: &str = "UNIVERSE_DEVICE_CLASS";
pub const ENV_STRICT_DEVICE: &str = "UNIVERSE_STRICT_DEVICE";
pub const ENV_KERNEL: &str = "UNIVERSE_KERNEL";
pub const ENV_BACKENDS: &str = "UNIVERSE_BACKENDS";

/// Largest field one dispatch covers on baseline device limits: 65535
/// workgroups of 64 invocations. Its 16-byte records also stay under the
/// 128 MiB storage binding limit.
pub const MAX_PARTICLES: usize = 65_535 * 64;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub particle_count: usize,
    pub slow_timestep: f32,
    pub fast_timestep: f32,
    /// Mass of the heavy body at the center of the disc distribution.
    pub big_mass: f32,
    pub gravitational_constant: f32,
    pub softening: f32,
    pub escape_radius: f32,
    pub window_width: u32,
    pub window_height: u32,
    pub title: String,
    pub policy: AccelerationPolicy,
    pub backends: wgpu::Backends,
    /// Kernel source to load instead of the embedded one.
    pub kernel_path: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let params = SimulationParameters::default();
        Self {
            particle_count: 10_000,
            slow_timestep: params.slow_timestep,
            fast_timestep: params.fast_timestep,
            big_mass: 1000.0,
            gravitational_constant: params.gravitational_constant,
            softening: params.softening,
            escape_radius: params.escape_radius,
            window_width: 1280,
            window_height: 720,
            title: "Universe Simulator".to_string(),
            policy: AccelerationPolicy::default(),
            backends: wgpu::Backends::PRIMARY | wgpu::Backends::GL,
            kernel_path: None,
        }
    }
}

impl SimulationConfig {
    /// Defaults with the process environment applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its
    /// value.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_PARTICLES) {
            self.particle_count =
                value
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                        key: ENV_PARTICLES,
                        value: value.clone(),
                        reason: e.to_string(),
                    })?;
        }
        if let Some(value) = lookup(ENV_DEVICE) {
            let name = value.trim();
            self.policy.name = (!name.is_empty()).then(|| name.to_string());
        }
        if let Some(value) = lookup(ENV_DEVICE_CLASS) {
            self.policy.preferred =
                value
                    .parse()
                    .map_err(|reason| ConfigError::InvalidValue {
                        key: ENV_DEVICE_CLASS,
                        value: value.clone(),
                        reason,
                    })?;
        }
        if let Some(value) = lookup(ENV_STRICT_DEVICE) {
            self.policy.strict = parse_flag(ENV_STRICT_DEVICE, &value)?;
        }
        if let Some(value) = lookup(ENV_KERNEL) {
            let path = value.trim();
            self.kernel_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(value) = lookup(ENV_BACKENDS) {
            self.backends = parse_backends(&value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.particle_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_PARTICLES,
                value: "0".to_string(),
                reason: "at least one particle is required".to_string(),
            });
        }
        if self.particle_count > MAX_PARTICLES {
            return Err(ConfigError::InvalidValue {
                key: ENV_PARTICLES,
                value: self.particle_count.to_string(),
                reason: format!("at most {MAX_PARTICLES} particles are supported"),
            });
        }
        for (key, dt) in [
            ("slow_timestep", self.slow_timestep),
            ("fast_timestep", self.fast_timestep),
        ] {
            if !dt.is_finite() || dt <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: dt.to_string(),
                    reason: "timesteps must be positive".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn parameters(&self) -> SimulationParameters {
        SimulationParameters::new(self.slow_timestep, self.fast_timestep)
            .with_field_constants(self.gravitational_constant, self.softening)
            .with_escape_radius(self.escape_radius)
    }

    /// The configured kernel file, or the embedded particle kernel.
    pub fn kernel_source(&self) -> Result<Cow<'static, str>, ConfigError> {
        match &self.kernel_path {
            Some(path) => std::fs::read_to_string(path)
                .map(Cow::Owned)
                .map_err(|source| ConfigError::KernelSource {
                    path: path.display().to_string(),
                    source,
                }),
            None => Ok(Cow::Borrowed(PARTICLE_KERNEL)),
        }
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_backends(value: &str) -> Result<wgpu::Backends, ConfigError> {
    let mut backends = wgpu::Backends::empty();
    for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        backends |= match name.to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => wgpu::Backends::VULKAN,
            "metal" | "mtl" => wgpu::Backends::METAL,
            "dx12" | "d3d12" => wgpu::Backends::DX12,
            "gl" | "opengl" | "gles" => wgpu::Backends::GL,
            "primary" => wgpu::Backends::PRIMARY,
            "all" => wgpu::Backends::all(),
            other => {
                return Err(ConfigError::InvalidValue {
                    key: ENV_BACKENDS,
                    value: value.to_string(),
                    reason: format!("unknown backend `{other}`"),
                })
            }
        };
    }
    if backends.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: ENV_BACKENDS,
            value: value.to_string(),
            reason: "no backend named".to_string(),
        });
    }
    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::DeviceClass;
    use std::collections::HashMap;

    fn overrides(vars: &[(&str, &str)]) -> Result<SimulationConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SimulationConfig::default().with_overrides(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = SimulationConfig::default();
        assert_eq!(config.particle_count, 10_000);
        assert_eq!(config.fast_timestep, config.slow_timestep * 10.0);
        assert_eq!(config.policy, AccelerationPolicy::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.title, "Universe Simulator");
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let config = overrides(&[]).unwrap();
        assert_eq!(config.particle_count, 10_000);
        assert!(config.kernel_path.is_none());
    }

    #[test]
    fn test_device_overrides() {
        let config = overrides(&[
            (ENV_PARTICLES, "2048"),
            (ENV_DEVICE, "Recording GPU"),
            (ENV_DEVICE_CLASS, "cpu"),
            (ENV_STRICT_DEVICE, "yes"),
        ])
        .unwrap();
        assert_eq!(config.particle_count, 2048);
        assert_eq!(config.policy.name.as_deref(), Some("Recording GPU"));
        assert_eq!(config.policy.preferred, DeviceClass::Cpu);
        assert!(config.policy.strict);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(matches!(
            overrides(&[(ENV_PARTICLES, "many")]),
            Err(ConfigError::InvalidValue { key: ENV_PARTICLES, .. })
        ));
        assert!(matches!(
            overrides(&[(ENV_DEVICE_CLASS, "fpga")]),
            Err(ConfigError::InvalidValue { key: ENV_DEVICE_CLASS, .. })
        ));
        assert!(matches!(
            overrides(&[(ENV_STRICT_DEVICE, "maybe")]),
            Err(ConfigError::InvalidValue { key: ENV_STRICT_DEVICE, .. })
        ));
        assert!(matches!(
            overrides(&[(ENV_PARTICLES, "0")]),
            Err(ConfigError::InvalidValue { key: ENV_PARTICLES, .. })
        ));
    }

    #[test]
    fn test_particle_count_upper_bound() {
        let max = MAX_PARTICLES.to_string();
        let config = overrides(&[(ENV_PARTICLES, max.as_str())]).unwrap();
        assert_eq!(config.particle_count, MAX_PARTICLES);
        assert!(matches!(
            overrides(&[(ENV_PARTICLES, "9000000")]),
            Err(ConfigError::InvalidValue { key: ENV_PARTICLES, .. })
        ));

        let limits = wgpu::Limits::downlevel_defaults();
        let bytes = MAX_PARTICLES as u64 * crate::simulation::particles::VEC4_RECORD_SIZE;
        assert!(bytes <= u64::from(limits.max_storage_buffer_binding_size));
        assert!(MAX_PARTICLES as u64 <= u64::from(limits.max_compute_workgroups_per_dimension) * 64);
    }

    #[test]
    fn test_backend_list() {
        let config = overrides(&[(ENV_BACKENDS, "vulkan, gl")]).unwrap();
        assert_eq!(config.backends, wgpu::Backends::VULKAN | wgpu::Backends::GL);
        assert!(overrides(&[(ENV_BACKENDS, "glide")]).is_err());
        assert!(overrides(&[(ENV_BACKENDS, " , ")]).is_err());
    }

    #[test]
    fn test_non_positive_timestep_is_invalid() {
        let config = SimulationConfig {
            slow_timestep: 0.0,
            ..SimulationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parameters_carry_field_constants() {
        let config = SimulationConfig {
            gravitational_constant: 1.0,
            softening: 0.5,
            ..SimulationConfig::default()
        };
        let params = config.parameters();
        assert_eq!(params.gravitational_constant, 1.0);
        assert_eq!(params.softening, 0.5);
        assert_eq!(params.timestep(), config.slow_timestep);
    }

    #[test]
    fn test_embedded_kernel_is_default() {
        let source = SimulationConfig::default().kernel_source().unwrap();
        assert!(source.contains("fn universe"));
    }

    #[test]
    fn test_missing_kernel_file() {
        let config = SimulationConfig {
            kernel_path: Some(PathBuf::from("/nonexistent/universe.wgsl")),
            ..SimulationConfig::default()
        };
        assert!(matches!(
            config.kernel_source(),
            Err(ConfigError::KernelSource { .. })
        ));
    }
}
