//! Device selector
//!
//! Walks every platform and every device the accelerator exposes and picks
//! one according to an [`AccelerationPolicy`]. A platform that fails to
//! enumerate is logged and skipped.

use std::fmt;
use std::str::FromStr;

use log::{info, warn};

use crate::backend::{Accelerator, DeviceInfo, DeviceKind};
use crate::error::{SimResult, SimulationError};

/// Device class preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    #[default]
    Gpu,
    Cpu,
    Any,
}

impl DeviceClass {
    pub fn matches(self, kind: DeviceKind) -> bool {
        match self {
            DeviceClass::Gpu => kind.is_gpu(),
            DeviceClass::Cpu => kind == DeviceKind::Cpu,
            DeviceClass::Any => true,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Gpu => write!(f, "gpu"),
            DeviceClass::Cpu => write!(f, "cpu"),
            DeviceClass::Any => write!(f, "any"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceClass::Gpu),
            "cpu" => Ok(DeviceClass::Cpu),
            "any" => Ok(DeviceClass::Any),
            other => Err(format!("expected gpu, cpu or any, got `{other}`")),
        }
    }
}

/// How to choose among enumerated devices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccelerationPolicy {
    pub preferred: DeviceClass,
    /// Exact device name; wins over the class preference.
    pub name: Option<String>,
    /// Fail instead of falling back to the first device when nothing matches.
    pub strict: bool,
}

impl AccelerationPolicy {
    pub fn prefer(preferred: DeviceClass) -> Self {
        Self {
            preferred,
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

/// Picks a device for `policy`.
///
/// Order of preference: exact name match, then the first device of the
/// preferred class, then (unless strict) the first usable device.
pub fn select_device<A: Accelerator>(
    accelerator: &mut A,
    policy: &AccelerationPolicy,
) -> SimResult<DeviceInfo> {
    let platforms = accelerator.platforms().map_err(|err| {
        warn!("Accelerator runtime unavailable: {err}");
        SimulationError::NoPlatformFound
    })?;
    if platforms.is_empty() {
        return Err(SimulationError::NoPlatformFound);
    }

    let mut candidates = Vec::new();
    for platform in &platforms {
        info!("Platform {}: {}", platform.index, platform.name);
        let devices = match accelerator.devices(platform) {
            Ok(devices) => devices,
            Err(source) => {
                let err = SimulationError::EnumerationFailure {
                    platform: platform.name.clone(),
                    source,
                };
                warn!("{err}; skipping");
                continue;
            }
        };

        for device in devices {
            info!(
                "  {} / {} ({}, {})",
                platform.name, device.name, device.kind, device.vendor
            );
            if !device.interop {
                warn!("  {} cannot share buffers with the rasterizer; skipping", device.name);
                continue;
            }
            if policy.name.as_deref() == Some(device.name.as_str()) {
                info!("Selected {} (name match)", device.name);
                return Ok(device);
            }
            candidates.push(device);
        }
    }

    if let Some(device) = candidates
        .iter()
        .find(|device| policy.preferred.matches(device.kind))
    {
        if let Some(name) = &policy.name {
            warn!("No device named {name}; using first {} device", policy.preferred);
        }
        info!("Selected {} ({})", device.name, device.kind);
        return Ok(device.clone());
    }

    let wanted = match &policy.name {
        Some(name) => format!("{name} / {}", policy.preferred),
        None => policy.preferred.to_string(),
    };
    if candidates.is_empty() {
        return Err(SimulationError::NoDeviceFound(format!(
            "no usable device on {} platform(s)",
            platforms.len()
        )));
    }
    if policy.strict {
        return Err(SimulationError::NoDeviceFound(format!(
            "no device matches {wanted}"
        )));
    }

    let device = candidates.swap_remove(0);
    warn!("No device matches {wanted}; falling back to {}", device.name);
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{DeviceSpec, RecordingAccelerator};

    fn mixed() -> RecordingAccelerator {
        RecordingAccelerator::new()
            .with_platform(
                "Portable",
                vec![DeviceSpec::new("Software Rasterizer", DeviceKind::Cpu)],
            )
            .with_platform(
                "Vendor",
                vec![
                    DeviceSpec::new("Laptop iGPU", DeviceKind::IntegratedGpu),
                    DeviceSpec::new("Big GPU", DeviceKind::DiscreteGpu),
                ],
            )
    }

    #[test]
    fn test_name_match_wins() {
        let device = select_device(&mut mixed(), &AccelerationPolicy::named("Big GPU")).unwrap();
        assert_eq!(device.name, "Big GPU");
    }

    #[test]
    fn test_class_preference() {
        let gpu = select_device(&mut mixed(), &AccelerationPolicy::prefer(DeviceClass::Gpu)).unwrap();
        assert_eq!(gpu.name, "Laptop iGPU");
        let cpu = select_device(&mut mixed(), &AccelerationPolicy::prefer(DeviceClass::Cpu)).unwrap();
        assert_eq!(cpu.name, "Software Rasterizer");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let policy = AccelerationPolicy::named("missing");
        let first = select_device(&mut mixed(), &policy).unwrap();
        for _ in 0..5 {
            assert_eq!(select_device(&mut mixed(), &policy).unwrap(), first);
        }
    }

    #[test]
    fn test_fallback_and_strict() {
        let mut only_cpu = RecordingAccelerator::new().with_platform(
            "Portable",
            vec![DeviceSpec::new("Software Rasterizer", DeviceKind::Cpu)],
        );
        let fallback = select_device(&mut only_cpu, &AccelerationPolicy::default()).unwrap();
        assert_eq!(fallback.kind, DeviceKind::Cpu);

        let err = select_device(&mut only_cpu, &AccelerationPolicy::default().strict()).unwrap_err();
        assert!(matches!(err, SimulationError::NoDeviceFound(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_broken_platform_is_skipped() {
        let mut accelerator = RecordingAccelerator::new()
            .with_broken_platform("Flaky")
            .with_platform("Vendor", vec![DeviceSpec::new("Big GPU", DeviceKind::DiscreteGpu)]);
        let device = select_device(&mut accelerator, &AccelerationPolicy::default()).unwrap();
        assert_eq!(device.name, "Big GPU");
        assert_eq!(device.platform, 1);
    }

    #[test]
    fn test_empty_enumeration() {
        let err = select_device(&mut RecordingAccelerator::new(), &AccelerationPolicy::default())
            .unwrap_err();
        assert!(matches!(err, SimulationError::NoPlatformFound));

        let mut empty = RecordingAccelerator::new().with_platform("Vendor", vec![]);
        let err = select_device(&mut empty, &AccelerationPolicy::default()).unwrap_err();
        assert!(matches!(err, SimulationError::NoDeviceFound(_)));
    }

    #[test]
    fn test_devices_without_interop_are_skipped() {
        let mut accelerator = RecordingAccelerator::new().with_platform(
            "Vendor",
            vec![
                DeviceSpec::isolated("Headless GPU", DeviceKind::DiscreteGpu),
                DeviceSpec::new("Display GPU", DeviceKind::IntegratedGpu),
            ],
        );
        let device =
            select_device(&mut accelerator, &AccelerationPolicy::named("Headless GPU")).unwrap();
        assert_eq!(device.name, "Display GPU");
    }

    #[test]
    fn test_device_class_parses() {
        assert_eq!(" GPU ".parse::<DeviceClass>(), Ok(DeviceClass::Gpu));
        assert_eq!("any".parse::<DeviceClass>(), Ok(DeviceClass::Any));
        assert!("fpga".parse::<DeviceClass>().is_err());
    }
}
