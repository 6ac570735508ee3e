//! Shared buffer registry
//!
//! Owns every named particle buffer. Dual-owned buffers are allocated by
//! the rasterizer, exported once and registered with the compute engine;
//! after that they are only ever overwritten in place so the rasterizer's
//! vertex bindings stay valid. Compute-only buffers belong to the compute
//! engine alone.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::backend::{BufferHandle, ComputeBackend, RasterBufferId, Rasterizer};
use crate::error::{BackendError, SimResult, SimulationError};
use crate::simulation::particles::FieldName;

/// Who may see a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Drawn by the rasterizer and written by kernels, alternately.
    DualOwned,
    /// Only ever touched by kernels.
    ComputeOnly,
}

impl BufferRole {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferRole::DualOwned => "dual-owned",
            BufferRole::ComputeOnly => "compute-only",
        }
    }
}

impl FieldName {
    /// Role of this field in the particle kernel.
    pub fn role(self) -> BufferRole {
        match self {
            FieldName::Position | FieldName::Color | FieldName::Mass => BufferRole::DualOwned,
            FieldName::Velocity | FieldName::InitialPosition | FieldName::InitialVelocity => {
                BufferRole::ComputeOnly
            }
        }
    }
}

/// Current owner of a dual-owned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Rasterizer,
    Compute,
}

/// One registered buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    pub field: FieldName,
    pub role: BufferRole,
    /// Compute-side handle, used as a kernel argument.
    pub handle: BufferHandle,
    /// Rasterizer-side id; `None` for compute-only buffers.
    pub raster_id: Option<RasterBufferId>,
    pub byte_len: u64,
    pub owner: Owner,
}

#[derive(Debug, Default)]
pub struct SharedBufferRegistry {
    entries: BTreeMap<FieldName, BufferEntry>,
    allocations: usize,
}

impl SharedBufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `field` on first use, otherwise refreshes its contents.
    ///
    /// A dual-owned field is never reallocated: later calls must supply the
    /// same byte length and are copied straight into the rasterizer's
    /// allocation. A compute-only field is rewritten in place when the
    /// length is unchanged and recreated otherwise.
    pub fn create_or_update<S, C, R>(
        &mut self,
        compute: &mut C,
        raster: &mut R,
        field: FieldName,
        bytes: &[u8],
        role: BufferRole,
    ) -> SimResult<BufferHandle>
    where
        C: ComputeBackend<Shared = S>,
        R: Rasterizer<Shared = S>,
    {
        let len = bytes.len() as u64;
        self.check_update(field, len, role)?;

        let Some(entry) = self.entries.get(&field) else {
            return self.create(compute, raster, field, bytes, role);
        };
        match role {
            BufferRole::DualOwned => {
                let Some(raster_id) = entry.raster_id else {
                    return Err(BackendError::call("raw copy", "dual-owned buffer has no raster id").into());
                };
                raster.write_shared_buffer(raster_id, bytes)?;
                debug!("Raw copy of {len} bytes into {field}");
                Ok(entry.handle)
            }
            BufferRole::ComputeOnly => {
                let handle = entry.handle;
                if entry.byte_len == len {
                    compute.write_buffer(handle, bytes)?;
                    debug!("Rewrote {field} in place ({len} bytes)");
                    return Ok(handle);
                }
                compute.release_buffer(handle)?;
                self.entries.remove(&field);
                self.create(compute, raster, field, bytes, role)
            }
        }
    }

    /// Fails with the error `create_or_update` would return for `len`
    /// bytes of `field`, without touching any buffer.
    pub fn check_update(&self, field: FieldName, len: u64, role: BufferRole) -> SimResult<()> {
        if len == 0 {
            return Err(SimulationError::EmptyField);
        }
        let Some(entry) = self.entries.get(&field) else {
            return Ok(());
        };
        if entry.role != role {
            return Err(SimulationError::RoleMismatch {
                field,
                registered: entry.role.as_str(),
                requested: role.as_str(),
            });
        }
        if role == BufferRole::DualOwned {
            if entry.byte_len != len {
                return Err(SimulationError::SizeMismatch {
                    field,
                    expected: entry.byte_len,
                    actual: len,
                });
            }
            if entry.owner != Owner::Rasterizer {
                return Err(BackendError::OwnershipViolation {
                    buffer: field.to_string(),
                    message: "raw copy requested while the compute engine owns it".into(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn create<S, C, R>(
        &mut self,
        compute: &mut C,
        raster: &mut R,
        field: FieldName,
        bytes: &[u8],
        role: BufferRole,
    ) -> SimResult<BufferHandle>
    where
        C: ComputeBackend<Shared = S>,
        R: Rasterizer<Shared = S>,
    {
        let label = field.as_str();
        let (handle, raster_id) = match role {
            BufferRole::DualOwned => {
                let raster_id = raster.create_shared_buffer(label, bytes)?;
                let registered = raster
                    .export_shared(raster_id)
                    .and_then(|shared| compute.register_shared(label, shared));
                match registered {
                    Ok(handle) => (handle, Some(raster_id)),
                    Err(err) => {
                        if let Err(cleanup) = raster.destroy_shared_buffer(raster_id) {
                            warn!("Could not destroy unregistered {field} buffer: {cleanup}");
                        }
                        return Err(err.into());
                    }
                }
            }
            BufferRole::ComputeOnly => (compute.create_buffer(label, bytes)?, None),
        };

        self.allocations += 1;
        info!(
            "Allocated {} {field} buffer ({} bytes)",
            role.as_str(),
            bytes.len()
        );
        self.entries.insert(
            field,
            BufferEntry {
                field,
                role,
                handle,
                raster_id,
                byte_len: bytes.len() as u64,
                owner: Owner::Rasterizer,
            },
        );
        Ok(handle)
    }

    pub fn get(&self, field: FieldName) -> Option<&BufferEntry> {
        self.entries.get(&field)
    }

    pub fn handle(&self, field: FieldName) -> SimResult<BufferHandle> {
        self.entries
            .get(&field)
            .map(|entry| entry.handle)
            .ok_or(SimulationError::UnknownField(field))
    }

    pub fn owner(&self, field: FieldName) -> Option<Owner> {
        self.entries.get(&field).map(|entry| entry.owner)
    }

    pub(crate) fn set_owner(&mut self, field: FieldName, owner: Owner) {
        if let Some(entry) = self.entries.get_mut(&field) {
            entry.owner = owner;
        }
    }

    /// Dual-owned entries in field order.
    pub fn dual_owned(&self) -> impl Iterator<Item = &BufferEntry> + '_ {
        self.entries
            .values()
            .filter(|entry| entry.role == BufferRole::DualOwned)
    }

    /// Rasterizer ids in attribute order (position, color, mass).
    pub fn draw_list(&self) -> Vec<RasterBufferId> {
        self.dual_owned().filter_map(|entry| entry.raster_id).collect()
    }

    /// Dual-owned fields currently held by the compute engine.
    pub fn compute_owned(&self) -> usize {
        self.dual_owned()
            .filter(|entry| entry.owner == Owner::Compute)
            .count()
    }

    /// Number of device allocations made since creation.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroys every buffer. Refuses while any dual-owned buffer is held
    /// by the compute engine. Entries are dropped even if a release fails;
    /// the first failure is returned.
    pub fn clear<S, C, R>(&mut self, compute: &mut C, raster: &mut R) -> SimResult<()>
    where
        C: ComputeBackend<Shared = S>,
        R: Rasterizer<Shared = S>,
    {
        if let Some(entry) = self.dual_owned().find(|entry| entry.owner == Owner::Compute) {
            return Err(BackendError::OwnershipViolation {
                buffer: entry.field.to_string(),
                message: "cannot destroy a buffer the compute engine owns".into(),
            }
            .into());
        }

        let mut first_error = None;
        for (field, entry) in std::mem::take(&mut self.entries) {
            let mut result = compute.release_buffer(entry.handle);
            if let Some(raster_id) = entry.raster_id {
                result = result.and(raster.destroy_shared_buffer(raster_id));
            }
            if let Err(err) = result {
                warn!("Failed to destroy {field} buffer: {err}");
                first_error.get_or_insert(err);
            }
        }
        info!("Destroyed all particle buffers");

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{Event, RecordingAccelerator, RecordingCompute, RecordingRasterizer};
    use crate::backend::Accelerator;

    fn open() -> (RecordingAccelerator, RecordingCompute, RecordingRasterizer) {
        let mut accelerator = RecordingAccelerator::single_gpu();
        let platform = accelerator.platforms().unwrap().remove(0);
        let device = accelerator.devices(&platform).unwrap().remove(0);
        let (compute, raster) = accelerator.open(&device).unwrap();
        (accelerator, compute, raster)
    }

    #[test]
    fn test_roles_match_kernel_layout() {
        assert_eq!(FieldName::Position.role(), BufferRole::DualOwned);
        assert_eq!(FieldName::Mass.role(), BufferRole::DualOwned);
        assert_eq!(FieldName::Velocity.role(), BufferRole::ComputeOnly);
        assert_eq!(FieldName::InitialPosition.role(), BufferRole::ComputeOnly);
    }

    #[test]
    fn test_dual_owned_update_copies_in_place() {
        let (accelerator, mut compute, mut raster) = open();
        let mut registry = SharedBufferRegistry::new();

        let first = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Position, &[1u8; 48], BufferRole::DualOwned)
            .unwrap();
        let second = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Position, &[2u8; 48], BufferRole::DualOwned)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.allocations(), 1);
        assert_eq!(raster.live_buffers(), 1);
        assert_eq!(compute.read_buffer(first).unwrap(), vec![2u8; 48]);

        let journal = accelerator.journal();
        assert_eq!(journal.count(|e| matches!(e, Event::RasterBufferCreated { .. })), 1);
        assert_eq!(journal.count(|e| matches!(e, Event::RasterBufferWritten { .. })), 1);
        assert_eq!(journal.count(|e| matches!(e, Event::Acquired { .. })), 0);
    }

    #[test]
    fn test_size_mismatch_leaves_buffer_untouched() {
        let (_accelerator, mut compute, mut raster) = open();
        let mut registry = SharedBufferRegistry::new();
        let handle = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Position, &[5u8; 48], BufferRole::DualOwned)
            .unwrap();

        let err = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Position, &[9u8; 64], BufferRole::DualOwned)
            .unwrap_err();
        assert!(matches!(
            err,
            SimulationError::SizeMismatch {
                field: FieldName::Position,
                expected: 48,
                actual: 64
            }
        ));
        assert_eq!(registry.get(FieldName::Position).unwrap().byte_len, 48);
        assert_eq!(compute.read_buffer(handle).unwrap(), vec![5u8; 48]);
    }

    #[test]
    fn test_compute_only_may_be_recreated() {
        let (_accelerator, mut compute, mut raster) = open();
        let mut registry = SharedBufferRegistry::new();
        let first = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Velocity, &[0u8; 16], BufferRole::ComputeOnly)
            .unwrap();
        let same = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Velocity, &[1u8; 16], BufferRole::ComputeOnly)
            .unwrap();
        assert_eq!(first, same);

        let grown = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Velocity, &[1u8; 32], BufferRole::ComputeOnly)
            .unwrap();
        assert_ne!(first, grown);
        assert_eq!(registry.allocations(), 2);
        assert_eq!(compute.live_buffers(), 1);
        assert_eq!(registry.get(FieldName::Velocity).unwrap().raster_id, None);
    }

    #[test]
    fn test_role_cannot_change() {
        let (_accelerator, mut compute, mut raster) = open();
        let mut registry = SharedBufferRegistry::new();
        registry
            .create_or_update(&mut compute, &mut raster, FieldName::Color, &[0u8; 16], BufferRole::DualOwned)
            .unwrap();
        let err = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Color, &[0u8; 16], BufferRole::ComputeOnly)
            .unwrap_err();
        assert!(matches!(err, SimulationError::RoleMismatch { .. }));
    }

    #[test]
    fn test_check_update_writes_nothing() {
        let (accelerator, mut compute, mut raster) = open();
        let mut registry = SharedBufferRegistry::new();
        registry
            .create_or_update(&mut compute, &mut raster, FieldName::Mass, &[0u8; 16], BufferRole::DualOwned)
            .unwrap();
        let journal = accelerator.journal();
        journal.clear();

        assert!(registry.check_update(FieldName::Mass, 16, BufferRole::DualOwned).is_ok());
        assert!(registry.check_update(FieldName::Velocity, 64, BufferRole::ComputeOnly).is_ok());
        assert!(matches!(
            registry.check_update(FieldName::Mass, 20, BufferRole::DualOwned),
            Err(SimulationError::SizeMismatch { expected: 16, actual: 20, .. })
        ));
        assert!(matches!(
            registry.check_update(FieldName::Mass, 16, BufferRole::ComputeOnly),
            Err(SimulationError::RoleMismatch { .. })
        ));
        assert!(matches!(
            registry.check_update(FieldName::Color, 0, BufferRole::DualOwned),
            Err(SimulationError::EmptyField)
        ));
        assert!(journal.is_empty());
    }

    #[test]
    fn test_raw_copy_refused_while_compute_owns() {
        let (_accelerator, mut compute, mut raster) = open();
        let mut registry = SharedBufferRegistry::new();
        registry
            .create_or_update(&mut compute, &mut raster, FieldName::Mass, &[0u8; 4], BufferRole::DualOwned)
            .unwrap();
        registry.set_owner(FieldName::Mass, Owner::Compute);

        let err = registry
            .create_or_update(&mut compute, &mut raster, FieldName::Mass, &[1u8; 4], BufferRole::DualOwned)
            .unwrap_err();
        assert!(matches!(
            err,
            SimulationError::Backend(BackendError::OwnershipViolation { .. })
        ));
        assert!(registry.clear(&mut compute, &mut raster).is_err());
    }

    #[test]
    fn test_draw_list_is_in_attribute_order() {
        let (_accelerator, mut compute, mut raster) = open();
        let mut registry = SharedBufferRegistry::new();
        for field in [FieldName::Mass, FieldName::Velocity, FieldName::Color, FieldName::Position] {
            let size = field.record_size() as usize;
            registry
                .create_or_update(&mut compute, &mut raster, field, &vec![0u8; size], field.role())
                .unwrap();
        }
        let ids = registry.draw_list();
        let expected: Vec<_> = [FieldName::Position, FieldName::Color, FieldName::Mass]
            .iter()
            .map(|f| registry.get(*f).unwrap().raster_id.unwrap())
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_failed_registration_destroys_raster_buffer() {
        let (accelerator, mut compute, mut raster) = open();
        accelerator
            .faults()
            .fail_once(crate::backend::recording::Op::RegisterShared);
        let mut registry = SharedBufferRegistry::new();
        assert!(registry
            .create_or_update(&mut compute, &mut raster, FieldName::Position, &[0u8; 16], BufferRole::DualOwned)
            .is_err());
        assert!(registry.is_empty());
        assert_eq!(raster.live_buffers(), 0);
    }

    #[test]
    fn test_clear_destroys_everything() {
        let (_accelerator, mut compute, mut raster) = open();
        let mut registry = SharedBufferRegistry::new();
        for field in FieldName::ALL {
            let size = field.record_size() as usize * 2;
            registry
                .create_or_update(&mut compute, &mut raster, field, &vec![0u8; size], field.role())
                .unwrap();
        }
        assert_eq!(registry.len(), 6);

        registry.clear(&mut compute, &mut raster).unwrap();
        assert!(registry.is_empty());
        assert_eq!(compute.live_buffers(), 0);
        assert_eq!(raster.live_buffers(), 0);
    }
}
