//! Particle records and the parallel-array particle field.

use std::fmt;
use std::str::FromStr;

use bytemuck::{Pod, Zeroable};

use crate::error::{SimResult, SimulationError};

/// Four packed floats: a position/velocity (`x, y, z, w`) or a color (`r, g, b, a`).
///
/// Layout matches WGSL `vec4<f32>` so slices cast straight into buffer bytes.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vec4 {
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// A point with `w = 1`.
    pub const fn point(x: f32, y: f32, z: f32) -> Self {
        Self::new(x, y, z, 1.0)
    }
}

/// Size in bytes of one position, velocity or color record.
pub const VEC4_RECORD_SIZE: u64 = std::mem::size_of::<Vec4>() as u64;
/// Size in bytes of one mass record.
pub const MASS_RECORD_SIZE: u64 = std::mem::size_of::<f32>() as u64;

/// The closed set of named particle buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldName {
    Position,
    Color,
    Mass,
    Velocity,
    InitialPosition,
    InitialVelocity,
}

impl FieldName {
    pub const ALL: [FieldName; 6] = [
        FieldName::Position,
        FieldName::Color,
        FieldName::Mass,
        FieldName::Velocity,
        FieldName::InitialPosition,
        FieldName::InitialVelocity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::Position => "position",
            FieldName::Color => "color",
            FieldName::Mass => "mass",
            FieldName::Velocity => "velocity",
            FieldName::InitialPosition => "initial_position",
            FieldName::InitialVelocity => "initial_velocity",
        }
    }

    /// Bytes per particle for this field.
    pub fn record_size(self) -> u64 {
        match self {
            FieldName::Mass => MASS_RECORD_SIZE,
            _ => VEC4_RECORD_SIZE,
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldName::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| format!("unknown particle field `{s}`"))
    }
}

/// `count` particles stored as parallel arrays, one per attribute.
///
/// All arrays always have the same length; the constructor is the only way
/// to build one, so the invariant holds for every value of this type.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleField {
    positions: Vec<Vec4>,
    velocities: Vec<Vec4>,
    colors: Vec<Vec4>,
    masses: Vec<f32>,
}

impl ParticleField {
    pub fn new(
        positions: Vec<Vec4>,
        velocities: Vec<Vec4>,
        colors: Vec<Vec4>,
        masses: Vec<f32>,
    ) -> SimResult<Self> {
        let count = positions.len();
        if count == 0 {
            return Err(SimulationError::EmptyField);
        }
        for (field, len) in [
            (FieldName::Velocity, velocities.len()),
            (FieldName::Color, colors.len()),
            (FieldName::Mass, masses.len()),
        ] {
            if len != count {
                return Err(SimulationError::FieldLengthMismatch {
                    field,
                    expected: count,
                    actual: len,
                });
            }
        }

        Ok(Self {
            positions,
            velocities,
            colors,
            masses,
        })
    }

    /// Borrowing variant of [`ParticleField::new`].
    pub fn from_slices(
        positions: &[Vec4],
        velocities: &[Vec4],
        colors: &[Vec4],
        masses: &[f32],
    ) -> SimResult<Self> {
        Self::new(
            positions.to_vec(),
            velocities.to_vec(),
            colors.to_vec(),
            masses.to_vec(),
        )
    }

    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[Vec4] {
        &self.positions
    }

    pub fn velocities(&self) -> &[Vec4] {
        &self.velocities
    }

    pub fn colors(&self) -> &[Vec4] {
        &self.colors
    }

    pub fn masses(&self) -> &[f32] {
        &self.masses
    }

    /// Raw bytes of one field as uploaded to the device. The initial
    /// snapshots are the current positions and velocities.
    pub fn bytes(&self, field: FieldName) -> &[u8] {
        match field {
            FieldName::Position | FieldName::InitialPosition => {
                bytemuck::cast_slice(&self.positions)
            }
            FieldName::Velocity | FieldName::InitialVelocity => {
                bytemuck::cast_slice(&self.velocities)
            }
            FieldName::Color => bytemuck::cast_slice(&self.colors),
            FieldName::Mass => bytemuck::cast_slice(&self.masses),
        }
    }

    /// Expected byte length of `field` for this particle count.
    pub fn byte_len(&self, field: FieldName) -> u64 {
        self.count() as u64 * field.record_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(n: usize) -> ParticleField {
        ParticleField::new(
            vec![Vec4::point(1.0, 2.0, 3.0); n],
            vec![Vec4::default(); n],
            vec![Vec4::new(1.0, 0.0, 0.0, 1.0); n],
            vec![1.0; n],
        )
        .unwrap()
    }

    #[test]
    fn test_byte_lengths_follow_record_size() {
        for n in [1, 3, 17, 1000] {
            let field = field(n);
            for name in FieldName::ALL {
                assert_eq!(field.bytes(name).len() as u64, n as u64 * name.record_size());
                assert_eq!(field.byte_len(name), field.bytes(name).len() as u64);
            }
        }
    }

    #[test]
    fn test_rejects_unequal_arrays() {
        let err = ParticleField::new(
            vec![Vec4::default(); 3],
            vec![Vec4::default(); 3],
            vec![Vec4::default(); 2],
            vec![1.0; 3],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SimulationError::FieldLengthMismatch {
                field: FieldName::Color,
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_rejects_empty_field() {
        let err = ParticleField::new(vec![], vec![], vec![], vec![]).unwrap_err();
        assert!(matches!(err, SimulationError::EmptyField));
    }

    #[test]
    fn test_field_name_round_trips_through_str() {
        assert_eq!("initial_velocity".parse::<FieldName>(), Ok(FieldName::InitialVelocity));
        assert!("density".parse::<FieldName>().is_err());
    }
}
