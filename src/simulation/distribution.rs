//! Initial particle distributions.

use std::f32::consts::TAU;

use rand::Rng;

use crate::error::SimResult;
use crate::simulation::particles::{ParticleField, Vec4};

pub const RED: Vec4 = Vec4::new(1.0, 0.0, 0.0, 1.0);
pub const WHITE: Vec4 = Vec4::new(1.0, 1.0, 1.0, 1.0);

/// Particles on a ring around the z axis with random radius in
/// `[0.2, 0.5)` and random velocities in `[-1, 1)` per component.
pub fn ring<R: Rng>(rng: &mut R, count: usize) -> SimResult<ParticleField> {
    let mut positions = Vec::with_capacity(count);
    let mut velocities = Vec::with_capacity(count);

    for i in 0..count {
        let radius = rng.random_range(0.2..0.5);
        let angle = TAU * i as f32 / count as f32;
        positions.push(Vec4::point(radius * angle.sin(), radius * angle.cos(), 0.0));
        velocities.push(Vec4::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            1.0,
        ));
    }

    ParticleField::new(positions, velocities, vec![RED; count], vec![1.0; count])
}

/// A flat rotating disc with one heavy body of `central_mass` at the origin.
///
/// Each particle starts at the circular orbit speed `sqrt(G * M / r)` around
/// the central body, tangential to its radius.
pub fn disc<R: Rng>(
    rng: &mut R,
    count: usize,
    central_mass: f32,
    gravitational_constant: f32,
) -> SimResult<ParticleField> {
    let mut positions = Vec::with_capacity(count);
    let mut velocities = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    let mut masses = Vec::with_capacity(count);

    if count > 0 {
        positions.push(Vec4::point(0.0, 0.0, 0.0));
        velocities.push(Vec4::new(0.0, 0.0, 0.0, 1.0));
        colors.push(WHITE);
        masses.push(central_mass);
    }

    for _ in 1..count {
        let radius: f32 = rng.random_range(0.1..1.0);
        let angle: f32 = rng.random_range(0.0..TAU);
        let height = rng.random_range(-0.02..0.02);
        let speed = (gravitational_constant * central_mass / radius).sqrt();

        positions.push(Vec4::point(radius * angle.cos(), radius * angle.sin(), height));
        velocities.push(Vec4::new(-speed * angle.sin(), speed * angle.cos(), 0.0, 1.0));
        colors.push(RED);
        masses.push(rng.random_range(0.5..1.5));
    }

    ParticleField::new(positions, velocities, colors, masses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_ring_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(7);
        let field = ring(&mut rng, 500).unwrap();
        assert_eq!(field.count(), 500);
        for p in field.positions() {
            let r = (p.x * p.x + p.y * p.y).sqrt();
            assert!((0.199..0.501).contains(&r), "radius {r}");
            assert_eq!(p.z, 0.0);
            assert_eq!(p.w, 1.0);
        }
        for v in field.velocities() {
            assert!(v.x.abs() <= 1.0 && v.y.abs() <= 1.0 && v.z.abs() <= 1.0);
        }
        assert!(field.colors().iter().all(|c| *c == RED));
    }

    #[test]
    fn test_seeded_ring_is_reproducible() {
        let a = ring(&mut StdRng::seed_from_u64(42), 64).unwrap();
        let b = ring(&mut StdRng::seed_from_u64(42), 64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_disc_has_heavy_center() {
        let field = disc(&mut StdRng::seed_from_u64(1), 100, 1000.0, 6.674e-11).unwrap();
        assert_eq!(field.masses()[0], 1000.0);
        assert_eq!(field.positions()[0], Vec4::point(0.0, 0.0, 0.0));
        assert!(field.masses()[1..].iter().all(|m| *m < 2.0));
    }

    #[test]
    fn test_empty_distribution_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(ring(&mut rng, 0).is_err());
        assert!(disc(&mut rng, 0, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_disc_starts_on_circular_orbits() {
        let (g, mass) = (6.674e-11, 1000.0);
        let field = disc(&mut StdRng::seed_from_u64(3), 200, mass, g).unwrap();
        for (p, v) in field.positions().iter().zip(field.velocities()).skip(1) {
            let r = (p.x * p.x + p.y * p.y).sqrt();
            let speed = (v.x * v.x + v.y * v.y).sqrt();
            let expected = (g * mass / r).sqrt();
            assert!((speed - expected).abs() <= expected * 1e-4, "r {r}: {speed} vs {expected}");
            // Tangential: no radial component.
            assert!((p.x * v.x + p.y * v.y).abs() <= r * expected * 1e-4);
        }
    }
}
