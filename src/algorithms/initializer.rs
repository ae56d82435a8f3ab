use crate::models::EntityKind;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Box-Muller normal samples drawn from the given generator.
pub fn normal_with<R: Rng>(rng: &mut R, size: usize, mean: f64, std_dev: f64) -> Vec<f64> {
    (0..size)
        .map(|_| {
            // (0, 1] keeps ln() finite
            let u1: f64 = 1.0 - rng.gen::<f64>();
            let u2: f64 = rng.gen();
            let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
            z0 * std_dev + mean
        })
        .collect()
}

fn kind_salt(kind: EntityKind) -> u64 {
    match kind {
        EntityKind::User => 0x5553_4552,
        EntityKind::Item => 0x4954_454d,
    }
}

// splitmix64 finalizer
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Draws latent rows from N(0, std_dev²).
///
/// Every row is seeded from `(seed, kind, index)` alone, so the row a user or
/// item receives does not depend on when it was grown or whether the model was
/// reloaded from a snapshot in between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RowInitializer {
    pub std_dev: f64,
    pub seed: u64,
}

impl RowInitializer {
    pub fn new(std_dev: f64, seed: u64) -> Self {
        Self { std_dev, seed }
    }

    pub fn row_seed(&self, kind: EntityKind, index: usize) -> u64 {
        mix(self.seed ^ mix(kind_salt(kind) ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)))
    }

    pub fn row(&self, kind: EntityKind, index: usize, n_factors: usize) -> DVector<f64> {
        let mut rng = StdRng::seed_from_u64(self.row_seed(kind, index));
        DVector::from_vec(normal_with(&mut rng, n_factors, 0.0, self.std_dev))
    }

    pub fn rows(&self, kind: EntityKind, count: usize, n_factors: usize) -> Vec<DVector<f64>> {
        (0..count).map(|index| self.row(kind, index, n_factors)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_reproducible() {
        let init = RowInitializer::new(0.1, 7);
        assert_eq!(init.row(EntityKind::User, 3, 8), init.row(EntityKind::User, 3, 8));
        assert_ne!(init.row(EntityKind::User, 3, 8), init.row(EntityKind::User, 4, 8));
        assert_ne!(init.row(EntityKind::User, 3, 8), init.row(EntityKind::Item, 3, 8));
    }

    #[test]
    fn test_normal_moments() {
        let mut rng = StdRng::seed_from_u64(1);
        let samples = normal_with(&mut rng, 20_000, 0.0, 0.1);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / samples.len() as f64;

        assert!(mean.abs() < 0.01);
        assert!((var.sqrt() - 0.1).abs() < 0.01);
        assert!(samples.iter().all(|x| x.is_finite()));
    }
}
