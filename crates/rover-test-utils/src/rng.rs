//! Deterministic RNG utilities for reproducible tests.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rover_core::types::State;

/// Create a deterministic `ChaCha8Rng` from a seed.
///
/// All test randomization should go through this to ensure reproducibility.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Uniform random pose inside a `width x height` screen, heading in `[-pi, pi)`.
pub fn random_pose(rng: &mut impl Rng, width: f64, height: f64) -> State {
    State::new(
        rng.gen_range(0.0..width),
        rng.gen_range(0.0..height),
        rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
