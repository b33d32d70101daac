//! Shared test fixtures and utilities for rover crates.
//!
//! Provides deterministic RNG setup, mock NLP solvers with scripted
//! outcomes, and small configuration fixtures.

pub mod fixtures;
pub mod mocks;
pub mod rng;

// ---------------------------------------------------------------------------
// Re-exports for convenience
// ---------------------------------------------------------------------------

pub use fixtures::{arena_config, fast_controller_config};
pub use mocks::{DelayedSolver, FailingSolver, FixedSolver, RecordingSolver};
pub use rng::{random_pose, seeded_rng};
