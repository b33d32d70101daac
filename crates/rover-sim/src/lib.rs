//! Rover simulation: environment, collision gate and the MPC control loop.
//!
//! [`ControlLoop`] owns the robot and the obstacles and runs one tick per
//! frame. Everything visual is left to the caller, which reads
//! [`WorldSnapshot`]s. With the `bevy` feature, [`plugin::RoverSimPlugin`]
//! drives the loop from a Bevy app.
//!
//! # Example
//!
//! ```no_run
//! use rover_core::config::RoverConfig;
//! use rover_sim::ControlLoop;
//!
//! let mut control = ControlLoop::new(&RoverConfig::default()).unwrap();
//! for _ in 0..100 {
//!     control.tick().unwrap();
//! }
//! println!("{:?}", control.snapshot().pose);
//! ```

pub mod control;
pub mod environment;
pub mod gate;
pub mod geometry;
pub mod robot;
pub mod snapshot;
pub mod stats;
pub mod worker;

#[cfg(feature = "bevy")]
pub mod plugin;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use control::{CommandSource, ControlLoop, TickOutcome};
pub use environment::{Environment, Obstacle};
pub use gate::{CollisionGate, GateOutcome};
pub use robot::Robot;
pub use snapshot::{AlertState, ObstacleSnapshot, WorldSnapshot};
pub use stats::TickStats;
pub use worker::{SolveOutcome, SolveWorker};
