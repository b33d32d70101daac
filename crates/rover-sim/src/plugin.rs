//! Bevy integration: tick the control loop once per frame.
//!
//! Insert a [`RoverLoop`] resource and add [`RoverSimPlugin`]; renderers read
//! [`LatestSnapshot`].

use bevy::prelude::*;
use tracing::error;

use crate::control::{ControlLoop, TickOutcome};
use crate::snapshot::WorldSnapshot;

/// The control loop, owned by the ECS world.
#[derive(Resource, Debug)]
pub struct RoverLoop(pub ControlLoop);

/// World state after the most recent tick.
#[derive(Resource, Clone, Debug, Default)]
pub struct LatestSnapshot(pub Option<WorldSnapshot>);

/// Outcome of the most recent tick. A tick error halts the loop.
#[derive(Resource, Clone, Debug, Default)]
pub struct LoopStatus {
    pub last_outcome: Option<TickOutcome>,
    pub error: Option<String>,
    pub halted: bool,
}

pub struct RoverSimPlugin;

impl Plugin for RoverSimPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<LatestSnapshot>()
            .init_resource::<LoopStatus>()
            .add_systems(Update, control_tick_system);
    }
}

/// Run one tick and publish the snapshot. Does nothing until a [`RoverLoop`]
/// is inserted or after the loop halted.
pub fn control_tick_system(
    control: Option<ResMut<RoverLoop>>,
    mut snapshot: ResMut<LatestSnapshot>,
    mut status: ResMut<LoopStatus>,
) {
    let Some(mut control) = control else {
        return;
    };
    if status.halted {
        return;
    }
    match control.0.tick() {
        Ok(outcome) => status.last_outcome = Some(outcome),
        Err(e) => {
            error!(error = %e, "control loop halted");
            status.error = Some(e.to_string());
            status.halted = true;
        }
    }
    snapshot.0 = Some(control.0.snapshot());
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_core::config::FailurePolicy;
    use rover_core::types::PixelRect;
    use rover_mpc::{MpcConfig, MpcController};
    use rover_test_utils::{FailingSolver, arena_config};

    use crate::environment::Environment;

    fn failing_loop(policy: FailurePolicy) -> ControlLoop {
        let mut config = arena_config([200.0, 200.0, 0.0], PixelRect::new(1200, 100, 50, 50), 0, 4);
        config.sim.failure_policy = policy;
        let mpc = MpcConfig::try_from(&config.controller).unwrap();
        let controller =
            MpcController::with_solver(mpc, rover_mpc::DiffDrive, Box::new(FailingSolver::new())).unwrap();
        let env = Environment::from_config(&config.sim, &config.environment).unwrap();
        ControlLoop::with_controller(config.sim, env, controller).unwrap()
    }

    #[test]
    fn plugin_without_loop_is_idle() {
        let mut app = App::new();
        app.add_plugins(RoverSimPlugin);
        app.update();
        assert!(app.world().resource::<LatestSnapshot>().0.is_none());
    }

    #[test]
    fn plugin_ticks_and_publishes_snapshot() {
        let mut app = App::new();
        app.add_plugins(RoverSimPlugin);
        app.insert_resource(RoverLoop(failing_loop(FailurePolicy::SafeStop)));
        app.update();
        app.update();

        let snapshot = app.world().resource::<LatestSnapshot>().0.clone().unwrap();
        assert_eq!(snapshot.tick, 2);
        let status = app.world().resource::<LoopStatus>();
        assert!(!status.halted);
        assert!(status.last_outcome.is_some());
    }

    #[test]
    fn fatal_failure_halts_the_loop() {
        let mut app = App::new();
        app.add_plugins(RoverSimPlugin);
        app.insert_resource(RoverLoop(failing_loop(FailurePolicy::Fatal)));
        app.update();
        app.update();

        let status = app.world().resource::<LoopStatus>();
        assert!(status.halted);
        assert!(status.error.as_deref().unwrap().contains("iteration limit reached"));
        assert_eq!(app.world().resource::<RoverLoop>().0.tick_count(), 0);
    }
}
