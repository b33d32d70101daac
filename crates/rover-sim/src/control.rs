//! Per-tick control loop.
//!
//! One tick runs `collision check -> (halt | bounce -> optimize -> apply)`
//! and then advances the obstacles. The loop is the only writer of robot and
//! obstacle state; renderers read [`WorldSnapshot`]s.

use nalgebra::DVector;
use rover_core::config::{FailurePolicy, RoverConfig, SimConfig, StalePolicy};
use rover_core::error::{OptimizationError, RoverError, SimError};
use rover_core::types::Input;
use rover_mpc::{DecisionLayout, MpcController, MpcRequest, OptimizerResult};
use tracing::{debug, error, warn};

use crate::environment::Environment;
use crate::gate::{CollisionGate, GateOutcome};
use crate::robot::Robot;
use crate::snapshot::{AlertState, ObstacleSnapshot, WorldSnapshot};
use crate::stats::TickStats;
use crate::worker::{SolveOutcome, SolveWorker};

// ---------------------------------------------------------------------------
// Tick results
// ---------------------------------------------------------------------------

/// Where a tick's command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    /// First input of a successful solve.
    Optimizer,
    /// Successful retry from the relaxed guess.
    Retry,
    /// Failure policy re-applied the last command.
    HoldLast,
    /// Failure policy commanded zero velocity.
    SafeStop,
    /// The background solve had not finished.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The gate halted the robot in front of `obstacle`.
    Collision { obstacle: String },
    Moved { command: Input, source: CommandSource },
}

impl TickOutcome {
    pub const fn is_collision(&self) -> bool {
        matches!(self, Self::Collision { .. })
    }
}

enum SolveBackend {
    Inline(MpcController),
    Worker(SolveWorker),
}

// ---------------------------------------------------------------------------
// ControlLoop
// ---------------------------------------------------------------------------

/// Owns the world and drives the controller one tick at a time.
pub struct ControlLoop {
    config: SimConfig,
    env: Environment,
    robot: Robot,
    gate: CollisionGate,
    backend: SolveBackend,
    layout: DecisionLayout,
    warm_start: bool,
    last_decision: Option<DVector<f64>>,
    last_command: Input,
    predicted_path: Vec<[f64; 2]>,
    alert: AlertState,
    paused: bool,
    tick: u64,
    stats: TickStats,
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("tick", &self.tick)
            .field("robot", &self.robot)
            .field("alert", &self.alert)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ControlLoop {
    /// Build the world, the robot and a differential-drive controller from a
    /// validated configuration.
    pub fn new(config: &RoverConfig) -> Result<Self, RoverError> {
        config.validate()?;
        let env = Environment::from_config(&config.sim, &config.environment)?;
        let controller = MpcController::from_controller_config(&config.controller)?;
        Self::with_controller(config.sim.clone(), env, controller)
    }

    /// Assemble a loop around an existing controller. With `async_solve` the
    /// controller moves onto a [`SolveWorker`].
    pub fn with_controller(
        config: SimConfig,
        env: Environment,
        controller: MpcController,
    ) -> Result<Self, RoverError> {
        config.validate()?;
        let layout = *controller.layout();
        let warm_start = controller.config().warm_start;
        let backend = if config.async_solve {
            SolveBackend::Worker(SolveWorker::spawn(controller)?)
        } else {
            SolveBackend::Inline(controller)
        };
        debug!(
            async_solve = config.async_solve,
            failure_policy = ?config.failure_policy,
            stale_policy = ?config.stale_policy,
            warm_start,
            "control loop ready"
        );

        Ok(Self {
            robot: Robot::from_config(&config),
            gate: CollisionGate::from_config(&config),
            paused: config.paused,
            config,
            env,
            backend,
            layout,
            warm_start,
            last_decision: None,
            last_command: Input::zeros(),
            predicted_path: Vec::new(),
            alert: AlertState::Nominal,
            tick: 0,
            stats: TickStats::new(),
        })
    }

    pub const fn robot(&self) -> &Robot {
        &self.robot
    }

    pub const fn environment(&self) -> &Environment {
        &self.env
    }

    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub const fn alert(&self) -> AlertState {
        self.alert
    }

    pub const fn tick_count(&self) -> u64 {
        self.tick
    }

    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Freeze or resume obstacle motion.
    pub const fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Change an obstacle's per-tick velocity between ticks.
    pub fn set_obstacle_velocity(&mut self, name: &str, dx: f64, dy: f64) -> Result<(), RoverError> {
        self.env.set_velocity(name, dx, dy)
    }

    /// Run one tick.
    pub fn tick(&mut self) -> Result<TickOutcome, RoverError> {
        let position = self.robot.position();
        if let GateOutcome::Collision { obstacle, .. } = self.gate.check(&position, self.env.obstacles_mut()) {
            self.alert = AlertState::Collision;
            self.last_command = Input::zeros();
            self.apply(Input::zeros())?;
            self.finish_tick();
            self.stats.collisions += 1;
            return Ok(TickOutcome::Collision { obstacle });
        }

        self.alert = AlertState::Nominal;
        self.gate.bounce(self.env.obstacles_mut());

        let request = self.request();
        let (command, source) = self.command(request)?;
        self.apply(command)?;
        self.finish_tick();
        Ok(TickOutcome::Moved { command, source })
    }

    /// Run `ticks` ticks, stopping at the first error.
    pub fn run(&mut self, ticks: u32) -> Result<&TickStats, RoverError> {
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(&self.stats)
    }

    /// Copy of the world after the last tick.
    pub fn snapshot(&self) -> WorldSnapshot {
        let state = self.robot.state();
        let input = self.robot.input();
        WorldSnapshot {
            tick: self.tick,
            pose: [state.x, state.y, state.z],
            input: [input.x, input.y],
            radius: self.robot.radius(),
            alert: self.alert,
            obstacles: self
                .env
                .obstacles()
                .iter()
                .map(|o| ObstacleSnapshot {
                    name: o.name().to_string(),
                    rect: *o.rect(),
                    velocity: o.velocity(),
                    moving: o.is_moving(),
                })
                .collect(),
            target: *self.env.target(),
            predicted_path: self.predicted_path.clone(),
        }
    }

    fn request(&self) -> MpcRequest {
        let state = DVector::from_column_slice(self.robot.state().as_slice());
        let reference = DVector::from_column_slice(self.env.reference().as_slice());
        let offset = self.config.obstacle_offset;
        let obstacles = self
            .env
            .tracked()
            .map(|o| o.center_f64().add_scalar(offset))
            .into_iter()
            .collect();
        let initial_guess = if self.warm_start {
            self.last_decision.as_ref().map(|z| self.layout.shift(z))
        } else {
            None
        };
        MpcRequest {
            state,
            reference,
            obstacles,
            initial_guess,
        }
    }

    fn command(&mut self, request: MpcRequest) -> Result<(Input, CommandSource), RoverError> {
        let Some(outcome) = self.solve(request.clone())? else {
            self.stats.stale_ticks += 1;
            let command = match self.config.stale_policy {
                StalePolicy::HoldLast => self.last_command,
                StalePolicy::Drop | StalePolicy::Block => Input::zeros(),
            };
            debug!(tick = self.tick, "solve still running");
            return Ok((command, CommandSource::Stale));
        };

        match outcome {
            Ok(result) => Ok((self.accept(&result), CommandSource::Optimizer)),
            Err(OptimizationError::Failed { message, iterations }) => {
                self.stats.record_failure(iterations);
                self.fallback(request, message, iterations)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Apply the failure policy after an unsuccessful solve.
    fn fallback(
        &mut self,
        request: MpcRequest,
        message: String,
        iterations: u32,
    ) -> Result<(Input, CommandSource), RoverError> {
        let policy = self.config.failure_policy;
        if policy == FailurePolicy::Fatal {
            error!(tick = self.tick, %message, "optimizer failed");
            return Err(OptimizationError::Failed { message, iterations }.into());
        }
        self.stats.fallbacks += 1;
        warn!(tick = self.tick, %message, ?policy, "optimizer failed, using fallback");

        match policy {
            FailurePolicy::HoldLast => Ok((self.last_command, CommandSource::HoldLast)),
            FailurePolicy::RetryRelaxed => {
                let retry = MpcRequest {
                    initial_guess: Some(self.layout.hold_guess(&request.state)),
                    ..request
                };
                match self.solve_blocking(retry)? {
                    Ok(result) => Ok((self.accept(&result), CommandSource::Retry)),
                    Err(OptimizationError::Failed { iterations, message }) => {
                        self.stats.record_failure(iterations);
                        warn!(tick = self.tick, %message, "relaxed retry failed, stopping");
                        Ok((Input::zeros(), CommandSource::SafeStop))
                    }
                    Err(other) => Err(other.into()),
                }
            }
            FailurePolicy::SafeStop | FailurePolicy::Fatal => Ok((Input::zeros(), CommandSource::SafeStop)),
        }
    }

    /// Solve with the configured backend. `None` means the worker result is
    /// not ready and the stale policy allows moving on.
    fn solve(&mut self, request: MpcRequest) -> Result<Option<SolveOutcome>, SimError> {
        match &mut self.backend {
            SolveBackend::Inline(controller) => Ok(Some(controller.solve(&request))),
            SolveBackend::Worker(worker) => {
                if !worker.is_busy() {
                    worker.submit(request)?;
                }
                match self.config.stale_policy {
                    StalePolicy::Block => worker.recv().map(Some),
                    StalePolicy::Drop | StalePolicy::HoldLast => worker.try_recv(),
                }
            }
        }
    }

    fn solve_blocking(&mut self, request: MpcRequest) -> Result<SolveOutcome, SimError> {
        match &mut self.backend {
            SolveBackend::Inline(controller) => Ok(controller.solve(&request)),
            SolveBackend::Worker(worker) => {
                worker.submit(request)?;
                worker.recv()
            }
        }
    }

    /// Record a successful solve and return its command: the first input
    /// scaled by the robot step.
    fn accept(&mut self, result: &OptimizerResult) -> Input {
        self.stats.record_solve(result.iterations, result.solve_time_us);
        let u = result.first_input();
        let dt = self.robot.dt();
        let command = Input::new(u[0] / dt, u[1] / dt);

        self.predicted_path = result
            .states
            .row_iter()
            .map(|row| [row[0], row[1]])
            .collect();
        self.last_decision = Some(result.decision.clone());
        self.last_command = command;
        command
    }

    fn apply(&mut self, command: Input) -> Result<(), RoverError> {
        let state = self.robot.apply_input(command)?;
        if state.iter().any(|v| !v.is_finite()) {
            error!(tick = self.tick, "robot state diverged");
            return Err(SimError::StateDiverged.into());
        }
        Ok(())
    }

    fn finish_tick(&mut self) {
        self.env.advance(self.paused);
        self.tick += 1;
        self.stats.ticks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_core::types::PixelRect;
    use rover_mpc::MpcConfig;
    use rover_test_utils::{FailingSolver, FixedSolver, arena_config};

    fn far_arena() -> RoverConfig {
        arena_config([200.0, 200.0, 0.0], PixelRect::new(1200, 100, 50, 50), 0, 4)
    }

    fn scripted_loop(config: &RoverConfig, v: f64, omega: f64) -> ControlLoop {
        let mpc = MpcConfig::try_from(&config.controller).unwrap();
        let solver = FixedSolver::with_first_input(25, 15, 5, v, omega);
        let controller = MpcController::with_solver(mpc, rover_mpc::DiffDrive, Box::new(solver)).unwrap();
        let env = Environment::from_config(&config.sim, &config.environment).unwrap();
        ControlLoop::with_controller(config.sim.clone(), env, controller).unwrap()
    }

    #[test]
    fn command_is_first_input_over_robot_dt() {
        let config = far_arena();
        let mut control = scripted_loop(&config, 2.0, 0.0);
        let outcome = control.tick().unwrap();
        let TickOutcome::Moved { command, source } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!(source, CommandSource::Optimizer);
        assert!((command.x - 2000.0).abs() < 1e-9);
        assert!((control.robot().state().x - 202.0).abs() < 1e-6);
        assert_eq!(control.stats().solves, 1);
    }

    #[test]
    fn obstacles_advance_each_tick_unless_paused() {
        let config = far_arena();
        let mut control = scripted_loop(&config, 0.0, 0.0);
        control.tick().unwrap();
        assert_eq!(control.environment().obstacle("mover").unwrap().rect().top, 104);
        control.set_paused(true);
        control.tick().unwrap();
        assert_eq!(control.environment().obstacle("mover").unwrap().rect().top, 104);
        assert_eq!(control.tick_count(), 2);
    }

    #[test]
    fn snapshot_reflects_world() {
        let config = far_arena();
        let mut control = scripted_loop(&config, 1.0, 0.0);
        control.tick().unwrap();
        let snapshot = control.snapshot();
        assert_eq!(snapshot.tick, 1);
        assert_eq!(snapshot.alert, AlertState::Nominal);
        assert_eq!(snapshot.obstacles.len(), 1);
        assert_eq!(snapshot.obstacle("mover").unwrap().velocity, (0, 4));
        assert_eq!(snapshot.predicted_path.len(), 5);
        assert_eq!(snapshot.target, config.environment.target);
    }

    #[test]
    fn request_offsets_tracked_obstacle() {
        let config = far_arena();
        let control = scripted_loop(&config, 0.0, 0.0);
        let request = control.request();
        assert_eq!(request.obstacles.len(), 1);
        assert_eq!(request.obstacles[0].x, 1240.0);
        assert_eq!(request.obstacles[0].y, 140.0);
        assert_eq!(request.reference.as_slice(), &[500.0, 700.0, 0.0]);
        assert!(request.initial_guess.is_none());
    }

    #[test]
    fn safe_stop_on_failure() {
        let config = far_arena();
        let mpc = MpcConfig::try_from(&config.controller).unwrap();
        let controller =
            MpcController::with_solver(mpc, rover_mpc::DiffDrive, Box::new(FailingSolver::new())).unwrap();
        let env = Environment::from_config(&config.sim, &config.environment).unwrap();
        let mut control = ControlLoop::with_controller(config.sim.clone(), env, controller).unwrap();

        let outcome = control.tick().unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Moved {
                command: Input::zeros(),
                source: CommandSource::SafeStop
            }
        );
        assert_eq!(control.stats().failures, 1);
        assert_eq!(control.stats().fallbacks, 1);
    }
}
