//! Integration tests: the control loop against scripted and real solvers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use approx::assert_relative_eq;
use nalgebra::DVector;
use rover_core::config::{FailurePolicy, RoverConfig, StalePolicy};
use rover_core::error::{OptimizationError, RoverError};
use rover_core::types::{Input, PixelRect};
use rover_mpc::nlp::{NlpProblem, NlpSolution, NlpSolver};
use rover_mpc::{DecisionLayout, DiffDrive, MpcConfig, MpcController};
use rover_sim::{AlertState, CommandSource, ControlLoop, Environment, TickOutcome};
use rover_test_utils::{DelayedSolver, FailingSolver, FixedSolver, RecordingSolver, arena_config};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const HORIZON: usize = 5;
const DECISION_LEN: usize = 25;
const INPUT_OFFSET: usize = 15;

/// Fails on the listed call indices and returns a fixed first input otherwise.
struct ScriptedSolver {
    calls: AtomicUsize,
    fail_on: Vec<usize>,
    fixed: FixedSolver,
    failing: FailingSolver,
}

impl ScriptedSolver {
    fn new(fail_on: Vec<usize>, v: f64, omega: f64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on,
            fixed: FixedSolver::with_first_input(DECISION_LEN, INPUT_OFFSET, HORIZON, v, omega),
            failing: FailingSolver::new(),
        }
    }
}

impl NlpSolver for ScriptedSolver {
    fn solve(&self, problem: &dyn NlpProblem, initial_guess: DVector<f64>) -> NlpSolution {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&call) {
            self.failing.solve(problem, initial_guess)
        } else {
            self.fixed.solve(problem, initial_guess)
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn open_arena() -> RoverConfig {
    arena_config([200.0, 200.0, 0.0], PixelRect::new(1200, 100, 50, 50), 0, 4)
}

fn build(config: &RoverConfig, solver: Box<dyn NlpSolver>) -> ControlLoop {
    let mpc = MpcConfig::try_from(&config.controller).unwrap();
    let controller = MpcController::with_solver(mpc, DiffDrive, solver).unwrap();
    let env = Environment::from_config(&config.sim, &config.environment).unwrap();
    ControlLoop::with_controller(config.sim.clone(), env, controller).unwrap()
}

fn moved(outcome: TickOutcome) -> (Input, CommandSource) {
    match outcome {
        TickOutcome::Moved { command, source } => (command, source),
        other @ TickOutcome::Collision { .. } => panic!("unexpected {other:?}"),
    }
}

fn distance_to(control: &ControlLoop, x: f64, y: f64) -> f64 {
    let state = control.robot().state();
    (state.x - x).hypot(state.y - y)
}

// ---------------------------------------------------------------------------
// Collision gate and bounce
// ---------------------------------------------------------------------------

#[test]
fn collision_halts_robot_and_obstacle() {
    // Clip point (500, 525) is 64 px from the robot, inside the 65 px halo.
    let config = arena_config([436.0, 525.0, 0.0], PixelRect::new(500, 500, 50, 50), 8, -3);
    let recording = RecordingSolver::new(FixedSolver::with_first_input(
        DECISION_LEN,
        INPUT_OFFSET,
        HORIZON,
        5.0,
        0.0,
    ));
    let guesses = recording.guesses();
    let mut control = build(&config, Box::new(recording));

    let outcome = control.tick().unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Collision {
            obstacle: "mover".into()
        }
    );
    assert!(guesses.lock().unwrap().is_empty());
    assert_eq!(*control.robot().input(), Input::zeros());
    assert_relative_eq!(control.robot().state().x, 436.0, epsilon = 1e-6);

    let mover = control.environment().obstacle("mover").unwrap();
    assert_eq!(mover.velocity(), (0, 0));
    assert_eq!(mover.rect().left, 500);

    let snapshot = control.snapshot();
    assert_eq!(snapshot.alert, AlertState::Collision);
    assert_eq!(control.stats().collisions, 1);
}

#[test]
fn left_margin_bounce_flips_dx_only() {
    let config = arena_config([200.0, 200.0, 0.0], PixelRect::new(10, 400, 50, 50), -6, 4);
    let mut control = build(&config, Box::new(ScriptedSolver::new(vec![], 0.0, 0.0)));

    let (_, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::Optimizer);
    let mover = control.environment().obstacle("mover").unwrap();
    assert_eq!(mover.velocity(), (6, 4));
    assert_eq!((mover.rect().left, mover.rect().top), (16, 404));
    assert_eq!(control.alert(), AlertState::Nominal);
}

#[test]
fn set_obstacle_velocity_validates_between_ticks() {
    let mut control = build(&open_arena(), Box::new(ScriptedSolver::new(vec![], 0.0, 0.0)));
    control.set_obstacle_velocity("mover", -3.0, 0.0).unwrap();
    assert!(control.set_obstacle_velocity("mover", 0.5, 0.0).is_err());
    control.tick().unwrap();
    assert_eq!(control.environment().obstacle("mover").unwrap().rect().left, 1197);
}

// ---------------------------------------------------------------------------
// Failure policies
// ---------------------------------------------------------------------------

#[test]
fn hold_last_reapplies_previous_command() {
    let mut config = open_arena();
    config.sim.failure_policy = FailurePolicy::HoldLast;
    let mut control = build(&config, Box::new(ScriptedSolver::new(vec![1], 2.0, 0.0)));

    let (first, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::Optimizer);
    assert_relative_eq!(first.x, 2000.0, epsilon = 1e-9);

    let (second, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::HoldLast);
    assert_eq!(second, first);
    assert_eq!(control.stats().fallbacks, 1);
}

#[test]
fn retry_relaxed_starts_from_hold_guess() {
    let mut config = open_arena();
    config.sim.failure_policy = FailurePolicy::RetryRelaxed;
    let recording = RecordingSolver::new(ScriptedSolver::new(vec![0], 2.0, 0.0));
    let guesses = recording.guesses();
    let mut control = build(&config, Box::new(recording));

    let (command, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::Retry);
    assert_relative_eq!(command.x, 2000.0, epsilon = 1e-9);

    let guesses = guesses.lock().unwrap();
    assert_eq!(guesses.len(), 2);
    let state = DVector::from_vec(vec![200.0, 200.0, 0.0]);
    assert_eq!(guesses[1], DecisionLayout::new(HORIZON, 3, 2).hold_guess(&state));
}

#[test]
fn retry_relaxed_falls_back_to_safe_stop() {
    let mut config = open_arena();
    config.sim.failure_policy = FailurePolicy::RetryRelaxed;
    let mut control = build(&config, Box::new(FailingSolver::new()));

    let (command, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::SafeStop);
    assert_eq!(command, Input::zeros());
    assert_eq!(control.stats().failures, 2);
    assert_eq!(control.stats().fallbacks, 1);
}

#[test]
fn fatal_policy_propagates_failure() {
    let mut config = open_arena();
    config.sim.failure_policy = FailurePolicy::Fatal;
    let mut control = build(&config, Box::new(FailingSolver::new()));

    let err = control.tick().unwrap_err();
    assert!(matches!(
        err,
        RoverError::Optimization(OptimizationError::Failed { .. })
    ));
    assert_eq!(control.tick_count(), 0);
}

// ---------------------------------------------------------------------------
// Warm start
// ---------------------------------------------------------------------------

#[test]
fn warm_start_passes_shifted_decision() {
    let mut config = open_arena();
    config.controller.warm_start = true;
    #[allow(clippy::cast_precision_loss)]
    let decision = DVector::from_fn(DECISION_LEN, |i, _| i as f64 * 0.01);
    let recording = RecordingSolver::new(FixedSolver::new(decision.clone()));
    let guesses = recording.guesses();
    let mut control = build(&config, Box::new(recording));

    control.tick().unwrap();
    control.tick().unwrap();

    let guesses = guesses.lock().unwrap();
    let layout = DecisionLayout::new(HORIZON, 3, 2);
    assert_eq!(guesses[0], layout.initial_guess(0.0, 0.0));
    assert_eq!(guesses[1], layout.shift(&decision));
}

#[test]
fn cold_start_every_tick_by_default() {
    let recording = RecordingSolver::new(ScriptedSolver::new(vec![], 1.0, 0.0));
    let guesses = recording.guesses();
    let mut control = build(&open_arena(), Box::new(recording));
    control.run(3).unwrap();
    let guesses = guesses.lock().unwrap();
    assert_eq!(guesses.len(), 3);
    assert!(guesses.iter().all(|g| *g == guesses[0]));
}

// ---------------------------------------------------------------------------
// Background solve
// ---------------------------------------------------------------------------

fn async_loop(policy: StalePolicy, delay: Duration) -> ControlLoop {
    let mut config = open_arena();
    config.sim.async_solve = true;
    config.sim.stale_policy = policy;
    let solver = DelayedSolver::new(
        FixedSolver::with_first_input(DECISION_LEN, INPUT_OFFSET, HORIZON, 2.0, 0.0),
        delay,
    );
    build(&config, Box::new(solver))
}

#[test]
fn block_policy_waits_for_result() {
    let mut control = async_loop(StalePolicy::Block, Duration::from_millis(30));
    let (command, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::Optimizer);
    assert_relative_eq!(command.x, 2000.0, epsilon = 1e-9);
    assert_eq!(control.stats().stale_ticks, 0);
}

#[test]
fn drop_policy_applies_zero_until_result_arrives() {
    let mut control = async_loop(StalePolicy::Drop, Duration::from_millis(150));

    let (command, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::Stale);
    assert_eq!(command, Input::zeros());

    thread::sleep(Duration::from_millis(500));
    let (command, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::Optimizer);
    assert_relative_eq!(command.x, 2000.0, epsilon = 1e-9);
    assert_eq!(control.stats().stale_ticks, 1);
}

#[test]
fn hold_last_stale_policy_repeats_command() {
    let mut control = async_loop(StalePolicy::HoldLast, Duration::from_millis(150));

    control.tick().unwrap();
    thread::sleep(Duration::from_millis(500));
    let (fresh, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::Optimizer);

    let (held, source) = moved(control.tick().unwrap());
    assert_eq!(source, CommandSource::Stale);
    assert_eq!(held, fresh);
}

// ---------------------------------------------------------------------------
// Real solver
// ---------------------------------------------------------------------------

/// Controller step of 1 makes the prediction match the robot's per-tick motion.
fn real_solver_config() -> RoverConfig {
    let mut config = arena_config([200.0, 200.0, 0.0], PixelRect::new(1300, 50, 50, 50), 1, 0);
    config.controller.dt = 1.0;
    config
}

#[test]
fn real_solver_drives_robot_toward_target() {
    let config = real_solver_config();
    let mut control = ControlLoop::new(&config).unwrap();
    let initial = distance_to(&control, 500.0, 700.0);

    for tick in 0..30 {
        let outcome = control.tick().unwrap_or_else(|e| panic!("tick {tick}: {e}"));
        assert!(!outcome.is_collision(), "tick {tick}");
    }
    let last = distance_to(&control, 500.0, 700.0);
    assert!(last < 0.5 * initial, "distance {initial} -> {last}");
    let stats = control.stats();
    assert_eq!(stats.failures, 0, "{stats:?}");
    assert_eq!(stats.fallbacks, 0, "{stats:?}");
    assert!(stats.solves > 0);
    assert_eq!(control.snapshot().predicted_path.len(), 5);
}

#[test]
fn default_config_reaches_target_without_fallbacks() {
    let mut control = ControlLoop::new(&RoverConfig::default()).unwrap();
    let initial = distance_to(&control, 500.0, 700.0);

    for tick in 0..40 {
        let outcome = control.tick().unwrap_or_else(|e| panic!("tick {tick}: {e}"));
        let (_, source) = moved(outcome);
        assert_eq!(source, CommandSource::Optimizer, "tick {tick}");
    }
    let stats = control.stats();
    assert_eq!(stats.failures, 0, "{stats:?}");
    assert_eq!(stats.fallbacks, 0, "{stats:?}");
    let last = distance_to(&control, 500.0, 700.0);
    assert!(last < 0.1 * initial, "distance {initial} -> {last}");
    assert!(control.robot().state()[2].is_finite());
}

#[test]
fn blocking_worker_matches_inline_solve() {
    let config = real_solver_config();
    let mut inline = ControlLoop::new(&config).unwrap();

    let mut threaded_config = config;
    threaded_config.sim.async_solve = true;
    let mut threaded = ControlLoop::new(&threaded_config).unwrap();

    for _ in 0..5 {
        inline.tick().unwrap();
        threaded.tick().unwrap();
    }
    assert_relative_eq!(*inline.robot().state(), *threaded.robot().state(), epsilon = 1e-12);
}
