//! Mock NLP solvers with scripted outcomes.
//!
//! Plug these into `MpcController::with_solver` to drive control-loop tests
//! without running a real optimization.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nalgebra::DVector;
use rover_mpc::nlp::{NlpProblem, NlpSolution, NlpSolver, NlpStatus, constraint_violation};

fn solution(problem: &dyn NlpProblem, z: DVector<f64>, status: NlpStatus) -> NlpSolution {
    let violation = constraint_violation(
        &problem.equality_constraints(&z),
        &problem.inequality_constraints(&z),
    );
    NlpSolution {
        objective: problem.objective(&z),
        constraint_violation: violation,
        z,
        status,
        iterations: 1,
    }
}

// ---------------------------------------------------------------------------
// FixedSolver
// ---------------------------------------------------------------------------

/// A solver that always reports success at a fixed decision vector.
pub struct FixedSolver {
    decision: DVector<f64>,
}

impl FixedSolver {
    pub const fn new(decision: DVector<f64>) -> Self {
        Self { decision }
    }

    /// Decision vector of `len` zeros except the first input run set to `(v, omega)`.
    ///
    /// `input_offset` is the flat index of input 0 at step 0 and `horizon` the
    /// run length, matching the column-major layout.
    pub fn with_first_input(len: usize, input_offset: usize, horizon: usize, v: f64, omega: f64) -> Self {
        let mut decision = DVector::zeros(len);
        decision[input_offset] = v;
        decision[input_offset + horizon] = omega;
        Self { decision }
    }
}

impl NlpSolver for FixedSolver {
    fn solve(&self, problem: &dyn NlpProblem, initial_guess: DVector<f64>) -> NlpSolution {
        let z = if self.decision.len() == problem.dimension() {
            self.decision.clone()
        } else {
            initial_guess
        };
        solution(problem, z, NlpStatus::Converged)
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "fixed"
    }
}

// ---------------------------------------------------------------------------
// FailingSolver
// ---------------------------------------------------------------------------

/// A solver that never converges and returns the initial guess.
pub struct FailingSolver {
    status: NlpStatus,
}

impl FailingSolver {
    pub const fn new() -> Self {
        Self {
            status: NlpStatus::MaxIterations,
        }
    }

    pub const fn with_status(status: NlpStatus) -> Self {
        Self { status }
    }
}

impl Default for FailingSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NlpSolver for FailingSolver {
    fn solve(&self, problem: &dyn NlpProblem, initial_guess: DVector<f64>) -> NlpSolution {
        solution(problem, initial_guess, self.status.clone())
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "failing"
    }
}

// ---------------------------------------------------------------------------
// RecordingSolver
// ---------------------------------------------------------------------------

/// Wraps a solver and records every initial guess it is handed.
///
/// Clone the [`guesses`](Self::guesses) handle before boxing the solver to
/// inspect the record afterwards.
pub struct RecordingSolver<S> {
    inner: S,
    guesses: Arc<Mutex<Vec<DVector<f64>>>>,
}

impl<S: NlpSolver> RecordingSolver<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            guesses: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn guesses(&self) -> Arc<Mutex<Vec<DVector<f64>>>> {
        Arc::clone(&self.guesses)
    }
}

impl<S: NlpSolver> NlpSolver for RecordingSolver<S> {
    fn solve(&self, problem: &dyn NlpProblem, initial_guess: DVector<f64>) -> NlpSolution {
        if let Ok(mut guesses) = self.guesses.lock() {
            guesses.push(initial_guess.clone());
        }
        self.inner.solve(problem, initial_guess)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// ---------------------------------------------------------------------------
// DelayedSolver
// ---------------------------------------------------------------------------

/// Sleeps before delegating, to exercise stale-result handling.
pub struct DelayedSolver<S> {
    inner: S,
    delay: Duration,
}

impl<S: NlpSolver> DelayedSolver<S> {
    pub const fn new(inner: S, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl<S: NlpSolver> NlpSolver for DelayedSolver<S> {
    fn solve(&self, problem: &dyn NlpProblem, initial_guess: DVector<f64>) -> NlpSolution {
        thread::sleep(self.delay);
        self.inner.solve(problem, initial_guess)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
