//! Controller configuration, requests and results.

use nalgebra::{DMatrix, DVector, Vector2};
use rover_core::config::{ConstraintMode, ControllerConfig, SolverKind};
use rover_core::error::ConfigError;

/// Validated controller configuration with dense weight matrices.
#[derive(Clone, Debug)]
pub struct MpcConfig {
    pub mode: ConstraintMode,
    /// State dimension.
    pub nx: usize,
    /// Input dimension.
    pub nu: usize,
    /// End value of the state initial-guess ramp.
    pub x_guess: f64,
    /// End value of the input initial-guess ramp.
    pub u_guess: f64,
    /// Prediction horizon (number of steps).
    pub horizon: usize,
    /// Transition time step in seconds.
    pub dt: f64,
    /// State weights, `nx x nx`.
    pub q: DMatrix<f64>,
    /// Input weights, `nu x nu`.
    pub r: DMatrix<f64>,
    pub solver: SolverKind,
    pub verbose: bool,
    pub max_iterations: u32,
    pub tolerance: f64,
    pub warm_start: bool,
    pub safety_radius: f64,
    pub avoidance_steps: usize,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            mode: ConstraintMode::Dms,
            nx: 3,
            nu: 2,
            x_guess: 0.0,
            u_guess: 0.0,
            horizon: 10,
            dt: 1.0,
            q: DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 1.0, 0.0])),
            r: DMatrix::from_diagonal(&DVector::from_vec(vec![0.1, 0.1])),
            solver: SolverKind::Sqp,
            verbose: false,
            max_iterations: 100,
            tolerance: 1e-6,
            warm_start: false,
            safety_radius: 30.0,
            avoidance_steps: 1,
        }
    }
}

impl TryFrom<&ControllerConfig> for MpcConfig {
    type Error = ConfigError;

    fn try_from(config: &ControllerConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        Ok(Self {
            mode: config.mode,
            nx: config.nx,
            nu: config.nu,
            x_guess: config.x_guess,
            u_guess: config.u_guess,
            horizon: config.horizon,
            dt: config.dt,
            q: config.q_matrix()?,
            r: config.r_matrix()?,
            solver: config.solver_kind()?,
            verbose: config.verbose,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            warm_start: config.warm_start,
            safety_radius: config.safety_radius,
            avoidance_steps: config.avoidance_steps,
        })
    }
}

impl MpcConfig {
    /// Check invariants that hold regardless of how the config was built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dt.is_nan() || self.dt <= 0.0 {
            return Err(ConfigError::InvalidDt(self.dt));
        }
        if self.horizon < 2 {
            return Err(ConfigError::HorizonTooShort(self.horizon));
        }
        if self.q.shape() != (self.nx, self.nx) {
            return Err(ConfigError::DimensionMismatch {
                field: "q".into(),
                expected: self.nx,
                got: self.q.nrows(),
            });
        }
        if self.r.shape() != (self.nu, self.nu) {
            return Err(ConfigError::DimensionMismatch {
                field: "r".into(),
                expected: self.nu,
                got: self.r.nrows(),
            });
        }
        if !rover_core::config::is_positive_semidefinite(&self.q) {
            return Err(ConfigError::NotPositiveSemidefinite("q".into()));
        }
        if !rover_core::config::is_positive_semidefinite(&self.r) {
            return Err(ConfigError::NotPositiveSemidefinite("r".into()));
        }
        if self.avoidance_steps == 0 || self.avoidance_steps > self.horizon {
            return Err(ConfigError::InvalidValue {
                field: "avoidance_steps".into(),
                message: format!("must be in 1..={}, got {}", self.horizon, self.avoidance_steps),
            });
        }
        if self.tolerance.is_nan() || self.tolerance <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tolerance".into(),
                message: format!("must be > 0, got {}", self.tolerance),
            });
        }
        Ok(())
    }
}

/// One optimization request. Owned so it can be handed to a worker thread.
#[derive(Clone, Debug)]
pub struct MpcRequest {
    /// Measured state, length `nx`.
    pub state: DVector<f64>,
    /// Reference state held over the horizon, length `nx`.
    pub reference: DVector<f64>,
    /// Obstacle positions to keep `safety_radius` away from.
    pub obstacles: Vec<Vector2<f64>>,
    /// Starting decision vector. `None` builds the cold-start ramp.
    pub initial_guess: Option<DVector<f64>>,
}

impl MpcRequest {
    pub fn new(state: DVector<f64>, reference: DVector<f64>, obstacle: Vector2<f64>) -> Self {
        Self {
            state,
            reference,
            obstacles: vec![obstacle],
            initial_guess: None,
        }
    }

    #[must_use]
    pub fn with_initial_guess(mut self, guess: DVector<f64>) -> Self {
        self.initial_guess = Some(guess);
        self
    }
}

/// Unpacked solution of one optimization.
#[derive(Clone, Debug)]
pub struct OptimizerResult {
    /// Predicted states, `horizon x nx`.
    pub states: DMatrix<f64>,
    /// Predicted inputs, `horizon x nu`.
    pub inputs: DMatrix<f64>,
    pub success: bool,
    pub cost: f64,
    /// Raw decision vector, reusable as a warm start.
    pub decision: DVector<f64>,
    pub iterations: u32,
    /// Wall-clock solve time in microseconds.
    pub solve_time_us: u64,
}

impl OptimizerResult {
    /// First predicted input, the one MPC applies.
    pub fn first_input(&self) -> DVector<f64> {
        self.inputs.row(0).transpose()
    }
}
