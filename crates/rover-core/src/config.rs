use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{INPUT_DIM, PixelRect, STATE_DIM};

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_screen_width() -> i32 {
    1450
}
const fn default_screen_height() -> i32 {
    1000
}
const fn default_robot_radius() -> f64 {
    30.0
}
const fn default_initial_pose() -> [f64; 3] {
    [200.0, 200.0, 0.0]
}
const fn default_robot_dt() -> f64 {
    1e-3
}
const fn default_ticks() -> u32 {
    500
}
const fn default_obstacle_offset() -> f64 {
    15.0
}
const fn default_collision_margin() -> f64 {
    5.0
}
const fn default_bounce_margin() -> i32 {
    15
}
const fn default_bounce_inset() -> i32 {
    10
}
const fn default_border_thickness() -> i32 {
    10
}
const fn default_target() -> PixelRect {
    PixelRect::new(400, 600, 200, 200)
}
fn default_obstacles() -> Vec<ObstacleConfig> {
    vec![ObstacleConfig {
        name: None,
        left: default_screen_width() / 2,
        top: default_screen_height() / 2,
        width: 50,
        height: 50,
        dx: 8,
        dy: 8,
    }]
}
const fn default_nx() -> usize {
    STATE_DIM
}
const fn default_nu() -> usize {
    INPUT_DIM
}
const fn default_horizon() -> usize {
    10
}
/// One controller step per robot tick: the loop applies `u0 / robot_dt` for
/// `robot_dt`, so the robot moves `u0` per tick and the prediction matches
/// only when `dt` is 1.
const fn default_dt() -> f64 {
    1.0
}
fn default_q() -> Vec<Vec<f64>> {
    vec![
        vec![1.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![0.0, 0.0, 0.0],
    ]
}
fn default_r() -> Vec<Vec<f64>> {
    vec![vec![0.1, 0.0], vec![0.0, 0.1]]
}
fn default_solver() -> String {
    "sqp".into()
}
const fn default_max_iterations() -> u32 {
    100
}
const fn default_tolerance() -> f64 {
    1e-6
}
const fn default_safety_radius() -> f64 {
    30.0
}
const fn default_avoidance_steps() -> usize {
    1
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Dynamics defect formulation used by the constraint builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintMode {
    /// Direct multiple shooting: `x[k+1] = step(x[k], u[k])`.
    #[default]
    #[serde(alias = "DMS")]
    Dms,
    /// Trapezoidal collocation on the continuous-time derivative.
    #[serde(alias = "COLL")]
    Coll,
}

/// What the control loop does when the optimizer reports failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Propagate the failure out of the tick; the caller terminates.
    Fatal,
    /// Re-apply the last successfully computed command.
    HoldLast,
    /// Command zero velocity.
    #[default]
    SafeStop,
    /// Retry once from a guess that holds the measured state, then safe stop.
    RetryRelaxed,
}

/// What a tick does when the background solve has not finished yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Wait for the in-flight solve to complete.
    #[default]
    Block,
    /// Skip this tick's command (zero input).
    Drop,
    /// Re-apply the last command.
    HoldLast,
}

/// Nonlinear program solver identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    /// Sequential quadratic programming with interior-point QP subproblems.
    Sqp,
}

impl FromStr for SolverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqp" | "slsqp" => Ok(Self::Sqp),
            _ => Err(ConfigError::UnknownSolver(s.to_string())),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqp => f.write_str("sqp"),
        }
    }
}

// ---------------------------------------------------------------------------
// SimConfig
// ---------------------------------------------------------------------------

/// Control loop and world configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Screen width in pixels (default: 1450).
    #[serde(default = "default_screen_width")]
    pub screen_width: i32,

    /// Screen height in pixels (default: 1000).
    #[serde(default = "default_screen_height")]
    pub screen_height: i32,

    /// Robot body radius in pixels. The collision halo is `2 * radius + collision_margin`.
    #[serde(default = "default_robot_radius")]
    pub robot_radius: f64,

    /// Initial robot pose [x, y, theta].
    #[serde(default = "default_initial_pose")]
    pub initial_pose: [f64; 3],

    /// Integration step of the simulated robot. The first optimized input is
    /// divided by this before it is applied, so one tick moves the robot by
    /// the optimized displacement.
    #[serde(default = "default_robot_dt")]
    pub robot_dt: f64,

    /// Number of ticks the headless runner executes.
    #[serde(default = "default_ticks")]
    pub ticks: u32,

    /// Offset added to both coordinates of the tracked obstacle center before
    /// it is handed to the optimizer.
    #[serde(default = "default_obstacle_offset")]
    pub obstacle_offset: f64,

    /// Extra distance on top of the robot halo that counts as a collision.
    #[serde(default = "default_collision_margin")]
    pub collision_margin: f64,

    /// Minimum left/top edge coordinate before a moving obstacle bounces.
    #[serde(default = "default_bounce_margin")]
    pub bounce_margin: i32,

    /// Inset from the right/bottom screen edge (beyond the rect size) that triggers a bounce.
    #[serde(default = "default_bounce_inset")]
    pub bounce_inset: i32,

    /// Name of the obstacle the optimizer avoids. `None` picks the first moving obstacle.
    #[serde(default)]
    pub tracked_obstacle: Option<String>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub stale_policy: StalePolicy,

    /// Run the optimizer on a background worker thread.
    #[serde(default)]
    pub async_solve: bool,

    /// Freeze obstacle motion (the loop still runs).
    #[serde(default)]
    pub paused: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            screen_width: default_screen_width(),
            screen_height: default_screen_height(),
            robot_radius: default_robot_radius(),
            initial_pose: default_initial_pose(),
            robot_dt: default_robot_dt(),
            ticks: default_ticks(),
            obstacle_offset: default_obstacle_offset(),
            collision_margin: default_collision_margin(),
            bounce_margin: default_bounce_margin(),
            bounce_inset: default_bounce_inset(),
            tracked_obstacle: None,
            failure_policy: FailurePolicy::default(),
            stale_policy: StalePolicy::default(),
            async_solve: false,
            paused: false,
        }
    }
}

impl SimConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.screen_width <= 0 || self.screen_height <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "screen".into(),
                message: format!(
                    "size must be positive, got {}x{}",
                    self.screen_width, self.screen_height
                ),
            });
        }
        if self.robot_radius.is_nan() || self.robot_radius <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "robot_radius".into(),
                message: format!("must be > 0, got {}", self.robot_radius),
            });
        }
        if self.robot_dt.is_nan() || self.robot_dt <= 0.0 {
            return Err(ConfigError::InvalidDt(self.robot_dt));
        }
        if self.initial_pose.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidValue {
                field: "initial_pose".into(),
                message: "must be finite".into(),
            });
        }
        Ok(())
    }

    /// Collision distance threshold: halo radius plus margin.
    pub fn collision_distance(&self) -> f64 {
        2.0f64.mul_add(self.robot_radius, self.collision_margin)
    }
}

// ---------------------------------------------------------------------------
// EnvironmentConfig
// ---------------------------------------------------------------------------

/// A single obstacle in the environment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObstacleConfig {
    /// Optional name; generated as `obs_<n>` when absent.
    #[serde(default)]
    pub name: Option<String>,
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
    /// Per-tick x displacement in pixels. Non-zero velocity marks the obstacle as moving.
    #[serde(default)]
    pub dx: i32,
    /// Per-tick y displacement in pixels.
    #[serde(default)]
    pub dy: i32,
}

impl ObstacleConfig {
    pub const fn rect(&self) -> PixelRect {
        PixelRect::new(self.left, self.top, self.width, self.height)
    }
}

/// Map layout: borders, target region, obstacles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Thickness of the four static border walls (0 disables them).
    #[serde(default = "default_border_thickness")]
    pub border_thickness: i32,

    /// Target region. The reference pose is its center with heading 0.
    #[serde(default = "default_target")]
    pub target: PixelRect,

    #[serde(default = "default_obstacles")]
    pub obstacles: Vec<ObstacleConfig>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            border_thickness: default_border_thickness(),
            target: default_target(),
            obstacles: default_obstacles(),
        }
    }
}

impl EnvironmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.border_thickness < 0 {
            return Err(ConfigError::InvalidValue {
                field: "border_thickness".into(),
                message: format!("must be >= 0, got {}", self.border_thickness),
            });
        }
        for obs in &self.obstacles {
            if obs.width <= 0 || obs.height <= 0 {
                return Err(ConfigError::InvalidValue {
                    field: "obstacles".into(),
                    message: format!("rect size must be positive, got {}x{}", obs.width, obs.height),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ControllerConfig
// ---------------------------------------------------------------------------

/// MPC controller configuration, as written in the config file.
///
/// Weight matrices are row-major nested arrays; `rover-mpc` converts them to
/// dense matrices after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub mode: ConstraintMode,

    /// State dimension. Must match the dynamics model.
    #[serde(default = "default_nx")]
    pub nx: usize,

    /// Input dimension. Must match the dynamics model.
    #[serde(default = "default_nu")]
    pub nu: usize,

    /// End value of the state initial-guess ramp (starts at 0).
    #[serde(default)]
    pub x_guess: f64,

    /// End value of the input initial-guess ramp (starts at 0.1).
    #[serde(default)]
    pub u_guess: f64,

    /// Prediction horizon (number of steps, >= 2).
    #[serde(default = "default_horizon", alias = "n_pred")]
    pub horizon: usize,

    /// Transition time step in seconds.
    #[serde(default = "default_dt")]
    pub dt: f64,

    /// State cost weights (nx x nx, positive semidefinite).
    #[serde(default = "default_q")]
    pub q: Vec<Vec<f64>>,

    /// Input cost weights (nu x nu, positive semidefinite).
    #[serde(default = "default_r")]
    pub r: Vec<Vec<f64>>,

    /// Solver identifier (`"sqp"`, alias `"slsqp"`).
    #[serde(default = "default_solver")]
    pub solver: String,

    /// Log every solve at info level.
    #[serde(default)]
    pub verbose: bool,

    /// Maximum SQP iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Convergence tolerance for step size and constraint violation.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Seed each solve with the previous solution shifted by one step.
    #[serde(default)]
    pub warm_start: bool,

    /// Minimum distance between the robot and an avoided obstacle.
    #[serde(default = "default_safety_radius")]
    pub safety_radius: f64,

    /// Number of leading horizon steps the obstacle constraint applies to.
    #[serde(default = "default_avoidance_steps")]
    pub avoidance_steps: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ConstraintMode::default(),
            nx: default_nx(),
            nu: default_nu(),
            x_guess: 0.0,
            u_guess: 0.0,
            horizon: default_horizon(),
            dt: default_dt(),
            q: default_q(),
            r: default_r(),
            solver: default_solver(),
            verbose: false,
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            warm_start: false,
            safety_radius: default_safety_radius(),
            avoidance_steps: default_avoidance_steps(),
        }
    }
}

impl ControllerConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dt.is_nan() || self.dt <= 0.0 {
            return Err(ConfigError::InvalidDt(self.dt));
        }
        if self.horizon < 2 {
            return Err(ConfigError::HorizonTooShort(self.horizon));
        }
        if self.tolerance.is_nan() || self.tolerance <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tolerance".into(),
                message: format!("must be > 0, got {}", self.tolerance),
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_iterations".into(),
                message: "must be > 0".into(),
            });
        }
        if self.safety_radius < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "safety_radius".into(),
                message: format!("must be >= 0, got {}", self.safety_radius),
            });
        }
        if self.avoidance_steps == 0 || self.avoidance_steps > self.horizon {
            return Err(ConfigError::InvalidValue {
                field: "avoidance_steps".into(),
                message: format!("must be in 1..={}, got {}", self.horizon, self.avoidance_steps),
            });
        }
        self.solver_kind()?;
        self.q_matrix()?;
        self.r_matrix()?;
        Ok(())
    }

    /// Parse the solver identifier.
    pub fn solver_kind(&self) -> Result<SolverKind, ConfigError> {
        self.solver.parse()
    }

    /// State weight matrix, checked for shape and positive semidefiniteness.
    pub fn q_matrix(&self) -> Result<DMatrix<f64>, ConfigError> {
        weight_matrix("q", &self.q, self.nx)
    }

    /// Input weight matrix, checked for shape and positive semidefiniteness.
    pub fn r_matrix(&self) -> Result<DMatrix<f64>, ConfigError> {
        weight_matrix("r", &self.r, self.nu)
    }
}

/// Build a square weight matrix from nested rows and check it is PSD.
fn weight_matrix(name: &str, rows: &[Vec<f64>], dim: usize) -> Result<DMatrix<f64>, ConfigError> {
    if rows.len() != dim {
        return Err(ConfigError::DimensionMismatch {
            field: name.into(),
            expected: dim,
            got: rows.len(),
        });
    }
    if let Some(row) = rows.iter().find(|row| row.len() != dim) {
        return Err(ConfigError::DimensionMismatch {
            field: name.into(),
            expected: dim,
            got: row.len(),
        });
    }
    let m = DMatrix::from_fn(dim, dim, |i, j| rows[i][j]);
    if !is_positive_semidefinite(&m) {
        return Err(ConfigError::NotPositiveSemidefinite(name.into()));
    }
    Ok(m)
}

/// PSD check on the symmetric part; a quadratic form only sees `(M + Mᵀ)/2`.
pub fn is_positive_semidefinite(m: &DMatrix<f64>) -> bool {
    if m.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let sym = (m + m.transpose()) * 0.5;
    let scale = sym.amax().max(1.0);
    SymmetricEigen::new(sym)
        .eigenvalues
        .iter()
        .all(|&ev| ev >= -1e-10 * scale)
}

// ---------------------------------------------------------------------------
// RoverConfig
// ---------------------------------------------------------------------------

/// Complete configuration file: `[sim]`, `[environment]`, `[controller]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoverConfig {
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl RoverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sim.validate()?;
        self.environment.validate()?;
        self.controller.validate()?;
        Ok(())
    }

    /// Parse and validate from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RoverConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = RoverConfig::from_toml_str("").unwrap();
        assert_eq!(config, RoverConfig::default());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let config = RoverConfig::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config, RoverConfig::default());
        assert_eq!(config.controller.dt, 1.0);
    }

    #[test]
    fn default_environment_has_one_moving_obstacle() {
        let env = EnvironmentConfig::default();
        assert_eq!(env.obstacles.len(), 1);
        let obs = &env.obstacles[0];
        assert_eq!((obs.left, obs.top), (725, 500));
        assert_eq!((obs.dx, obs.dy), (8, 8));
        assert_eq!(env.target.center(), (500, 700));
    }

    #[test]
    fn collision_distance_is_halo_plus_margin() {
        let sim = SimConfig::default();
        assert!((sim.collision_distance() - 65.0).abs() < 1e-12);
    }

    #[test]
    fn parse_full_file() {
        let toml = r#"
            [sim]
            screen_width = 800
            screen_height = 600
            failure_policy = "retry_relaxed"
            stale_policy = "hold_last"
            async_solve = true

            [environment]
            border_thickness = 0
            target = { left = 100, top = 100, width = 40, height = 40 }

            [[environment.obstacles]]
            name = "crate"
            left = 300
            top = 200
            width = 50
            height = 50
            dx = -4

            [controller]
            mode = "COLL"
            n_pred = 5
            dt = 0.05
            q = [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 0.5]]
            r = [[1.0, 0.0], [0.0, 1.0]]
            solver = "SLSQP"
            warm_start = true
        "#;
        let config = RoverConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.sim.screen_width, 800);
        assert_eq!(config.sim.failure_policy, FailurePolicy::RetryRelaxed);
        assert_eq!(config.sim.stale_policy, StalePolicy::HoldLast);
        assert!(config.sim.async_solve);
        assert_eq!(config.environment.border_thickness, 0);
        assert_eq!(config.environment.obstacles[0].name.as_deref(), Some("crate"));
        assert_eq!(config.environment.obstacles[0].dy, 0);
        assert_eq!(config.controller.mode, ConstraintMode::Coll);
        assert_eq!(config.controller.horizon, 5);
        assert_eq!(config.controller.solver_kind().unwrap(), SolverKind::Sqp);
        assert!(config.controller.warm_start);
    }

    #[test]
    fn rejects_short_horizon() {
        let config = ControllerConfig {
            horizon: 1,
            avoidance_steps: 1,
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HorizonTooShort(1))
        ));
    }

    #[test]
    fn rejects_non_positive_dt() {
        let config = ControllerConfig {
            dt: 0.0,
            ..ControllerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDt(_))));
    }

    #[test]
    fn rejects_unknown_solver() {
        let config = ControllerConfig {
            solver: "ipopt".into(),
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownSolver(name)) if name == "ipopt"
        ));
    }

    #[test]
    fn rejects_indefinite_q() {
        let config = ControllerConfig {
            q: vec![
                vec![1.0, 0.0, 0.0],
                vec![0.0, -1.0, 0.0],
                vec![0.0, 0.0, 0.0],
            ],
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositiveSemidefinite(name)) if name == "q"
        ));
    }

    #[test]
    fn rejects_wrong_r_shape() {
        let config = ControllerConfig {
            r: vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DimensionMismatch { expected: 2, got: 3, .. })
        ));
    }

    #[test]
    fn rejects_avoidance_beyond_horizon() {
        let config = ControllerConfig {
            horizon: 4,
            avoidance_steps: 5,
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "avoidance_steps"
        ));
    }

    #[test]
    fn psd_check_uses_symmetric_part() {
        // Skew part does not change the quadratic form.
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 5.0, -5.0, 1.0]);
        assert!(is_positive_semidefinite(&m));
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(!is_positive_semidefinite(&m));
    }
}
