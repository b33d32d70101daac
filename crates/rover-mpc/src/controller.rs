//! Receding-horizon controller.
//!
//! Each call builds the NLP from the current measurement, hands it to the
//! configured solver and unpacks the predicted trajectory. Only the first
//! input of the result is meant to be applied.

use std::time::Instant;

use nalgebra::{DMatrix, DVector, Vector2};
use rover_core::config::{ControllerConfig, SolverKind};
use rover_core::error::{ConfigError, OptimizationError};
use tracing::{debug, info};

use crate::constraints::ConstraintBuilder;
use crate::cost::CostFunction;
use crate::decision::DecisionLayout;
use crate::dynamics::{DiffDrive, Dynamics};
use crate::nlp::{NlpProblem, NlpSolver, NlpStatus};
use crate::sqp::{SqpSettings, SqpSolver};
use crate::types::{MpcConfig, MpcRequest, OptimizerResult};

/// Nonlinear MPC over a [`Dynamics`] model.
pub struct MpcController<D: Dynamics = DiffDrive> {
    config: MpcConfig,
    dynamics: D,
    layout: DecisionLayout,
    cost: CostFunction,
    constraints: ConstraintBuilder,
    solver: Box<dyn NlpSolver>,
}

impl<D: Dynamics> std::fmt::Debug for MpcController<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpcController")
            .field("config", &self.config)
            .field("dynamics", &self.dynamics.name())
            .field("solver", &self.solver.name())
            .finish_non_exhaustive()
    }
}

impl MpcController<DiffDrive> {
    /// Differential-drive controller from a file-level controller config.
    pub fn from_controller_config(config: &ControllerConfig) -> Result<Self, ConfigError> {
        Self::new(MpcConfig::try_from(config)?, DiffDrive)
    }
}

impl<D: Dynamics> MpcController<D> {
    /// Build a controller with the solver named in `config`.
    pub fn new(config: MpcConfig, dynamics: D) -> Result<Self, ConfigError> {
        let solver: Box<dyn NlpSolver> = match config.solver {
            SolverKind::Sqp => Box::new(SqpSolver::new(SqpSettings {
                max_iterations: config.max_iterations,
                tolerance: config.tolerance,
                constraint_tolerance: config.tolerance,
                verbose: config.verbose,
                ..SqpSettings::default()
            })),
        };
        Self::with_solver(config, dynamics, solver)
    }

    /// Build a controller around an arbitrary solver.
    pub fn with_solver(
        config: MpcConfig,
        dynamics: D,
        solver: Box<dyn NlpSolver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.nx != dynamics.state_dim() {
            return Err(ConfigError::DimensionMismatch {
                field: "nx".into(),
                expected: dynamics.state_dim(),
                got: config.nx,
            });
        }
        if config.nu != dynamics.input_dim() {
            return Err(ConfigError::DimensionMismatch {
                field: "nu".into(),
                expected: dynamics.input_dim(),
                got: config.nu,
            });
        }
        if config.nx < 2 {
            return Err(ConfigError::InvalidValue {
                field: "nx".into(),
                message: "obstacle avoidance needs planar position states".into(),
            });
        }

        let layout = DecisionLayout::new(config.horizon, config.nx, config.nu);
        let cost = CostFunction::new(layout, config.q.clone(), config.r.clone());
        let constraints = ConstraintBuilder::new(
            layout,
            config.mode,
            config.dt,
            config.safety_radius,
            config.avoidance_steps,
        );

        debug!(
            dynamics = dynamics.name(),
            solver = solver.name(),
            mode = ?config.mode,
            horizon = config.horizon,
            "mpc controller ready"
        );

        Ok(Self {
            config,
            dynamics,
            layout,
            cost,
            constraints,
            solver,
        })
    }

    pub const fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub const fn dynamics(&self) -> &D {
        &self.dynamics
    }

    pub const fn layout(&self) -> &DecisionLayout {
        &self.layout
    }

    pub fn solver_name(&self) -> &str {
        self.solver.name()
    }

    /// Cold-start decision vector from the configured guess ramps.
    pub fn initial_guess(&self) -> DVector<f64> {
        self.layout.initial_guess(self.config.x_guess, self.config.u_guess)
    }

    /// Previous decision vector advanced one step, last sample repeated.
    pub fn shift_warm_start(&self, previous: &DVector<f64>) -> Result<DVector<f64>, OptimizationError> {
        self.check_guess(previous)?;
        Ok(self.layout.shift(previous))
    }

    /// Optimize against a single obstacle from the cold-start guess.
    pub fn optimize(
        &self,
        state: &DVector<f64>,
        reference: &DVector<f64>,
        obstacle: &Vector2<f64>,
    ) -> Result<OptimizerResult, OptimizationError> {
        self.solve(&MpcRequest::new(state.clone(), reference.clone(), *obstacle))
    }

    /// Optimize and turn an unsuccessful solve into [`OptimizationError::Failed`].
    pub fn solve(&self, request: &MpcRequest) -> Result<OptimizerResult, OptimizationError> {
        let (result, status) = self.run(request)?;
        if result.success {
            Ok(result)
        } else {
            Err(OptimizationError::Failed {
                message: status.to_string(),
                iterations: result.iterations,
            })
        }
    }

    /// Optimize and return the last iterate even when the solver did not converge.
    pub fn solve_raw(&self, request: &MpcRequest) -> Result<OptimizerResult, OptimizationError> {
        self.run(request).map(|(result, _)| result)
    }

    fn run(&self, request: &MpcRequest) -> Result<(OptimizerResult, NlpStatus), OptimizationError> {
        self.check_state(&request.state)?;
        self.check_state(&request.reference)?;
        let guess = match &request.initial_guess {
            Some(guess) => {
                self.check_guess(guess)?;
                guess.clone()
            }
            None => self.initial_guess(),
        };

        let problem = MpcProblem {
            dynamics: &self.dynamics,
            cost: &self.cost,
            constraints: &self.constraints,
            state: &request.state,
            reference: &request.reference,
            obstacles: &request.obstacles,
        };

        let start = Instant::now();
        let solution = self.solver.solve(&problem, guess);
        let solve_time_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);

        let success = solution.is_success();
        debug!(
            success,
            iterations = solution.iterations,
            cost = solution.objective,
            violation = solution.constraint_violation,
            solve_time_us,
            "mpc solve"
        );
        if self.config.verbose {
            info!(
                status = %solution.status,
                iterations = solution.iterations,
                cost = solution.objective,
                solve_time_us,
                "mpc solve finished"
            );
        }

        let result = self.unpack(solution.z, success, solution.objective, solution.iterations, solve_time_us);
        Ok((result, solution.status))
    }

    fn unpack(
        &self,
        decision: DVector<f64>,
        success: bool,
        cost: f64,
        iterations: u32,
        solve_time_us: u64,
    ) -> OptimizerResult {
        let (states, inputs) = if decision.len() == self.layout.len() {
            (self.layout.states(&decision), self.layout.inputs(&decision))
        } else {
            (
                DMatrix::zeros(self.layout.horizon, self.layout.nx),
                DMatrix::zeros(self.layout.horizon, self.layout.nu),
            )
        };
        OptimizerResult {
            states,
            inputs,
            success,
            cost,
            decision,
            iterations,
            solve_time_us,
        }
    }

    fn check_state(&self, v: &DVector<f64>) -> Result<(), OptimizationError> {
        if v.len() == self.layout.nx {
            Ok(())
        } else {
            Err(OptimizationError::StateDimMismatch {
                expected: self.layout.nx,
                got: v.len(),
            })
        }
    }

    fn check_guess(&self, z: &DVector<f64>) -> Result<(), OptimizationError> {
        if z.len() == self.layout.len() {
            Ok(())
        } else {
            Err(OptimizationError::GuessLengthMismatch {
                expected: self.layout.len(),
                got: z.len(),
            })
        }
    }
}

/// The NLP for one measurement. Borrowed from the controller for the duration of a solve.
struct MpcProblem<'a, D: Dynamics> {
    dynamics: &'a D,
    cost: &'a CostFunction,
    constraints: &'a ConstraintBuilder,
    state: &'a DVector<f64>,
    reference: &'a DVector<f64>,
    obstacles: &'a [Vector2<f64>],
}

impl<D: Dynamics> NlpProblem for MpcProblem<'_, D> {
    fn dimension(&self) -> usize {
        self.cost.layout().len()
    }

    fn objective(&self, z: &DVector<f64>) -> f64 {
        self.cost.evaluate(z, self.reference)
    }

    fn gradient(&self, z: &DVector<f64>) -> DVector<f64> {
        self.cost.gradient(z, self.reference)
    }

    fn equality_constraints(&self, z: &DVector<f64>) -> DVector<f64> {
        self.constraints.equalities(self.dynamics, z, self.state)
    }

    fn equality_jacobian(&self, z: &DVector<f64>) -> DMatrix<f64> {
        self.constraints.equality_jacobian(self.dynamics, z)
    }

    fn inequality_constraints(&self, z: &DVector<f64>) -> DVector<f64> {
        self.constraints.inequalities(z, self.obstacles)
    }

    fn inequality_jacobian(&self, z: &DVector<f64>) -> DMatrix<f64> {
        self.constraints.inequality_jacobian(z, self.obstacles)
    }

    fn lagrangian_hessian(
        &self,
        z: &DVector<f64>,
        lambda: &DVector<f64>,
        mu: &DVector<f64>,
    ) -> Option<DMatrix<f64>> {
        Some(self.cost.hessian() - self.constraints.curvature(self.dynamics, z, self.obstacles, lambda, mu))
    }
}
