//! Nonlinear model predictive control for a differential-drive rover.
//!
//! Every control tick the controller solves a finite-horizon trajectory
//! optimization and returns the predicted trajectory; only its first input is
//! applied.
//!
//! 1. **Dynamics**: exact arc-motion transition and its continuous-time field
//! 2. **Decision layout**: column-major packing of states and inputs
//! 3. **Cost**: quadratic tracking and effort objective
//! 4. **Constraints**: multiple-shooting or trapezoidal-collocation defects,
//!    initial-state tie and obstacle clearance
//! 5. **SQP solver**: damped-BFGS SQP whose QP subproblems run on Clarabel
//! 6. **Controller**: builds the problem per measurement and unpacks the result

pub mod constraints;
pub mod controller;
pub mod cost;
pub mod decision;
pub mod dynamics;
pub mod nlp;
pub mod sqp;
pub mod types;

pub use constraints::ConstraintBuilder;
pub use controller::MpcController;
pub use cost::CostFunction;
pub use decision::DecisionLayout;
pub use dynamics::{DiffDrive, Dynamics, OMEGA_CORRECTION, OMEGA_THRESHOLD};
pub use nlp::{NlpProblem, NlpSolution, NlpSolver, NlpStatus};
pub use sqp::{SqpSettings, SqpSolver};
pub use types::{MpcConfig, MpcRequest, OptimizerResult};
