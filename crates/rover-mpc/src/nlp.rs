//! Nonlinear program interface.
//!
//! A problem is `min f(z)` subject to `c_eq(z) = 0` and `c_ineq(z) >= 0`.
//! Derivatives default to central finite differences; problems with cheap
//! analytic derivatives override them. Second-order information is optional:
//! without it the solver falls back to a quasi-Newton approximation.

use std::fmt;

use nalgebra::{DMatrix, DVector};

/// Relative finite-difference step, roughly the cube root of machine epsilon.
pub const FD_STEP: f64 = 6.055_454_452_393_343e-6;

/// Relative second-difference step, roughly the fourth root of machine epsilon.
pub const FD_HESSIAN_STEP: f64 = 1.220_703_125e-4;

/// A smooth constrained minimization problem.
pub trait NlpProblem {
    /// Number of decision variables.
    fn dimension(&self) -> usize;

    fn objective(&self, z: &DVector<f64>) -> f64;

    fn gradient(&self, z: &DVector<f64>) -> DVector<f64> {
        central_difference_gradient(|p| self.objective(p), z)
    }

    /// Equality constraint values; feasible where all are zero.
    fn equality_constraints(&self, z: &DVector<f64>) -> DVector<f64>;

    fn equality_jacobian(&self, z: &DVector<f64>) -> DMatrix<f64> {
        central_difference_jacobian(|p| self.equality_constraints(p), z)
    }

    /// Inequality constraint values; feasible where all are non-negative.
    fn inequality_constraints(&self, z: &DVector<f64>) -> DVector<f64>;

    fn inequality_jacobian(&self, z: &DVector<f64>) -> DMatrix<f64> {
        central_difference_jacobian(|p| self.inequality_constraints(p), z)
    }

    /// Hessian of `f - lambda^T c_eq - mu^T c_ineq`, when the problem can supply it.
    fn lagrangian_hessian(
        &self,
        _z: &DVector<f64>,
        _lambda: &DVector<f64>,
        _mu: &DVector<f64>,
    ) -> Option<DMatrix<f64>> {
        None
    }
}

/// How a solve ended.
#[derive(Debug, Clone, PartialEq)]
pub enum NlpStatus {
    Converged,
    MaxIterations,
    /// The QP subproblem could not be solved; carries the QP solver's status.
    QpFailed(String),
    LineSearchFailed,
    /// Constraint violation could not be reduced from the current iterate.
    LocallyInfeasible,
    /// Objective or constraints evaluated to NaN/inf.
    NonFinite,
}

impl fmt::Display for NlpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => f.write_str("optimization terminated successfully"),
            Self::MaxIterations => f.write_str("iteration limit reached"),
            Self::QpFailed(status) => write!(f, "QP subproblem failed: {status}"),
            Self::LineSearchFailed => f.write_str("positive directional derivative for linesearch"),
            Self::LocallyInfeasible => f.write_str("constraints are locally infeasible"),
            Self::NonFinite => f.write_str("non-finite objective or constraint value"),
        }
    }
}

/// Result of an NLP solve. `z` is the last iterate even on failure.
#[derive(Debug, Clone)]
pub struct NlpSolution {
    pub z: DVector<f64>,
    pub objective: f64,
    pub status: NlpStatus,
    pub iterations: u32,
    /// Largest equality residual or inequality shortfall at `z`.
    pub constraint_violation: f64,
}

impl NlpSolution {
    pub fn is_success(&self) -> bool {
        self.status == NlpStatus::Converged
    }

    pub fn message(&self) -> String {
        self.status.to_string()
    }
}

/// Solver capability the controller is configured with.
pub trait NlpSolver: Send + Sync {
    fn solve(&self, problem: &dyn NlpProblem, initial_guess: DVector<f64>) -> NlpSolution;

    fn name(&self) -> &str;
}

/// Maximum constraint violation: `max(|c_eq|, max(0, -c_ineq))`.
pub fn constraint_violation(eq: &DVector<f64>, ineq: &DVector<f64>) -> f64 {
    let e = eq.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    ineq.iter().fold(e, |acc, v| acc.max(-v))
}

fn fd_step(value: f64) -> f64 {
    FD_STEP * value.abs().max(1.0)
}

/// Central-difference gradient of a scalar function.
pub fn central_difference_gradient(f: impl Fn(&DVector<f64>) -> f64, z: &DVector<f64>) -> DVector<f64> {
    let mut shifted = z.clone();
    DVector::from_fn(z.len(), |i, _| {
        let h = fd_step(z[i]);
        shifted[i] = z[i] + h;
        let fp = f(&shifted);
        shifted[i] = z[i] - h;
        let fm = f(&shifted);
        shifted[i] = z[i];
        (fp - fm) / (2.0 * h)
    })
}

/// Second-difference Hessian of a scalar function.
pub fn central_difference_hessian(f: impl Fn(&DVector<f64>) -> f64, z: &DVector<f64>) -> DMatrix<f64> {
    let n = z.len();
    let h: Vec<f64> = z.iter().map(|v| FD_HESSIAN_STEP * v.abs().max(1.0)).collect();
    let f0 = f(z);
    let mut shifted = z.clone();
    let mut hess = DMatrix::zeros(n, n);
    for i in 0..n {
        shifted[i] = z[i] + h[i];
        let fp = f(&shifted);
        shifted[i] = z[i] - h[i];
        let fm = f(&shifted);
        shifted[i] = z[i];
        hess[(i, i)] = (fp - 2.0 * f0 + fm) / (h[i] * h[i]);

        for j in 0..i {
            shifted[i] = z[i] + h[i];
            shifted[j] = z[j] + h[j];
            let fpp = f(&shifted);
            shifted[j] = z[j] - h[j];
            let fpm = f(&shifted);
            shifted[i] = z[i] - h[i];
            let fmm = f(&shifted);
            shifted[j] = z[j] + h[j];
            let fmp = f(&shifted);
            shifted[i] = z[i];
            shifted[j] = z[j];
            let v = (fpp - fpm - fmp + fmm) / (4.0 * h[i] * h[j]);
            hess[(i, j)] = v;
            hess[(j, i)] = v;
        }
    }
    hess
}

/// Central-difference Jacobian of a vector function; rows are outputs.
pub fn central_difference_jacobian(
    f: impl Fn(&DVector<f64>) -> DVector<f64>,
    z: &DVector<f64>,
) -> DMatrix<f64> {
    let m = f(z).len();
    let mut jac = DMatrix::zeros(m, z.len());
    if m == 0 {
        return jac;
    }
    let mut shifted = z.clone();
    for i in 0..z.len() {
        let h = fd_step(z[i]);
        shifted[i] = z[i] + h;
        let fp = f(&shifted);
        shifted[i] = z[i] - h;
        let fm = f(&shifted);
        shifted[i] = z[i];
        jac.set_column(i, &((fp - fm) / (2.0 * h)));
    }
    jac
}
