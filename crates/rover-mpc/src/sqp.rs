//! Sequential quadratic programming with Clarabel QP subproblems.
//!
//! Each iteration linearizes the constraints around the current iterate and
//! solves
//!
//! ```text
//! min  1/2 d^T W d + g^T d
//! s.t. c_eq + J_eq d = 0
//!      c_ineq + J_ineq d >= 0
//! ```
//!
//! `W` is the problem's Lagrangian Hessian when it supplies one and a damped
//! BFGS approximation otherwise. An indefinite `W` is first augmented with
//! `a J_eq^T J_eq`, which does not move the QP solution on the linearized
//! equality manifold, and then shifted along the diagonal until Cholesky
//! succeeds. A Levenberg-Marquardt shift on top of that shortens steps after
//! the line search had to cut one back and decays after full steps.
//!
//! Steps are globalized with the L1 exact-penalty merit function, one
//! second-order correction per iteration and backtracking. When the
//! linearized inequalities are inconsistent an elastic QP with penalized
//! slacks supplies the step instead.
//!
//! Clarabel's conic form is `A d + s = b, s in K`, so the rows are stacked as
//! `A = [J_eq; -J_ineq]`, `b = [-c_eq; c_ineq]` with cones
//! `[ZeroCone(m_eq), NonnegativeCone(m_ineq)]`.

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
    SupportedConeT::{NonnegativeConeT, ZeroConeT},
};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

use crate::nlp::{NlpProblem, NlpSolution, NlpSolver, NlpStatus, constraint_violation};

/// Armijo sufficient-decrease fraction.
const ARMIJO: f64 = 1e-4;

/// Share of the step curvature the merit slope must cover after a penalty update.
const PENALTY_CURVATURE: f64 = 0.5;

/// Smallest Levenberg-Marquardt shift, relative to the Hessian magnitude.
const DAMPING_START: f64 = 1e-3;

/// Consecutive failed line searches tolerated before giving up.
const MAX_STALLS: u32 = 4;

/// Equality augmentations tried before falling back to a diagonal shift.
const AUGMENTATION_ATTEMPTS: i32 = 4;

/// Entries at or below this magnitude are left out of the sparse QP matrices.
const SPARSITY_THRESHOLD: f64 = 1e-15;

/// SQP tuning knobs.
#[derive(Debug, Clone)]
pub struct SqpSettings {
    /// Maximum outer iterations.
    pub max_iterations: u32,
    /// Relative tolerance on the Lagrangian gradient and on the step.
    pub tolerance: f64,
    /// Constraint violation accepted at convergence, relative to `1 + |z|_inf`.
    pub constraint_tolerance: f64,
    /// Iteration cap handed to Clarabel per QP.
    pub max_qp_iterations: u32,
    /// Smallest diagonal shift applied to the QP Hessian, scaled by its magnitude.
    pub regularization: f64,
    /// Maximum step halvings per line search.
    pub max_line_search_steps: u32,
    /// Starting weight on inequality slack in the elastic QP.
    pub elastic_penalty: f64,
    /// Elastic weight past which a stalled infeasible iterate is given up on.
    pub max_penalty: f64,
    pub verbose: bool,
}

impl Default for SqpSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            constraint_tolerance: 1e-6,
            max_qp_iterations: 200,
            regularization: 1e-8,
            max_line_search_steps: 30,
            elastic_penalty: 1.0,
            max_penalty: 1e8,
            verbose: false,
        }
    }
}

/// Line-search SQP solver.
#[derive(Debug, Clone, Default)]
pub struct SqpSolver {
    settings: SqpSettings,
}

/// Function values and first derivatives at one iterate.
struct Point {
    z: DVector<f64>,
    f: f64,
    g: DVector<f64>,
    ce: DVector<f64>,
    ci: DVector<f64>,
    je: DMatrix<f64>,
    ji: DMatrix<f64>,
}

impl Point {
    fn evaluate(problem: &dyn NlpProblem, z: DVector<f64>) -> Option<Self> {
        let f = problem.objective(&z);
        let ce = problem.equality_constraints(&z);
        let ci = problem.inequality_constraints(&z);
        if !f.is_finite() || ce.iter().chain(ci.iter()).any(|v| !v.is_finite()) {
            return None;
        }
        let g = problem.gradient(&z);
        let je = problem.equality_jacobian(&z);
        let ji = problem.inequality_jacobian(&z);
        if g.iter().chain(je.iter()).chain(ji.iter()).any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self {
            z,
            f,
            g,
            ce,
            ci,
            je,
            ji,
        })
    }

    fn violation(&self) -> f64 {
        constraint_violation(&self.ce, &self.ci)
    }

    /// `||c_eq||_1 + ||max(0, -c_ineq)||_1`.
    fn infeasibility(&self) -> f64 {
        l1_infeasibility(&self.ce, &self.ci)
    }

    /// Infeasibility of the linearization at `z + d`.
    fn linearized_infeasibility(&self, d: &DVector<f64>) -> f64 {
        l1_infeasibility(&(&self.ce + &self.je * d), &(&self.ci + &self.ji * d))
    }

    /// Lagrangian gradient `g - J_eq^T lambda - J_ineq^T mu`.
    fn lagrangian_gradient(&self, lambda: &DVector<f64>, mu: &DVector<f64>) -> DVector<f64> {
        &self.g - self.je.tr_mul(lambda) - self.ji.tr_mul(mu)
    }
}

/// Positive definite QP Hessian and the equality augmentation folded into it.
struct QpHessian {
    w: DMatrix<f64>,
    augmentation: f64,
}

/// QP step with multipliers in the `L = f - lambda^T c_eq - mu^T c_ineq` convention.
struct QpStep {
    d: DVector<f64>,
    lambda: DVector<f64>,
    mu: DVector<f64>,
}

/// Why a QP produced no step.
struct QpFailure {
    status: String,
    infeasible: bool,
}

impl QpFailure {
    const fn other(status: String) -> Self {
        Self {
            status,
            infeasible: false,
        }
    }
}

impl SqpSolver {
    pub const fn new(settings: SqpSettings) -> Self {
        Self { settings }
    }

    pub const fn settings(&self) -> &SqpSettings {
        &self.settings
    }

    fn failure(point: &Point, status: NlpStatus, iterations: u32) -> NlpSolution {
        NlpSolution {
            z: point.z.clone(),
            objective: point.f,
            constraint_violation: point.violation(),
            status,
            iterations,
        }
    }

    fn converged(&self, point: Point, iteration: u32) -> NlpSolution {
        let violation = point.violation();
        if self.settings.verbose {
            debug!(iteration, f = point.f, violation, "sqp converged");
        }
        NlpSolution {
            objective: point.f,
            constraint_violation: violation,
            z: point.z,
            status: NlpStatus::Converged,
            iterations: iteration,
        }
    }

    /// Make `h` positive definite while keeping its reduced Hessian on the equality manifold.
    fn convexify(&self, h: &DMatrix<f64>, je: &DMatrix<f64>) -> QpHessian {
        let n = h.nrows();
        let mut base = (h + h.transpose()) * 0.5;
        let scale = base.amax().max(1.0);
        let floor = self.settings.regularization * scale;

        if let Some(w) = shifted_cholesky(&base, floor) {
            return QpHessian { w, augmentation: 0.0 };
        }

        let mut augmentation = 0.0;
        if je.nrows() > 0 {
            let jtj = je.tr_mul(je);
            let unit = scale / jtj.amax().max(f64::MIN_POSITIVE);
            for attempt in 0..AUGMENTATION_ATTEMPTS {
                augmentation = unit * 10f64.powi(attempt);
                if let Some(w) = shifted_cholesky(&(&base + &jtj * augmentation), floor) {
                    return QpHessian { w, augmentation };
                }
            }
            base += &jtj * augmentation;
        }

        let mut shift = floor.max(1e-6 * scale);
        for _ in 0..32 {
            if let Some(w) = shifted_cholesky(&base, shift) {
                return QpHessian { w, augmentation };
            }
            shift *= 10.0;
        }
        QpHessian {
            w: DMatrix::identity(n, n) * scale,
            augmentation: 0.0,
        }
    }

    /// Solve the QP with constraint constants `ce`, `ci` linearized at `point`.
    ///
    /// With `elastic = Some(weight)` every inequality gets a slack `t >= 0`
    /// charged at `weight` per unit, so the QP is always feasible in them.
    fn solve_qp(
        &self,
        hess: &QpHessian,
        point: &Point,
        ce: &DVector<f64>,
        ci: &DVector<f64>,
        elastic: Option<f64>,
    ) -> Result<QpStep, QpFailure> {
        let n = point.z.len();
        let me = ce.len();
        let mi = ci.len();
        let slacks = if elastic.is_some() { mi } else { 0 };
        let nv = n + slacks;

        if me + mi == 0 {
            let d = hess
                .w
                .clone()
                .cholesky()
                .map_or_else(|| -&point.g, |chol| -chol.solve(&point.g));
            return Ok(QpStep {
                d,
                lambda: DVector::zeros(0),
                mu: DVector::zeros(0),
            });
        }

        let rows = me + mi + slacks;
        let mut a = DMatrix::zeros(rows, nv);
        a.view_mut((0, 0), (me, n)).copy_from(&point.je);
        a.view_mut((me, 0), (mi, n)).copy_from(&(-&point.ji));
        for j in 0..slacks {
            a[(me + j, n + j)] = -1.0;
            a[(me + mi + j, n + j)] = -1.0;
        }
        let mut rhs = Vec::with_capacity(rows);
        rhs.extend(ce.iter().map(|v| -v));
        rhs.extend(ci.iter().copied());
        rhs.extend(std::iter::repeat_n(0.0, slacks));

        let mut p = DMatrix::zeros(nv, nv);
        p.view_mut((0, 0), (n, n)).copy_from(&hess.w);
        let mut q: Vec<f64> = point.g.iter().copied().collect();
        if let Some(weight) = elastic {
            q.extend(std::iter::repeat_n(weight, slacks));
        }

        let mut cones: Vec<SupportedConeT<f64>> = Vec::with_capacity(2);
        if me > 0 {
            cones.push(ZeroConeT(me));
        }
        if mi + slacks > 0 {
            cones.push(NonnegativeConeT(mi + slacks));
        }

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.settings.max_qp_iterations)
            .verbose(false)
            .build()
            .map_err(|e| QpFailure::other(format!("invalid settings: {e:?}")))?;

        let p_csc = dmatrix_to_csc_upper_tri(&p);
        let a_csc = dmatrix_to_csc(&a);

        let mut solver = DefaultSolver::new(&p_csc, &q, &a_csc, &rhs, &cones, settings)
            .map_err(|e| QpFailure::other(format!("{e:?}")))?;
        solver.solve();
        let sol = &solver.solution;

        if !matches!(sol.status, SolverStatus::Solved | SolverStatus::AlmostSolved) {
            return Err(QpFailure {
                status: format!("{:?}", sol.status),
                infeasible: matches!(
                    sol.status,
                    SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible
                ),
            });
        }

        // The augmentation shifts the equality multipliers by `a * c_eq`.
        let lambda = DVector::from_iterator(
            me,
            sol.z[..me]
                .iter()
                .zip(ce.iter())
                .map(|(z, c)| hess.augmentation.mul_add(*c, -z)),
        );
        Ok(QpStep {
            d: DVector::from_column_slice(&sol.x[..n]),
            lambda,
            mu: DVector::from_column_slice(&sol.z[me..me + mi]),
        })
    }

    /// Re-solve the QP with constants `c(z + d) - J d` to bend `d` back onto the constraints.
    fn second_order_correction(
        &self,
        hess: &QpHessian,
        point: &Point,
        d: &DVector<f64>,
        ce_trial: &DVector<f64>,
        ci_trial: &DVector<f64>,
    ) -> Option<DVector<f64>> {
        let ce = ce_trial - &point.je * d;
        let ci = ci_trial - &point.ji * d;
        self.solve_qp(hess, point, &ce, &ci, None).ok().map(|step| step.d)
    }

    /// First-order optimality of `point` with the multipliers of its QP step.
    fn is_stationary(&self, point: &Point, step: &QpStep) -> bool {
        let tol = self.settings.tolerance;
        let gradient = point.lagrangian_gradient(&step.lambda, &step.mu).amax();
        let complementarity = step
            .mu
            .iter()
            .zip(point.ci.iter())
            .fold(0.0f64, |acc, (m, c)| acc.max((m * c).abs()));
        gradient <= tol * (1.0 + point.g.amax()) && complementarity <= tol * (1.0 + point.f.abs())
    }

    /// Powell-damped BFGS update; keeps `b` positive definite.
    fn update_hessian(b: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) {
        let bs = &*b * s;
        let sbs = s.dot(&bs);
        if sbs <= f64::EPSILON * s.norm_squared().max(f64::MIN_POSITIVE) {
            return;
        }
        let sy = s.dot(y);
        let theta = if sy >= 0.2 * sbs {
            1.0
        } else {
            0.8 * sbs / (sbs - sy)
        };
        let r = theta * y + (1.0 - theta) * &bs;
        let sr = s.dot(&r);
        if sr <= 0.0 || !sr.is_finite() {
            return;
        }
        *b -= &bs * bs.transpose() / sbs;
        *b += &r * r.transpose() / sr;
    }
}

impl NlpSolver for SqpSolver {
    #[allow(clippy::too_many_lines)]
    fn solve(&self, problem: &dyn NlpProblem, initial_guess: DVector<f64>) -> NlpSolution {
        let n = problem.dimension();
        let tol = self.settings.tolerance;
        let ctol = self.settings.constraint_tolerance;

        let Some(mut point) = Point::evaluate(problem, initial_guess) else {
            return NlpSolution {
                z: DVector::zeros(n),
                objective: f64::NAN,
                status: NlpStatus::NonFinite,
                iterations: 0,
                constraint_violation: f64::INFINITY,
            };
        };

        let mut lambda = DVector::zeros(point.ce.len());
        let mut mu = DVector::zeros(point.ci.len());
        let mut bfgs = DMatrix::identity(n, n);
        let mut rho = 0.0f64;
        let mut damping = 0.0f64;
        let mut elastic_weight = self.settings.elastic_penalty;
        let mut stalls = 0u32;

        for iteration in 1..=self.settings.max_iterations {
            let exact = problem
                .lagrangian_hessian(&point.z, &lambda, &mu)
                .filter(|h| h.shape() == (n, n) && h.iter().all(|v| v.is_finite()));
            let mut hess = self.convexify(exact.as_ref().unwrap_or(&bfgs), &point.je);
            let damping_start = DAMPING_START * hess.w.amax().max(1.0);
            for i in 0..n {
                hess.w[(i, i)] += damping;
            }

            let (step, elastic) = match self.solve_qp(&hess, &point, &point.ce, &point.ci, None) {
                Ok(step) => (step, None),
                Err(failure) if failure.infeasible && !point.ci.is_empty() => {
                    let weight = elastic_weight.max(rho);
                    match self.solve_qp(&hess, &point, &point.ce, &point.ci, Some(weight)) {
                        Ok(step) => (step, Some(weight)),
                        Err(failure) => {
                            return Self::failure(&point, NlpStatus::QpFailed(failure.status), iteration);
                        }
                    }
                }
                Err(failure) => {
                    return Self::failure(&point, NlpStatus::QpFailed(failure.status), iteration);
                }
            };

            let z_scale = 1.0 + point.z.amax();
            let violation = point.violation();
            let d_norm = step.d.amax();
            let feasible = violation <= ctol * z_scale;
            let small_step = d_norm <= tol * z_scale;
            trace!(
                iteration,
                f = point.f,
                violation,
                d_norm,
                rho,
                damping,
                elastic = elastic.is_some(),
                "sqp iterate"
            );

            if feasible && (small_step || (elastic.is_none() && self.is_stationary(&point, &step))) {
                return self.converged(point, iteration);
            }

            if let Some(weight) = elastic {
                rho = rho.max(weight);
                if small_step {
                    if weight >= self.settings.max_penalty {
                        return Self::failure(&point, NlpStatus::LocallyInfeasible, iteration);
                    }
                    elastic_weight = weight * 10.0;
                    continue;
                }
            }

            // Raise the penalty until the merit slope covers part of the step curvature.
            let gd = point.g.dot(&step.d);
            let curvature = step.d.dot(&(&hess.w * &step.d));
            let infeasibility = point.infeasibility();
            let reduction = infeasibility - point.linearized_infeasibility(&step.d);
            if reduction > 0.0 {
                rho = rho.max(PENALTY_CURVATURE.mul_add(curvature, gd) / reduction);
            }
            let slope = rho.mul_add(-reduction, gd);

            let merit0 = rho.mul_add(infeasibility, point.f);
            let allowance = 1e-12 * (1.0 + merit0.abs());
            let merit_at = |z: &DVector<f64>| {
                let ce = problem.equality_constraints(z);
                let ci = problem.inequality_constraints(z);
                (rho.mul_add(l1_infeasibility(&ce, &ci), problem.objective(z)), ce, ci)
            };

            let mut accepted = None;
            if slope < 0.0 {
                let mut alpha = 1.0f64;
                for attempt in 0..=self.settings.max_line_search_steps {
                    let trial = &point.z + alpha * &step.d;
                    let (value, ce, ci) = merit_at(&trial);
                    if value.is_finite() && value <= (ARMIJO * alpha).mul_add(slope, merit0) + allowance {
                        accepted = Some((trial, alpha));
                        break;
                    }
                    if attempt == 0 && elastic.is_none() && value.is_finite() {
                        if let Some(corrected) = self.second_order_correction(&hess, &point, &step.d, &ce, &ci) {
                            let trial = &point.z + corrected;
                            let (value, _, _) = merit_at(&trial);
                            if value.is_finite() && value <= ARMIJO.mul_add(slope, merit0) + allowance {
                                accepted = Some((trial, 1.0));
                                break;
                            }
                        }
                    }
                    alpha *= 0.5;
                }
            }

            let Some((trial, alpha)) = accepted else {
                if feasible && d_norm <= tol.sqrt() * z_scale {
                    return self.converged(point, iteration);
                }
                stalls += 1;
                if stalls >= MAX_STALLS {
                    return Self::failure(&point, NlpStatus::LineSearchFailed, iteration);
                }
                damping = (damping * 100.0).max(damping_start);
                continue;
            };
            stalls = 0;

            damping = if alpha < 1.0 {
                (damping * 10.0).max(damping_start)
            } else if damping * 0.25 < damping_start {
                0.0
            } else {
                damping * 0.25
            };

            let Some(next) = Point::evaluate(problem, trial) else {
                return Self::failure(&point, NlpStatus::NonFinite, iteration);
            };

            if exact.is_none() {
                let s = &next.z - &point.z;
                let y = next.lagrangian_gradient(&step.lambda, &step.mu)
                    - point.lagrangian_gradient(&step.lambda, &step.mu);
                Self::update_hessian(&mut bfgs, &s, &y);
            }
            lambda = step.lambda;
            mu = step.mu;
            point = next;
        }

        Self::failure(&point, NlpStatus::MaxIterations, self.settings.max_iterations)
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "sqp"
    }
}

/// `m + shift I` when that factors, else `None`.
fn shifted_cholesky(m: &DMatrix<f64>, shift: f64) -> Option<DMatrix<f64>> {
    let mut w = m.clone();
    for i in 0..w.nrows() {
        w[(i, i)] += shift;
    }
    w.clone().cholesky().map(|_| w)
}

fn l1_infeasibility(ce: &DVector<f64>, ci: &DVector<f64>) -> f64 {
    ce.iter().map(|v| v.abs()).sum::<f64>() + ci.iter().map(|v| (-v).max(0.0)).sum::<f64>()
}

/// Convert a nalgebra `DMatrix<f64>` to a Clarabel `CscMatrix<f64>` (full matrix).
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v.abs() > SPARSITY_THRESHOLD {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Upper triangle of a symmetric `DMatrix<f64>` as a Clarabel `CscMatrix<f64>`.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..=j.min(nrows.saturating_sub(1)) {
            let v = m[(i, j)];
            if v.abs() > SPARSITY_THRESHOLD {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}
