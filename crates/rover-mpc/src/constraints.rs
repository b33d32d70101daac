//! Dynamics defects, initial-state tie and obstacle clearance.
//!
//! Equality rows are ordered as `horizon - 1` defect blocks of `nx` rows
//! followed by the `nx` rows of `x_0 - x_measured`, so there are always
//! `nx * horizon` of them.
//!
//! Inequality rows are `(x_k - ox)^2 + (y_k - oy)^2 - r^2 >= 0`, one per
//! obstacle and leading horizon step, obstacle-major.

use nalgebra::{DMatrix, DVector, Vector2};
use rover_core::config::ConstraintMode;

use crate::decision::DecisionLayout;
use crate::dynamics::Dynamics;
use crate::nlp::central_difference_jacobian;

/// Builds constraint values and Jacobians for one MPC problem shape.
#[derive(Debug, Clone)]
pub struct ConstraintBuilder {
    layout: DecisionLayout,
    mode: ConstraintMode,
    dt: f64,
    safety_radius: f64,
    avoidance_steps: usize,
}

impl ConstraintBuilder {
    pub fn new(
        layout: DecisionLayout,
        mode: ConstraintMode,
        dt: f64,
        safety_radius: f64,
        avoidance_steps: usize,
    ) -> Self {
        Self {
            layout,
            mode,
            dt,
            safety_radius,
            avoidance_steps: avoidance_steps.clamp(1, layout.horizon.max(1)),
        }
    }

    pub const fn mode(&self) -> ConstraintMode {
        self.mode
    }

    pub const fn layout(&self) -> &DecisionLayout {
        &self.layout
    }

    pub const fn safety_radius(&self) -> f64 {
        self.safety_radius
    }

    pub const fn avoidance_steps(&self) -> usize {
        self.avoidance_steps
    }

    /// Number of equality rows.
    pub const fn n_eq(&self) -> usize {
        self.layout.nx * self.layout.horizon
    }

    /// Number of inequality rows for `n_obstacles` avoided obstacles.
    pub const fn n_ineq(&self, n_obstacles: usize) -> usize {
        n_obstacles * self.avoidance_steps
    }

    /// Dynamics defect between steps `k` and `k + 1`.
    fn defect<D: Dynamics + ?Sized>(&self, dynamics: &D, z: &DVector<f64>, k: usize) -> DVector<f64> {
        let l = &self.layout;
        let x_k = l.state(z, k);
        let u_k = l.input(z, k);
        let x_next = l.state(z, k + 1);
        match self.mode {
            ConstraintMode::Dms => x_next - dynamics.step(&x_k, &u_k, self.dt),
            ConstraintMode::Coll => {
                let u_next = l.input(z, k + 1);
                let f_k = dynamics.derivative(&x_k, &u_k);
                let f_next = dynamics.derivative(&x_next, &u_next);
                &x_next - &x_k - (f_k + f_next) * (0.5 * self.dt)
            }
        }
    }

    /// All equality constraint values.
    pub fn equalities<D: Dynamics + ?Sized>(
        &self,
        dynamics: &D,
        z: &DVector<f64>,
        x0: &DVector<f64>,
    ) -> DVector<f64> {
        let l = &self.layout;
        let nx = l.nx;
        let mut out = DVector::zeros(self.n_eq());
        for k in 0..l.horizon - 1 {
            out.rows_mut(k * nx, nx).copy_from(&self.defect(dynamics, z, k));
        }
        let tie = l.state(z, 0) - x0;
        out.rows_mut((l.horizon - 1) * nx, nx).copy_from(&tie);
        out
    }

    /// Jacobian of [`equalities`](Self::equalities).
    ///
    /// Only the per-step transition is differentiated numerically; the block
    /// structure is assembled directly.
    pub fn equality_jacobian<D: Dynamics + ?Sized>(&self, dynamics: &D, z: &DVector<f64>) -> DMatrix<f64> {
        let l = &self.layout;
        let (nx, nu) = (l.nx, l.nu);
        let mut jac = DMatrix::zeros(self.n_eq(), l.len());

        // d(transition)/d[x; u] evaluated at step k.
        let local = |k: usize, f: &dyn Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64>| {
            let mut xu = DVector::zeros(nx + nu);
            xu.rows_mut(0, nx).copy_from(&l.state(z, k));
            xu.rows_mut(nx, nu).copy_from(&l.input(z, k));
            central_difference_jacobian(
                |p| f(&p.rows(0, nx).into_owned(), &p.rows(nx, nu).into_owned()),
                &xu,
            )
        };

        for k in 0..l.horizon - 1 {
            let row = k * nx;
            for i in 0..nx {
                jac[(row + i, l.state_index(k + 1, i))] = 1.0;
            }
            match self.mode {
                ConstraintMode::Dms => {
                    let ab = local(k, &|x: &DVector<f64>, u: &DVector<f64>| dynamics.step(x, u, self.dt));
                    self.scatter(&mut jac, row, k, &ab, -1.0);
                }
                ConstraintMode::Coll => {
                    let half = 0.5 * self.dt;
                    let field = |x: &DVector<f64>, u: &DVector<f64>| dynamics.derivative(x, u);
                    let here = local(k, &field);
                    let next = local(k + 1, &field);
                    for i in 0..nx {
                        jac[(row + i, l.state_index(k, i))] -= 1.0;
                    }
                    self.scatter(&mut jac, row, k, &here, -half);
                    self.scatter(&mut jac, row, k + 1, &next, -half);
                }
            }
        }

        let row = (l.horizon - 1) * nx;
        for i in 0..nx {
            jac[(row + i, l.state_index(0, i))] = 1.0;
        }
        jac
    }

    /// Add `scale * local` into the columns of step `k`, rows starting at `row`.
    fn scatter(&self, jac: &mut DMatrix<f64>, row: usize, k: usize, local: &DMatrix<f64>, scale: f64) {
        let l = &self.layout;
        for i in 0..l.nx {
            for j in 0..l.nx {
                jac[(row + i, l.state_index(k, j))] += scale * local[(i, j)];
            }
            for j in 0..l.nu {
                jac[(row + i, l.input_index(k, j))] += scale * local[(i, l.nx + j)];
            }
        }
    }

    /// Weighted constraint curvature `sum_i lambda_i H(c_eq_i) + sum_j mu_j H(c_ineq_j)`.
    ///
    /// Dynamics terms are block-diagonal per step; the initial-state tie is
    /// linear and contributes nothing.
    pub fn curvature<D: Dynamics + ?Sized>(
        &self,
        dynamics: &D,
        z: &DVector<f64>,
        obstacles: &[Vector2<f64>],
        lambda: &DVector<f64>,
        mu: &DVector<f64>,
    ) -> DMatrix<f64> {
        let l = &self.layout;
        let nx = l.nx;
        let mut out = DMatrix::zeros(l.len(), l.len());

        if lambda.len() == self.n_eq() {
            for k in 0..l.horizon - 1 {
                let w = lambda.rows(k * nx, nx).into_owned();
                if w.iter().all(|v| *v == 0.0) {
                    continue;
                }
                match self.mode {
                    ConstraintMode::Dms => {
                        let local = dynamics.step_curvature(&l.state(z, k), &l.input(z, k), self.dt, &w);
                        self.scatter_block(&mut out, k, &local, -1.0);
                    }
                    ConstraintMode::Coll => {
                        let half = 0.5 * self.dt;
                        let here = dynamics.derivative_curvature(&l.state(z, k), &l.input(z, k), &w);
                        let next = dynamics.derivative_curvature(&l.state(z, k + 1), &l.input(z, k + 1), &w);
                        self.scatter_block(&mut out, k, &here, -half);
                        self.scatter_block(&mut out, k + 1, &next, -half);
                    }
                }
            }
        }

        if mu.len() == self.n_ineq(obstacles.len()) {
            for o in 0..obstacles.len() {
                for k in 0..self.avoidance_steps {
                    let weight = 2.0 * mu[o * self.avoidance_steps + k];
                    out[(l.state_index(k, 0), l.state_index(k, 0))] += weight;
                    out[(l.state_index(k, 1), l.state_index(k, 1))] += weight;
                }
            }
        }
        out
    }

    /// Add `scale * local` into the `[x_k; u_k]` rows and columns.
    fn scatter_block(&self, out: &mut DMatrix<f64>, k: usize, local: &DMatrix<f64>, scale: f64) {
        let l = &self.layout;
        let index = |a: usize| {
            if a < l.nx {
                l.state_index(k, a)
            } else {
                l.input_index(k, a - l.nx)
            }
        };
        for a in 0..l.nx + l.nu {
            for b in 0..l.nx + l.nu {
                out[(index(a), index(b))] += scale * local[(a, b)];
            }
        }
    }

    /// Obstacle clearance values, obstacle-major over the leading steps.
    pub fn inequalities(&self, z: &DVector<f64>, obstacles: &[Vector2<f64>]) -> DVector<f64> {
        let l = &self.layout;
        let r2 = self.safety_radius * self.safety_radius;
        let mut out = DVector::zeros(self.n_ineq(obstacles.len()));
        for (o, obstacle) in obstacles.iter().enumerate() {
            for k in 0..self.avoidance_steps {
                let dx = z[l.state_index(k, 0)] - obstacle.x;
                let dy = z[l.state_index(k, 1)] - obstacle.y;
                out[o * self.avoidance_steps + k] = dx.mul_add(dx, dy * dy) - r2;
            }
        }
        out
    }

    /// Analytic Jacobian of [`inequalities`](Self::inequalities).
    pub fn inequality_jacobian(&self, z: &DVector<f64>, obstacles: &[Vector2<f64>]) -> DMatrix<f64> {
        let l = &self.layout;
        let mut jac = DMatrix::zeros(self.n_ineq(obstacles.len()), l.len());
        for (o, obstacle) in obstacles.iter().enumerate() {
            for k in 0..self.avoidance_steps {
                let row = o * self.avoidance_steps + k;
                let (ix, iy) = (l.state_index(k, 0), l.state_index(k, 1));
                jac[(row, ix)] = 2.0 * (z[ix] - obstacle.x);
                jac[(row, iy)] = 2.0 * (z[iy] - obstacle.y);
            }
        }
        jac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::DiffDrive;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn builder(mode: ConstraintMode, horizon: usize) -> ConstraintBuilder {
        ConstraintBuilder::new(DecisionLayout::new(horizon, 3, 2), mode, 0.1, 30.0, 1)
    }

    /// Straight line at constant speed along heading `theta`.
    fn straight_line(layout: &DecisionLayout, start: (f64, f64), theta: f64, v: f64, dt: f64) -> DVector<f64> {
        let mut z = DVector::zeros(layout.len());
        for k in 0..layout.horizon {
            #[allow(clippy::cast_precision_loss)]
            let t = k as f64 * dt;
            z[layout.state_index(k, 0)] = (v * t).mul_add(theta.cos(), start.0);
            z[layout.state_index(k, 1)] = (v * t).mul_add(theta.sin(), start.1);
            z[layout.state_index(k, 2)] = theta;
            z[layout.input_index(k, 0)] = v;
        }
        z
    }

    #[test]
    fn equality_count_is_nx_times_horizon() {
        for horizon in [2, 3, 5, 10] {
            for mode in [ConstraintMode::Dms, ConstraintMode::Coll] {
                let b = builder(mode, horizon);
                let layout = *b.layout();
                let z = layout.initial_guess(1.0, 1.0);
                let x0 = DVector::from_vec(vec![0.0, 0.0, 0.0]);
                assert_eq!(b.equalities(&DiffDrive, &z, &x0).len(), 3 * horizon);
                assert_eq!(b.n_eq(), 3 * horizon);
            }
        }
    }

    #[test]
    fn coll_defects_vanish_on_straight_line() {
        let b = builder(ConstraintMode::Coll, 6);
        let z = straight_line(b.layout(), (100.0, 50.0), 0.7, 12.0, 0.1);
        let x0 = b.layout().state(&z, 0);
        let c = b.equalities(&DiffDrive, &z, &x0);
        assert!(c.amax() < 1e-9, "max defect {}", c.amax());
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn dms_defects_vanish_on_rollout() {
        let b = builder(ConstraintMode::Dms, 5);
        let l = *b.layout();
        let mut z = DVector::zeros(l.len());
        let mut x = DVector::from_vec(vec![200.0, 200.0, 0.3]);
        for k in 0..l.horizon {
            let u = DVector::from_vec(vec![40.0, 0.2f64.mul_add(-(k as f64), 0.5)]);
            for i in 0..3 {
                z[l.state_index(k, i)] = x[i];
            }
            for j in 0..2 {
                z[l.input_index(k, j)] = u[j];
            }
            x = DiffDrive.step(&x, &u, 0.1);
        }
        let x0 = l.state(&z, 0);
        assert!(b.equalities(&DiffDrive, &z, &x0).amax() < 1e-9);
    }

    #[test]
    fn initial_state_tie_is_last_block() {
        let b = builder(ConstraintMode::Dms, 3);
        let l = *b.layout();
        let z = l.hold_guess(&DVector::from_vec(vec![1.0, 2.0, 0.0]));
        let measured = DVector::from_vec(vec![1.5, 1.0, 0.25]);
        let c = b.equalities(&DiffDrive, &z, &measured);
        assert_relative_eq!(c[6], -0.5);
        assert_relative_eq!(c[7], 1.0);
        assert_relative_eq!(c[8], -0.25);
    }

    #[test]
    fn equality_jacobian_matches_full_finite_differences() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        for mode in [ConstraintMode::Dms, ConstraintMode::Coll] {
            let b = builder(mode, 4);
            let l = *b.layout();
            let z = DVector::from_fn(l.len(), |i, _| {
                if i >= l.input_index(0, 1) {
                    rng.gen_range(0.2..1.0)
                } else {
                    rng.gen_range(-5.0..5.0)
                }
            });
            let x0 = DVector::from_vec(vec![0.5, -0.5, 0.1]);
            let analytic = b.equality_jacobian(&DiffDrive, &z);
            let numeric = central_difference_jacobian(|p| b.equalities(&DiffDrive, p, &x0), &z);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn single_obstacle_constraint_by_default() {
        let b = builder(ConstraintMode::Dms, 5);
        let l = *b.layout();
        let z = l.hold_guess(&DVector::from_vec(vec![100.0, 100.0, 0.0]));
        let c = b.inequalities(&z, &[Vector2::new(140.0, 130.0)]);
        assert_eq!(c.len(), 1);
        // 40^2 + 30^2 - 30^2
        assert_relative_eq!(c[0], 1600.0);
    }

    #[test]
    fn avoidance_steps_expand_inequalities() {
        let b = ConstraintBuilder::new(DecisionLayout::new(5, 3, 2), ConstraintMode::Dms, 0.1, 10.0, 3);
        let l = *b.layout();
        let z = l.initial_guess(50.0, 1.0);
        let obstacles = [Vector2::new(0.0, 0.0), Vector2::new(20.0, 20.0)];
        let c = b.inequalities(&z, &obstacles);
        assert_eq!(c.len(), 6);
        assert_eq!(b.n_ineq(2), 6);
        // Obstacle 1, step 0: state at origin, distance^2 = 800.
        assert_relative_eq!(c[3], 800.0 - 100.0);

        let jac = b.inequality_jacobian(&z, &obstacles);
        let numeric = central_difference_jacobian(|p| b.inequalities(p, &obstacles), &z);
        assert_relative_eq!(jac, numeric, epsilon = 1e-5);
    }

    #[test]
    fn curvature_matches_second_differences_of_weighted_constraints() {
        let mut rng = ChaCha8Rng::seed_from_u64(33);
        let obstacles = [Vector2::new(1.0, -2.0)];
        for mode in [ConstraintMode::Dms, ConstraintMode::Coll] {
            let b = ConstraintBuilder::new(DecisionLayout::new(3, 3, 2), mode, 0.5, 2.0, 2);
            let l = *b.layout();
            let z = DVector::from_fn(l.len(), |i, _| {
                if i >= l.input_index(0, 1) {
                    rng.gen_range(0.2..1.0)
                } else {
                    rng.gen_range(-3.0..3.0)
                }
            });
            let x0 = DVector::from_vec(vec![0.5, -0.5, 0.1]);
            let lambda = DVector::from_fn(b.n_eq(), |_, _| rng.gen_range(-2.0..2.0));
            let mu = DVector::from_fn(b.n_ineq(1), |_, _| rng.gen_range(0.0..2.0));

            let analytic = b.curvature(&DiffDrive, &z, &obstacles, &lambda, &mu);
            let numeric = crate::nlp::central_difference_hessian(
                |p| lambda.dot(&b.equalities(&DiffDrive, p, &x0)) + mu.dot(&b.inequalities(p, &obstacles)),
                &z,
            );
            assert_relative_eq!(analytic, numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn curvature_ignores_mismatched_multipliers() {
        let b = builder(ConstraintMode::Dms, 3);
        let z = b.layout().initial_guess(1.0, 1.0);
        let out = b.curvature(&DiffDrive, &z, &[], &DVector::zeros(2), &DVector::zeros(0));
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn avoidance_steps_are_clamped_to_horizon() {
        let b = ConstraintBuilder::new(DecisionLayout::new(3, 3, 2), ConstraintMode::Dms, 0.1, 30.0, 9);
        assert_eq!(b.avoidance_steps(), 3);
    }
}
