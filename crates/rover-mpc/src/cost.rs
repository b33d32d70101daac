//! Quadratic tracking and effort objective.
//!
//! ```text
//! J(z) = sum_k (x_k - ref)^T Q (x_k - ref) + sum_k u_k^T R u_k
//! ```
//!
//! The reference is held constant across the horizon.

use nalgebra::{DMatrix, DVector};

use crate::decision::DecisionLayout;

/// Stage-summed quadratic cost over the horizon.
#[derive(Debug, Clone)]
pub struct CostFunction {
    layout: DecisionLayout,
    q: DMatrix<f64>,
    r: DMatrix<f64>,
}

impl CostFunction {
    pub fn new(layout: DecisionLayout, q: DMatrix<f64>, r: DMatrix<f64>) -> Self {
        debug_assert_eq!(q.shape(), (layout.nx, layout.nx));
        debug_assert_eq!(r.shape(), (layout.nu, layout.nu));
        Self { layout, q, r }
    }

    pub const fn layout(&self) -> &DecisionLayout {
        &self.layout
    }

    pub const fn q(&self) -> &DMatrix<f64> {
        &self.q
    }

    pub const fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    /// Objective value at `z` for a constant `reference` state.
    pub fn evaluate(&self, z: &DVector<f64>, reference: &DVector<f64>) -> f64 {
        let mut total = 0.0;
        for k in 0..self.layout.horizon {
            let e = self.layout.state(z, k) - reference;
            let u = self.layout.input(z, k);
            total += e.dot(&(&self.q * &e)) + u.dot(&(&self.r * &u));
        }
        total
    }

    /// Gradient: `(Q + Q^T)(x_k - ref)` on state entries, `(R + R^T) u_k` on inputs.
    pub fn gradient(&self, z: &DVector<f64>, reference: &DVector<f64>) -> DVector<f64> {
        let qs = &self.q + self.q.transpose();
        let rs = &self.r + self.r.transpose();
        let mut g = DVector::zeros(self.layout.len());
        for k in 0..self.layout.horizon {
            let gx = &qs * (self.layout.state(z, k) - reference);
            let gu = &rs * self.layout.input(z, k);
            for i in 0..self.layout.nx {
                g[self.layout.state_index(k, i)] = gx[i];
            }
            for j in 0..self.layout.nu {
                g[self.layout.input_index(k, j)] = gu[j];
            }
        }
        g
    }

    /// Constant Hessian in decision-vector coordinates.
    pub fn hessian(&self) -> DMatrix<f64> {
        let l = &self.layout;
        let mut h = DMatrix::zeros(l.len(), l.len());
        for k in 0..l.horizon {
            for i in 0..l.nx {
                for j in 0..l.nx {
                    h[(l.state_index(k, i), l.state_index(k, j))] =
                        self.q[(i, j)] + self.q[(j, i)];
                }
            }
            for i in 0..l.nu {
                for j in 0..l.nu {
                    h[(l.input_index(k, i), l.input_index(k, j))] =
                        self.r[(i, j)] + self.r[(j, i)];
                }
            }
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn default_cost(horizon: usize) -> CostFunction {
        CostFunction::new(
            DecisionLayout::new(horizon, 3, 2),
            DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 1.0, 0.0])),
            DMatrix::from_diagonal(&DVector::from_vec(vec![0.1, 0.1])),
        )
    }

    #[test]
    fn zero_at_reference_with_no_input() {
        let cost = default_cost(4);
        let reference = DVector::from_vec(vec![500.0, 700.0, 0.0]);
        let z = cost.layout().hold_guess(&reference);
        assert_relative_eq!(cost.evaluate(&z, &reference), 0.0);
    }

    #[test]
    fn sums_stage_costs() {
        let cost = default_cost(2);
        let l = *cost.layout();
        let reference = DVector::from_vec(vec![1.0, 1.0, 0.0]);
        let mut z = DVector::zeros(l.len());
        // Step 0 at origin: error (-1, -1), cost 2. Heading is unweighted.
        z[l.state_index(0, 2)] = 3.0;
        // Step 1 at reference with v = 2: cost 0.1 * 4.
        z[l.state_index(1, 0)] = 1.0;
        z[l.state_index(1, 1)] = 1.0;
        z[l.input_index(1, 0)] = 2.0;
        assert_relative_eq!(cost.evaluate(&z, &reference), 2.4, epsilon = 1e-12);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let q = DMatrix::from_row_slice(3, 3, &[2.0, 0.5, 0.0, 0.1, 1.0, 0.0, 0.0, 0.0, 0.3]);
        let r = DMatrix::from_row_slice(2, 2, &[0.2, 0.05, 0.0, 0.4]);
        let cost = CostFunction::new(DecisionLayout::new(3, 3, 2), q, r);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let z = DVector::from_fn(cost.layout().len(), |_, _| rng.gen_range(-2.0..2.0));
        let reference = DVector::from_vec(vec![0.5, -0.3, 0.1]);

        let g = cost.gradient(&z, &reference);
        let h = 1e-6;
        for i in 0..z.len() {
            let mut zp = z.clone();
            let mut zm = z.clone();
            zp[i] += h;
            zm[i] -= h;
            let fd = (cost.evaluate(&zp, &reference) - cost.evaluate(&zm, &reference)) / (2.0 * h);
            assert_relative_eq!(g[i], fd, epsilon = 1e-6);
        }
    }

    #[test]
    fn hessian_is_constant_second_derivative() {
        let cost = default_cost(3);
        let reference = DVector::from_vec(vec![10.0, 20.0, 0.0]);
        let l = *cost.layout();
        let h = cost.hessian();
        assert_eq!(h.shape(), (l.len(), l.len()));
        assert_relative_eq!(h[(l.state_index(1, 0), l.state_index(1, 0))], 2.0);
        assert_relative_eq!(h[(l.input_index(2, 1), l.input_index(2, 1))], 0.2);

        // Quadratic: f(z + d) = f(z) + g.d + d^T H d / 2 exactly.
        let z = DVector::from_fn(l.len(), |i, _| f64::from(u32::try_from(i).unwrap_or(0)) * 0.3);
        let d = DVector::from_fn(l.len(), |i, _| if i % 2 == 0 { 0.7 } else { -0.4 });
        let predicted = cost.evaluate(&z, &reference)
            + cost.gradient(&z, &reference).dot(&d)
            + 0.5 * d.dot(&(&h * &d));
        assert_relative_eq!(cost.evaluate(&(&z + &d), &reference), predicted, epsilon = 1e-9);
    }
}
