//! Decision vector layout.
//!
//! The optimizer works on a flat vector of length `horizon * (nx + nu)`
//! grouped column-major: for each of the `nx + nu` variables, a run of
//! `horizon` values. Reshaping to a `horizon x (nx + nu)` matrix is a
//! reinterpretation of the same buffer (nalgebra storage is column-major).

use nalgebra::{DMatrix, DVector};

/// Index arithmetic for the column-major decision vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionLayout {
    pub horizon: usize,
    pub nx: usize,
    pub nu: usize,
}

impl DecisionLayout {
    pub const fn new(horizon: usize, nx: usize, nu: usize) -> Self {
        Self { horizon, nx, nu }
    }

    /// Variables per horizon step (`nx + nu`).
    pub const fn width(&self) -> usize {
        self.nx + self.nu
    }

    /// Total decision vector length.
    pub const fn len(&self) -> usize {
        self.horizon * self.width()
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of variable `var` (state dims first, then inputs) at `step`.
    pub const fn index(&self, step: usize, var: usize) -> usize {
        var * self.horizon + step
    }

    /// Flat index of state dimension `i` at `step`.
    pub const fn state_index(&self, step: usize, i: usize) -> usize {
        self.index(step, i)
    }

    /// Flat index of input dimension `j` at `step`.
    pub const fn input_index(&self, step: usize, j: usize) -> usize {
        self.index(step, self.nx + j)
    }

    /// View the flat vector as a `horizon x (nx + nu)` matrix.
    pub fn reshape(&self, z: &DVector<f64>) -> DMatrix<f64> {
        debug_assert_eq!(z.len(), self.len());
        DMatrix::from_column_slice(self.horizon, self.width(), z.as_slice())
    }

    /// Inverse of [`reshape`](Self::reshape).
    pub fn flatten(&self, m: &DMatrix<f64>) -> DVector<f64> {
        debug_assert_eq!(m.shape(), (self.horizon, self.width()));
        DVector::from_column_slice(m.as_slice())
    }

    /// Predicted state at `step`.
    pub fn state(&self, z: &DVector<f64>, step: usize) -> DVector<f64> {
        DVector::from_fn(self.nx, |i, _| z[self.state_index(step, i)])
    }

    /// Predicted input at `step`.
    pub fn input(&self, z: &DVector<f64>, step: usize) -> DVector<f64> {
        DVector::from_fn(self.nu, |j, _| z[self.input_index(step, j)])
    }

    /// All predicted states, `horizon x nx`.
    pub fn states(&self, z: &DVector<f64>) -> DMatrix<f64> {
        self.reshape(z).columns(0, self.nx).into_owned()
    }

    /// All predicted inputs, `horizon x nu`.
    pub fn inputs(&self, z: &DVector<f64>) -> DMatrix<f64> {
        self.reshape(z).columns(self.nx, self.nu).into_owned()
    }

    /// Cold-start guess: states ramp `0 -> x_guess`, inputs ramp `0.1 -> u_guess`.
    pub fn initial_guess(&self, x_guess: f64, u_guess: f64) -> DVector<f64> {
        let mut m = DMatrix::zeros(self.horizon, self.width());
        for var in 0..self.width() {
            let (start, end) = if var < self.nx {
                (0.0, x_guess)
            } else {
                (0.1, u_guess)
            };
            for (step, value) in linspace(start, end, self.horizon).into_iter().enumerate() {
                m[(step, var)] = value;
            }
        }
        self.flatten(&m)
    }

    /// Guess that holds the measured state across the horizon with zero inputs.
    pub fn hold_guess(&self, x0: &DVector<f64>) -> DVector<f64> {
        debug_assert_eq!(x0.len(), self.nx);
        let mut z = DVector::zeros(self.len());
        for step in 0..self.horizon {
            for i in 0..self.nx {
                z[self.state_index(step, i)] = x0[i];
            }
        }
        z
    }

    /// Shift a previous solution one step forward, repeating the last sample.
    pub fn shift(&self, previous: &DVector<f64>) -> DVector<f64> {
        let m = self.reshape(previous);
        let last = self.horizon - 1;
        let shifted = DMatrix::from_fn(self.horizon, self.width(), |step, var| {
            m[((step + 1).min(last), var)]
        });
        self.flatten(&shifted)
    }
}

/// `n` evenly spaced samples from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            #[allow(clippy::cast_precision_loss)]
            let step = (end - start) / (n - 1) as f64;
            #[allow(clippy::cast_precision_loss)]
            (0..n).map(|i| step.mul_add(i as f64, start)).collect()
        }
    }
}
