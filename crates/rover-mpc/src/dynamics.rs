//! Differential-drive kinematics.
//!
//! The discrete transition is the exact arc solution for a constant
//! `(v, omega)` held over `dt`:
//!
//! ```text
//! p  = v / omega
//! x' = x - p sin(theta) + p sin(theta + omega dt)
//! y' = y + p cos(theta) - p cos(theta + omega dt)
//! theta' = theta + omega dt
//! ```
//!
//! The sine/cosine differences are evaluated in product form,
//! `p (sin b - sin a) = v dt cos((a+b)/2) sinc(omega dt / 2)`, which is the
//! same function without the cancellation near `omega = 0`.

use nalgebra::{DMatrix, DVector};
use rover_core::types::{INPUT_DIM, Input, STATE_DIM, State};

use crate::nlp::central_difference_hessian;

/// Angular velocities with `|omega|` below this are shifted by [`OMEGA_CORRECTION`].
pub const OMEGA_THRESHOLD: f64 = 1e-4;

/// Shift applied to near-zero angular velocities before the arc formula.
pub const OMEGA_CORRECTION: f64 = 1e-4;

/// A discrete-time system the MPC can optimize over.
///
/// `step` is the direct transition over `dt` used by multiple shooting;
/// `derivative` is the continuous-time vector field used by collocation.
pub trait Dynamics: Send + Sync + 'static {
    fn state_dim(&self) -> usize;

    fn input_dim(&self) -> usize;

    /// Next state after holding `u` for `dt`.
    fn step(&self, x: &DVector<f64>, u: &DVector<f64>, dt: f64) -> DVector<f64>;

    /// Time derivative of the state.
    fn derivative(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// Hessian of `w . step(x, u, dt)` over the stacked `[x; u]`.
    fn step_curvature(&self, x: &DVector<f64>, u: &DVector<f64>, dt: f64, w: &DVector<f64>) -> DMatrix<f64> {
        let (nx, nu) = (x.len(), u.len());
        central_difference_hessian(
            |p| w.dot(&self.step(&p.rows(0, nx).into_owned(), &p.rows(nx, nu).into_owned(), dt)),
            &stack(x, u),
        )
    }

    /// Hessian of `w . derivative(x, u)` over the stacked `[x; u]`.
    fn derivative_curvature(&self, x: &DVector<f64>, u: &DVector<f64>, w: &DVector<f64>) -> DMatrix<f64> {
        let (nx, nu) = (x.len(), u.len());
        central_difference_hessian(
            |p| w.dot(&self.derivative(&p.rows(0, nx).into_owned(), &p.rows(nx, nu).into_owned())),
            &stack(x, u),
        )
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

// ---------------------------------------------------------------------------
// DiffDrive
// ---------------------------------------------------------------------------

/// Unicycle model of a differential-drive robot. State `[x, y, theta]`, input `[v, omega]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffDrive;

impl DiffDrive {
    /// Apply the singularity guard to an angular velocity.
    pub fn guard_omega(omega: f64) -> f64 {
        if omega.abs() < OMEGA_THRESHOLD {
            omega + OMEGA_CORRECTION
        } else {
            omega
        }
    }

    /// Exact arc step on typed pose/input.
    pub fn step_pose(state: &State, input: &Input, dt: f64) -> State {
        let (x, y, theta) = (state.x, state.y, state.z);
        let v = input.x;
        let omega = Self::guard_omega(input.y);

        let half = 0.5 * omega * dt;
        let mid = theta + half;
        let chord = v * dt * sinc(half);

        State::new(
            chord.mul_add(mid.cos(), x),
            chord.mul_add(mid.sin(), y),
            omega.mul_add(dt, theta),
        )
    }

    /// Continuous-time unicycle field `(v cos theta, v sin theta, omega)`.
    pub fn derivative_pose(state: &State, input: &Input) -> State {
        let theta = state.z;
        State::new(input.x * theta.cos(), input.x * theta.sin(), input.y)
    }

    /// Hessian of `w . step_pose` over `[x, y, theta, v, omega]`.
    ///
    /// Only `theta`, `v` and `omega` enter nonlinearly. The guard is a shift,
    /// so `omega` derivatives are taken at the guarded value.
    pub fn step_curvature_pose(state: &State, input: &Input, dt: f64, w: &State) -> DMatrix<f64> {
        let v = input.x;
        let half_dt = 0.5 * dt;
        let h = Self::guard_omega(input.y) * half_dt;
        let (s, ds, dds) = sinc_derivatives(h);

        // Chord length c = v dt sinc(h) and its partials.
        let c = v * dt * s;
        let c_v = dt * s;
        let c_w = v * dt * ds * half_dt;
        let c_vw = dt * ds * half_dt;
        let c_ww = v * dt * dds * half_dt * half_dt;

        // a(m) = w_x cos m + w_y sin m along the chord heading m.
        let (sin_m, cos_m) = (state.z + h).sin_cos();
        let a = w.x.mul_add(cos_m, w.y * sin_m);
        let a_m = w.y.mul_add(cos_m, -w.x * sin_m);

        let theta_theta = -c * a;
        let theta_v = c_v * a_m;
        let theta_omega = c_w.mul_add(a_m, -c * a * half_dt);
        let v_omega = c_vw.mul_add(a, c_v * a_m * half_dt);
        let omega_omega = c_ww * a + 2.0 * c_w * a_m * half_dt - c * a * half_dt * half_dt;

        symmetric_pose_hessian(theta_theta, theta_v, theta_omega, v_omega, omega_omega)
    }

    /// Hessian of `w . derivative_pose` over `[x, y, theta, v, omega]`.
    pub fn derivative_curvature_pose(state: &State, input: &Input, w: &State) -> DMatrix<f64> {
        let (sin_t, cos_t) = state.z.sin_cos();
        let a = w.x.mul_add(cos_t, w.y * sin_t);
        let a_t = w.y.mul_add(cos_t, -w.x * sin_t);
        symmetric_pose_hessian(-input.x * a, a_t, 0.0, 0.0, 0.0)
    }
}

impl Dynamics for DiffDrive {
    fn state_dim(&self) -> usize {
        STATE_DIM
    }

    fn input_dim(&self) -> usize {
        INPUT_DIM
    }

    fn step(&self, x: &DVector<f64>, u: &DVector<f64>, dt: f64) -> DVector<f64> {
        let next = Self::step_pose(&State::new(x[0], x[1], x[2]), &Input::new(u[0], u[1]), dt);
        DVector::from_column_slice(next.as_slice())
    }

    fn derivative(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        let dx = Self::derivative_pose(&State::new(x[0], x[1], x[2]), &Input::new(u[0], u[1]));
        DVector::from_column_slice(dx.as_slice())
    }

    fn step_curvature(&self, x: &DVector<f64>, u: &DVector<f64>, dt: f64, w: &DVector<f64>) -> DMatrix<f64> {
        Self::step_curvature_pose(
            &State::new(x[0], x[1], x[2]),
            &Input::new(u[0], u[1]),
            dt,
            &State::new(w[0], w[1], w[2]),
        )
    }

    fn derivative_curvature(&self, x: &DVector<f64>, u: &DVector<f64>, w: &DVector<f64>) -> DMatrix<f64> {
        Self::derivative_curvature_pose(
            &State::new(x[0], x[1], x[2]),
            &Input::new(u[0], u[1]),
            &State::new(w[0], w[1], w[2]),
        )
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "DiffDrive"
    }
}

/// `sin(h) / h` with the removable singularity filled in.
fn sinc(h: f64) -> f64 {
    if h.abs() < 1e-6 {
        1.0 - h * h / 6.0
    } else {
        h.sin() / h
    }
}

/// `sinc(h)` with its first and second derivatives.
fn sinc_derivatives(h: f64) -> (f64, f64, f64) {
    let h2 = h * h;
    if h.abs() < 1e-3 {
        return (1.0 - h2 / 6.0, h * (h2 / 30.0 - 1.0 / 3.0), h2 / 10.0 - 1.0 / 3.0);
    }
    let (sin, cos) = h.sin_cos();
    (
        sin / h,
        h.mul_add(cos, -sin) / h2,
        (2.0 - h2).mul_add(sin, -2.0 * h * cos) / (h2 * h),
    )
}

/// 5x5 pose/input Hessian with only the `theta`, `v`, `omega` block filled.
fn symmetric_pose_hessian(
    theta_theta: f64,
    theta_v: f64,
    theta_omega: f64,
    v_omega: f64,
    omega_omega: f64,
) -> DMatrix<f64> {
    let mut hess = DMatrix::zeros(STATE_DIM + INPUT_DIM, STATE_DIM + INPUT_DIM);
    hess[(2, 2)] = theta_theta;
    hess[(4, 4)] = omega_omega;
    for (i, j, value) in [(2, 3, theta_v), (2, 4, theta_omega), (3, 4, v_omega)] {
        hess[(i, j)] = value;
        hess[(j, i)] = value;
    }
    hess
}

fn stack(x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(x.len() + u.len(), x.iter().chain(u.iter()).copied())
}
