//! The simulated differential-drive robot.

use nalgebra::Vector2;
use rover_core::config::SimConfig;
use rover_core::error::ValidationError;
use rover_core::types::{Input, State};
use rover_mpc::DiffDrive;

/// Robot pose plus the command it is currently executing.
#[derive(Debug, Clone, PartialEq)]
pub struct Robot {
    state: State,
    input: Input,
    radius: f64,
    dt: f64,
}

impl Robot {
    pub const fn new(state: State, radius: f64, dt: f64) -> Self {
        Self {
            state,
            input: Input::new(0.0, 0.0),
            radius,
            dt,
        }
    }

    pub fn from_config(config: &SimConfig) -> Self {
        let [x, y, theta] = config.initial_pose;
        Self::new(State::new(x, y, theta), config.robot_radius, config.robot_dt)
    }

    pub const fn state(&self) -> &State {
        &self.state
    }

    pub const fn input(&self) -> &Input {
        &self.input
    }

    pub const fn radius(&self) -> f64 {
        self.radius
    }

    pub const fn dt(&self) -> f64 {
        self.dt
    }

    pub fn position(&self) -> Vector2<f64> {
        self.state.xy()
    }

    /// Pose after one integration step of `input` from `state`.
    pub fn dynamics_step(&self, state: &State, input: &Input) -> State {
        DiffDrive::step_pose(state, input, self.dt)
    }

    /// Set the command and advance one step.
    pub fn apply_input(&mut self, input: Input) -> Result<&State, ValidationError> {
        if input.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::NonFiniteInput);
        }
        self.input = input;
        self.state = self.dynamics_step(&self.state, &self.input);
        Ok(&self.state)
    }
}
