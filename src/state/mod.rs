//! Window variable types.
//!
//! A frame in the window is either a full state (pose, velocity, biases) or
//! a pose-only keyframe whose velocity and biases have been marginalised.
//! Both come wrapped in a `WithLin` variant that pins a linearisation point
//! once the variable participates in the marginalisation prior: from then on
//! Jacobians are evaluated at the pinned value while residuals use the live
//! value, and increments accumulate in a tangent-space delta.
//!
//! Tangent ordering for the 15-dim state:
//! `[trans (3), rot (3), vel (3), bias_gyro (3), bias_accel (3)]`.

use nalgebra::{SVector, Vector3, Vector6};

use crate::geometry::SE3;

/// Tangent dimension of a pose-only variable.
pub const POSE_SIZE: usize = 6;
/// Tangent dimension of a full state variable.
pub const POSE_VEL_BIAS_SIZE: usize = 15;

/// Full state of a frame: body pose in world, velocity, IMU biases.
#[derive(Debug, Clone)]
pub struct PoseVelBiasState {
    pub t_ns: i64,
    pub t_w_i: SE3,
    pub vel_w_i: Vector3<f64>,
    pub bias_gyro: Vector3<f64>,
    pub bias_accel: Vector3<f64>,
}

impl PoseVelBiasState {
    pub fn new(
        t_ns: i64,
        t_w_i: SE3,
        vel_w_i: Vector3<f64>,
        bias_gyro: Vector3<f64>,
        bias_accel: Vector3<f64>,
    ) -> Self {
        Self {
            t_ns,
            t_w_i,
            vel_w_i,
            bias_gyro,
            bias_accel,
        }
    }

    /// Apply a 15-dim increment: pose multiplicative, the rest additive.
    pub fn apply_inc(&mut self, inc: &SVector<f64, 15>) {
        self.t_w_i.apply_inc(&inc.fixed_rows::<6>(0).into_owned());
        self.vel_w_i += inc.fixed_rows::<3>(6).into_owned();
        self.bias_gyro += inc.fixed_rows::<3>(9).into_owned();
        self.bias_accel += inc.fixed_rows::<3>(12).into_owned();
    }
}

/// Full state with an optional pinned linearisation point.
#[derive(Debug, Clone)]
pub struct PoseVelBiasStateWithLin {
    linearized: bool,
    delta: SVector<f64, 15>,
    state_linearized: PoseVelBiasState,
    state_current: PoseVelBiasState,
    backup_delta: SVector<f64, 15>,
    backup_state_linearized: Option<PoseVelBiasState>,
}

impl PoseVelBiasStateWithLin {
    pub fn new(state: PoseVelBiasState, linearized: bool) -> Self {
        Self {
            linearized,
            delta: SVector::zeros(),
            state_current: state.clone(),
            state_linearized: state,
            backup_delta: SVector::zeros(),
            backup_state_linearized: None,
        }
    }

    /// Live value of the state.
    pub fn state(&self) -> &PoseVelBiasState {
        &self.state_current
    }

    /// Value the Jacobians are evaluated at. Equals the live value until the
    /// variable is pinned.
    pub fn state_lin(&self) -> &PoseVelBiasState {
        &self.state_linearized
    }

    pub fn is_linearized(&self) -> bool {
        self.linearized
    }

    /// Tangent-space offset of the live value from the linearisation point.
    pub fn delta(&self) -> &SVector<f64, 15> {
        &self.delta
    }

    /// Pin the current value as the linearisation point.
    pub fn set_linearized(&mut self) {
        self.linearized = true;
    }

    pub fn apply_inc(&mut self, inc: &SVector<f64, 15>) {
        if !self.linearized {
            self.state_linearized.apply_inc(inc);
            self.state_current = self.state_linearized.clone();
        } else {
            self.delta += inc;
            self.state_current = self.state_linearized.clone();
            self.state_current.apply_inc(&self.delta);
        }
    }

    pub fn backup(&mut self) {
        self.backup_delta = self.delta;
        self.backup_state_linearized = Some(self.state_linearized.clone());
    }

    pub fn restore(&mut self) {
        if let Some(state) = self.backup_state_linearized.take() {
            self.state_linearized = state;
            self.delta = self.backup_delta;
            self.state_current = self.state_linearized.clone();
            self.state_current.apply_inc(&self.delta);
        }
    }
}

/// Pose-only keyframe variable with an optional pinned linearisation point.
#[derive(Debug, Clone)]
pub struct PoseStateWithLin {
    linearized: bool,
    delta: Vector6<f64>,
    pub t_ns: i64,
    pose_linearized: SE3,
    pose_current: SE3,
    backup_delta: Vector6<f64>,
    backup_pose_linearized: Option<SE3>,
}

impl PoseStateWithLin {
    pub fn new(t_ns: i64, pose: SE3, linearized: bool) -> Self {
        Self {
            linearized,
            delta: Vector6::zeros(),
            t_ns,
            pose_current: pose.clone(),
            pose_linearized: pose,
            backup_delta: Vector6::zeros(),
            backup_pose_linearized: None,
        }
    }

    /// Demote a full state to pose-only, keeping the linearisation point and
    /// the pose part of the accumulated delta.
    pub fn from_pose_vel_bias(other: &PoseVelBiasStateWithLin) -> Self {
        let mut pose_current = other.state_linearized.t_w_i.clone();
        let delta = other.delta.fixed_rows::<6>(0).into_owned();
        pose_current.apply_inc(&delta);
        Self {
            linearized: other.linearized,
            delta,
            t_ns: other.state_linearized.t_ns,
            pose_linearized: other.state_linearized.t_w_i.clone(),
            pose_current,
            backup_delta: Vector6::zeros(),
            backup_pose_linearized: None,
        }
    }

    pub fn pose(&self) -> &SE3 {
        &self.pose_current
    }

    pub fn pose_lin(&self) -> &SE3 {
        &self.pose_linearized
    }

    pub fn is_linearized(&self) -> bool {
        self.linearized
    }

    pub fn delta(&self) -> &Vector6<f64> {
        &self.delta
    }

    pub fn set_linearized(&mut self) {
        self.linearized = true;
    }

    pub fn apply_inc(&mut self, inc: &Vector6<f64>) {
        if !self.linearized {
            self.pose_linearized.apply_inc(inc);
            self.pose_current = self.pose_linearized.clone();
        } else {
            self.delta += inc;
            self.pose_current = self.pose_linearized.clone();
            self.pose_current.apply_inc(&self.delta);
        }
    }

    pub fn backup(&mut self) {
        self.backup_delta = self.delta;
        self.backup_pose_linearized = Some(self.pose_linearized.clone());
    }

    pub fn restore(&mut self) {
        if let Some(pose) = self.backup_pose_linearized.take() {
            self.pose_linearized = pose;
            self.delta = self.backup_delta;
            self.pose_current = self.pose_linearized.clone();
            self.pose_current.apply_inc(&self.delta);
        }
    }
}
