//! IMU preintegration.
//!
//! Compresses the IMU samples between two visual frames into a single
//! relative-motion constraint following Forster et al. "IMU Preintegration
//! on Manifold". The delta state is expressed in the body frame of the
//! interval start; biases are fixed at the values used during integration
//! and first-order bias Jacobians allow correcting the deltas when the bias
//! estimate moves without re-integrating.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::sample::ImuSample;
use super::types::{Matrix9, Matrix9x6};
use crate::geometry::{right_jacobian_so3, skew};
use crate::state::PoseVelBiasState;

/// Preintegrated IMU measurement over `[start_t_ns, start_t_ns + dt_ns]`.
///
/// The 9-dim delta state and its covariance are ordered `[δp, δθ, δv]`.
#[derive(Debug, Clone)]
pub struct IntegratedImuMeasurement {
    start_t_ns: i64,
    dt_ns: i64,

    /// Biases the samples were corrected with during integration.
    bias_gyro_lin: Vector3<f64>,
    bias_accel_lin: Vector3<f64>,

    delta_rot: UnitQuaternion<f64>,
    delta_vel: Vector3<f64>,
    delta_pos: Vector3<f64>,

    /// Covariance of the delta state.
    cov: Matrix9,

    /// Jacobian ∂(Δθ)/∂(bg).
    d_rot_d_bg: Matrix3<f64>,
    /// Jacobian ∂(Δv)/∂(bg).
    d_vel_d_bg: Matrix3<f64>,
    /// Jacobian ∂(Δv)/∂(ba).
    d_vel_d_ba: Matrix3<f64>,
    /// Jacobian ∂(Δp)/∂(bg).
    d_pos_d_bg: Matrix3<f64>,
    /// Jacobian ∂(Δp)/∂(ba).
    d_pos_d_ba: Matrix3<f64>,
}

impl IntegratedImuMeasurement {
    pub fn new(start_t_ns: i64, bias_gyro: Vector3<f64>, bias_accel: Vector3<f64>) -> Self {
        Self {
            start_t_ns,
            dt_ns: 0,
            bias_gyro_lin: bias_gyro,
            bias_accel_lin: bias_accel,
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            cov: Matrix9::zeros(),
            d_rot_d_bg: Matrix3::zeros(),
            d_vel_d_bg: Matrix3::zeros(),
            d_vel_d_ba: Matrix3::zeros(),
            d_pos_d_bg: Matrix3::zeros(),
            d_pos_d_ba: Matrix3::zeros(),
        }
    }

    pub fn start_t_ns(&self) -> i64 {
        self.start_t_ns
    }

    pub fn dt_ns(&self) -> i64 {
        self.dt_ns
    }

    pub fn end_t_ns(&self) -> i64 {
        self.start_t_ns + self.dt_ns
    }

    pub fn bias_gyro_lin(&self) -> &Vector3<f64> {
        &self.bias_gyro_lin
    }

    pub fn bias_accel_lin(&self) -> &Vector3<f64> {
        &self.bias_accel_lin
    }

    pub fn delta_rot(&self) -> &UnitQuaternion<f64> {
        &self.delta_rot
    }

    pub fn delta_vel(&self) -> &Vector3<f64> {
        &self.delta_vel
    }

    pub fn delta_pos(&self) -> &Vector3<f64> {
        &self.delta_pos
    }

    pub fn d_rot_d_bg(&self) -> &Matrix3<f64> {
        &self.d_rot_d_bg
    }

    pub fn d_vel_d_bg(&self) -> &Matrix3<f64> {
        &self.d_vel_d_bg
    }

    pub fn d_vel_d_ba(&self) -> &Matrix3<f64> {
        &self.d_vel_d_ba
    }

    pub fn d_pos_d_bg(&self) -> &Matrix3<f64> {
        &self.d_pos_d_bg
    }

    pub fn d_pos_d_ba(&self) -> &Matrix3<f64> {
        &self.d_pos_d_ba
    }

    /// Information matrix of the delta state (regularised inverse of the
    /// propagated covariance).
    pub fn cov_inv(&self) -> Matrix9 {
        let regularized = self.cov + Matrix9::identity() * 1e-12;
        regularized
            .try_inverse()
            .unwrap_or_else(Matrix9::identity)
    }

    /// Integrate one sample. The step spans from the current interval end to
    /// the sample timestamp; `accel_cov`/`gyro_cov` are discrete-time
    /// per-step noise variances.
    pub fn integrate(
        &mut self,
        data: &ImuSample,
        accel_cov: &Vector3<f64>,
        gyro_cov: &Vector3<f64>,
    ) {
        let dt_step_ns = data.t_ns - self.end_t_ns();
        let dt = dt_step_ns as f64 * 1e-9;
        if dt <= 0.0 {
            return;
        }

        let accel = data.accel - self.bias_accel_lin;
        let gyro = data.gyro - self.bias_gyro_lin;

        let rot = self.delta_rot.to_rotation_matrix().into_inner();
        let angle_axis = gyro * dt;
        let rot_inc = UnitQuaternion::from_scaled_axis(angle_axis);
        let rot_inc_mat = rot_inc.to_rotation_matrix().into_inner();
        let jr = right_jacobian_so3(&angle_axis);
        let skew_accel = skew(&accel);

        // State transition for [δp, δθ, δv]:
        //
        // A = | I   0            I·dt |
        //     | 0   ΔR_incᵀ      0    |
        //     | 0   -ΔR·[a]×·dt  I    |
        let mut a_mat = Matrix9::identity();
        a_mat
            .fixed_view_mut::<3, 3>(0, 6)
            .copy_from(&(Matrix3::identity() * dt));
        a_mat
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&rot_inc_mat.transpose());
        a_mat
            .fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(-rot * skew_accel * dt));

        // Noise input for [gyro, accel]:
        //
        // B = | 0       0    |
        //     | Jr·dt   0    |
        //     | 0       ΔR·dt|
        let mut b_mat = Matrix9x6::zeros();
        b_mat.fixed_view_mut::<3, 3>(3, 0).copy_from(&(jr * dt));
        b_mat.fixed_view_mut::<3, 3>(6, 3).copy_from(&(rot * dt));

        let mut q_diag = nalgebra::SVector::<f64, 6>::zeros();
        q_diag.fixed_rows_mut::<3>(0).copy_from(gyro_cov);
        q_diag.fixed_rows_mut::<3>(3).copy_from(accel_cov);

        self.cov = a_mat * self.cov * a_mat.transpose()
            + b_mat * nalgebra::SMatrix::<f64, 6, 6>::from_diagonal(&q_diag) * b_mat.transpose();

        // Bias Jacobians, propagated before the mean update.
        self.d_pos_d_bg += self.d_vel_d_bg * dt;
        self.d_pos_d_ba += self.d_vel_d_ba * dt;
        self.d_vel_d_bg -= rot * skew_accel * self.d_rot_d_bg * dt;
        self.d_vel_d_ba -= rot * dt;
        self.d_rot_d_bg = rot_inc_mat.transpose() * self.d_rot_d_bg - jr * dt;

        // Mean update (Euler): position uses the pre-step velocity.
        self.delta_pos += self.delta_vel * dt;
        self.delta_vel += rot * accel * dt;
        self.delta_rot *= rot_inc;

        self.dt_ns += dt_step_ns;
    }

    /// Delta state corrected to first order for the bias change from the
    /// integration biases to `(bias_gyro, bias_accel)`.
    pub fn corrected_deltas(
        &self,
        bias_gyro: &Vector3<f64>,
        bias_accel: &Vector3<f64>,
    ) -> (Vector3<f64>, UnitQuaternion<f64>, Vector3<f64>) {
        let dbg = bias_gyro - self.bias_gyro_lin;
        let dba = bias_accel - self.bias_accel_lin;

        let pos = self.delta_pos + self.d_pos_d_bg * dbg + self.d_pos_d_ba * dba;
        let rot = self.delta_rot * UnitQuaternion::from_scaled_axis(self.d_rot_d_bg * dbg);
        let vel = self.delta_vel + self.d_vel_d_bg * dbg + self.d_vel_d_ba * dba;
        (pos, rot, vel)
    }

    /// Closed-form prediction of the state at the interval end from the
    /// state at the interval start and gravity.
    pub fn predict_state(&self, state0: &PoseVelBiasState, g: &Vector3<f64>) -> PoseVelBiasState {
        let dt = self.dt_ns as f64 * 1e-9;
        let r0 = &state0.t_w_i.rotation;

        let mut next = state0.clone();
        next.t_ns = self.end_t_ns();
        next.t_w_i.rotation = r0 * self.delta_rot;
        next.t_w_i.translation = state0.t_w_i.translation
            + state0.vel_w_i * dt
            + g * (0.5 * dt * dt)
            + r0 * self.delta_pos;
        next.vel_w_i = state0.vel_w_i + g * dt + r0 * self.delta_vel;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;

    const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

    fn sample_cov() -> (Vector3<f64>, Vector3<f64>) {
        (Vector3::repeat(1e-4), Vector3::repeat(1e-6))
    }

    fn integrate_constant(
        meas: &mut IntegratedImuMeasurement,
        accel: Vector3<f64>,
        gyro: Vector3<f64>,
        steps: i64,
        dt_ns: i64,
    ) {
        let (accel_cov, gyro_cov) = sample_cov();
        for i in 1..=steps {
            let data = ImuSample {
                t_ns: meas.start_t_ns() + i * dt_ns,
                accel,
                gyro,
            };
            meas.integrate(&data, &accel_cov, &gyro_cov);
        }
    }

    #[test]
    fn test_static_at_rest_predicts_same_pose() {
        // Body at rest, accelerometer measures -g in body frame (z up).
        let mut meas = IntegratedImuMeasurement::new(0, Vector3::zeros(), Vector3::zeros());
        integrate_constant(
            &mut meas,
            Vector3::new(0.0, 0.0, 9.81),
            Vector3::zeros(),
            100,
            5_000_000,
        );

        let state0 = PoseVelBiasState::new(
            0,
            SE3::identity(),
            Vector3::zeros(),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        let state1 = meas.predict_state(&state0, &GRAVITY);

        assert_eq!(state1.t_ns, 500_000_000);
        assert_relative_eq!(state1.t_w_i.translation.norm(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(state1.vel_w_i.norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_constant_acceleration_trajectory() {
        // 1 m/s² along x for one second.
        let mut meas = IntegratedImuMeasurement::new(0, Vector3::zeros(), Vector3::zeros());
        integrate_constant(
            &mut meas,
            Vector3::new(1.0, 0.0, 9.81),
            Vector3::zeros(),
            1000,
            1_000_000,
        );

        let state0 = PoseVelBiasState::new(
            0,
            SE3::identity(),
            Vector3::zeros(),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        let state1 = meas.predict_state(&state0, &GRAVITY);

        assert_relative_eq!(state1.vel_w_i.x, 1.0, epsilon = 1e-3);
        assert_relative_eq!(state1.t_w_i.translation.x, 0.5, epsilon = 2e-3);
        assert_relative_eq!(state1.t_w_i.translation.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_covariance_grows_and_stays_symmetric() {
        let mut meas = IntegratedImuMeasurement::new(0, Vector3::zeros(), Vector3::zeros());
        integrate_constant(
            &mut meas,
            Vector3::new(0.1, 0.2, 9.81),
            Vector3::new(0.01, 0.02, 0.03),
            50,
            5_000_000,
        );

        let cov_inv = meas.cov_inv();
        for i in 0..9 {
            for j in 0..9 {
                assert!(cov_inv[(i, j)].is_finite());
                assert_relative_eq!(cov_inv[(i, j)], cov_inv[(j, i)], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_bias_correction_matches_reintegration() {
        let accel = Vector3::new(0.3, -0.1, 9.7);
        let gyro = Vector3::new(0.05, -0.02, 0.1);
        let dbg = Vector3::new(2e-4, -1e-4, 3e-4);
        let dba = Vector3::new(1e-3, 2e-3, -1e-3);

        let mut nominal = IntegratedImuMeasurement::new(0, Vector3::zeros(), Vector3::zeros());
        integrate_constant(&mut nominal, accel, gyro, 40, 5_000_000);

        // Reference: integrate with the perturbed bias directly.
        let mut shifted = IntegratedImuMeasurement::new(0, dbg, dba);
        integrate_constant(&mut shifted, accel, gyro, 40, 5_000_000);

        let (pos, rot, vel) = nominal.corrected_deltas(&dbg, &dba);

        assert_relative_eq!(pos, *shifted.delta_pos(), epsilon = 1e-5);
        assert_relative_eq!(vel, *shifted.delta_vel(), epsilon = 1e-5);
        assert_relative_eq!(
            rot.angle_to(shifted.delta_rot()),
            0.0,
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_interval_bookkeeping() {
        let mut meas = IntegratedImuMeasurement::new(1_000, Vector3::zeros(), Vector3::zeros());
        let (accel_cov, gyro_cov) = sample_cov();
        meas.integrate(
            &ImuSample {
                t_ns: 6_000,
                accel: Vector3::zeros(),
                gyro: Vector3::zeros(),
            },
            &accel_cov,
            &gyro_cov,
        );
        assert_eq!(meas.start_t_ns(), 1_000);
        assert_eq!(meas.dt_ns(), 5_000);
        assert_eq!(meas.end_t_ns(), 6_000);

        // Non-positive step is ignored.
        meas.integrate(
            &ImuSample {
                t_ns: 6_000,
                accel: Vector3::zeros(),
                gyro: Vector3::zeros(),
            },
            &accel_cov,
            &gyro_cov,
        );
        assert_eq!(meas.dt_ns(), 5_000);
    }
}
