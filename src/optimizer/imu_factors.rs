//! Inertial factors.
//!
//! IMU residuals and Jacobians for the joint optimization of poses,
//! velocities and biases, following the "On-Manifold Preintegration"
//! framework by Forster et al. One preintegration factor constrains each
//! pair of consecutive full states; bias random-walk factors tie the biases
//! of consecutive states together.
//!
//! The 9-dim residual is ordered `[r_p, r_R, r_v]` and weighted with the
//! information matrix propagated by the preintegration. First-estimate
//! Jacobians: when either endpoint state is pinned, Jacobians come from the
//! pinned values while the residual is re-evaluated at the live values.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, Vector3};

use super::accumulator::DenseAccumulator;
use super::aom::AbsOrderMap;
use crate::geometry::{left_jacobian_so3_inv, right_jacobian_so3_inv, skew};
use crate::imu::types::{Matrix9x15, Vector9};
use crate::imu::IntegratedImuMeasurement;
use crate::state::{PoseVelBiasState, PoseVelBiasStateWithLin};

/// Preintegration residual between two states.
pub fn imu_residual(
    meas: &IntegratedImuMeasurement,
    state0: &PoseVelBiasState,
    state1: &PoseVelBiasState,
    g: &Vector3<f64>,
) -> Vector9 {
    let dt = meas.dt_ns() as f64 * 1e-9;
    let r0_inv = state0.t_w_i.rotation.inverse();

    let (cd_pos, cd_rot, cd_vel) = meas.corrected_deltas(&state0.bias_gyro, &state0.bias_accel);

    let tmp_p = state1.t_w_i.translation
        - state0.t_w_i.translation
        - state0.vel_w_i * dt
        - g * (0.5 * dt * dt);
    let tmp_v = state1.vel_w_i - state0.vel_w_i - g * dt;

    let res_p = r0_inv * tmp_p - cd_pos;
    let res_r = (cd_rot.inverse() * r0_inv * state1.t_w_i.rotation).scaled_axis();
    let res_v = r0_inv * tmp_v - cd_vel;

    let mut res = Vector9::zeros();
    res.fixed_rows_mut::<3>(0).copy_from(&res_p);
    res.fixed_rows_mut::<3>(3).copy_from(&res_r);
    res.fixed_rows_mut::<3>(6).copy_from(&res_v);
    res
}

/// Residual plus Jacobians with respect to both state blocks, evaluated at
/// the given states.
pub fn imu_residual_jac(
    meas: &IntegratedImuMeasurement,
    state0: &PoseVelBiasState,
    state1: &PoseVelBiasState,
    g: &Vector3<f64>,
) -> (Vector9, Matrix9x15, Matrix9x15) {
    let dt = meas.dt_ns() as f64 * 1e-9;
    let res = imu_residual(meas, state0, state1, g);
    let res_r = res.fixed_rows::<3>(3).into_owned();

    let r0_t = state0
        .t_w_i
        .rotation
        .inverse()
        .to_rotation_matrix()
        .into_inner();
    let r1_t = state1
        .t_w_i
        .rotation
        .inverse()
        .to_rotation_matrix()
        .into_inner();

    let tmp_p = state1.t_w_i.translation
        - state0.t_w_i.translation
        - state0.vel_w_i * dt
        - g * (0.5 * dt * dt);
    let tmp_v = state1.vel_w_i - state0.vel_w_i - g * dt;

    let jr_inv = right_jacobian_so3_inv(&res_r);
    let jl_inv = left_jacobian_so3_inv(&res_r);

    let mut d0 = Matrix9x15::zeros();
    let mut d1 = Matrix9x15::zeros();

    // Position rows.
    d0.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-r0_t));
    d0.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(r0_t * skew(&tmp_p)));
    d0.fixed_view_mut::<3, 3>(0, 6).copy_from(&(-r0_t * dt));
    d0.fixed_view_mut::<3, 3>(0, 9)
        .copy_from(&(-meas.d_pos_d_bg()));
    d0.fixed_view_mut::<3, 3>(0, 12)
        .copy_from(&(-meas.d_pos_d_ba()));
    d1.fixed_view_mut::<3, 3>(0, 0).copy_from(&r0_t);

    // Rotation rows.
    d0.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(-jr_inv * r1_t));
    d0.fixed_view_mut::<3, 3>(3, 9)
        .copy_from(&(-jl_inv * meas.d_rot_d_bg()));
    d1.fixed_view_mut::<3, 3>(3, 3).copy_from(&(jr_inv * r1_t));

    // Velocity rows.
    d0.fixed_view_mut::<3, 3>(6, 3)
        .copy_from(&(r0_t * skew(&tmp_v)));
    d0.fixed_view_mut::<3, 3>(6, 6).copy_from(&(-r0_t));
    d0.fixed_view_mut::<3, 3>(6, 9)
        .copy_from(&(-meas.d_vel_d_bg()));
    d0.fixed_view_mut::<3, 3>(6, 12)
        .copy_from(&(-meas.d_vel_d_ba()));
    d1.fixed_view_mut::<3, 3>(6, 6).copy_from(&r0_t);

    (res, d0, d1)
}

/// Linearise all preintegration and bias random-walk factors between
/// consecutive states into the absolute accumulator. Returns
/// `(imu_error, bg_error, ba_error)`.
#[allow(clippy::too_many_arguments)]
pub fn linearize_abs_imu(
    aom: &AbsOrderMap,
    accum: &mut DenseAccumulator,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
    imu_meas: &BTreeMap<i64, IntegratedImuMeasurement>,
    gyro_bias_weight: &Vector3<f64>,
    accel_bias_weight: &Vector3<f64>,
    g: &Vector3<f64>,
) -> (f64, f64, f64) {
    let mut imu_error = 0.0;
    let mut bg_error = 0.0;
    let mut ba_error = 0.0;

    for ((t0, state0), (t1, state1)) in frame_states.iter().zip(frame_states.iter().skip(1)) {
        // During marginalisation the ordering only covers the states up to
        // the boundary; factors reaching past it stay live.
        if !aom.abs_order_map.contains_key(t0) || !aom.abs_order_map.contains_key(t1) {
            continue;
        }
        let Some(meas) = imu_meas.get(t0) else {
            continue;
        };
        assert_eq!(meas.start_t_ns(), *t0, "preintegration start mismatch");
        assert_eq!(meas.end_t_ns(), *t1, "preintegration end mismatch");

        let idx0 = aom.offset(*t0);
        let idx1 = aom.offset(*t1);

        let (mut res, d0, d1) = imu_residual_jac(meas, state0.state_lin(), state1.state_lin(), g);
        if state0.is_linearized() || state1.is_linearized() {
            res = imu_residual(meas, state0.state(), state1.state(), g);
        }

        let w = meas.cov_inv();

        accum.add_h(idx0, idx0, &(d0.transpose() * w * d0));
        accum.add_h(idx0, idx1, &(d0.transpose() * w * d1));
        accum.add_h(idx1, idx0, &(d1.transpose() * w * d0));
        accum.add_h(idx1, idx1, &(d1.transpose() * w * d1));
        accum.add_b(idx0, &(d0.transpose() * w * res));
        accum.add_b(idx1, &(d1.transpose() * w * res));

        imu_error += 0.5 * res.dot(&(w * res));

        // Bias random walk: information scales with 1/dt.
        let dt = meas.dt_ns() as f64 * 1e-9;
        let w_bg = Matrix3::from_diagonal(gyro_bias_weight) / dt;
        let w_ba = Matrix3::from_diagonal(accel_bias_weight) / dt;

        let res_bg = state1.state().bias_gyro - state0.state().bias_gyro;
        let res_ba = state1.state().bias_accel - state0.state().bias_accel;

        accum.add_h(idx0 + 9, idx0 + 9, &w_bg);
        accum.add_h(idx1 + 9, idx1 + 9, &w_bg);
        accum.add_h(idx0 + 9, idx1 + 9, &(-w_bg));
        accum.add_h(idx1 + 9, idx0 + 9, &(-w_bg));
        accum.add_b(idx0 + 9, &(-(w_bg * res_bg)));
        accum.add_b(idx1 + 9, &(w_bg * res_bg));

        accum.add_h(idx0 + 12, idx0 + 12, &w_ba);
        accum.add_h(idx1 + 12, idx1 + 12, &w_ba);
        accum.add_h(idx0 + 12, idx1 + 12, &(-w_ba));
        accum.add_h(idx1 + 12, idx0 + 12, &(-w_ba));
        accum.add_b(idx0 + 12, &(-(w_ba * res_ba)));
        accum.add_b(idx1 + 12, &(w_ba * res_ba));

        bg_error += 0.5 * res_bg.dot(&(w_bg * res_bg));
        ba_error += 0.5 * res_ba.dot(&(w_ba * res_ba));
    }

    (imu_error, bg_error, ba_error)
}

/// Total inertial error at the live states. Same formulas as the
/// linearisation pass.
pub fn compute_imu_error(
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
    imu_meas: &BTreeMap<i64, IntegratedImuMeasurement>,
    gyro_bias_weight: &Vector3<f64>,
    accel_bias_weight: &Vector3<f64>,
    g: &Vector3<f64>,
) -> (f64, f64, f64) {
    let mut imu_error = 0.0;
    let mut bg_error = 0.0;
    let mut ba_error = 0.0;

    for ((t0, state0), (_t1, state1)) in frame_states.iter().zip(frame_states.iter().skip(1)) {
        let Some(meas) = imu_meas.get(t0) else {
            continue;
        };

        let res = imu_residual(meas, state0.state(), state1.state(), g);
        let w = meas.cov_inv();
        imu_error += 0.5 * res.dot(&(w * res));

        let dt = meas.dt_ns() as f64 * 1e-9;
        let w_bg = Matrix3::from_diagonal(gyro_bias_weight) / dt;
        let w_ba = Matrix3::from_diagonal(accel_bias_weight) / dt;
        let res_bg = state1.state().bias_gyro - state0.state().bias_gyro;
        let res_ba = state1.state().bias_accel - state0.state().bias_accel;
        bg_error += 0.5 * res_bg.dot(&(w_bg * res_bg));
        ba_error += 0.5 * res_ba.dot(&(w_ba * res_ba));
    }

    (imu_error, bg_error, ba_error)
}
