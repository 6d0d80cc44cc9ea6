//! Schur-complement marginalisation of the dense system.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector, Vector3};
use tracing::{debug, warn};

use super::aom::AbsOrderMap;
use crate::state::{PoseStateWithLin, PoseVelBiasStateWithLin, POSE_VEL_BIAS_SIZE};

fn gather(
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    rows: &[usize],
    cols: &[usize],
) -> (DMatrix<f64>, DVector<f64>) {
    let mut h_out = DMatrix::zeros(rows.len(), cols.len());
    let mut b_out = DVector::zeros(rows.len());
    for (i, &r) in rows.iter().enumerate() {
        b_out[i] = b[r];
        for (j, &c) in cols.iter().enumerate() {
            h_out[(i, j)] = h[(r, c)];
        }
    }
    (h_out, b_out)
}

/// Damped pseudo-inverse for a rank-deficient symmetric block.
fn damped_pinv(m: &DMatrix<f64>) -> DMatrix<f64> {
    let eigen = m.clone().symmetric_eigen();
    let max_ev = eigen
        .eigenvalues
        .iter()
        .fold(0.0f64, |acc, &ev| acc.max(ev.abs()));
    let cutoff = (max_ev * 1e-12).max(1e-15);

    let mut inv_diag = DVector::zeros(eigen.eigenvalues.len());
    for (i, &ev) in eigen.eigenvalues.iter().enumerate() {
        inv_diag[i] = if ev.abs() > cutoff { 1.0 / ev } else { 0.0 };
    }
    &eigen.eigenvectors * DMatrix::from_diagonal(&inv_diag) * eigen.eigenvectors.transpose()
}

/// Eliminate the `idx_to_marg` variables from `(h, b)` by Schur complement,
/// returning the reduced system over `idx_to_keep` (in ascending index
/// order):
///
/// ```text
/// H' = H_kk − H_km·H_mm⁻¹·H_mk,   b' = b_k − H_km·H_mm⁻¹·b_m
/// ```
///
/// `H_mm` is factored with Cholesky; a damped eigendecomposition
/// pseudo-inverse covers the rank-deficient case. The result is numerically
/// symmetrised.
pub fn marginalize_helper(
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    idx_to_keep: &BTreeSet<usize>,
    idx_to_marg: &BTreeSet<usize>,
) -> (DMatrix<f64>, DVector<f64>) {
    assert_eq!(idx_to_keep.len() + idx_to_marg.len(), h.nrows());

    let keep: Vec<usize> = idx_to_keep.iter().copied().collect();
    let marg: Vec<usize> = idx_to_marg.iter().copied().collect();

    if marg.is_empty() {
        let (h_kk, b_k) = gather(h, b, &keep, &keep);
        return (h_kk, b_k);
    }

    let (h_kk, b_k) = gather(h, b, &keep, &keep);
    let (h_km, _) = gather(h, b, &keep, &marg);
    let (h_mk, b_m) = gather(h, b, &marg, &keep);
    let (h_mm, _) = gather(h, b, &marg, &marg);

    // H_mm⁻¹·H_mk and H_mm⁻¹·b_m.
    let (x_mk, y_m) = match h_mm.clone().cholesky() {
        Some(chol) => (chol.solve(&h_mk), chol.solve(&b_m)),
        None => {
            warn!("H_mm not positive definite, using damped pseudo-inverse");
            let pinv = damped_pinv(&h_mm);
            (&pinv * &h_mk, &pinv * &b_m)
        }
    };

    let mut h_new = h_kk - &h_km * x_mk;
    let b_new = b_k - &h_km * y_m;

    // Symmetrise away the accumulated round-off.
    h_new = 0.5 * (&h_new + h_new.transpose());

    (h_new, b_new)
}

/// Residual norms of the marginalisation prior along the four directions
/// that must stay unobservable: global translation x/y/z and global yaw.
///
/// Directions are built at the linearisation points of the prior variables.
/// Debug tool; large values indicate the prior gained spurious information.
pub fn check_nullspace(
    marg_h: &DMatrix<f64>,
    marg_order: &AbsOrderMap,
    frame_poses: &BTreeMap<i64, PoseStateWithLin>,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
) -> [f64; 4] {
    let n = marg_order.total_size;
    assert_eq!(marg_h.nrows(), n);
    let z = Vector3::z();

    let mut directions: Vec<DVector<f64>> = (0..3)
        .map(|axis| {
            let mut v = DVector::zeros(n);
            for (_, (offset, _)) in &marg_order.abs_order_map {
                v[offset + axis] = 1.0;
            }
            v
        })
        .collect();

    let mut yaw = DVector::zeros(n);
    for (t_ns, (offset, size)) in &marg_order.abs_order_map {
        let (pos, vel) = if *size == POSE_VEL_BIAS_SIZE {
            let s = frame_states[t_ns].state_lin();
            (s.t_w_i.translation, Some(s.vel_w_i))
        } else {
            (frame_poses[t_ns].pose_lin().translation, None)
        };
        yaw.rows_mut(*offset, 3).copy_from(&z.cross(&pos));
        yaw.rows_mut(*offset + 3, 3).copy_from(&z);
        if let Some(vel) = vel {
            yaw.rows_mut(*offset + 6, 3).copy_from(&z.cross(&vel));
        }
    }
    directions.push(yaw);

    let mut norms = [0.0; 4];
    for (i, v) in directions.iter().enumerate() {
        norms[i] = (marg_h * v).norm() / v.norm().max(1e-12);
    }
    debug!(
        "nullspace residuals: tx {:.3e} ty {:.3e} tz {:.3e} yaw {:.3e}",
        norms[0], norms[1], norms[2], norms[3]
    );
    norms
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_schur_matches_dense_elimination() {
        // Known 4x4 system, marginalize the last two variables.
        #[rustfmt::skip]
        let h = DMatrix::from_row_slice(4, 4, &[
            4.0, 1.0, 0.5, 0.0,
            1.0, 3.0, 0.0, 0.2,
            0.5, 0.0, 2.0, 0.3,
            0.0, 0.2, 0.3, 1.5,
        ]);
        let b = DVector::from_row_slice(&[1.0, 2.0, 3.0, 4.0]);

        let keep: BTreeSet<usize> = [0, 1].into();
        let marg: BTreeSet<usize> = [2, 3].into();
        let (h_new, b_new) = marginalize_helper(&h, &b, &keep, &marg);

        // Reference via explicit inverse.
        let h_mm = h.view((2, 2), (2, 2)).into_owned();
        let h_km = h.view((0, 2), (2, 2)).into_owned();
        let h_mm_inv = h_mm.try_inverse().unwrap();
        let h_ref = h.view((0, 0), (2, 2)).into_owned() - &h_km * &h_mm_inv * h_km.transpose();
        let b_ref = b.rows(0, 2).into_owned()
            - &h_km * &h_mm_inv * b.rows(2, 2).into_owned();

        assert_relative_eq!(h_new, h_ref, epsilon = 1e-12);
        assert_relative_eq!(b_new, b_ref, epsilon = 1e-12);
    }

    #[test]
    fn test_schur_result_symmetric() {
        let mut h = DMatrix::from_fn(6, 6, |i, j| 1.0 / (1.0 + (i + j) as f64));
        // Make it safely positive definite.
        for i in 0..6 {
            h[(i, i)] += 3.0;
        }
        let b = DVector::from_fn(6, |i, _| i as f64);

        let keep: BTreeSet<usize> = [0, 1, 2, 3].into();
        let marg: BTreeSet<usize> = [4, 5].into();
        let (h_new, _) = marginalize_helper(&h, &b, &keep, &marg);

        assert_relative_eq!(
            (&h_new - h_new.transpose()).norm(),
            0.0,
            epsilon = 1e-8
        );
    }

    #[test]
    fn test_rank_deficient_block_falls_back() {
        // H_mm is singular; the damped pseudo-inverse path must not produce
        // NaNs and must keep the kept block finite.
        let mut h = DMatrix::zeros(3, 3);
        h[(0, 0)] = 2.0;
        h[(0, 1)] = 1.0;
        h[(1, 0)] = 1.0;
        // h[(1,1)] = h[(2,2)] = 0 → singular marg block {1, 2}.
        let b = DVector::from_row_slice(&[1.0, 0.5, 0.0]);

        let keep: BTreeSet<usize> = [0].into();
        let marg: BTreeSet<usize> = [1, 2].into();
        let (h_new, b_new) = marginalize_helper(&h, &b, &keep, &marg);

        assert!(h_new[(0, 0)].is_finite());
        assert!(b_new[0].is_finite());
    }

    #[test]
    fn test_imu_nullspace_preserved_by_marginalization() {
        // A two-state inertial system constrains only relative quantities:
        // global translation and yaw must stay unobservable, and the Schur
        // complement must not manufacture information along them.
        use crate::geometry::SE3;
        use crate::imu::{ImuSample, IntegratedImuMeasurement};
        use crate::optimizer::{linearize_abs_imu, DenseAccumulator};
        use crate::state::PoseVelBiasState;
        use nalgebra::{UnitQuaternion, Vector3};

        let g = Vector3::new(0.0, 0.0, -9.81);
        let mut meas = IntegratedImuMeasurement::new(0, Vector3::zeros(), Vector3::zeros());
        let accel_cov = Vector3::repeat(1e-4);
        let gyro_cov = Vector3::repeat(1e-6);
        for i in 1..=20i64 {
            meas.integrate(
                &ImuSample {
                    t_ns: i * 5_000_000,
                    accel: Vector3::new(0.3, -0.1, 9.81),
                    gyro: Vector3::new(0.0, 0.02, 0.01),
                },
                &accel_cov,
                &gyro_cov,
            );
        }

        let state0 = PoseVelBiasState::new(
            0,
            SE3::new(
                UnitQuaternion::from_euler_angles(0.1, 0.0, 0.3),
                Vector3::new(1.0, -0.5, 0.2),
            ),
            Vector3::new(0.2, 0.0, 0.1),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        let state1 = meas.predict_state(&state0, &g);
        let t1 = meas.end_t_ns();

        let mut frame_states = BTreeMap::new();
        frame_states.insert(0i64, PoseVelBiasStateWithLin::new(state0, false));
        frame_states.insert(t1, PoseVelBiasStateWithLin::new(state1, false));

        let mut aom = AbsOrderMap::new();
        aom.push_variable(0, POSE_VEL_BIAS_SIZE);
        aom.push_variable(t1, POSE_VEL_BIAS_SIZE);

        let mut imu_meas = BTreeMap::new();
        imu_meas.insert(0i64, meas);

        let mut accum = DenseAccumulator::new(aom.total_size);
        let w_bias = Vector3::repeat(1.0);
        linearize_abs_imu(
            &aom,
            &mut accum,
            &frame_states,
            &imu_meas,
            &w_bias,
            &w_bias,
            &g,
        );

        let h = accum.h().clone();
        let h_scale = h.norm();
        let empty_poses = BTreeMap::new();

        let norms = check_nullspace(&h, &aom, &empty_poses, &frame_states);
        for n in norms {
            assert!(n < 1e-8 * h_scale, "full system gained information: {n}");
        }

        // Marginalise state 0 entirely.
        let keep: BTreeSet<usize> = (15..30).collect();
        let marg: BTreeSet<usize> = (0..15).collect();
        let (h_new, _) = marginalize_helper(&h, accum.b(), &keep, &marg);

        let mut order1 = AbsOrderMap::new();
        order1.push_variable(t1, POSE_VEL_BIAS_SIZE);
        let mut remaining = frame_states.clone();
        remaining.remove(&0);

        let norms = check_nullspace(&h_new, &order1, &empty_poses, &remaining);
        for n in norms {
            assert!(
                n < 1e-7 * h_scale,
                "marginalised prior gained information: {n}"
            );
        }
    }

    #[test]
    fn test_information_preserved_on_solution() {
        // Marginalising variables of a consistent Gaussian system must keep
        // the minimiser of the kept variables unchanged.
        #[rustfmt::skip]
        let h = DMatrix::from_row_slice(3, 3, &[
            5.0, 1.0, 0.5,
            1.0, 4.0, 0.2,
            0.5, 0.2, 3.0,
        ]);
        let x_star = DVector::from_row_slice(&[0.3, -0.2, 0.7]);
        let b = &h * &x_star;

        let keep: BTreeSet<usize> = [0, 1].into();
        let marg: BTreeSet<usize> = [2].into();
        let (h_new, b_new) = marginalize_helper(&h, &b, &keep, &marg);

        let x_kept = h_new.lu().solve(&b_new).unwrap();
        assert_relative_eq!(x_kept[0], 0.3, epsilon = 1e-10);
        assert_relative_eq!(x_kept[1], -0.2, epsilon = 1e-10);
    }
}
