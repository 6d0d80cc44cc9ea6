//! Marginalisation prior linearisation.
//!
//! The prior is a quadratic in the tangent-space offset of the pinned
//! variables from their linearisation points:
//!
//! ```text
//! E(x) = const + δᵀ·marg_b + ½·δᵀ·marg_H·δ,   δ = x_live ⊖ x_lin
//! ```
//!
//! Because the prior ordering is a prefix-consistent subset of the live
//! ordering (poses before states, identical offsets on shared keys), the
//! prior maps onto the top-left block of the accumulator.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use nalgebra::{DMatrix, DVector};

use super::accumulator::DenseAccumulator;
use super::aom::AbsOrderMap;
use crate::state::{PoseStateWithLin, PoseVelBiasStateWithLin, POSE_SIZE, POSE_VEL_BIAS_SIZE};

/// Stack the tangent offsets `x_live ⊖ x_lin` of all prior variables in
/// `marg_order`.
pub fn compute_delta(
    marg_order: &AbsOrderMap,
    frame_poses: &BTreeMap<i64, PoseStateWithLin>,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
) -> DVector<f64> {
    let mut delta = DVector::zeros(marg_order.total_size);
    for (t_ns, (offset, size)) in &marg_order.abs_order_map {
        match *size {
            POSE_SIZE => {
                let pose = frame_poses
                    .get(t_ns)
                    .unwrap_or_else(|| panic!("prior pose {t_ns} missing from window"));
                delta.rows_mut(*offset, POSE_SIZE).copy_from(pose.delta());
            }
            POSE_VEL_BIAS_SIZE => {
                let state = frame_states
                    .get(t_ns)
                    .unwrap_or_else(|| panic!("prior state {t_ns} missing from window"));
                delta
                    .rows_mut(*offset, POSE_VEL_BIAS_SIZE)
                    .copy_from(state.delta());
            }
            other => panic!("unexpected prior block size {other}"),
        }
    }
    delta
}

/// Add the prior to the accumulator and return its error at the live state.
pub fn linearize_marg_prior(
    marg_order: &AbsOrderMap,
    marg_h: &DMatrix<f64>,
    marg_b: &DVector<f64>,
    aom: &AbsOrderMap,
    accum: &mut DenseAccumulator,
    frame_poses: &BTreeMap<i64, PoseStateWithLin>,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
) -> f64 {
    marg_order.assert_consistent_with(aom);
    let n = marg_order.total_size;
    assert!(n <= aom.total_size);
    assert_eq!(marg_h.nrows(), n);

    let delta = compute_delta(marg_order, frame_poses, frame_states);

    accum.h_mut().view_mut((0, 0), (n, n)).add_assign(marg_h);
    accum
        .b_mut()
        .rows_mut(0, n)
        .add_assign(&(marg_h * &delta + marg_b));

    delta.dot(marg_b) + 0.5 * delta.dot(&(marg_h * &delta))
}

/// Prior error at the live state without touching the accumulator.
pub fn compute_marg_prior_error(
    marg_order: &AbsOrderMap,
    marg_h: &DMatrix<f64>,
    marg_b: &DVector<f64>,
    frame_poses: &BTreeMap<i64, PoseStateWithLin>,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
) -> f64 {
    let delta = compute_delta(marg_order, frame_poses, frame_states);
    delta.dot(marg_b) + 0.5 * delta.dot(&(marg_h * &delta))
}
