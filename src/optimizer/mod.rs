//! Nonlinear least-squares machinery for the sliding window.
//!
//! Linearises visual reprojection, IMU preintegration and the
//! marginalisation prior into one dense Gauss-Newton system over the
//! absolute variable ordering, and provides the Schur-complement
//! marginalisation of evicted variables.

pub mod accumulator;
pub mod aom;
pub mod imu_factors;
pub mod linearize;
pub mod marg_prior;
pub mod marginalize;

pub use accumulator::DenseAccumulator;
pub use aom::AbsOrderMap;
pub use imu_factors::{compute_imu_error, imu_residual, linearize_abs_imu};
pub use linearize::{
    compute_error, filter_outliers, landmark_increments, linearize_abs_reduce, linearize_helper,
    linearize_point, rel_pose, LinearizeCtx, RelLinData,
};
pub use marg_prior::{compute_delta, compute_marg_prior_error, linearize_marg_prior};
pub use marginalize::{check_nullspace, marginalize_helper};
