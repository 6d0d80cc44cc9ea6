//! Type aliases for IMU covariance and Jacobian matrices.
//!
//! These types support the 9-dimensional delta state [δp, δθ, δv] used in
//! preintegration covariance propagation and in the inertial residual.

use nalgebra::{SMatrix, SVector};

/// 9×9 covariance/information matrix for the delta state [δp, δθ, δv].
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// 9-dimensional delta-state vector [δp, δθ, δv].
pub type Vector9 = SVector<f64, 9>;

/// 9×6 Jacobian matrix (delta state w.r.t. per-step noise).
pub type Matrix9x6 = SMatrix<f64, 9, 6>;

/// 9×15 Jacobian matrix (residual w.r.t. a full state block).
pub type Matrix9x15 = SMatrix<f64, 9, 15>;
