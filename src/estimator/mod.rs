//! Sliding-window visual-inertial estimator.

mod vio;

pub use vio::VioEstimator;
