//! Estimator configuration.
//!
//! All tunables of the sliding-window optimizer in one place. The defaults
//! are the values the estimator was tuned with on stereo-inertial datasets;
//! override individual fields before constructing the system.

use serde::{Deserialize, Serialize};

/// Configuration for the visual-inertial estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VioConfig {
    /// Standard deviation of keypoint observations (pixels).
    pub vio_obs_std_dev: f64,
    /// Huber threshold for the reprojection residual (pixels).
    pub vio_obs_huber_thresh: f64,
    /// Information weight on the initial position and yaw prior.
    pub vio_init_pose_weight: f64,
    /// Information weight on the initial accelerometer bias prior (per axis).
    pub vio_init_ba_weight: f64,
    /// Information weight on the initial gyroscope bias prior (per axis).
    pub vio_init_bg_weight: f64,
    /// Lower bound for the Levenberg-Marquardt damping factor.
    pub vio_lm_lambda_min: f64,
    /// Upper bound for the Levenberg-Marquardt damping factor.
    pub vio_lm_lambda_max: f64,
    /// Maximum number of full states (pose + velocity + bias) in the window.
    pub vio_max_states: usize,
    /// Maximum number of keyframes (pose only) in the window.
    pub vio_max_kfs: usize,
    /// Maximum outer iterations per optimization call.
    pub vio_max_iterations: usize,
    /// A frame becomes a keyframe when the fraction of tracked cam-0
    /// keypoints drops below this threshold.
    pub vio_new_kf_keypoints_thresh: f64,
    /// Minimum number of frames between consecutive keyframes.
    pub vio_min_frames_after_kf: usize,
    /// Minimum stereo/temporal baseline for triangulation (meters).
    pub vio_min_triangulation_dist: f64,
    /// Outer iteration at which the outlier filter runs.
    pub vio_filter_iteration: usize,
    /// Reprojection error above which an observation is an outlier (pixels).
    pub vio_outlier_threshold: f64,
    /// Use Levenberg-Marquardt damping; plain Gauss-Newton otherwise.
    pub vio_use_lm: bool,
    /// Drop stale frames instead of blocking when the estimator falls behind.
    pub vio_enforce_realtime: bool,
    /// Enable verbose per-iteration diagnostics.
    pub vio_debug: bool,
}

impl Default for VioConfig {
    fn default() -> Self {
        Self {
            vio_obs_std_dev: 0.5,
            vio_obs_huber_thresh: 1.0,
            vio_init_pose_weight: 1e8,
            vio_init_ba_weight: 1e1,
            vio_init_bg_weight: 1e2,
            vio_lm_lambda_min: 1e-32,
            vio_lm_lambda_max: 1e2,
            vio_max_states: 3,
            vio_max_kfs: 7,
            vio_max_iterations: 7,
            vio_new_kf_keypoints_thresh: 0.7,
            vio_min_frames_after_kf: 5,
            vio_min_triangulation_dist: 0.05,
            vio_filter_iteration: 4,
            vio_outlier_threshold: 3.0,
            vio_use_lm: true,
            vio_enforce_realtime: false,
            vio_debug: false,
        }
    }
}
