//! Inter-thread message types.
//!
//! These types cross the bounded queues between the frontend, the estimator
//! worker and the output consumers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Matrix2x3, Vector2, Vector3, Vector4};

use crate::geometry::SE3;
use crate::optimizer::AbsOrderMap;
use crate::state::{PoseStateWithLin, PoseVelBiasStateWithLin};

/// Frontend keypoint identifier.
pub type KeypointId = u32;

/// Optical-flow tracks for one frame: per camera, the affine-compact patch
/// transform of every tracked keypoint. Only the translation column is
/// consumed by the estimator.
#[derive(Debug, Clone)]
pub struct OpticalFlowResult {
    pub t_ns: i64,
    pub observations: Vec<HashMap<KeypointId, Matrix2x3<f32>>>,
}

impl OpticalFlowResult {
    /// Pixel position of a tracked keypoint (translation part of the patch
    /// transform).
    pub fn translation(&self, cam_id: usize, kpt_id: KeypointId) -> Option<Vector2<f64>> {
        self.observations.get(cam_id).and_then(|m| {
            m.get(&kpt_id)
                .map(|a| Vector2::new(a[(0, 2)] as f64, a[(1, 2)] as f64))
        })
    }
}

/// Snapshot of the estimator for visualisation consumers.
#[derive(Debug, Clone)]
pub struct VioVisualizationData {
    pub t_ns: i64,
    /// Poses of the full states in the window.
    pub states: Vec<SE3>,
    /// Poses of the pose-only keyframes in the window.
    pub frames: Vec<SE3>,
    /// Landmark positions in the world frame.
    pub points: Vec<Vector3<f64>>,
    pub point_ids: Vec<KeypointId>,
    /// Per camera: reprojections of all landmarks observed in the newest
    /// frame, as `(u, v, inverse depth, keypoint id)`.
    pub projections: Vec<Vec<Vector4<f64>>>,
    pub opt_flow_res: Option<Arc<OpticalFlowResult>>,
}

/// Marginalisation blob: the joint linearisation at eviction time together
/// with the window context needed to interpret it. Handed to an external
/// sink which may serialise it.
#[derive(Debug, Clone)]
pub struct MargData {
    pub aom: AbsOrderMap,
    pub abs_h: DMatrix<f64>,
    pub abs_b: DVector<f64>,
    pub frame_poses: BTreeMap<i64, PoseStateWithLin>,
    pub frame_states: BTreeMap<i64, PoseVelBiasStateWithLin>,
    pub kfs_all: BTreeSet<i64>,
    pub kfs_to_marg: BTreeSet<i64>,
    pub use_imu: bool,
    pub opt_flow_res: Vec<Arc<OpticalFlowResult>>,
}
