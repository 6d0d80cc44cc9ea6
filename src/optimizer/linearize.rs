//! Visual linearisation.
//!
//! Reprojection residuals are formed per (host, target) relative pose so the
//! per-landmark 3×3 blocks can be Schur-complemented away before touching
//! the absolute system. The flow per outer iteration is:
//!
//! 1. `linearize_helper`: one `RelLinData` per host frame, built in
//!    parallel with residuals, relative-pose and landmark Jacobians and
//!    Huber weights.
//! 2. `linearize_abs_reduce`: invert landmark Hessians, reduce each
//!    `RelLinData` to a relative-pose system and map it into the absolute
//!    ordering via the relative-pose Jacobians, merging per-worker
//!    accumulators.
//! 3. After the solve, `landmark_increments` back-substitutes the landmark
//!    updates from the pose increment.
//!
//! First-estimate Jacobians: the rel→abs Jacobians are evaluated at the
//! pinned linearisation points, while residuals and point Jacobians use the
//! live relative pose.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::{AddAssign, SubAssign};

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, SMatrix, Vector2, Vector3, Vector6};
use rayon::prelude::*;
use tracing::debug;

use super::accumulator::DenseAccumulator;
use super::aom::AbsOrderMap;
use crate::calib::{Calibration, CameraModel};
use crate::geometry::{skew, StereographicParam, SE3};
use crate::map::{KeypointPosition, LandmarkDatabase, TimeCamId};
use crate::state::{PoseStateWithLin, PoseVelBiasStateWithLin};

/// Read-only view of the window needed for linearisation.
#[derive(Clone, Copy)]
pub struct LinearizeCtx<'a> {
    pub frame_poses: &'a BTreeMap<i64, PoseStateWithLin>,
    pub frame_states: &'a BTreeMap<i64, PoseVelBiasStateWithLin>,
    pub calib: &'a Calibration,
    pub obs_std_dev: f64,
    pub huber_thresh: f64,
}

/// Live and pinned pose of a window frame.
pub struct PoseView {
    pub pose: SE3,
    pub pose_lin: SE3,
    pub linearized: bool,
}

impl LinearizeCtx<'_> {
    /// Resolve a frame through both window maps. Panics when the frame is
    /// missing, which indicates a window bookkeeping bug.
    pub fn pose_view(&self, frame_id: i64) -> PoseView {
        if let Some(s) = self.frame_states.get(&frame_id) {
            PoseView {
                pose: s.state().t_w_i.clone(),
                pose_lin: s.state_lin().t_w_i.clone(),
                linearized: s.is_linearized(),
            }
        } else if let Some(p) = self.frame_poses.get(&frame_id) {
            PoseView {
                pose: p.pose().clone(),
                pose_lin: p.pose_lin().clone(),
                linearized: p.is_linearized(),
            }
        } else {
            panic!("frame {frame_id} referenced by an observation is not in the window");
        }
    }

    fn obs_inv_var(&self) -> f64 {
        1.0 / (self.obs_std_dev * self.obs_std_dev)
    }
}

/// Relative pose of the host camera in the target camera frame.
pub fn rel_pose(t_w_i_h: &SE3, t_i_c_h: &SE3, t_w_i_t: &SE3, t_i_c_t: &SE3) -> SE3 {
    t_i_c_t
        .inverse()
        .compose(&t_w_i_t.inverse())
        .compose(t_w_i_h)
        .compose(t_i_c_h)
}

/// Relative pose together with the Jacobians of its left tangent with
/// respect to the host and target body-pose increments.
pub fn rel_pose_jac(
    t_w_i_h: &SE3,
    t_i_c_h: &SE3,
    t_w_i_t: &SE3,
    t_i_c_t: &SE3,
) -> (SE3, Matrix6<f64>, Matrix6<f64>) {
    let tmp2 = t_i_c_t.inverse();
    let t_t_i_h_i = t_w_i_t.inverse().compose(t_w_i_h);
    let tmp = tmp2.compose(&t_t_i_h_i);
    let res = tmp.compose(t_i_c_h);

    // World-frame increments map into the body's right tangent through the
    // inverse rotation on both components.
    let mut rr_h = Matrix6::zeros();
    let r_h_inv = t_w_i_h.rotation.inverse().to_rotation_matrix().into_inner();
    rr_h.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_h_inv);
    rr_h.fixed_view_mut::<3, 3>(3, 3).copy_from(&r_h_inv);

    let mut rr_t = Matrix6::zeros();
    let r_t_inv = t_w_i_t.rotation.inverse().to_rotation_matrix().into_inner();
    rr_t.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_t_inv);
    rr_t.fixed_view_mut::<3, 3>(3, 3).copy_from(&r_t_inv);

    let d_rel_d_h = tmp.adjoint() * rr_h;
    let d_rel_d_t = -(tmp2.adjoint()) * rr_t;

    (res, d_rel_d_h, d_rel_d_t)
}

/// Output of a single reprojection linearisation.
pub struct PointLin {
    pub res: Vector2<f64>,
    pub d_res_d_xi: SMatrix<f64, 2, 6>,
    pub d_res_d_p: SMatrix<f64, 2, 3>,
    /// Projection of the landmark into the target image.
    pub proj: Vector2<f64>,
}

/// Linearise one observation of a host-parameterised landmark seen from the
/// target camera via the relative pose `t_t_h`.
///
/// Returns `None` when the landmark does not project into the target model's
/// valid region.
pub fn linearize_point(
    obs_pos: &Vector2<f64>,
    kpt: &KeypointPosition,
    t_t_h: &SE3,
    cam: &CameraModel,
) -> Option<PointLin> {
    let (p_h, d_unproj) = StereographicParam::unproject_jac(&kpt.dir);

    // Homogeneous transform of (direction, inverse depth).
    let p_t = t_t_h.rotation * p_h.xyz() + t_t_h.translation * kpt.inv_depth;
    let (proj, d_proj) = cam.project_jac(&p_t)?;
    let res = proj - obs_pos;

    // Left SE(3) tangent on the relative pose: δp = v·ρ − [p_t]×·ω.
    let mut d_res_d_xi = SMatrix::<f64, 2, 6>::zeros();
    d_res_d_xi
        .fixed_view_mut::<2, 3>(0, 0)
        .copy_from(&(d_proj * kpt.inv_depth));
    d_res_d_xi
        .fixed_view_mut::<2, 3>(0, 3)
        .copy_from(&(-d_proj * skew(&p_t)));

    let r = t_t_h.rotation_matrix();
    let d_unproj3 = d_unproj.fixed_view::<3, 2>(0, 0).into_owned();
    let mut d_res_d_p = SMatrix::<f64, 2, 3>::zeros();
    d_res_d_p
        .fixed_view_mut::<2, 2>(0, 0)
        .copy_from(&(d_proj * r * d_unproj3));
    d_res_d_p.set_column(2, &(d_proj * t_t_h.translation));

    Some(PointLin {
        res,
        d_res_d_xi,
        d_res_d_p,
        proj,
    })
}

/// Pose-side accumulation for one (host, target) relative pose.
#[derive(Debug, Clone, Default)]
pub struct FrameRelLinData {
    pub hpp: Matrix6<f64>,
    pub bp: Vector6<f64>,
    pub lm_id: Vec<u32>,
    pub hpl: Vec<SMatrix<f64, 6, 3>>,
}

/// Linearisation of all observations hosted by one frame.
#[derive(Debug, Clone, Default)]
pub struct RelLinData {
    pub order: Vec<(TimeCamId, TimeCamId)>,
    pub d_rel_d_h: Vec<Matrix6<f64>>,
    pub d_rel_d_t: Vec<Matrix6<f64>>,
    pub frame_rel: Vec<FrameRelLinData>,
    /// Per-landmark Hessian; replaced by its inverse before the reduction.
    pub hll: HashMap<u32, Matrix3<f64>>,
    pub bl: HashMap<u32, Vector3<f64>>,
    /// Landmark → list of (relative-pose index, observation index).
    pub lm_to_obs: HashMap<u32, Vec<(usize, usize)>>,
    pub error: f64,
}

impl RelLinData {
    /// Invert the per-landmark 3×3 Hessians in place. Degenerate blocks
    /// (landmarks seen only host-frame, or with collapsed parallax) get a
    /// damped inverse.
    pub fn invert_keypoint_hessians(&mut self) {
        for h in self.hll.values_mut() {
            *h = h.try_inverse().unwrap_or_else(|| {
                (*h + Matrix3::identity() * 1e-9)
                    .try_inverse()
                    .unwrap_or_else(Matrix3::zeros)
            });
        }
    }
}

fn huber_weight(err_norm: f64, thresh: f64) -> f64 {
    if err_norm < thresh {
        1.0
    } else {
        thresh / err_norm
    }
}

/// Linearise every observation group accepted by `pair_filter`, one
/// `RelLinData` per host frame, in parallel. Returns the linearisations and
/// the total robust vision error.
pub fn linearize_helper<F>(
    ctx: &LinearizeCtx,
    lmdb: &LandmarkDatabase,
    pair_filter: F,
) -> (Vec<RelLinData>, f64)
where
    F: Fn(&TimeCamId, &TimeCamId) -> bool + Sync,
{
    let groups: Vec<(TimeCamId, Vec<(TimeCamId, &Vec<crate::map::KeypointObservation>)>)> = lmdb
        .observations()
        .iter()
        .map(|(host, per_target)| {
            let targets: Vec<_> = per_target
                .iter()
                .filter(|(target, _)| pair_filter(host, target))
                .map(|(target, obs_list)| (*target, obs_list))
                .collect();
            (*host, targets)
        })
        .filter(|(_, targets)| !targets.is_empty())
        .collect();

    let rld_vec: Vec<RelLinData> = groups
        .par_iter()
        .map(|(host, targets)| {
            let mut rld = RelLinData::default();
            let host_view = ctx.pose_view(host.frame_id);
            let obs_inv_var = ctx.obs_inv_var();

            for (target, obs_list) in targets {
                let same_frame = host.frame_id == target.frame_id;
                let cam = &ctx.calib.intrinsics[target.cam_id];

                let (t_t_h, rel_idx) = if same_frame {
                    // Static extrinsic pair; no pose Jacobians.
                    let t = ctx.calib.t_i_c[target.cam_id]
                        .inverse()
                        .compose(&ctx.calib.t_i_c[host.cam_id]);
                    (t, None)
                } else {
                    let target_view = ctx.pose_view(target.frame_id);
                    let (mut t_t_h, d_rel_d_h, d_rel_d_t) = rel_pose_jac(
                        &host_view.pose_lin,
                        &ctx.calib.t_i_c[host.cam_id],
                        &target_view.pose_lin,
                        &ctx.calib.t_i_c[target.cam_id],
                    );
                    if host_view.linearized || target_view.linearized {
                        t_t_h = rel_pose(
                            &host_view.pose,
                            &ctx.calib.t_i_c[host.cam_id],
                            &target_view.pose,
                            &ctx.calib.t_i_c[target.cam_id],
                        );
                    }
                    rld.order.push((*host, *target));
                    rld.d_rel_d_h.push(d_rel_d_h);
                    rld.d_rel_d_t.push(d_rel_d_t);
                    rld.frame_rel.push(FrameRelLinData::default());
                    (t_t_h, Some(rld.order.len() - 1))
                };

                for obs in obs_list.iter() {
                    let Some(kpt) = lmdb.get_landmark(obs.kpt_id) else {
                        continue;
                    };
                    let Some(pl) = linearize_point(&obs.pos, kpt, &t_t_h, cam) else {
                        continue;
                    };

                    let e = pl.res.norm();
                    let hw = huber_weight(e, ctx.huber_thresh);
                    let obs_w = hw * obs_inv_var;

                    rld.error += (2.0 - hw) * obs_w * pl.res.norm_squared();

                    *rld.hll.entry(obs.kpt_id).or_insert_with(Matrix3::zeros) +=
                        pl.d_res_d_p.transpose() * pl.d_res_d_p * obs_w;
                    *rld.bl.entry(obs.kpt_id).or_insert_with(Vector3::zeros) +=
                        pl.d_res_d_p.transpose() * pl.res * obs_w;

                    if let Some(i) = rel_idx {
                        let frd = &mut rld.frame_rel[i];
                        frd.hpp += pl.d_res_d_xi.transpose() * pl.d_res_d_xi * obs_w;
                        frd.bp += pl.d_res_d_xi.transpose() * pl.res * obs_w;
                        frd.hpl
                            .push(pl.d_res_d_xi.transpose() * pl.d_res_d_p * obs_w);
                        frd.lm_id.push(obs.kpt_id);
                        rld.lm_to_obs
                            .entry(obs.kpt_id)
                            .or_default()
                            .push((i, frd.hpl.len() - 1));
                    }
                }
            }
            rld
        })
        .collect();

    let error = rld_vec.iter().map(|rld| rld.error).sum();
    (rld_vec, error)
}

/// Reduce one host's linearisation to its relative-pose system with the
/// landmarks Schur-complemented out. Requires inverted landmark Hessians.
pub fn linearize_rel(rld: &RelLinData) -> (DMatrix<f64>, DVector<f64>) {
    let n = rld.order.len();
    let mut rel_h = DMatrix::zeros(6 * n, 6 * n);
    let mut rel_b = DVector::zeros(6 * n);

    for (i, frd) in rld.frame_rel.iter().enumerate() {
        rel_h.view_mut((6 * i, 6 * i), (6, 6)).add_assign(&frd.hpp);
        rel_b.rows_mut(6 * i, 6).add_assign(&frd.bp);
    }

    for (lm_id, obs_refs) in &rld.lm_to_obs {
        let hll_inv = &rld.hll[lm_id];
        let bl = &rld.bl[lm_id];

        for &(i, i_obs) in obs_refs {
            let tmp = rld.frame_rel[i].hpl[i_obs] * hll_inv;
            rel_b.rows_mut(6 * i, 6).sub_assign(&(tmp * bl));
            for &(j, j_obs) in obs_refs {
                let hpl_j_t = rld.frame_rel[j].hpl[j_obs].transpose();
                rel_h
                    .view_mut((6 * i, 6 * j), (6, 6))
                    .sub_assign(&(tmp * hpl_j_t));
            }
        }
    }

    (rel_h, rel_b)
}

/// Map one host's relative-pose system into the absolute accumulator via
/// the stored rel→abs Jacobians.
pub fn linearize_abs(
    rel_h: &DMatrix<f64>,
    rel_b: &DVector<f64>,
    rld: &RelLinData,
    aom: &AbsOrderMap,
    accum: &mut DenseAccumulator,
) {
    for (i, (host_i, target_i)) in rld.order.iter().enumerate() {
        let abs_h_i = aom.offset(host_i.frame_id);
        let abs_t_i = aom.offset(target_i.frame_id);
        let b_seg: Vector6<f64> = rel_b.fixed_rows::<6>(6 * i).into_owned();

        accum.add_b(abs_h_i, &(rld.d_rel_d_h[i].transpose() * b_seg));
        accum.add_b(abs_t_i, &(rld.d_rel_d_t[i].transpose() * b_seg));

        for (j, (host_j, target_j)) in rld.order.iter().enumerate() {
            let block: Matrix6<f64> = rel_h.fixed_view::<6, 6>(6 * i, 6 * j).into_owned();
            let abs_h_j = aom.offset(host_j.frame_id);
            let abs_t_j = aom.offset(target_j.frame_id);

            accum.add_h(
                abs_h_i,
                abs_h_j,
                &(rld.d_rel_d_h[i].transpose() * block * rld.d_rel_d_h[j]),
            );
            accum.add_h(
                abs_h_i,
                abs_t_j,
                &(rld.d_rel_d_h[i].transpose() * block * rld.d_rel_d_t[j]),
            );
            accum.add_h(
                abs_t_i,
                abs_h_j,
                &(rld.d_rel_d_t[i].transpose() * block * rld.d_rel_d_h[j]),
            );
            accum.add_h(
                abs_t_i,
                abs_t_j,
                &(rld.d_rel_d_t[i].transpose() * block * rld.d_rel_d_t[j]),
            );
        }
    }
}

/// Parallel reduction of all host linearisations into one absolute
/// accumulator. Inverts the landmark Hessians in place as a side effect
/// (needed later for the back-substitution).
pub fn linearize_abs_reduce(rld_vec: &mut [RelLinData], aom: &AbsOrderMap) -> DenseAccumulator {
    rld_vec
        .par_iter_mut()
        .fold(
            || DenseAccumulator::new(aom.total_size),
            |mut acc, rld| {
                rld.invert_keypoint_hessians();
                let (rel_h, rel_b) = linearize_rel(rld);
                linearize_abs(&rel_h, &rel_b, rld, aom, &mut acc);
                acc
            },
        )
        .reduce(
            || DenseAccumulator::new(aom.total_size),
            |mut a, b| {
                a.join(&b);
                a
            },
        )
}

/// Back-substitute the landmark increments of one host from the solved pose
/// increment. Requires inverted landmark Hessians. The caller applies each
/// increment with a negative sign.
pub fn landmark_increments(
    rld: &RelLinData,
    aom: &AbsOrderMap,
    inc: &DVector<f64>,
) -> Vec<(u32, Vector3<f64>)> {
    let mut rel_inc = vec![Vector6::zeros(); rld.order.len()];
    for (i, (host, target)) in rld.order.iter().enumerate() {
        if host.frame_id != target.frame_id {
            let inc_h: Vector6<f64> = inc.fixed_rows::<6>(aom.offset(host.frame_id)).into_owned();
            let inc_t: Vector6<f64> = inc.fixed_rows::<6>(aom.offset(target.frame_id)).into_owned();
            rel_inc[i] = rld.d_rel_d_h[i] * inc_h + rld.d_rel_d_t[i] * inc_t;
        }
    }

    rld.hll
        .iter()
        .map(|(lm_id, hll_inv)| {
            let mut h_l_p_x = Vector3::zeros();
            if let Some(obs_refs) = rld.lm_to_obs.get(lm_id) {
                for &(i, i_obs) in obs_refs {
                    h_l_p_x += rld.frame_rel[i].hpl[i_obs].transpose() * rel_inc[i];
                }
            }
            let inc_p = hll_inv * (rld.bl[lm_id] - h_l_p_x);
            (*lm_id, inc_p)
        })
        .collect()
}

/// Total robust vision error at the live states.
pub fn compute_error(ctx: &LinearizeCtx, lmdb: &LandmarkDatabase) -> f64 {
    let groups: Vec<_> = lmdb.observations().iter().collect();
    groups
        .par_iter()
        .map(|(host, per_target)| {
            let host_view = ctx.pose_view(host.frame_id);
            let obs_inv_var = ctx.obs_inv_var();
            let mut error = 0.0;

            for (target, obs_list) in per_target.iter() {
                let cam = &ctx.calib.intrinsics[target.cam_id];
                let t_t_h = if host.frame_id == target.frame_id {
                    ctx.calib.t_i_c[target.cam_id]
                        .inverse()
                        .compose(&ctx.calib.t_i_c[host.cam_id])
                } else {
                    let target_view = ctx.pose_view(target.frame_id);
                    rel_pose(
                        &host_view.pose,
                        &ctx.calib.t_i_c[host.cam_id],
                        &target_view.pose,
                        &ctx.calib.t_i_c[target.cam_id],
                    )
                };

                for obs in obs_list {
                    let Some(kpt) = lmdb.get_landmark(obs.kpt_id) else {
                        continue;
                    };
                    if let Some(pl) = linearize_point(&obs.pos, kpt, &t_t_h, cam) {
                        let hw = huber_weight(pl.res.norm(), ctx.huber_thresh);
                        error += (2.0 - hw) * hw * obs_inv_var * pl.res.norm_squared();
                    }
                }
            }
            error
        })
        .sum()
}

/// Drop observations whose reprojection error exceeds `outlier_threshold`,
/// landmarks that ended up behind the camera, and landmarks left with fewer
/// than `min_obs` observations. Returns the number of removed observations.
pub fn filter_outliers(
    ctx: &LinearizeCtx,
    lmdb: &mut LandmarkDatabase,
    outlier_threshold: f64,
    min_obs: usize,
) -> usize {
    let mut landmarks_to_remove: BTreeSet<u32> = BTreeSet::new();
    let mut obs_to_remove: HashMap<u32, BTreeSet<TimeCamId>> = HashMap::new();
    let mut num_removed = 0;

    for (host, per_target) in lmdb.observations() {
        let host_view = ctx.pose_view(host.frame_id);
        for (target, obs_list) in per_target {
            let cam = &ctx.calib.intrinsics[target.cam_id];
            let t_t_h = if host.frame_id == target.frame_id {
                ctx.calib.t_i_c[target.cam_id]
                    .inverse()
                    .compose(&ctx.calib.t_i_c[host.cam_id])
            } else {
                let target_view = ctx.pose_view(target.frame_id);
                rel_pose(
                    &host_view.pose,
                    &ctx.calib.t_i_c[host.cam_id],
                    &target_view.pose,
                    &ctx.calib.t_i_c[target.cam_id],
                )
            };

            for obs in obs_list {
                let Some(kpt) = lmdb.get_landmark(obs.kpt_id) else {
                    continue;
                };
                if kpt.inv_depth <= 0.0 {
                    landmarks_to_remove.insert(obs.kpt_id);
                    continue;
                }
                let outlier = match linearize_point(&obs.pos, kpt, &t_t_h, cam) {
                    Some(pl) => pl.res.norm() > outlier_threshold,
                    None => true,
                };
                if outlier {
                    obs_to_remove.entry(obs.kpt_id).or_default().insert(*target);
                }
            }
        }
    }

    for (kpt_id, targets) in &obs_to_remove {
        num_removed += targets.len();
        lmdb.remove_landmark_observations(*kpt_id, targets);
    }

    let counts = lmdb.observation_counts();
    let landmark_ids: Vec<u32> = lmdb.landmarks().keys().copied().collect();
    for kpt_id in landmark_ids {
        if counts.get(&kpt_id).copied().unwrap_or(0) < min_obs {
            landmarks_to_remove.insert(kpt_id);
        }
    }
    for kpt_id in &landmarks_to_remove {
        lmdb.remove_landmark(*kpt_id);
    }

    if num_removed > 0 || !landmarks_to_remove.is_empty() {
        debug!(
            "outlier filter removed {} observations and {} landmarks",
            num_removed,
            landmarks_to_remove.len()
        );
    }
    num_removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::PinholeCamera;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector4};

    fn cam() -> CameraModel {
        CameraModel::Pinhole(PinholeCamera {
            fx: 400.0,
            fy: 400.0,
            cx: 320.0,
            cy: 240.0,
        })
    }

    fn landmark_from_point(p_host: &Vector3<f64>) -> KeypointPosition {
        KeypointPosition {
            host: TimeCamId::new(0, 0),
            dir: StereographicParam::project(&Vector4::new(p_host.x, p_host.y, p_host.z, 0.0)),
            inv_depth: 1.0 / p_host.norm(),
        }
    }

    #[test]
    fn test_linearize_point_zero_residual_at_reprojection() {
        let p_host = Vector3::new(0.2, -0.1, 3.0);
        let kpt = landmark_from_point(&p_host);
        let t_t_h = SE3::new(
            UnitQuaternion::from_euler_angles(0.02, -0.01, 0.03),
            Vector3::new(0.1, 0.0, 0.02),
        );

        let p_target = t_t_h.transform_point(&p_host);
        let obs = cam().project(&p_target).unwrap();

        let pl = linearize_point(&obs, &kpt, &t_t_h, &cam()).unwrap();
        assert_relative_eq!(pl.res.norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_linearize_point_pose_jacobian_numeric() {
        let p_host = Vector3::new(0.2, -0.1, 3.0);
        let kpt = landmark_from_point(&p_host);
        let t_t_h = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.05, 0.02),
            Vector3::new(0.3, 0.1, -0.05),
        );
        let obs = Vector2::new(310.0, 250.0);

        let pl = linearize_point(&obs, &kpt, &t_t_h, &cam()).unwrap();

        let eps = 1e-7;
        for k in 0..6 {
            let mut inc = Vector6::zeros();
            inc[k] = eps;

            // Left increment on the relative pose.
            let mut outer = SE3::identity();
            outer.apply_inc(&inc);
            let t_plus = outer.compose(&t_t_h);
            let res_plus = linearize_point(&obs, &kpt, &t_plus, &cam()).unwrap().res;

            let num = (res_plus - pl.res) / eps;
            assert_relative_eq!(
                pl.d_res_d_xi.column(k).into_owned(),
                num,
                epsilon = 1e-3
            );
        }
    }

    #[test]
    fn test_linearize_point_landmark_jacobian_numeric() {
        let p_host = Vector3::new(-0.3, 0.2, 2.0);
        let kpt = landmark_from_point(&p_host);
        let t_t_h = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0),
            Vector3::new(0.2, -0.1, 0.0),
        );
        let obs = Vector2::new(300.0, 230.0);

        let pl = linearize_point(&obs, &kpt, &t_t_h, &cam()).unwrap();

        let eps = 1e-7;
        for k in 0..3 {
            let mut kpt_pert = kpt.clone();
            match k {
                0 => kpt_pert.dir.x += eps,
                1 => kpt_pert.dir.y += eps,
                _ => kpt_pert.inv_depth += eps,
            }
            let res_plus = linearize_point(&obs, &kpt_pert, &t_t_h, &cam())
                .unwrap()
                .res;
            let num = (res_plus - pl.res) / eps;
            assert_relative_eq!(
                pl.d_res_d_p.column(k).into_owned(),
                num,
                epsilon = 1e-3
            );
        }
    }

    #[test]
    fn test_rel_pose_jacobians_numeric() {
        let t_w_i_h = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, 0.2, -0.1),
            Vector3::new(1.0, 0.5, 0.2),
        );
        let t_w_i_t = SE3::new(
            UnitQuaternion::from_euler_angles(-0.05, 0.1, 0.3),
            Vector3::new(0.8, 0.6, 0.1),
        );
        let t_i_c_h = SE3::new(
            UnitQuaternion::from_euler_angles(0.01, -0.02, 0.0),
            Vector3::new(0.05, 0.0, 0.0),
        );
        let t_i_c_t = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.01, 0.02),
            Vector3::new(-0.05, 0.0, 0.0),
        );

        let (t0, d_h, d_t) = rel_pose_jac(&t_w_i_h, &t_i_c_h, &t_w_i_t, &t_i_c_t);

        let eps = 1e-7;
        for k in 0..6 {
            let mut inc = Vector6::zeros();
            inc[k] = eps;

            // Host perturbation.
            let mut h_pert = t_w_i_h.clone();
            h_pert.apply_inc(&inc);
            let t_h = rel_pose(&h_pert, &t_i_c_h, &t_w_i_t, &t_i_c_t);
            // Left-tangent difference of the relative pose.
            let num_h = left_tangent_diff(&t_h, &t0) / eps;
            assert_relative_eq!(d_h.column(k).into_owned(), num_h, epsilon = 1e-5);

            // Target perturbation.
            let mut t_pert = t_w_i_t.clone();
            t_pert.apply_inc(&inc);
            let t_t = rel_pose(&t_w_i_h, &t_i_c_h, &t_pert, &t_i_c_t);
            let num_t = left_tangent_diff(&t_t, &t0) / eps;
            assert_relative_eq!(d_t.column(k).into_owned(), num_t, epsilon = 1e-5);
        }
    }

    /// First-order left tangent ξ with `a ≈ X(ξ)·b` for the decoupled
    /// increment (valid for small differences).
    fn left_tangent_diff(a: &SE3, b: &SE3) -> Vector6<f64> {
        let rot = (a.rotation * b.rotation.inverse()).scaled_axis();
        // For small rotations the translation component of the left tangent
        // is t_a − Exp(ω)·t_b ≈ t_a − t_b − ω×t_b.
        let trans = a.translation - b.translation - rot.cross(&b.translation);
        let mut out = Vector6::zeros();
        out.fixed_rows_mut::<3>(0).copy_from(&trans);
        out.fixed_rows_mut::<3>(3).copy_from(&rot);
        out
    }
}
