//! The sliding-window estimator core.
//!
//! Owns the window of frame states and keyframe poses, the landmark
//! database and the marginalisation prior. Per frame the pipeline is
//! `measure` (state propagation, data association, keyframe decision and
//! triangulation), `optimize` (damped Gauss-Newton over the joint visual,
//! inertial and prior system) and `marginalize` (eviction of old variables
//! through the Schur complement).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crossbeam_channel::Sender;
use nalgebra::{DMatrix, DVector, SVector, Vector2, Vector3, Vector4};
use rayon::prelude::*;
use tracing::debug;

use crate::calib::Calibration;
use crate::config::VioConfig;
use crate::geometry::{triangulate, StereographicParam, SE3};
use crate::imu::IntegratedImuMeasurement;
use crate::map::{KeypointObservation, KeypointPosition, LandmarkDatabase, TimeCamId};
use crate::optimizer::{
    check_nullspace, compute_delta, compute_error, compute_imu_error, compute_marg_prior_error,
    filter_outliers, landmark_increments, linearize_abs_imu, linearize_abs_reduce,
    linearize_helper, linearize_marg_prior, linearize_point, marginalize_helper, rel_pose,
    AbsOrderMap, LinearizeCtx, RelLinData,
};
use crate::state::{
    PoseStateWithLin, PoseVelBiasState, PoseVelBiasStateWithLin, POSE_SIZE, POSE_VEL_BIAS_SIZE,
};
use crate::system::messages::{MargData, OpticalFlowResult, VioVisualizationData};

/// Minimum observations a landmark must keep to survive the outlier filter.
const MIN_LANDMARK_OBS: usize = 4;

/// Sliding-window visual-inertial odometry estimator.
pub struct VioEstimator {
    take_kf: bool,
    frames_after_kf: usize,
    g: Vector3<f64>,
    initialized: bool,

    config: VioConfig,
    calib: Calibration,

    lambda: f64,
    min_lambda: f64,
    max_lambda: f64,
    lambda_vee: f64,

    pub(crate) frame_states: BTreeMap<i64, PoseVelBiasStateWithLin>,
    pub(crate) frame_poses: BTreeMap<i64, PoseStateWithLin>,
    pub(crate) kf_ids: BTreeSet<i64>,
    pub(crate) imu_meas: BTreeMap<i64, IntegratedImuMeasurement>,
    prev_opt_flow_res: BTreeMap<i64, Arc<OpticalFlowResult>>,
    num_points_kf: BTreeMap<i64, usize>,
    pub(crate) lmdb: LandmarkDatabase,

    marg_h: DMatrix<f64>,
    marg_b: DVector<f64>,
    marg_order: AbsOrderMap,

    gyro_bias_weight: Vector3<f64>,
    accel_bias_weight: Vector3<f64>,

    max_states: usize,
    max_kfs: usize,
    opt_started: bool,

    last_state_t_ns: i64,

    pub out_state_queue: Option<Sender<Option<PoseVelBiasState>>>,
    pub out_vis_queue: Option<Sender<Option<VioVisualizationData>>>,
    pub out_marg_queue: Option<Sender<Option<MargData>>>,
}

impl VioEstimator {
    pub fn new(g: Vector3<f64>, calib: Calibration, config: VioConfig) -> Self {
        // Initial prior: position and yaw are anchored hard, biases softly.
        // Roll/pitch are observable through gravity and velocity through the
        // IMU, so they carry no prior.
        let mut marg_h = DMatrix::zeros(POSE_VEL_BIAS_SIZE, POSE_VEL_BIAS_SIZE);
        for i in 0..3 {
            marg_h[(i, i)] = config.vio_init_pose_weight;
        }
        marg_h[(5, 5)] = config.vio_init_pose_weight;
        for i in 9..12 {
            marg_h[(i, i)] = config.vio_init_bg_weight;
        }
        for i in 12..15 {
            marg_h[(i, i)] = config.vio_init_ba_weight;
        }

        let gyro_bias_weight = calib.gyro_bias_std.map(|s| 1.0 / (s * s));
        let accel_bias_weight = calib.accel_bias_std.map(|s| 1.0 / (s * s));

        Self {
            take_kf: true,
            frames_after_kf: 0,
            g,
            initialized: false,
            lambda: config.vio_lm_lambda_min,
            min_lambda: config.vio_lm_lambda_min,
            max_lambda: config.vio_lm_lambda_max,
            lambda_vee: 2.0,
            frame_states: BTreeMap::new(),
            frame_poses: BTreeMap::new(),
            kf_ids: BTreeSet::new(),
            imu_meas: BTreeMap::new(),
            prev_opt_flow_res: BTreeMap::new(),
            num_points_kf: BTreeMap::new(),
            lmdb: LandmarkDatabase::new(),
            marg_h,
            marg_b: DVector::zeros(POSE_VEL_BIAS_SIZE),
            marg_order: AbsOrderMap::new(),
            gyro_bias_weight,
            accel_bias_weight,
            max_states: config.vio_max_states,
            max_kfs: config.vio_max_kfs,
            opt_started: false,
            last_state_t_ns: 0,
            out_state_queue: None,
            out_vis_queue: None,
            out_marg_queue: None,
            config,
            calib,
        }
    }

    /// Seed the window with a known initial state. The first state is
    /// pinned: it carries the initial prior.
    pub fn initialize(
        &mut self,
        t_ns: i64,
        t_w_i: SE3,
        vel_w_i: Vector3<f64>,
        bias_gyro: Vector3<f64>,
        bias_accel: Vector3<f64>,
    ) {
        self.initialized = true;
        self.last_state_t_ns = t_ns;

        self.imu_meas
            .insert(t_ns, IntegratedImuMeasurement::new(t_ns, bias_gyro, bias_accel));
        self.frame_states.insert(
            t_ns,
            PoseVelBiasStateWithLin::new(
                PoseVelBiasState::new(t_ns, t_w_i, vel_w_i, bias_gyro, bias_accel),
                true,
            ),
        );

        self.marg_order = AbsOrderMap::new();
        self.marg_order.push_variable(t_ns, POSE_VEL_BIAS_SIZE);

        debug!("estimator initialized at t_ns {}", t_ns);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_state_t_ns(&self) -> i64 {
        self.last_state_t_ns
    }

    /// Live state of the most recent frame.
    pub fn last_state(&self) -> PoseVelBiasState {
        self.frame_states[&self.last_state_t_ns].state().clone()
    }

    pub fn landmark_db(&self) -> &LandmarkDatabase {
        &self.lmdb
    }

    pub fn num_keyframes(&self) -> usize {
        self.kf_ids.len()
    }

    pub fn num_states(&self) -> usize {
        self.frame_states.len()
    }

    pub fn config(&self) -> &VioConfig {
        &self.config
    }

    pub fn calib(&self) -> &Calibration {
        &self.calib
    }

    fn ctx(&self) -> LinearizeCtx<'_> {
        LinearizeCtx {
            frame_poses: &self.frame_poses,
            frame_states: &self.frame_states,
            calib: &self.calib,
            obs_std_dev: self.config.vio_obs_std_dev,
            huber_thresh: self.config.vio_obs_huber_thresh,
        }
    }

    /// Live pose of any frame in the window.
    fn pose(&self, frame_id: i64) -> SE3 {
        if let Some(s) = self.frame_states.get(&frame_id) {
            s.state().t_w_i.clone()
        } else if let Some(p) = self.frame_poses.get(&frame_id) {
            p.pose().clone()
        } else {
            panic!("frame {frame_id} not in window");
        }
    }

    /// Process one visual frame with the preintegration covering the span
    /// since the previous frame.
    pub fn measure(
        &mut self,
        opt_flow: Arc<OpticalFlowResult>,
        meas: Option<IntegratedImuMeasurement>,
    ) {
        if let Some(meas) = meas {
            let last_state = self.frame_states[&self.last_state_t_ns].state().clone();
            assert_eq!(
                last_state.t_ns,
                meas.start_t_ns(),
                "preintegration does not start at the previous frame"
            );
            assert_eq!(
                opt_flow.t_ns,
                meas.end_t_ns(),
                "preintegration does not end at the current frame"
            );

            let next_state = meas.predict_state(&last_state, &self.g);
            self.last_state_t_ns = opt_flow.t_ns;
            self.frame_states.insert(
                opt_flow.t_ns,
                PoseVelBiasStateWithLin::new(next_state, false),
            );
            self.imu_meas.insert(meas.start_t_ns(), meas);
        }

        self.prev_opt_flow_res.insert(opt_flow.t_ns, opt_flow.clone());

        // Data association: feed tracked keypoints to existing landmarks,
        // remember the untracked cam-0 ones as triangulation candidates.
        let mut connected0: usize = 0;
        let mut num_points_connected: BTreeMap<i64, usize> = BTreeMap::new();
        let mut unconnected_obs0: BTreeSet<u32> = BTreeSet::new();

        for (cam_id, per_cam) in opt_flow.observations.iter().enumerate() {
            let tcid_target = TimeCamId::new(opt_flow.t_ns, cam_id);
            for (kpt_id, affine) in per_cam {
                match self.lmdb.get_landmark(*kpt_id) {
                    Some(lm) => {
                        let host_frame = lm.host.frame_id;
                        let pos = Vector2::new(affine[(0, 2)] as f64, affine[(1, 2)] as f64);
                        self.lmdb
                            .add_observation(
                                tcid_target,
                                KeypointObservation { kpt_id: *kpt_id, pos },
                            )
                            .expect("landmark vanished during association");
                        *num_points_connected.entry(host_frame).or_insert(0) += 1;
                        if cam_id == 0 {
                            connected0 += 1;
                        }
                    }
                    None => {
                        if cam_id == 0 {
                            unconnected_obs0.insert(*kpt_id);
                        }
                    }
                }
            }
        }

        let total0 = connected0 + unconnected_obs0.len();
        if total0 > 0
            && (connected0 as f64 / total0 as f64) < self.config.vio_new_kf_keypoints_thresh
            && self.frames_after_kf > self.config.vio_min_frames_after_kf
        {
            self.take_kf = true;
        }

        if self.config.vio_debug {
            debug!(
                "connected0 {} unconnected0 {}",
                connected0,
                unconnected_obs0.len()
            );
        }

        if self.take_kf {
            self.take_kf = false;
            self.frames_after_kf = 0;
            self.kf_ids.insert(self.last_state_t_ns);
            let num_points_added = self.triangulate_new_landmarks(&opt_flow, &unconnected_obs0);
            self.num_points_kf.insert(opt_flow.t_ns, num_points_added);
            debug!(
                "new keyframe {} with {} triangulated landmarks",
                self.last_state_t_ns, num_points_added
            );
        } else {
            self.frames_after_kf += 1;
        }

        self.optimize();
        self.marginalize(&num_points_connected);

        if let Some(queue) = &self.out_state_queue {
            let _ = queue.send(Some(self.last_state()));
        }
        if let Some(queue) = &self.out_vis_queue {
            let data = self.visualization_data(&opt_flow);
            let _ = queue.send(Some(data));
        }
    }

    /// Triangulate the unconnected cam-0 keypoints of a fresh keyframe from
    /// their observations in the retained optical-flow history.
    fn triangulate_new_landmarks(
        &mut self,
        opt_flow: &Arc<OpticalFlowResult>,
        unconnected_obs0: &BTreeSet<u32>,
    ) -> usize {
        let tcidl = TimeCamId::new(opt_flow.t_ns, 0);
        let min_dist2 =
            self.config.vio_min_triangulation_dist * self.config.vio_min_triangulation_dist;
        let mut num_points_added = 0;

        for &lm_id in unconnected_obs0 {
            // Gather every observation of this keypoint across the retained
            // flow results (the current frame included).
            let mut kp_obs: BTreeMap<TimeCamId, KeypointObservation> = BTreeMap::new();
            for (t_ns, flow) in &self.prev_opt_flow_res {
                for cam_id in 0..flow.observations.len() {
                    if let Some(pos) = flow.translation(cam_id, lm_id) {
                        kp_obs.insert(
                            TimeCamId::new(*t_ns, cam_id),
                            KeypointObservation { kpt_id: lm_id, pos },
                        );
                    }
                }
            }

            let p0 = opt_flow
                .translation(0, lm_id)
                .expect("candidate keypoint missing from its own frame");

            let mut valid_kp = false;
            for (tcido, obs) in &kp_obs {
                if valid_kp {
                    break;
                }
                if *tcido == tcidl {
                    continue;
                }

                let Some(f0) = self.calib.intrinsics[0].unproject(&p0) else {
                    continue;
                };
                let Some(f1) = self.calib.intrinsics[tcido.cam_id].unproject(&obs.pos) else {
                    continue;
                };

                let t_0_1 = rel_pose(
                    &self.pose(tcido.frame_id),
                    &self.calib.t_i_c[tcido.cam_id],
                    &self.pose(tcidl.frame_id),
                    &self.calib.t_i_c[0],
                );
                if t_0_1.translation.norm_squared() < min_dist2 {
                    continue;
                }

                let Some(p0_triangulated) = triangulate(&f0.xyz(), &f1.xyz(), &t_0_1) else {
                    continue;
                };

                if p0_triangulated.iter().all(|v| v.is_finite())
                    && p0_triangulated.w > 0.0
                    && p0_triangulated.w < 3.0
                {
                    self.lmdb.add_landmark(
                        lm_id,
                        KeypointPosition {
                            host: tcidl,
                            dir: StereographicParam::project(&p0_triangulated),
                            inv_depth: p0_triangulated.w,
                        },
                    );
                    num_points_added += 1;
                    valid_kp = true;
                }
            }

            if valid_kp {
                for (tcido, obs) in kp_obs {
                    self.lmdb
                        .add_observation(tcido, obs)
                        .expect("freshly added landmark missing");
                }
            }
        }

        num_points_added
    }

    fn backup(&mut self) {
        for state in self.frame_states.values_mut() {
            state.backup();
        }
        for pose in self.frame_poses.values_mut() {
            pose.backup();
        }
        self.lmdb.backup();
    }

    fn restore(&mut self) {
        for state in self.frame_states.values_mut() {
            state.restore();
        }
        for pose in self.frame_poses.values_mut() {
            pose.restore();
        }
        self.lmdb.restore();
    }

    fn total_error(&self) -> f64 {
        let vision = compute_error(&self.ctx(), &self.lmdb);
        let (imu, bg, ba) = compute_imu_error(
            &self.frame_states,
            &self.imu_meas,
            &self.gyro_bias_weight,
            &self.accel_bias_weight,
            &self.g,
        );
        let prior = compute_marg_prior_error(
            &self.marg_order,
            &self.marg_h,
            &self.marg_b,
            &self.frame_poses,
            &self.frame_states,
        );
        vision + imu + bg + ba + prior
    }

    /// Build the live absolute ordering: poses first, then states, both in
    /// timestamp order.
    fn build_aom(&self) -> AbsOrderMap {
        let mut aom = AbsOrderMap::new();
        for t_ns in self.frame_poses.keys() {
            aom.push_variable(*t_ns, POSE_SIZE);
        }
        for t_ns in self.frame_states.keys() {
            aom.push_variable(*t_ns, POSE_VEL_BIAS_SIZE);
        }
        aom.assert_consistent_with(&self.marg_order);
        aom
    }

    fn apply_pose_state_inc(&mut self, aom: &AbsOrderMap, inc: &DVector<f64>) {
        for (t_ns, pose) in self.frame_poses.iter_mut() {
            let idx = aom.offset(*t_ns);
            let seg = -inc.fixed_rows::<6>(idx).into_owned();
            pose.apply_inc(&seg);
        }
        for (t_ns, state) in self.frame_states.iter_mut() {
            let idx = aom.offset(*t_ns);
            let seg: SVector<f64, 15> = -inc.fixed_rows::<15>(idx).into_owned();
            state.apply_inc(&seg);
        }
    }

    fn apply_landmark_inc(&mut self, rld_vec: &[RelLinData], aom: &AbsOrderMap, inc: &DVector<f64>) {
        let increments: Vec<(u32, Vector3<f64>)> = rld_vec
            .par_iter()
            .flat_map(|rld| landmark_increments(rld, aom, inc))
            .collect();
        for (lm_id, inc_p) in increments {
            if let Some(lm) = self.lmdb.get_landmark_mut(lm_id) {
                lm.dir -= Vector2::new(inc_p.x, inc_p.y);
                lm.inv_depth -= inc_p.z;
            }
        }
    }

    /// Damped Gauss-Newton / Levenberg-Marquardt over the joint system.
    pub fn optimize(&mut self) {
        if !(self.opt_started || self.frame_states.len() > 4) {
            return;
        }
        self.opt_started = true;

        let aom = self.build_aom();

        for iter in 0..self.config.vio_max_iterations {
            let (mut rld_vec, rld_error) = linearize_helper(&self.ctx(), &self.lmdb, |_, _| true);
            let mut accum = linearize_abs_reduce(&mut rld_vec, &aom);

            let (imu_error, bg_error, ba_error) = linearize_abs_imu(
                &aom,
                &mut accum,
                &self.frame_states,
                &self.imu_meas,
                &self.gyro_bias_weight,
                &self.accel_bias_weight,
                &self.g,
            );
            let marg_prior_error = linearize_marg_prior(
                &self.marg_order,
                &self.marg_h,
                &self.marg_b,
                &aom,
                &mut accum,
                &self.frame_poses,
                &self.frame_states,
            );

            let error_total = rld_error + imu_error + bg_error + ba_error + marg_prior_error;
            if self.config.vio_debug {
                debug!(
                    "iter {iter} error: vision {rld_error:.3} imu {imu_error:.3} bg {bg_error:.3} \
                     ba {ba_error:.3} marg prior {marg_prior_error:.3} total {error_total:.3}"
                );
            }

            let h_diag = accum.h_diagonal();
            let mut converged = false;

            if self.config.vio_use_lm {
                let mut step = false;
                let mut max_iter = 10;

                while !step && max_iter > 0 && !converged {
                    let mut h_diag_lambda = &h_diag * self.lambda;
                    for v in h_diag_lambda.iter_mut() {
                        *v = v.max(self.min_lambda);
                    }

                    let inc = accum.solve(Some(&h_diag_lambda));
                    let max_inc = inc.amax();
                    if max_inc < 1e-4 {
                        converged = true;
                    }

                    self.backup();
                    self.apply_pose_state_inc(&aom, &inc);
                    self.apply_landmark_inc(&rld_vec, &aom, &inc);

                    let after_error_total = self.total_error();
                    let f_diff = error_total - after_error_total;

                    if f_diff < 0.0 {
                        if self.config.vio_debug {
                            debug!(
                                "\t[REJECTED] lambda {:.3e} f_diff {f_diff:.3e} max_inc {max_inc:.3e}",
                                self.lambda
                            );
                        }
                        self.lambda = self.max_lambda.min(self.lambda_vee * self.lambda);
                        self.lambda_vee *= 2.0;
                        self.restore();
                    } else {
                        if self.config.vio_debug {
                            debug!(
                                "\t[ACCEPTED] lambda {:.3e} f_diff {f_diff:.3e} max_inc {max_inc:.3e}",
                                self.lambda
                            );
                        }
                        self.lambda = self.min_lambda.max(self.lambda / 3.0);
                        self.lambda_vee = 2.0;
                        step = true;
                    }
                    max_iter -= 1;
                }
            } else {
                let mut h_diag_lambda = &h_diag * self.min_lambda;
                for v in h_diag_lambda.iter_mut() {
                    *v = v.max(self.min_lambda);
                }
                let inc = accum.solve(Some(&h_diag_lambda));
                if inc.amax() < 1e-4 {
                    converged = true;
                }
                self.apply_pose_state_inc(&aom, &inc);
                self.apply_landmark_inc(&rld_vec, &aom, &inc);
            }

            if iter == self.config.vio_filter_iteration {
                let ctx = LinearizeCtx {
                    frame_poses: &self.frame_poses,
                    frame_states: &self.frame_states,
                    calib: &self.calib,
                    obs_std_dev: self.config.vio_obs_std_dev,
                    huber_thresh: self.config.vio_obs_huber_thresh,
                };
                filter_outliers(
                    &ctx,
                    &mut self.lmdb,
                    self.config.vio_outlier_threshold,
                    MIN_LANDMARK_OBS,
                );
            }

            if converged {
                if self.config.vio_debug {
                    debug!("[CONVERGED] at iter {iter}");
                }
                break;
            }
        }
    }

    /// Evict old states and keyframes, folding their information into the
    /// prior.
    pub fn marginalize(&mut self, num_points_connected: &BTreeMap<i64, usize>) {
        if !self.opt_started {
            return;
        }
        if !(self.frame_poses.len() > self.max_kfs || self.frame_states.len() >= self.max_states)
        {
            return;
        }

        let states_to_remove = self.frame_states.len() - self.max_states + 1;
        let last_state_to_marg = *self
            .frame_states
            .keys()
            .nth(states_to_remove)
            .expect("window shorter than eviction count");

        // Ordering for the marginalisation system: all poses, then the
        // states up to and including the boundary.
        let mut aom = AbsOrderMap::new();
        let mut poses_to_marg: BTreeSet<i64> = BTreeSet::new();
        for t_ns in self.frame_poses.keys() {
            aom.push_variable(*t_ns, POSE_SIZE);
            if !self.kf_ids.contains(t_ns) {
                poses_to_marg.insert(*t_ns);
            }
        }

        let mut states_to_marg_vel_bias: BTreeSet<i64> = BTreeSet::new();
        let mut states_to_marg_all: BTreeSet<i64> = BTreeSet::new();
        for t_ns in self.frame_states.keys() {
            if *t_ns > last_state_to_marg {
                break;
            }
            if *t_ns != last_state_to_marg {
                if self.kf_ids.contains(t_ns) {
                    states_to_marg_vel_bias.insert(*t_ns);
                } else {
                    states_to_marg_all.insert(*t_ns);
                }
            }
            aom.push_variable(*t_ns, POSE_VEL_BIAS_SIZE);
        }
        aom.assert_consistent_with(&self.marg_order);

        let kf_ids_all = self.kf_ids.clone();
        let mut kfs_to_marg: BTreeSet<i64> = BTreeSet::new();
        while self.kf_ids.len() > self.max_kfs && !states_to_marg_vel_bias.is_empty() {
            let Some(id_to_marg) = self.select_kf_to_marg(num_points_connected) else {
                break;
            };
            kfs_to_marg.insert(id_to_marg);
            poses_to_marg.insert(id_to_marg);
            self.kf_ids.remove(&id_to_marg);
        }

        if self.config.vio_debug {
            debug!(
                "marginalize: states_to_remove {} poses_to_marg {} states_all {} \
                 states_vel_bias {} kfs_to_marg {}",
                states_to_remove,
                poses_to_marg.len(),
                states_to_marg_all.len(),
                states_to_marg_vel_bias.len(),
                kfs_to_marg.len()
            );
        }

        // Joint linearisation at the eviction ordering. Only observations
        // hosted by an evicted keyframe and targeting a frame at or before
        // the boundary are relinearised.
        let (mut rld_vec, _) = linearize_helper(&self.ctx(), &self.lmdb, |host, target| {
            kfs_to_marg.contains(&host.frame_id) && target.frame_id <= last_state_to_marg
        });
        let mut accum = linearize_abs_reduce(&mut rld_vec, &aom);
        linearize_abs_imu(
            &aom,
            &mut accum,
            &self.frame_states,
            &self.imu_meas,
            &self.gyro_bias_weight,
            &self.accel_bias_weight,
            &self.g,
        );
        linearize_marg_prior(
            &self.marg_order,
            &self.marg_h,
            &self.marg_b,
            &aom,
            &mut accum,
            &self.frame_poses,
            &self.frame_states,
        );

        if let Some(queue) = &self.out_marg_queue {
            if !kfs_to_marg.is_empty() {
                let opt_flow_res = kf_ids_all
                    .iter()
                    .map(|t| {
                        self.prev_opt_flow_res
                            .get(t)
                            .expect("keyframe flow result already dropped")
                            .clone()
                    })
                    .collect();
                let _ = queue.send(Some(MargData {
                    aom: aom.clone(),
                    abs_h: accum.h().clone(),
                    abs_b: accum.b().clone(),
                    frame_poses: self.frame_poses.clone(),
                    frame_states: self.frame_states.clone(),
                    kfs_all: kf_ids_all.clone(),
                    kfs_to_marg: kfs_to_marg.clone(),
                    use_imu: true,
                    opt_flow_res,
                }));
            }
        }

        // Partition the columns into kept and marginalised index sets.
        let mut idx_to_keep: BTreeSet<usize> = BTreeSet::new();
        let mut idx_to_marg: BTreeSet<usize> = BTreeSet::new();
        for (t_ns, (offset, size)) in &aom.abs_order_map {
            match *size {
                POSE_SIZE => {
                    let set = if poses_to_marg.contains(t_ns) {
                        &mut idx_to_marg
                    } else {
                        &mut idx_to_keep
                    };
                    set.extend(*offset..*offset + POSE_SIZE);
                }
                POSE_VEL_BIAS_SIZE => {
                    if states_to_marg_all.contains(t_ns) {
                        idx_to_marg.extend(*offset..*offset + POSE_VEL_BIAS_SIZE);
                    } else if states_to_marg_vel_bias.contains(t_ns) {
                        idx_to_keep.extend(*offset..*offset + POSE_SIZE);
                        idx_to_marg.extend(*offset + POSE_SIZE..*offset + POSE_VEL_BIAS_SIZE);
                    } else {
                        assert_eq!(*t_ns, last_state_to_marg);
                        idx_to_keep.extend(*offset..*offset + POSE_VEL_BIAS_SIZE);
                    }
                }
                other => panic!("unexpected block size {other}"),
            }
        }

        let (marg_h_new, marg_b_new) =
            marginalize_helper(accum.h(), accum.b(), &idx_to_keep, &idx_to_marg);

        // The boundary state becomes part of the prior and is pinned.
        {
            let state = self
                .frame_states
                .get_mut(&last_state_to_marg)
                .expect("boundary state missing");
            assert!(
                !state.is_linearized(),
                "boundary state already linearized"
            );
            state.set_linearized();
        }

        // Apply removals.
        for t_ns in &states_to_marg_all {
            self.frame_states.remove(t_ns);
            self.imu_meas.remove(t_ns);
            self.prev_opt_flow_res.remove(t_ns);
        }
        for t_ns in &states_to_marg_vel_bias {
            let state = self
                .frame_states
                .remove(t_ns)
                .expect("demoted state missing");
            self.frame_poses
                .insert(*t_ns, PoseStateWithLin::from_pose_vel_bias(&state));
            self.imu_meas.remove(t_ns);
        }
        for t_ns in &poses_to_marg {
            self.frame_poses.remove(t_ns);
            self.prev_opt_flow_res.remove(t_ns);
        }

        self.lmdb
            .remove_keyframes(&kfs_to_marg, &poses_to_marg, &states_to_marg_all);

        // New prior ordering: surviving poses, then the boundary state.
        let mut marg_order_new = AbsOrderMap::new();
        for t_ns in self.frame_poses.keys() {
            marg_order_new.push_variable(*t_ns, POSE_SIZE);
        }
        marg_order_new.push_variable(last_state_to_marg, POSE_VEL_BIAS_SIZE);

        self.marg_h = marg_h_new;
        self.marg_b = marg_b_new;
        self.marg_order = marg_order_new;
        assert_eq!(self.marg_h.ncols(), self.marg_order.total_size);

        // Re-center the prior gradient at the live values of the pinned set.
        let delta = compute_delta(&self.marg_order, &self.frame_poses, &self.frame_states);
        self.marg_b -= &self.marg_h * delta;

        if self.config.vio_debug {
            let norms = check_nullspace(
                &self.marg_h,
                &self.marg_order,
                &self.frame_poses,
                &self.frame_states,
            );
            debug!("marginalization nullspace residuals: {:?}", norms);
        }
    }

    /// Pick the keyframe to evict: first by covisibility with the current
    /// frame, then by the spatial-spread score.
    fn select_kf_to_marg(&self, num_points_connected: &BTreeMap<i64, usize>) -> Option<i64> {
        let ids: Vec<i64> = self.kf_ids.iter().copied().collect();
        if ids.len() <= 2 {
            return None;
        }
        let candidates = &ids[..ids.len() - 2];

        // Covisibility rule: barely-observed keyframes go first. A keyframe
        // that hosted no landmarks is immediately evictable.
        for &id in candidates {
            let connected = num_points_connected.get(&id).copied().unwrap_or(0);
            let hosted = self.num_points_kf.get(&id).copied().unwrap_or(0);
            if hosted == 0 || (connected as f64 / hosted as f64) < 0.05 {
                return Some(id);
            }
        }

        // Fallback: evict the keyframe that keeps the remaining set most
        // spread out relative to the newest keyframe.
        let last_kf = *ids.last().unwrap();
        let p_last = self.pose(last_kf).translation;

        let mut min_score = f64::MAX;
        let mut min_score_id = None;
        for &i in candidates {
            let p_i = self.pose(i).translation;
            let mut denom = 0.0;
            for &j in candidates {
                denom += 1.0 / ((p_i - self.pose(j).translation).norm() + 1e-5);
            }
            let score = (p_i - p_last).norm().sqrt() * denom;
            if score < min_score {
                min_score = score;
                min_score_id = Some(i);
            }
        }
        min_score_id
    }

    /// Reprojections of all landmarks observed in the newest frame, per
    /// camera, as `(u, v, inverse depth, keypoint id)`.
    pub fn compute_projections(&self) -> Vec<Vec<Vector4<f64>>> {
        let mut data = vec![Vec::new(); self.calib.num_cams()];

        for (host, per_target) in self.lmdb.observations() {
            for (target, obs_list) in per_target {
                if target.frame_id != self.last_state_t_ns {
                    continue;
                }

                let t_t_h = if host == target {
                    SE3::identity()
                } else if host.frame_id == target.frame_id {
                    self.calib.t_i_c[target.cam_id]
                        .inverse()
                        .compose(&self.calib.t_i_c[host.cam_id])
                } else {
                    rel_pose(
                        &self.pose(host.frame_id),
                        &self.calib.t_i_c[host.cam_id],
                        &self.pose(target.frame_id),
                        &self.calib.t_i_c[target.cam_id],
                    )
                };

                for obs in obs_list {
                    let Some(kpt) = self.lmdb.get_landmark(obs.kpt_id) else {
                        continue;
                    };
                    if let Some(pl) = linearize_point(
                        &obs.pos,
                        kpt,
                        &t_t_h,
                        &self.calib.intrinsics[target.cam_id],
                    ) {
                        data[target.cam_id].push(Vector4::new(
                            pl.proj.x,
                            pl.proj.y,
                            kpt.inv_depth,
                            obs.kpt_id as f64,
                        ));
                    }
                }
            }
        }
        data
    }

    /// World positions of all landmarks in the window.
    pub fn current_points(&self) -> (Vec<Vector3<f64>>, Vec<u32>) {
        let mut points = Vec::with_capacity(self.lmdb.num_landmarks());
        let mut ids = Vec::with_capacity(self.lmdb.num_landmarks());

        for (kpt_id, kpt) in self.lmdb.landmarks() {
            let t_w_c = self
                .pose(kpt.host.frame_id)
                .compose(&self.calib.t_i_c[kpt.host.cam_id]);
            let dir = StereographicParam::unproject(&kpt.dir);
            let p_cam = dir.xyz() / kpt.inv_depth;
            points.push(t_w_c.transform_point(&p_cam));
            ids.push(*kpt_id);
        }
        (points, ids)
    }

    fn visualization_data(&self, opt_flow: &Arc<OpticalFlowResult>) -> VioVisualizationData {
        let (points, point_ids) = self.current_points();
        VioVisualizationData {
            t_ns: self.last_state_t_ns,
            states: self
                .frame_states
                .values()
                .map(|s| s.state().t_w_i.clone())
                .collect(),
            frames: self.frame_poses.values().map(|p| p.pose().clone()).collect(),
            points,
            point_ids,
            projections: self.compute_projections(),
            opt_flow_res: Some(opt_flow.clone()),
        }
    }

    /// Nullspace diagnostics of the current prior (debug helper).
    pub fn check_marg_nullspace(&self) -> [f64; 4] {
        check_nullspace(
            &self.marg_h,
            &self.marg_order,
            &self.frame_poses,
            &self.frame_states,
        )
    }

    /// Current marginalisation prior (Hessian, gradient, ordering).
    pub fn marg_prior(&self) -> (&DMatrix<f64>, &DVector<f64>, &AbsOrderMap) {
        (&self.marg_h, &self.marg_b, &self.marg_order)
    }

    /// Replace the marginalisation prior. Intended for replaying a prior
    /// produced by another estimator instance over the same window.
    pub fn set_marg_prior(&mut self, marg_h: DMatrix<f64>, marg_b: DVector<f64>, marg_order: AbsOrderMap) {
        assert_eq!(marg_h.ncols(), marg_order.total_size);
        assert_eq!(marg_b.len(), marg_order.total_size);
        self.marg_h = marg_h;
        self.marg_b = marg_b;
        self.marg_order = marg_order;
    }
}
