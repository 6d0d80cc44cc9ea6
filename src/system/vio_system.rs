//! VIO system - entry point and worker thread orchestration.
//!
//! The `VioSystem` owns the bounded input queues and spawns the single
//! worker that runs the estimator. Producers push optical-flow results and
//! IMU samples; the worker synchronises the two streams, preintegrates the
//! inertial span between consecutive frames and runs the
//! measure / optimize / marginalize pipeline. Shutdown is signalled by a
//! `None` sentinel on the visual queue; the worker forwards the sentinel to
//! every output before exiting.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use nalgebra::{UnitQuaternion, Vector3};
use tracing::{debug, info};

use super::messages::{MargData, OpticalFlowResult, VioVisualizationData};
use super::shared_state::SharedState;
use crate::calib::Calibration;
use crate::config::VioConfig;
use crate::estimator::VioEstimator;
use crate::geometry::SE3;
use crate::imu::{ImuSample, IntegratedImuMeasurement};
use crate::state::PoseVelBiasState;

/// Capacity of the visual input queue. Producers block when it is full
/// unless realtime mode drains it instead.
const VISION_QUEUE_CAPACITY: usize = 10;

/// Capacity of the IMU input queue. IMU samples are never dropped.
const IMU_QUEUE_CAPACITY: usize = 300;

/// Capacity of each output queue.
const OUTPUT_QUEUE_CAPACITY: usize = 100;

/// Bias-corrects and monotonicity-checks the raw IMU stream.
struct ImuSource {
    rx: Receiver<Option<ImuSample>>,
    calib: Calibration,
    last_t_ns: i64,
}

impl ImuSource {
    /// Pop the next sample; `None` means the stream ended.
    fn next(&mut self) -> Option<ImuSample> {
        match self.rx.recv() {
            Ok(Some(mut sample)) => {
                assert!(
                    sample.t_ns > self.last_t_ns,
                    "non-monotonic IMU timestamps: {} after {}",
                    sample.t_ns,
                    self.last_t_ns
                );
                self.last_t_ns = sample.t_ns;
                sample.accel = self.calib.calibrate_accel(&sample.accel);
                sample.gyro = self.calib.calibrate_gyro(&sample.gyro);
                Some(sample)
            }
            _ => None,
        }
    }
}

/// Handle to a running estimator worker.
pub struct VioSystem {
    vision_tx: Sender<Option<Arc<OpticalFlowResult>>>,
    imu_tx: Sender<Option<ImuSample>>,

    state_rx: Option<Receiver<Option<PoseVelBiasState>>>,
    vis_rx: Option<Receiver<Option<VioVisualizationData>>>,
    marg_rx: Option<Receiver<Option<MargData>>>,

    shared: Arc<SharedState>,
    worker: Option<JoinHandle<()>>,
}

impl VioSystem {
    /// Spawn the estimator worker. `g` is the gravity vector in the world
    /// frame (conventionally `(0, 0, -9.81)`).
    pub fn new(g: Vector3<f64>, calib: Calibration, config: VioConfig) -> Self {
        let (vision_tx, vision_rx) = bounded(VISION_QUEUE_CAPACITY);
        let (imu_tx, imu_rx) = bounded(IMU_QUEUE_CAPACITY);
        let (state_tx, state_rx) = bounded(OUTPUT_QUEUE_CAPACITY);
        let (vis_tx, vis_rx) = bounded(OUTPUT_QUEUE_CAPACITY);
        let (marg_tx, marg_rx) = bounded(OUTPUT_QUEUE_CAPACITY);

        let mut estimator = VioEstimator::new(g, calib.clone(), config.clone());
        estimator.out_state_queue = Some(state_tx);
        estimator.out_vis_queue = Some(vis_tx);
        estimator.out_marg_queue = Some(marg_tx);

        let shared = SharedState::new();
        let shared_worker = shared.clone();
        let realtime = config.vio_enforce_realtime;

        let worker = thread::spawn(move || {
            run_worker(estimator, calib, realtime, vision_rx, imu_rx, shared_worker);
        });

        Self {
            vision_tx,
            imu_tx,
            state_rx: Some(state_rx),
            vis_rx: Some(vis_rx),
            marg_rx: Some(marg_rx),
            shared,
            worker: Some(worker),
        }
    }

    /// Queue an IMU sample. Blocks while the queue is full.
    pub fn push_imu(&self, sample: ImuSample) -> Result<()> {
        self.imu_tx
            .send(Some(sample))
            .map_err(|_| anyhow!("estimator worker is gone"))
    }

    /// Queue a visual frame. Blocks while the queue is full.
    pub fn push_frame(&self, frame: Arc<OpticalFlowResult>) -> Result<()> {
        self.vision_tx
            .send(Some(frame))
            .map_err(|_| anyhow!("estimator worker is gone"))
    }

    /// Take the per-frame state output. `None` on the channel marks the end
    /// of the stream.
    pub fn take_state_output(&mut self) -> Option<Receiver<Option<PoseVelBiasState>>> {
        self.state_rx.take()
    }

    /// Take the visualisation output.
    pub fn take_vis_output(&mut self) -> Option<Receiver<Option<VioVisualizationData>>> {
        self.vis_rx.take()
    }

    /// Take the marginalisation-blob output.
    pub fn take_marg_output(&mut self) -> Option<Receiver<Option<MargData>>> {
        self.marg_rx.take()
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Signal end-of-stream and wait for the worker to drain and exit.
    pub fn quit(&mut self) {
        let _ = self.vision_tx.send(None);
        let _ = self.imu_tx.send(None);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VioSystem {
    fn drop(&mut self) {
        self.quit();
    }
}

fn run_worker(
    mut estimator: VioEstimator,
    calib: Calibration,
    realtime: bool,
    vision_rx: Receiver<Option<Arc<OpticalFlowResult>>>,
    imu_rx: Receiver<Option<ImuSample>>,
    shared: Arc<SharedState>,
) {
    let accel_cov = calib
        .discrete_time_accel_noise_std()
        .map(|v| v * v);
    let gyro_cov = calib.discrete_time_gyro_noise_std().map(|v| v * v);

    let mut imu = ImuSource {
        rx: imu_rx,
        calib,
        last_t_ns: i64::MIN,
    };

    let mut data = imu.next();
    // Most recently consumed sample, kept as the left bracket for the
    // interpolated terminal step.
    let mut last_sample: Option<ImuSample> = None;
    let mut prev_frame: Option<Arc<OpticalFlowResult>> = None;

    'main: loop {
        let mut curr = vision_rx.recv().unwrap_or(None);
        if realtime {
            // Drain to the newest frame; intermediate frames are dropped.
            while let Ok(newer) = vision_rx.try_recv() {
                curr = newer;
                if curr.is_none() {
                    break;
                }
            }
        }
        let Some(curr_frame) = curr else {
            break;
        };

        if !estimator.is_initialized() {
            // Skip IMU samples older than the first frame, then align the
            // world frame with gravity from the current accelerometer
            // reading.
            while data.as_ref().map_or(false, |s| s.t_ns < curr_frame.t_ns) {
                last_sample = data;
                data = imu.next();
            }
            let Some(gravity_sample) = data.as_ref().or(last_sample.as_ref()) else {
                break;
            };

            let r_w_i = UnitQuaternion::rotation_between(&gravity_sample.accel, &Vector3::z())
                .unwrap_or_else(UnitQuaternion::identity);
            estimator.initialize(
                curr_frame.t_ns,
                SE3::new(r_w_i, Vector3::zeros()),
                Vector3::zeros(),
                Vector3::zeros(),
                Vector3::zeros(),
            );
            info!(
                "initialized at t_ns {} with gravity-aligned orientation",
                curr_frame.t_ns
            );
        }

        let meas = if let Some(prev) = &prev_frame {
            let last_state = estimator.last_state();
            let mut meas = IntegratedImuMeasurement::new(
                prev.t_ns,
                last_state.bias_gyro,
                last_state.bias_accel,
            );

            // Drop everything at or before the previous frame.
            while data.as_ref().map_or(false, |s| s.t_ns <= prev.t_ns) {
                last_sample = data;
                data = imu.next();
            }

            // Integrate the span up to the current frame.
            while let Some(sample) = data {
                if sample.t_ns > curr_frame.t_ns {
                    break;
                }
                meas.integrate(&sample, &accel_cov, &gyro_cov);
                last_sample = Some(sample);
                data = imu.next();
            }

            // Close the span exactly at the frame time with a sample
            // interpolated between the bracketing measurements.
            if meas.end_t_ns() < curr_frame.t_ns {
                let (Some(left), Some(right)) = (last_sample.as_ref(), data.as_ref()) else {
                    debug!("IMU stream ended mid-span, shutting down");
                    break 'main;
                };
                let spliced = ImuSample::interpolate(left, right, curr_frame.t_ns);
                meas.integrate(&spliced, &accel_cov, &gyro_cov);
            }

            Some(meas)
        } else {
            None
        };

        estimator.measure(curr_frame.clone(), meas);
        shared.set_last_state(estimator.last_state());
        prev_frame = Some(curr_frame);
    }

    if let Some(queue) = &estimator.out_vis_queue {
        let _ = queue.send(None);
    }
    if let Some(queue) = &estimator.out_marg_queue {
        let _ = queue.send(None);
    }
    if let Some(queue) = &estimator.out_state_queue {
        let _ = queue.send(None);
    }
    shared.set_finished();
    info!("VIO worker finished");
}
