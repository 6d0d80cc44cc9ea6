//! Sensor rig calibration.
//!
//! Holds camera extrinsics/intrinsics and the IMU noise model. The loader
//! that fills this struct from calibration files lives outside the crate;
//! the estimator only consumes the values.

pub mod camera;

use nalgebra::Vector3;

pub use camera::{CameraModel, DoubleSphereCamera, PinholeCamera};

use crate::geometry::SE3;

/// Calibration of a stereo-inertial rig.
#[derive(Debug, Clone)]
pub struct Calibration {
    /// Camera-from-IMU extrinsics, one per camera.
    pub t_i_c: Vec<SE3>,
    /// Intrinsics, one per camera.
    pub intrinsics: Vec<CameraModel>,
    /// Continuous-time accelerometer noise density (per axis).
    pub accel_noise_std: Vector3<f64>,
    /// Continuous-time gyroscope noise density (per axis).
    pub gyro_noise_std: Vector3<f64>,
    /// Accelerometer bias random-walk standard deviation (per axis).
    pub accel_bias_std: Vector3<f64>,
    /// Gyroscope bias random-walk standard deviation (per axis).
    pub gyro_bias_std: Vector3<f64>,
    /// Static accelerometer bias removed from raw samples at dequeue time.
    pub calib_accel_bias: Vector3<f64>,
    /// Static gyroscope bias removed from raw samples at dequeue time.
    pub calib_gyro_bias: Vector3<f64>,
    /// Nominal IMU rate (Hz), used for the discrete-time noise conversion.
    pub imu_update_rate: f64,
}

impl Calibration {
    /// Discrete-time accelerometer noise standard deviation:
    /// `σ_d = σ_c · sqrt(rate)`.
    pub fn discrete_time_accel_noise_std(&self) -> Vector3<f64> {
        self.accel_noise_std * self.imu_update_rate.sqrt()
    }

    /// Discrete-time gyroscope noise standard deviation.
    pub fn discrete_time_gyro_noise_std(&self) -> Vector3<f64> {
        self.gyro_noise_std * self.imu_update_rate.sqrt()
    }

    /// Remove the static accelerometer bias from a raw measurement.
    pub fn calibrate_accel(&self, accel: &Vector3<f64>) -> Vector3<f64> {
        accel - self.calib_accel_bias
    }

    /// Remove the static gyroscope bias from a raw measurement.
    pub fn calibrate_gyro(&self, gyro: &Vector3<f64>) -> Vector3<f64> {
        gyro - self.calib_gyro_bias
    }

    pub fn num_cams(&self) -> usize {
        self.intrinsics.len()
    }
}
