use nalgebra::Vector3;

/// Single IMU measurement, timestamped in nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub t_ns: i64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    /// Linear interpolation between two samples at time `t_ns`.
    ///
    /// Used to close a preintegration span exactly at a frame timestamp when
    /// the bracketing samples straddle it.
    pub fn interpolate(a: &ImuSample, b: &ImuSample, t_ns: i64) -> ImuSample {
        debug_assert!(a.t_ns <= t_ns && t_ns <= b.t_ns);
        let span = (b.t_ns - a.t_ns) as f64;
        let w = if span > 0.0 {
            (t_ns - a.t_ns) as f64 / span
        } else {
            0.0
        };
        ImuSample {
            t_ns,
            accel: a.accel * (1.0 - w) + b.accel * w,
            gyro: a.gyro * (1.0 - w) + b.gyro * w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_interpolate_midpoint() {
        let a = ImuSample {
            t_ns: 0,
            accel: Vector3::new(0.0, 0.0, 9.0),
            gyro: Vector3::new(0.1, 0.0, 0.0),
        };
        let b = ImuSample {
            t_ns: 10_000_000,
            accel: Vector3::new(0.0, 0.0, 11.0),
            gyro: Vector3::new(0.3, 0.0, 0.0),
        };
        let mid = ImuSample::interpolate(&a, &b, 5_000_000);
        assert_relative_eq!(mid.accel.z, 10.0, epsilon = 1e-12);
        assert_relative_eq!(mid.gyro.x, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolate_endpoints() {
        let a = ImuSample {
            t_ns: 100,
            accel: Vector3::new(1.0, 2.0, 3.0),
            gyro: Vector3::zeros(),
        };
        let b = ImuSample {
            t_ns: 200,
            accel: Vector3::new(-1.0, 0.0, 5.0),
            gyro: Vector3::zeros(),
        };
        assert_relative_eq!(ImuSample::interpolate(&a, &b, 100).accel, a.accel);
        assert_relative_eq!(ImuSample::interpolate(&a, &b, 200).accel, b.accel);
    }
}
