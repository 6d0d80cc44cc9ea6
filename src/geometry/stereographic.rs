//! Stereographic parameterisation of the unit sphere.
//!
//! Landmark bearing directions live on S². The two-parameter stereographic
//! chart (projection from the south pole `(0,0,-1)`) is a minimal,
//! singularity-free parameterisation for directions in the forward
//! hemisphere, which is where camera bearings live.

use nalgebra::{SMatrix, Vector2, Vector3, Vector4};

/// Stereographic projection and its inverse.
pub struct StereographicParam;

impl StereographicParam {
    /// Project a homogeneous point onto the chart. Only the direction of the
    /// first three components matters.
    pub fn project(p: &Vector4<f64>) -> Vector2<f64> {
        let dir = p.xyz();
        let n = dir.norm();
        let z = dir.z / n;
        Vector2::new(dir.x / n / (1.0 + z), dir.y / n / (1.0 + z))
    }

    /// Inverse projection: chart coordinates to a unit direction, returned
    /// homogeneous with zero fourth component.
    pub fn unproject(d: &Vector2<f64>) -> Vector4<f64> {
        let norm2 = d.norm_squared();
        let denom = 1.0 + norm2;
        Vector4::new(
            2.0 * d.x / denom,
            2.0 * d.y / denom,
            (1.0 - norm2) / denom,
            0.0,
        )
    }

    /// Inverse projection together with its 4×2 Jacobian.
    pub fn unproject_jac(d: &Vector2<f64>) -> (Vector4<f64>, SMatrix<f64, 4, 2>) {
        let norm2 = d.norm_squared();
        let denom = 1.0 + norm2;
        let denom2 = denom * denom;

        let p = Vector4::new(
            2.0 * d.x / denom,
            2.0 * d.y / denom,
            (1.0 - norm2) / denom,
            0.0,
        );

        let mut jac = SMatrix::<f64, 4, 2>::zeros();
        jac[(0, 0)] = (2.0 * denom - 4.0 * d.x * d.x) / denom2;
        jac[(0, 1)] = -4.0 * d.x * d.y / denom2;
        jac[(1, 0)] = jac[(0, 1)];
        jac[(1, 1)] = (2.0 * denom - 4.0 * d.y * d.y) / denom2;
        jac[(2, 0)] = -4.0 * d.x / denom2;
        jac[(2, 1)] = -4.0 * d.y / denom2;

        (p, jac)
    }
}
