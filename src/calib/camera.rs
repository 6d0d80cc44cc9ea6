//! Camera projection models.
//!
//! A tagged union over the supported intrinsics. Projection returns `None`
//! when the point is outside the model's valid region (e.g. behind a pinhole
//! camera), in which case the observation contributes nothing.

use nalgebra::{Matrix2x3, Vector2, Vector3, Vector4};

/// Pinhole model: `u = fx·x/z + cx`, `v = fy·y/z + cy`.
#[derive(Debug, Clone)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Double-sphere model (fx, fy, cx, cy, xi, alpha): projects through two
/// unit spheres before the pinhole, modelling large field-of-view lenses.
#[derive(Debug, Clone)]
pub struct DoubleSphereCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub xi: f64,
    pub alpha: f64,
}

/// Supported camera models.
#[derive(Debug, Clone)]
pub enum CameraModel {
    Pinhole(PinholeCamera),
    DoubleSphere(DoubleSphereCamera),
}

impl CameraModel {
    /// Project a 3D point in the camera frame to the pixel plane.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.project_jac(p).map(|(uv, _)| uv)
    }

    /// Project a 3D point and return the 2×3 Jacobian of the projection
    /// with respect to the point.
    pub fn project_jac(&self, p: &Vector3<f64>) -> Option<(Vector2<f64>, Matrix2x3<f64>)> {
        match self {
            CameraModel::Pinhole(cam) => {
                if p.z < 1e-8 {
                    return None;
                }
                let inv_z = 1.0 / p.z;
                let inv_z2 = inv_z * inv_z;
                let uv = Vector2::new(
                    cam.fx * p.x * inv_z + cam.cx,
                    cam.fy * p.y * inv_z + cam.cy,
                );
                let jac = Matrix2x3::new(
                    cam.fx * inv_z,
                    0.0,
                    -cam.fx * p.x * inv_z2,
                    0.0,
                    cam.fy * inv_z,
                    -cam.fy * p.y * inv_z2,
                );
                Some((uv, jac))
            }
            CameraModel::DoubleSphere(cam) => {
                let (xi, alpha) = (cam.xi, cam.alpha);
                let d1 = p.norm();
                if d1 < 1e-12 {
                    return None;
                }
                let k = xi * d1 + p.z;
                let d2 = (p.x * p.x + p.y * p.y + k * k).sqrt();
                let denom = alpha * d2 + (1.0 - alpha) * k;
                if denom < 1e-9 {
                    return None;
                }

                // Validity: point must be in front of the unprojectable cone.
                let w1 = if alpha <= 0.5 {
                    alpha / (1.0 - alpha)
                } else {
                    (1.0 - alpha) / alpha
                };
                let w2 = (w1 + xi) / (2.0 * w1 * xi + xi * xi + 1.0).sqrt();
                if p.z <= -w2 * d1 {
                    return None;
                }

                let inv_denom = 1.0 / denom;
                let uv = Vector2::new(
                    cam.fx * p.x * inv_denom + cam.cx,
                    cam.fy * p.y * inv_denom + cam.cy,
                );

                // d(denom)/dp through d1, k and d2.
                let dd1 = p / d1;
                let dk = Vector3::new(xi * dd1.x, xi * dd1.y, xi * dd1.z + 1.0);
                let dd2 = Vector3::new(
                    (p.x + k * dk.x) / d2,
                    (p.y + k * dk.y) / d2,
                    k * dk.z / d2,
                );
                let ddenom = alpha * dd2 + (1.0 - alpha) * dk;

                let inv_denom2 = inv_denom * inv_denom;
                let jac = Matrix2x3::new(
                    cam.fx * (denom - p.x * ddenom.x) * inv_denom2,
                    -cam.fx * p.x * ddenom.y * inv_denom2,
                    -cam.fx * p.x * ddenom.z * inv_denom2,
                    -cam.fy * p.y * ddenom.x * inv_denom2,
                    cam.fy * (denom - p.y * ddenom.y) * inv_denom2,
                    -cam.fy * p.y * ddenom.z * inv_denom2,
                );
                Some((uv, jac))
            }
        }
    }

    /// Unproject a pixel to a unit bearing, homogeneous with zero fourth
    /// component. Returns `None` outside the model's valid image region.
    pub fn unproject(&self, uv: &Vector2<f64>) -> Option<Vector4<f64>> {
        match self {
            CameraModel::Pinhole(cam) => {
                let mx = (uv.x - cam.cx) / cam.fx;
                let my = (uv.y - cam.cy) / cam.fy;
                let dir = Vector3::new(mx, my, 1.0).normalize();
                Some(dir.push(0.0))
            }
            CameraModel::DoubleSphere(cam) => {
                let (xi, alpha) = (cam.xi, cam.alpha);
                let mx = (uv.x - cam.cx) / cam.fx;
                let my = (uv.y - cam.cy) / cam.fy;
                let r2 = mx * mx + my * my;

                if alpha > 0.5 && r2 > 1.0 / (2.0 * alpha - 1.0) {
                    return None;
                }

                let mz = (1.0 - alpha * alpha * r2)
                    / (alpha * (1.0 - (2.0 * alpha - 1.0) * r2).sqrt() + 1.0 - alpha);
                let mz2 = mz * mz;
                let scale = (mz * xi + (mz2 + (1.0 - xi * xi) * r2).sqrt()) / (mz2 + r2);

                let dir =
                    Vector3::new(scale * mx, scale * my, scale * mz - xi).normalize();
                Some(dir.push(0.0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pinhole() -> CameraModel {
        CameraModel::Pinhole(PinholeCamera {
            fx: 450.0,
            fy: 450.0,
            cx: 320.0,
            cy: 240.0,
        })
    }

    fn double_sphere() -> CameraModel {
        // Values in the range fitted for fisheye lenses.
        CameraModel::DoubleSphere(DoubleSphereCamera {
            fx: 350.0,
            fy: 350.0,
            cx: 320.0,
            cy: 240.0,
            xi: -0.2,
            alpha: 0.59,
        })
    }

    #[test]
    fn test_project_unproject_roundtrip() {
        for cam in [pinhole(), double_sphere()] {
            let p = Vector3::new(0.4, -0.3, 2.0);
            let uv = cam.project(&p).unwrap();
            let dir = cam.unproject(&uv).unwrap();
            assert_relative_eq!(dir.xyz(), p.normalize(), epsilon = 1e-8);
        }
    }

    #[test]
    fn test_pinhole_rejects_behind_camera() {
        let cam = pinhole();
        assert!(cam.project(&Vector3::new(0.1, 0.1, -1.0)).is_none());
        assert!(cam.project(&Vector3::new(0.1, 0.1, 0.0)).is_none());
    }

    #[test]
    fn test_projection_jacobian_numeric() {
        for cam in [pinhole(), double_sphere()] {
            let p = Vector3::new(0.25, -0.15, 1.7);
            let (_, jac) = cam.project_jac(&p).unwrap();

            let eps = 1e-6;
            for col in 0..3 {
                let mut pp = p;
                let mut pm = p;
                pp[col] += eps;
                pm[col] -= eps;
                let num = (cam.project(&pp).unwrap() - cam.project(&pm).unwrap()) / (2.0 * eps);
                assert_relative_eq!(jac.column(col).into_owned(), num, epsilon = 1e-4);
            }
        }
    }
}
