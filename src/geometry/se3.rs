//! Rigid-body transform in SE(3).
//!
//! Poses are stored as a unit quaternion plus a translation vector. The
//! tangent-space ordering is `[translation (3), rotation (3)]` throughout the
//! crate, and pose increments are decoupled: translation is additive in the
//! world frame, rotation is left-multiplicative (`R ← Exp(ω)·R`). The
//! adjoint below uses the same ordering.

use nalgebra::{Matrix3, Matrix4, Matrix6, UnitQuaternion, Vector3, Vector6};

use super::so3::skew;

/// A rigid-body transform (rotation followed by translation).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Inverse transform: (R, t)⁻¹ = (Rᵀ, -Rᵀt).
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            translation: -(rot_inv * self.translation),
            rotation: rot_inv,
        }
    }

    /// Composition `self * other` (apply `other` first).
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a point: `R p + t`.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation matrix of this transform.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous 4×4 matrix.
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Adjoint of the transform for tangent vectors ordered `[trans, rot]`:
    ///
    /// ```text
    /// Adj(T) = | R   [t]× R |
    ///          | 0      R   |
    /// ```
    pub fn adjoint(&self) -> Matrix6<f64> {
        let r = self.rotation_matrix();
        let mut adj = Matrix6::zeros();
        adj.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        adj.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
        adj.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(skew(&self.translation) * r));
        adj
    }

    /// Apply the decoupled increment `[δt, δω]`: `t += δt`, `R ← Exp(δω)·R`.
    pub fn apply_inc(&mut self, inc: &Vector6<f64>) {
        self.translation += inc.fixed_rows::<3>(0).into_owned();
        self.rotation =
            UnitQuaternion::from_scaled_axis(inc.fixed_rows::<3>(3).into_owned()) * self.rotation;
    }

    /// Decoupled difference `self ⊖ other`: `[t_self − t_other, Log(R_self R_otherᵀ)]`.
    ///
    /// Inverse of `apply_inc` applied to `other`.
    pub fn diff(&self, other: &Self) -> Vector6<f64> {
        let mut d = Vector6::zeros();
        d.fixed_rows_mut::<3>(0)
            .copy_from(&(self.translation - other.translation));
        d.fixed_rows_mut::<3>(3)
            .copy_from(&(self.rotation * other.rotation.inverse()).scaled_axis());
        d
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn random_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.3, -0.2, 0.8),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = random_pose();
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(
            id.rotation_matrix(),
            Matrix3::identity(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_transform_point_matches_matrix() {
        let t = random_pose();
        let p = Vector3::new(0.7, 1.1, -0.4);
        let via_matrix = (t.matrix() * p.push(1.0)).xyz();
        assert_relative_eq!(t.transform_point(&p), via_matrix, epsilon = 1e-12);
    }

    #[test]
    fn test_apply_inc_diff_roundtrip() {
        let a = random_pose();
        let mut b = a.clone();
        let inc = Vector6::new(0.1, -0.2, 0.05, 0.03, -0.01, 0.07);
        b.apply_inc(&inc);
        assert_relative_eq!(b.diff(&a), inc, epsilon = 1e-12);
    }

    #[test]
    fn test_adjoint_maps_right_tangent_to_left() {
        // First-order check: T·X(ξ) ≈ X(Adj(T)ξ)·T for small ξ, where X(·)
        // is the decoupled increment applied to the identity.
        let t = random_pose();
        let xi = Vector6::new(1e-6, -2e-6, 3e-7, 2e-6, 1e-6, -1e-6);
        let p = Vector3::new(0.4, -0.9, 2.0);

        let mut inner = SE3::identity();
        inner.apply_inc(&xi);
        let via_right = t.compose(&inner).transform_point(&p);

        let mut outer = SE3::identity();
        outer.apply_inc(&(t.adjoint() * xi));
        let via_left = outer.compose(&t).transform_point(&p);

        assert_relative_eq!(via_right, via_left, epsilon = 1e-10);
    }
}
