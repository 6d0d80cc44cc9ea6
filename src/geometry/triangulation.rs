//! Two-view linear triangulation.
//!
//! Triangulates a landmark from a pair of bearing vectors via the direct
//! linear transform. The result is expressed in the first camera frame as a
//! homogeneous 4-vector whose first three components are a unit direction
//! and whose fourth component is the inverse depth along that direction.

use nalgebra::{Matrix4, SMatrix, Vector3, Vector4};

use super::SE3;

/// Triangulate from bearings `f0` (frame 0) and `f1` (frame 1) given the
/// relative pose `T_0_1` (frame 1 expressed in frame 0).
///
/// Returns `None` when the DLT system is degenerate (e.g. zero baseline with
/// parallel bearings).
pub fn triangulate(
    f0: &Vector3<f64>,
    f1: &Vector3<f64>,
    t_0_1: &SE3,
) -> Option<Vector4<f64>> {
    // Projection matrices: P0 = [I | 0] in frame 0, P1 = T_1_0 as 3x4.
    let t_1_0 = t_0_1.inverse();
    let mut p1 = SMatrix::<f64, 3, 4>::zeros();
    p1.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&t_1_0.rotation_matrix());
    p1.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_1_0.translation);

    let mut p0 = SMatrix::<f64, 3, 4>::zeros();
    p0.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&nalgebra::Matrix3::identity());

    // DLT: two equations per view from x × (P X) = 0.
    let mut a = Matrix4::<f64>::zeros();
    a.row_mut(0)
        .copy_from(&(f0.x * p0.row(2) - f0.z * p0.row(0)));
    a.row_mut(1)
        .copy_from(&(f0.y * p0.row(2) - f0.z * p0.row(1)));
    a.row_mut(2)
        .copy_from(&(f1.x * p1.row(2) - f1.z * p1.row(0)));
    a.row_mut(3)
        .copy_from(&(f1.y * p1.row(2) - f1.z * p1.row(1)));

    // Solution is the right singular vector of the smallest singular value.
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let min_idx = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)?;
    let mut point = Vector4::new(
        v_t[(min_idx, 0)],
        v_t[(min_idx, 1)],
        v_t[(min_idx, 2)],
        v_t[(min_idx, 3)],
    );

    let dir_norm = point.xyz().norm();
    if dir_norm < 1e-12 {
        return None;
    }
    point /= dir_norm;

    // Keep the direction aligned with the observed bearing.
    if point.xyz().dot(f0) < 0.0 {
        point = -point;
    }

    Some(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_triangulate_known_point() {
        // Point at (0.3, -0.2, 4.0) in frame 0, second camera 0.2m to the right.
        let p = Vector3::new(0.3, -0.2, 4.0);
        let t_0_1 = SE3::new(UnitQuaternion::identity(), Vector3::new(0.2, 0.0, 0.0));

        let f0 = p.normalize();
        let p_in_1 = t_0_1.inverse().transform_point(&p);
        let f1 = p_in_1.normalize();

        let res = triangulate(&f0, &f1, &t_0_1).unwrap();
        assert_relative_eq!(res.xyz().norm(), 1.0, epsilon = 1e-10);

        let recovered = res.xyz() / res.w;
        assert_relative_eq!(recovered, p, epsilon = 1e-6);
    }

    #[test]
    fn test_triangulate_inverse_depth_positive_in_front() {
        let p = Vector3::new(-0.5, 0.1, 2.5);
        let t_0_1 = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.15, 0.02, 0.0),
        );
        let f0 = p.normalize();
        let f1 = t_0_1.inverse().transform_point(&p).normalize();

        let res = triangulate(&f0, &f1, &t_0_1).unwrap();
        assert!(res.w > 0.0);
        assert_relative_eq!(1.0 / res.w, p.norm(), epsilon = 1e-4);
    }
}
