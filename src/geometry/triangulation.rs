//! Two-view triangulation via the Direct Linear Transform.

use nalgebra::{Matrix4, SMatrix, Vector2, Vector3};

use crate::geometry::SE3;

/// Triangulates a world point from two normalized image observations.
///
/// `pose_a` and `pose_b` are camera-to-world (T_wc); `xn_a` and `xn_b` are
/// coordinates on the z = 1 plane of each camera. Returns `None` for
/// non-finite observations or when the homogeneous solution is at infinity
/// or numerically invalid.
pub fn triangulate_dlt(
    xn_a: &Vector2<f64>,
    xn_b: &Vector2<f64>,
    pose_a: &SE3,
    pose_b: &SE3,
) -> Option<Vector3<f64>> {
    if !(xn_a.x.is_finite() && xn_a.y.is_finite() && xn_b.x.is_finite() && xn_b.y.is_finite()) {
        return None;
    }

    let p_a = projection_matrix(&pose_a.inverse());
    let p_b = projection_matrix(&pose_b.inverse());

    // DLT system A X = 0; each view contributes two rows
    // (x * P[2] - P[0]) and (y * P[2] - P[1]).
    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn_a.x * p_a[(2, j)] - p_a[(0, j)];
        a[(1, j)] = xn_a.y * p_a[(2, j)] - p_a[(1, j)];
        a[(2, j)] = xn_b.x * p_b[(2, j)] - p_b[(0, j)];
        a[(3, j)] = xn_b.y * p_b[(2, j)] - p_b[(1, j)];
    }

    // Right singular vector of the smallest singular value.
    let svd = a.svd(false, true);
    let v = svd.v_t?.transpose();
    let x3d_h = v.column(3);

    if x3d_h[3].abs() < 1e-10 {
        return None;
    }
    let p = Vector3::new(
        x3d_h[0] / x3d_h[3],
        x3d_h[1] / x3d_h[3],
        x3d_h[2] / x3d_h[3],
    );
    if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
        return None;
    }
    Some(p)
}

/// 3x4 projection matrix [R | t] from a world-to-camera pose.
fn projection_matrix(pose_cw: &SE3) -> SMatrix<f64, 3, 4> {
    let r = pose_cw.rotation.to_rotation_matrix();
    let t = &pose_cw.translation;

    SMatrix::<f64, 3, 4>::from_columns(&[
        r.matrix().column(0).into(),
        r.matrix().column(1).into(),
        r.matrix().column(2).into(),
        (*t).into(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn observe(pose_wc: &SE3, p_world: &Vector3<f64>) -> Vector2<f64> {
        let p_cam = pose_wc.inverse().transform_point(p_world);
        Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z)
    }

    #[test]
    fn test_recovers_known_point() {
        let pose_a = SE3::identity();
        let pose_b = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, -0.05, 0.0),
            translation: Vector3::new(0.4, 0.0, 0.0),
        };
        let p_world = Vector3::new(0.3, -0.2, 4.0);

        let xn_a = observe(&pose_a, &p_world);
        let xn_b = observe(&pose_b, &p_world);

        let recovered = triangulate_dlt(&xn_a, &xn_b, &pose_a, &pose_b).unwrap();
        assert_relative_eq!(recovered, p_world, epsilon = 1e-3);
    }

    #[test]
    fn test_recovers_point_behind_translated_pair() {
        let pose_a = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 2.0, -1.0),
        };
        let pose_b = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, 0.1, 0.0),
            translation: Vector3::new(1.3, 2.0, -1.0),
        };
        let p_world = Vector3::new(1.5, 1.7, 5.0);

        let xn_a = observe(&pose_a, &p_world);
        let xn_b = observe(&pose_b, &p_world);

        let recovered = triangulate_dlt(&xn_a, &xn_b, &pose_a, &pose_b).unwrap();
        assert_relative_eq!(recovered, p_world, epsilon = 1e-3);
    }

    #[test]
    fn test_invalid_observation_returns_none() {
        let pose_a = SE3::identity();
        let pose_b = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.5, 0.0, 0.0),
        };
        let bad = Vector2::new(f64::NAN, 0.1);
        let ok = Vector2::new(0.05, 0.1);

        assert!(triangulate_dlt(&bad, &ok, &pose_a, &pose_b).is_none());
    }
}
