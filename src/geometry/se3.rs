//! SE(3) rigid-body transforms.
//!
//! Poses are stored as a unit quaternion plus translation. Throughout the
//! crate a keyframe pose is T_wc (camera-to-world): `transform_point` maps
//! camera-frame coordinates into the world frame.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Rigid-body transform in SE(3).
///
/// ```text
/// T = | R  t |      T(p) = R p + t
///     | 0  1 |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Builds a transform from a rotation matrix and translation vector.
    ///
    /// The matrix is assumed orthonormal with determinant +1; the quaternion
    /// conversion renormalizes small numeric drift.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Applies the transform to a point: R p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Inverse transform.
    ///
    /// ```text
    /// T⁻¹ = | Rᵀ  -Rᵀ t |
    ///       | 0     1   |
    /// ```
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition: (self ∘ other)(p) = self(other(p)).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Rotation angle in radians.
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Renormalizes the rotation quaternion.
    ///
    /// Gradient updates nudge the quaternion off the unit sphere; call this
    /// after in-place modification of `rotation` components.
    pub fn renormalize(&mut self) {
        self.rotation = UnitQuaternion::new_normalize(*self.rotation.quaternion());
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
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_leaves_points_unchanged() {
        let p = Vector3::new(1.0, -2.0, 3.0);
        assert_relative_eq!(SE3::identity().transform_point(&p), p, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_round_trip() {
        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.3, 0.7),
            translation: Vector3::new(0.5, 1.5, -2.0),
        };
        let p = Vector3::new(2.0, 0.0, 4.0);

        let round_trip = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(round_trip, p, epsilon = 1e-10);
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, FRAC_PI_2, 0.0),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let b = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.2, 0.0, -0.1),
            translation: Vector3::new(0.0, -1.0, 2.0),
        };
        let p = Vector3::new(0.3, 0.6, -0.9);

        let composed = a.compose(&b).transform_point(&p);
        let sequential = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-10);
    }

    #[test]
    fn test_from_rt_recovers_rotation() {
        let q = UnitQuaternion::from_euler_angles(0.4, 0.2, -0.6);
        let pose = SE3::from_rt(q.to_rotation_matrix().into_inner(), Vector3::zeros());
        assert_relative_eq!(pose.rotation.angle_to(&q), 0.0, epsilon = 1e-10);
    }
}
