//! Pinhole camera model.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Pinhole intrinsics. Distortion is assumed already corrected upstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraIntrinsics {
    /// Focal length in pixels, horizontal.
    pub fx: f64,
    /// Focal length in pixels, vertical.
    pub fy: f64,
    /// Principal point x.
    pub cx: f64,
    /// Principal point y.
    pub cy: f64,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        // Nominal 640x480 camera.
        Self {
            fx: 525.0,
            fy: 525.0,
            cx: 320.0,
            cy: 240.0,
        }
    }
}

impl CameraIntrinsics {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fx > 0.0 && self.fx.is_finite()) {
            return Err(ConfigError::invalid("fx", "must be positive and finite"));
        }
        if !(self.fy > 0.0 && self.fy.is_finite()) {
            return Err(ConfigError::invalid("fy", "must be positive and finite"));
        }
        if !self.cx.is_finite() || !self.cy.is_finite() {
            return Err(ConfigError::invalid("cx/cy", "must be finite"));
        }
        Ok(())
    }

    /// Pixel coordinates to normalized camera coordinates (z = 1 plane).
    pub fn normalize(&self, u: f64, v: f64) -> Vector2<f64> {
        Vector2::new((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    /// Projects a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 1e-9 {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Lifts a pixel at a known depth back into the camera frame.
    pub fn back_project(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) / self.fx * depth,
            (v - self.cy) / self.fy * depth,
            depth,
        )
    }

    /// Mean focal length, used to convert pixel thresholds into normalized
    /// image coordinates.
    pub fn focal_mean(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_back_project_round_trip() {
        let cam = CameraIntrinsics::default();
        let p = Vector3::new(0.4, -0.2, 2.5);

        let px = cam.project(&p).unwrap();
        let recovered = cam.back_project(px.x, px.y, p.z);
        assert_relative_eq!(recovered, p, epsilon = 1e-10);
    }

    #[test]
    fn test_project_rejects_points_behind_camera() {
        let cam = CameraIntrinsics::default();
        assert!(cam.project(&Vector3::new(0.1, 0.1, -1.0)).is_none());
        assert!(cam.project(&Vector3::new(0.1, 0.1, 0.0)).is_none());
    }

    #[test]
    fn test_normalize_is_inverse_of_projection_at_unit_depth() {
        let cam = CameraIntrinsics::default();
        let n = cam.normalize(400.0, 300.0);
        let px = cam.project(&Vector3::new(n.x, n.y, 1.0)).unwrap();
        assert_relative_eq!(px, Vector2::new(400.0, 300.0), epsilon = 1e-10);
    }
}
