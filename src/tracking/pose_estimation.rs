//! Two-view relative pose estimation.
//!
//! RANSAC over the normalized eight-point algorithm: sample minimal sets,
//! score every correspondence with the Sampson error, refit on the winning
//! inlier set, then disambiguate the four decomposition candidates with a
//! chirality (positive depth) test.

use nalgebra::{Matrix3, Vector2, Vector3};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TrackFailure};
use crate::features::{FeatureSet, Match};
use crate::geometry::essential::MIN_CORRESPONDENCES;
use crate::geometry::{
    decompose_essential, estimate_essential, sampson_error, triangulate_dlt, CameraIntrinsics, SE3,
};

/// Configuration for the essential-matrix RANSAC estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Maximum number of RANSAC iterations.
    pub ransac_iterations: usize,
    /// Correspondences per minimal sample.
    pub sample_size: usize,
    /// Inlier threshold in pixels, converted internally to normalized
    /// image units via the mean focal length.
    pub inlier_threshold_px: f64,
    /// Minimum inliers for an accepted model.
    pub min_inliers: usize,
    /// Correspondences triangulated per candidate during the chirality test.
    pub chirality_samples: usize,
    /// Seed for RANSAC sampling.
    pub seed: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            ransac_iterations: 100,
            sample_size: 8,
            inlier_threshold_px: 2.0,
            min_inliers: 8,
            chirality_samples: 32,
            seed: 29,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_size < MIN_CORRESPONDENCES {
            return Err(ConfigError::invalid(
                "sample_size",
                "eight-point needs at least 8",
            ));
        }
        if self.min_inliers < MIN_CORRESPONDENCES {
            return Err(ConfigError::invalid(
                "min_inliers",
                "two-view geometry needs at least 8",
            ));
        }
        if !(self.inlier_threshold_px > 0.0) {
            return Err(ConfigError::invalid(
                "inlier_threshold_px",
                "must be positive",
            ));
        }
        if self.chirality_samples == 0 {
            return Err(ConfigError::invalid(
                "chirality_samples",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Relative motion between two frames.
///
/// `rotation` and `translation` give the pose of the later camera expressed
/// in the earlier camera's frame, so composing a world pose with this on the
/// right advances it: T_w_curr = T_w_prev ∘ T_rel. The translation is
/// unit-norm; monocular geometry fixes only its direction.
#[derive(Debug, Clone)]
pub struct RelativePose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Indices into the input match list that support the model.
    pub inliers: Vec<usize>,
    /// Mean Sampson error of the inliers, in squared normalized units.
    pub avg_sampson_error: f64,
}

impl RelativePose {
    /// The relative motion as an SE3 transform.
    pub fn to_se3(&self) -> SE3 {
        SE3::from_rt(self.rotation, self.translation)
    }
}

/// Essential-matrix RANSAC estimator.
pub struct PoseEstimator {
    config: EstimatorConfig,
}

impl PoseEstimator {
    pub fn new(config: EstimatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimates relative camera motion from matched features.
    ///
    /// Exactly `min_inliers` correspondences are enough when they all agree;
    /// fewer is `InsufficientData`. No consensus or no candidate with
    /// positive-depth support is `GeometricDegeneracy`.
    pub fn estimate(
        &self,
        prev: &FeatureSet,
        curr: &FeatureSet,
        matches: &[Match],
        camera: &CameraIntrinsics,
    ) -> Result<RelativePose, TrackFailure> {
        // Normalized coordinate pairs, keeping the originating match index.
        // Non-finite observations are dropped here rather than poisoning SVDs.
        let mut indices = Vec::with_capacity(matches.len());
        let mut pts_a = Vec::with_capacity(matches.len());
        let mut pts_b = Vec::with_capacity(matches.len());
        for (i, m) in matches.iter().enumerate() {
            let kp_a = &prev.keypoints[m.prev_idx];
            let kp_b = &curr.keypoints[m.curr_idx];
            let na = camera.normalize(kp_a.x as f64, kp_a.y as f64);
            let nb = camera.normalize(kp_b.x as f64, kp_b.y as f64);
            if na.x.is_finite() && na.y.is_finite() && nb.x.is_finite() && nb.y.is_finite() {
                indices.push(i);
                pts_a.push(na);
                pts_b.push(nb);
            }
        }

        let n = pts_a.len();
        if n < self.config.min_inliers {
            return Err(TrackFailure::InsufficientData);
        }

        let thr = self.config.inlier_threshold_px / camera.focal_mean();
        let thr_sq = thr * thr;
        let sample_size = self.config.sample_size.min(n);
        let seed = self.config.seed;

        let (best_count, _, best_e) = (0..self.config.ransac_iterations)
            .into_par_iter()
            .map(|iter| {
                let mut rng = SmallRng::seed_from_u64(
                    seed ^ (iter as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                );
                let sample = rand::seq::index::sample(&mut rng, n, sample_size);
                let sample_a: Vec<_> = sample.iter().map(|i| pts_a[i]).collect();
                let sample_b: Vec<_> = sample.iter().map(|i| pts_b[i]).collect();

                let Ok(e) = estimate_essential(&sample_a, &sample_b) else {
                    return (0usize, iter, None);
                };
                let count = count_inliers(&e, &pts_a, &pts_b, thr_sq);
                (count, iter, Some(e))
            })
            .reduce(
                || (0, usize::MAX, None),
                |a, b| {
                    if b.0 > a.0 || (b.0 == a.0 && b.1 < a.1) {
                        b
                    } else {
                        a
                    }
                },
            );

        let Some(mut e) = best_e else {
            return Err(TrackFailure::GeometricDegeneracy);
        };
        if best_count < self.config.min_inliers {
            return Err(TrackFailure::GeometricDegeneracy);
        }

        // Refit on the full inlier set; keep the refit only if it does not
        // lose support.
        let mut inlier_idx = collect_inliers(&e, &pts_a, &pts_b, thr_sq);
        let refit_a: Vec<_> = inlier_idx.iter().map(|&i| pts_a[i]).collect();
        let refit_b: Vec<_> = inlier_idx.iter().map(|&i| pts_b[i]).collect();
        if let Ok(refined) = estimate_essential(&refit_a, &refit_b) {
            let refined_idx = collect_inliers(&refined, &pts_a, &pts_b, thr_sq);
            if refined_idx.len() >= inlier_idx.len() {
                e = refined;
                inlier_idx = refined_idx;
            }
        }
        if inlier_idx.len() < self.config.min_inliers {
            return Err(TrackFailure::GeometricDegeneracy);
        }

        let avg_sampson = inlier_idx
            .iter()
            .map(|&i| sampson_error(&e, &pts_a[i], &pts_b[i]))
            .sum::<f64>()
            / inlier_idx.len() as f64;

        let candidates = decompose_essential(&e).ok_or(TrackFailure::NumericInvalid)?;
        let (r, t) = self.resolve_chirality(&candidates, &pts_a, &pts_b, &inlier_idx)?;

        // (R, t) maps earlier-camera coordinates into the later camera;
        // invert to express the later camera's pose in the earlier frame.
        let rotation = r.transpose();
        let translation = -(r.transpose() * t);

        Ok(RelativePose {
            rotation,
            translation,
            inliers: inlier_idx.into_iter().map(|i| indices[i]).collect(),
            avg_sampson_error: avg_sampson,
        })
    }

    /// Picks the decomposition candidate with the most triangulated points
    /// in front of both cameras.
    fn resolve_chirality(
        &self,
        candidates: &[(Matrix3<f64>, Vector3<f64>); 4],
        pts_a: &[Vector2<f64>],
        pts_b: &[Vector2<f64>],
        inliers: &[usize],
    ) -> Result<(Matrix3<f64>, Vector3<f64>), TrackFailure> {
        let step = (inliers.len() / self.config.chirality_samples).max(1);
        let sampled: Vec<usize> = inliers
            .iter()
            .copied()
            .step_by(step)
            .take(self.config.chirality_samples)
            .collect();

        let pose_a = SE3::identity();
        let mut best: Option<(usize, Matrix3<f64>, Vector3<f64>)> = None;

        for (r, t) in candidates {
            // Second camera pose in the first camera's frame: T_wc = [R|t]⁻¹.
            let pose_b = SE3::from_rt(*r, *t).inverse();

            let mut front = 0usize;
            for &i in &sampled {
                let Some(p) = triangulate_dlt(&pts_a[i], &pts_b[i], &pose_a, &pose_b) else {
                    continue;
                };
                let z_b = (r * p + t).z;
                if p.z > 0.0 && z_b > 0.0 {
                    front += 1;
                }
            }

            if best.as_ref().map_or(true, |(count, _, _)| front > *count) {
                best = Some((front, *r, *t));
            }
        }

        match best {
            Some((count, r, t)) if count > 0 => Ok((r, t)),
            _ => Err(TrackFailure::GeometricDegeneracy),
        }
    }
}

fn count_inliers(
    e: &Matrix3<f64>,
    pts_a: &[Vector2<f64>],
    pts_b: &[Vector2<f64>],
    thr_sq: f64,
) -> usize {
    pts_a
        .iter()
        .zip(pts_b.iter())
        .filter(|(a, b)| sampson_error(e, a, b) < thr_sq)
        .count()
}

fn collect_inliers(
    e: &Matrix3<f64>,
    pts_a: &[Vector2<f64>],
    pts_b: &[Vector2<f64>],
    thr_sq: f64,
) -> Vec<usize> {
    (0..pts_a.len())
        .filter(|&i| sampson_error(e, &pts_a[i], &pts_b[i]) < thr_sq)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Keypoint};
    use nalgebra::Rotation3;

    /// Non-coplanar 3D points in the first camera frame, all in view.
    fn scene(n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| {
                let x = -0.8 + 0.23 * (i % 8) as f64;
                let y = -0.5 + 0.31 * (i % 4) as f64;
                let z = 3.0 + 0.7 * ((i * 7) % 5) as f64;
                Vector3::new(x, y, z)
            })
            .collect()
    }

    /// Projects the scene into two cameras related by X_b = R X_a + t.
    fn feature_pair(
        r: &Matrix3<f64>,
        t: &Vector3<f64>,
        camera: &CameraIntrinsics,
        n: usize,
    ) -> (FeatureSet, FeatureSet, Vec<Match>) {
        let mut prev = FeatureSet::default();
        let mut curr = FeatureSet::default();
        let mut matches = Vec::new();

        for (i, p) in scene(n).iter().enumerate() {
            let q = r * p + t;
            let pa = camera.project(p).unwrap();
            let pb = camera.project(&q).unwrap();
            prev.push(
                Keypoint::new(pa.x as f32, pa.y as f32, 1.0, 1.0),
                Descriptor::ZERO,
            );
            curr.push(
                Keypoint::new(pb.x as f32, pb.y as f32, 1.0, 1.0),
                Descriptor::ZERO,
            );
            matches.push(Match {
                prev_idx: i,
                curr_idx: i,
                distance: 0,
            });
        }
        (prev, curr, matches)
    }

    #[test]
    fn test_too_few_matches_is_insufficient() {
        let camera = CameraIntrinsics::default();
        let r = Matrix3::identity();
        let t = Vector3::new(0.1, 0.0, 0.0);
        let (prev, curr, matches) = feature_pair(&r, &t, &camera, 7);

        let estimator = PoseEstimator::new(EstimatorConfig::default()).unwrap();
        let result = estimator.estimate(&prev, &curr, &matches, &camera);
        assert!(matches!(result, Err(TrackFailure::InsufficientData)));
    }

    #[test]
    fn test_exactly_eight_matches_succeed() {
        let camera = CameraIntrinsics::default();
        let r = Rotation3::from_euler_angles(0.01, -0.02, 0.005).into_inner();
        let t = Vector3::new(-0.15, 0.0, 0.02);
        let (prev, curr, matches) = feature_pair(&r, &t, &camera, 8);

        let estimator = PoseEstimator::new(EstimatorConfig::default()).unwrap();
        let pose = estimator.estimate(&prev, &curr, &matches, &camera).unwrap();
        assert_eq!(pose.inliers.len(), 8);
    }

    #[test]
    fn test_recovers_translation_direction() {
        let camera = CameraIntrinsics::default();
        // Camera slides right: scene moves left in its frame.
        let r = Rotation3::from_euler_angles(0.0, 0.01, 0.0).into_inner();
        let t = Vector3::new(-0.1, 0.0, 0.0);
        let (prev, curr, matches) = feature_pair(&r, &t, &camera, 40);

        let estimator = PoseEstimator::new(EstimatorConfig::default()).unwrap();
        let pose = estimator.estimate(&prev, &curr, &matches, &camera).unwrap();

        // Expected relative pose translation: -Rᵀ t, normalized.
        let expected = -(r.transpose() * t).normalize();
        let cosine = pose.translation.normalize().dot(&expected);
        assert!(cosine > 0.999, "direction off: cos = {cosine}");

        assert!((pose.translation.norm() - 1.0).abs() < 1e-9);
        assert!(pose.avg_sampson_error < 1e-9);
    }

    #[test]
    fn test_outliers_excluded_from_support() {
        let camera = CameraIntrinsics::default();
        let r = Matrix3::identity();
        let t = Vector3::new(-0.2, 0.0, 0.0);
        let (prev, mut curr, matches) = feature_pair(&r, &t, &camera, 30);

        // Corrupt the last four observations.
        for i in 26..30 {
            curr.keypoints[i].x += 35.0;
            curr.keypoints[i].y -= 18.0;
        }

        let estimator = PoseEstimator::new(EstimatorConfig::default()).unwrap();
        let pose = estimator.estimate(&prev, &curr, &matches, &camera).unwrap();

        assert!(pose.inliers.len() >= 20);
        assert!(pose.inliers.iter().all(|&i| i < 26));
    }
}
