//! Keyframe lifecycle and map-point triangulation.
//!
//! The mapper dead-reckons the camera's world pose by composing relative
//! poses, decides when the camera has moved far enough to warrant a new
//! keyframe, and on insertion triangulates map points from correspondences
//! between the last keyframe and the current frame.
//!
//! Depth comes from the stereo-style disparity relation:
//!
//! ```text
//! depth = fx * baseline / disparity
//! ```
//!
//! where baseline is the translation magnitude accumulated since the last
//! keyframe and disparity is the pixel displacement of the matched feature.
//! Each candidate passes a chain of gates (minimum disparity, depth bounds,
//! minimum confidence, finiteness); a candidate failing any gate is dropped,
//! never clamped. The keyframe and all surviving points are committed
//! together, so readers never observe a keyframe without its points.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cloud::CloudAccumulator;
use crate::error::ConfigError;
use crate::features::{FeatureMatcher, FeatureSet, MatcherConfig};
use crate::geometry::{CameraIntrinsics, SE3};
use crate::image::GrayFrame;
use crate::map::{Keyframe, KeyframeId, Map, MapPoint, MapPointId};
use crate::tracking::RelativePose;

/// Configuration for keyframe selection and triangulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Keyframe count below which every tracked frame becomes a keyframe.
    /// Guarantees a usable two-view baseline even under near-stationary
    /// startup motion.
    pub bootstrap_keyframes: usize,
    /// Translation since the last keyframe (world units) that triggers a new
    /// keyframe once bootstrap is complete.
    pub keyframe_translation: f64,
    /// Metric length assigned to each unit-norm relative translation.
    /// Monocular estimation recovers translation direction only; this fixes
    /// the scale of the reconstruction.
    pub translation_step: f64,
    /// Minimum pixel disparity for triangulation. Near-zero disparity makes
    /// depth numerically unstable.
    pub min_disparity: f64,
    /// Closest accepted triangulated depth (world units).
    pub min_depth: f64,
    /// Farthest accepted triangulated depth (world units).
    pub max_depth: f64,
    /// Points whose confidence falls below this are discarded before
    /// insertion.
    pub min_confidence: f32,
    /// Depth uncertainty per unit depth: sigma = slope * depth.
    pub depth_sigma_slope: f64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            bootstrap_keyframes: 2,
            keyframe_translation: 0.05,
            translation_step: 0.02,
            min_disparity: 1.0,
            min_depth: 0.1,
            max_depth: 50.0,
            min_confidence: 0.3,
            depth_sigma_slope: 0.1,
        }
    }
}

impl MapperConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_keyframes == 0 {
            return Err(ConfigError::invalid(
                "bootstrap_keyframes",
                "must be at least 1",
            ));
        }
        if self.keyframe_translation <= 0.0 {
            return Err(ConfigError::invalid(
                "keyframe_translation",
                "must be positive",
            ));
        }
        if self.translation_step <= 0.0 {
            return Err(ConfigError::invalid("translation_step", "must be positive"));
        }
        if self.min_disparity <= 0.0 {
            return Err(ConfigError::invalid("min_disparity", "must be positive"));
        }
        if self.min_depth <= 0.0 || self.max_depth <= self.min_depth {
            return Err(ConfigError::invalid(
                "min_depth/max_depth",
                "require 0 < min_depth < max_depth",
            ));
        }
        if !(0.0..1.0).contains(&self.min_confidence) {
            return Err(ConfigError::invalid(
                "min_confidence",
                "must be in [0, 1)",
            ));
        }
        if self.depth_sigma_slope < 0.0 {
            return Err(ConfigError::invalid(
                "depth_sigma_slope",
                "must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Mapper phase. Bootstrap inserts keyframes unconditionally to establish
/// the initial baseline; Tracking inserts on the translation threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperState {
    Bootstrap,
    Tracking,
}

/// Summary of one committed keyframe.
#[derive(Debug, Clone)]
pub struct KeyframeInsertion {
    pub keyframe_id: KeyframeId,
    /// Consensus-filtered matches against the last keyframe.
    pub num_matches: usize,
    /// New map points triangulated and committed.
    pub points_created: usize,
    /// Matches resolved to an already-existing map point.
    pub points_reobserved: usize,
    pub rejected_low_disparity: usize,
    pub rejected_depth_bounds: usize,
    pub rejected_low_confidence: usize,
    pub rejected_non_finite: usize,
}

/// A triangulated candidate waiting for the commit step.
struct StagedPoint {
    prev_idx: usize,
    curr_idx: usize,
    position: Vector3<f64>,
    color: [f32; 3],
    confidence: f32,
    depth: f64,
    depth_sigma: f64,
}

/// Data for the frame currently being considered for insertion.
pub struct FrameInput<'a> {
    pub timestamp: Duration,
    pub features: &'a FeatureSet,
    /// Per-keypoint RGB sampled from the source image, components in [0, 1].
    pub colors: &'a [[f32; 3]],
    pub frame: &'a Arc<GrayFrame>,
}

/// Keyframe lifecycle manager.
pub struct Mapper {
    config: MapperConfig,
    camera: CameraIntrinsics,
    /// Matcher for keyframe-to-frame correspondences. Separate from the
    /// frame-to-frame tracker so keyframe gaps spanning several frames still
    /// match.
    matcher: FeatureMatcher,
    /// Current camera pose in the world frame (T_wc), dead-reckoned from
    /// relative poses.
    pose: SE3,
    /// World pose at the moment the last keyframe was inserted.
    last_keyframe_pose: SE3,
    num_keyframes: usize,
}

impl Mapper {
    pub fn new(
        config: MapperConfig,
        matcher_config: MatcherConfig,
        camera: CameraIntrinsics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        camera.validate()?;
        Ok(Self {
            config,
            camera,
            matcher: FeatureMatcher::new(matcher_config)?,
            pose: SE3::identity(),
            last_keyframe_pose: SE3::identity(),
            num_keyframes: 0,
        })
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn state(&self) -> MapperState {
        if self.num_keyframes < self.config.bootstrap_keyframes {
            MapperState::Bootstrap
        } else {
            MapperState::Tracking
        }
    }

    /// Current camera pose in the world frame.
    pub fn current_pose(&self) -> SE3 {
        self.pose
    }

    /// Translation magnitude accumulated since the last keyframe. This is
    /// the triangulation baseline.
    pub fn translation_since_keyframe(&self) -> f64 {
        if self.num_keyframes == 0 {
            return 0.0;
        }
        (self.pose.translation - self.last_keyframe_pose.translation).norm()
    }

    /// Fold a relative pose into the world pose.
    ///
    /// The unit-length relative translation is scaled to `translation_step`
    /// before composition. Returns the updated world pose.
    pub fn advance(&mut self, rel: &RelativePose) -> SE3 {
        let step = SE3::from_rt(rel.rotation, rel.translation * self.config.translation_step);
        self.pose = self.pose.compose(&step);
        self.pose
    }

    /// Whether the insertion policy fires for the current pose.
    pub fn should_insert_keyframe(&self) -> bool {
        self.num_keyframes < self.config.bootstrap_keyframes
            || self.translation_since_keyframe() >= self.config.keyframe_translation
    }

    /// Return to the pre-bootstrap state. The caller is responsible for
    /// clearing the map and the accumulator under the same lock scope.
    pub fn reset(&mut self) {
        self.pose = SE3::identity();
        self.last_keyframe_pose = SE3::identity();
        self.num_keyframes = 0;
    }

    /// Insert a keyframe for the current frame if the policy fires.
    ///
    /// Triangulation and all validation gates run before the map is touched;
    /// the keyframe, its map points, their observations, and the cloud
    /// entries are then committed while the caller holds the write locks, so
    /// no partial keyframe is ever visible.
    pub fn process(
        &mut self,
        map: &mut Map,
        cloud: &mut CloudAccumulator,
        input: FrameInput<'_>,
    ) -> Option<KeyframeInsertion> {
        if !self.should_insert_keyframe() {
            return None;
        }

        // Step 1: correspondences against the last keyframe (none for the
        // first keyframe).
        let baseline = self.translation_since_keyframe();
        let matches = match map.last_keyframe() {
            Some(kf) => {
                let raw = self.matcher.match_features(&kf.features, input.features);
                self.matcher
                    .filter_outliers(&raw, &kf.features, input.features)
            }
            None => Vec::new(),
        };

        // Step 2: stage triangulations and reobservations without mutating
        // anything.
        let mut insertion = KeyframeInsertion {
            keyframe_id: KeyframeId::new(0),
            num_matches: matches.len(),
            points_created: 0,
            points_reobserved: 0,
            rejected_low_disparity: 0,
            rejected_depth_bounds: 0,
            rejected_low_confidence: 0,
            rejected_non_finite: 0,
        };
        let mut staged: Vec<StagedPoint> = Vec::new();
        let mut reobserved: Vec<(usize, MapPointId)> = Vec::new();
        let mut claimed_curr: HashSet<usize> = HashSet::new();

        if let Some(kf) = map.last_keyframe() {
            for m in &matches {
                // One map point per current-frame feature slot.
                if !claimed_curr.insert(m.curr_idx) {
                    continue;
                }

                if let Some(mp_id) = kf.get_map_point(m.prev_idx) {
                    reobserved.push((m.curr_idx, mp_id));
                    continue;
                }

                let kp_prev = &kf.features.keypoints[m.prev_idx];
                let kp_curr = &input.features.keypoints[m.curr_idx];
                let disparity = kp_prev.distance_sq(kp_curr).sqrt() as f64;
                if disparity < self.config.min_disparity {
                    insertion.rejected_low_disparity += 1;
                    continue;
                }

                let depth = self.camera.fx * baseline / disparity;
                if depth < self.config.min_depth || depth > self.config.max_depth {
                    insertion.rejected_depth_bounds += 1;
                    continue;
                }

                let depth_sigma = self.config.depth_sigma_slope * depth;
                let confidence = (1.0 / (1.0 + depth_sigma)) as f32;
                if confidence < self.config.min_confidence {
                    insertion.rejected_low_confidence += 1;
                    continue;
                }

                let cam_point =
                    self.camera
                        .back_project(kp_curr.x as f64, kp_curr.y as f64, depth);
                let position = self.pose.transform_point(&cam_point);
                if !position.iter().all(|v| v.is_finite()) {
                    insertion.rejected_non_finite += 1;
                    continue;
                }

                let color = input
                    .colors
                    .get(m.curr_idx)
                    .copied()
                    .unwrap_or([0.5, 0.5, 0.5]);
                staged.push(StagedPoint {
                    prev_idx: m.prev_idx,
                    curr_idx: m.curr_idx,
                    position,
                    color,
                    confidence,
                    depth,
                    depth_sigma,
                });
            }
        }

        // Step 3: commit. The caller holds the write locks for the whole
        // call, so the keyframe and its points appear atomically.
        let last_kf_id = map.last_keyframe_id();
        let kf_id = map.next_keyframe_id();
        insertion.keyframe_id = kf_id;
        map.add_keyframe(Keyframe::new(
            kf_id,
            input.timestamp,
            self.pose,
            input.features.clone(),
            input.colors.to_vec(),
            Arc::clone(input.frame),
        ));

        for (curr_idx, mp_id) in reobserved {
            if map.associate(kf_id, curr_idx, mp_id) {
                insertion.points_reobserved += 1;
            }
        }

        for point in staged {
            let mp_id = map.next_map_point_id();
            map.add_map_point(MapPoint::new(
                mp_id,
                point.position,
                point.color,
                point.confidence,
                point.depth,
                point.depth_sigma,
            ));
            if let Some(prev_kf) = last_kf_id {
                map.associate(prev_kf, point.prev_idx, mp_id);
            }
            map.associate(kf_id, point.curr_idx, mp_id);
            cloud.insert(
                mp_id,
                point.position,
                point.color,
                point.confidence,
                point.depth,
            );
            insertion.points_created += 1;
        }

        self.last_keyframe_pose = self.pose;
        self.num_keyframes += 1;

        info!(
            "inserted {} with {} new points ({} reobserved, {} matches, baseline {:.3})",
            kf_id,
            insertion.points_created,
            insertion.points_reobserved,
            insertion.num_matches,
            baseline,
        );
        debug!(
            "triangulation rejects: {} disparity, {} depth, {} confidence, {} non-finite",
            insertion.rejected_low_disparity,
            insertion.rejected_depth_bounds,
            insertion.rejected_low_confidence,
            insertion.rejected_non_finite,
        );

        Some(insertion)
    }
}
