//! Keyframe - a selected frame anchoring map structure.

use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;

use crate::features::FeatureSet;
use crate::geometry::SE3;
use crate::image::GrayFrame;

use super::types::{KeyframeId, MapPointId};

/// A keyframe in the map.
///
/// Keyframes are the frames promoted to structural nodes: they keep their
/// features, per-feature colors, the source image (for re-matching against
/// later frames), and the feature-to-map-point associations.
#[derive(Clone)]
pub struct Keyframe {
    /// Unique identifier.
    pub id: KeyframeId,

    /// Capture timestamp relative to stream start.
    pub timestamp: Duration,

    /// Pose: transform from camera to world (T_wc).
    /// p_world = pose.transform_point(p_cam).
    pub pose: SE3,

    /// Detected keypoints and their descriptors.
    pub features: FeatureSet,

    /// RGB color per keypoint, sampled from the source frame, in [0, 1].
    pub colors: Vec<[f32; 3]>,

    /// Source grayscale image, shared with any in-flight refinement work.
    pub frame: Arc<GrayFrame>,

    /// Feature index → map point association.
    pub map_point_ids: Vec<Option<MapPointId>>,
}

impl Keyframe {
    pub fn new(
        id: KeyframeId,
        timestamp: Duration,
        pose: SE3,
        features: FeatureSet,
        colors: Vec<[f32; 3]>,
        frame: Arc<GrayFrame>,
    ) -> Self {
        let num_features = features.len();
        Self {
            id,
            timestamp,
            pose,
            features,
            colors,
            frame,
            map_point_ids: vec![None; num_features],
        }
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Map point associated with a feature, if any.
    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a map point. Returns the previous
    /// association if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        if feature_idx >= self.map_point_ids.len() {
            return None;
        }
        let prev = self.map_point_ids[feature_idx];
        self.map_point_ids[feature_idx] = Some(mp_id);
        prev
    }

    /// Remove the association for a feature.
    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        if feature_idx >= self.map_point_ids.len() {
            return None;
        }
        self.map_point_ids[feature_idx].take()
    }

    /// All associated map points with their feature indices.
    pub fn map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }
}

impl std::fmt::Debug for Keyframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyframe")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .finish()
    }
}
