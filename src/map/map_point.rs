//! MapPoint - a 3D landmark observed by keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::{KeyframeId, MapPointId};

/// A 3D map point observed by one or more keyframes.
///
/// Map points form the sparse reconstruction of the environment. Each one
/// carries the appearance and confidence data the point cloud needs, plus
/// the observation links bundle adjustment walks.
#[derive(Debug, Clone)]
pub struct MapPoint {
    /// Unique identifier.
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// RGB color sampled at the creating observation, components in [0, 1].
    pub color: [f32; 3],

    /// Triangulation confidence in [0, 1]. Decreases with depth: distant
    /// points have larger disparity-quantization error.
    pub confidence: f32,

    /// Depth along the creating camera's optical axis, in scene units.
    pub depth: f64,

    /// One-sigma depth uncertainty. Grows linearly with depth.
    pub depth_sigma: f64,

    /// Keyframes observing this point, mapped to the feature index in that
    /// keyframe: observations[kf_id] = feature_idx.
    pub observations: HashMap<KeyframeId, usize>,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        color: [f32; 3],
        confidence: f32,
        depth: f64,
        depth_sigma: f64,
    ) -> Self {
        Self {
            id,
            position,
            color,
            confidence,
            depth,
            depth_sigma,
            observations: HashMap::new(),
        }
    }

    /// Add an observation from a keyframe.
    pub fn add_observation(&mut self, kf_id: KeyframeId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Remove an observation. Returns true if it existed.
    pub fn erase_observation(&mut self, kf_id: KeyframeId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_bookkeeping() {
        let mut mp = MapPoint::new(
            MapPointId::new(0),
            Vector3::new(1.0, 2.0, 3.0),
            [0.5, 0.5, 0.5],
            0.8,
            3.0,
            0.3,
        );

        mp.add_observation(KeyframeId::new(1), 4);
        mp.add_observation(KeyframeId::new(2), 9);
        assert_eq!(mp.num_observations(), 2);

        assert!(mp.erase_observation(KeyframeId::new(1)));
        assert!(!mp.erase_observation(KeyframeId::new(1)));
        assert_eq!(mp.num_observations(), 1);
        assert_eq!(mp.observations.get(&KeyframeId::new(2)), Some(&9));
    }
}
