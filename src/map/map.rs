//! Map - container for keyframes and map points.
//!
//! The map is the shared structure both the tracking side and the refinement
//! worker read and write. It owns keyframes with their poses and features,
//! the 3D landmarks with their observations, and the bidirectional
//! associations between the two.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::keyframe::Keyframe;
use super::map_point::MapPoint;
use super::types::{KeyframeId, MapPointId};

/// The map containing keyframes and map points.
pub struct Map {
    /// All keyframes.
    keyframes: HashMap<KeyframeId, Keyframe>,

    /// All map points.
    map_points: HashMap<MapPointId, MapPoint>,

    /// Keyframe IDs in insertion (temporal) order.
    order: Vec<KeyframeId>,

    /// Counter for generating unique keyframe IDs.
    next_kf_id: u64,

    /// Counter for generating unique map point IDs.
    next_mp_id: u64,

    /// Bumped on every `clear`. Refinement results computed against an
    /// earlier epoch are stale and must not be applied.
    epoch: u64,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            order: Vec::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            epoch: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ID Generation
    // ─────────────────────────────────────────────────────────────────────────

    /// Generate a new unique keyframe ID.
    pub fn next_keyframe_id(&mut self) -> KeyframeId {
        let id = KeyframeId::new(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    /// Generate a new unique map point ID.
    pub fn next_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    /// Current reset epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframe Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a keyframe built with an ID from `next_keyframe_id`.
    pub fn add_keyframe(&mut self, kf: Keyframe) {
        if kf.id.0 >= self.next_kf_id {
            self.next_kf_id = kf.id.0 + 1;
        }
        self.order.push(kf.id);
        self.keyframes.insert(kf.id, kf);
    }

    pub fn get_keyframe(&self, id: KeyframeId) -> Option<&Keyframe> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyframeId) -> Option<&mut Keyframe> {
        self.keyframes.get_mut(&id)
    }

    /// Most recently inserted keyframe.
    pub fn last_keyframe(&self) -> Option<&Keyframe> {
        self.order.last().and_then(|id| self.keyframes.get(id))
    }

    pub fn last_keyframe_id(&self) -> Option<KeyframeId> {
        self.order.last().copied()
    }

    /// Keyframe IDs in insertion order.
    pub fn keyframe_order(&self) -> &[KeyframeId] {
        &self.order
    }

    /// The newest `n` keyframe IDs, oldest first.
    pub fn recent_keyframes(&self, n: usize) -> &[KeyframeId] {
        let start = self.order.len().saturating_sub(n);
        &self.order[start..]
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &Keyframe> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a map point built with an ID from `next_map_point_id`.
    pub fn add_map_point(&mut self, mp: MapPoint) {
        if mp.id.0 >= self.next_mp_id {
            self.next_mp_id = mp.id.0 + 1;
        }
        self.map_points.insert(mp.id, mp);
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Move a map point, keeping observations intact. Returns false when the
    /// point no longer exists.
    pub fn set_map_point_position(&mut self, id: MapPointId, position: Vector3<f64>) -> bool {
        match self.map_points.get_mut(&id) {
            Some(mp) => {
                mp.position = position;
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a keyframe feature and a
    /// map point. Returns false when either side is missing.
    pub fn associate(&mut self, kf_id: KeyframeId, feature_idx: usize, mp_id: MapPointId) -> bool {
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        } else {
            return false;
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
            true
        } else {
            // Roll the observation back so the two sides stay consistent.
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id);
            }
            false
        }
    }

    /// Fully remove a map point, erasing every keyframe association.
    pub fn remove_map_point(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyframeId, usize)> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.iter().map(|(&k, &i)| (k, i)).collect())
            .unwrap_or_default();

        for (kf_id, feat_idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_map_point(feat_idx);
            }
        }

        self.map_points.remove(&mp_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Clear everything and advance the epoch, invalidating in-flight
    /// refinement work.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.order.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.epoch += 1;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("epoch", &self.epoch)
            .finish()
    }
}
