//! Point cloud accumulation and filtering.
//!
//! Mirrors the accepted map points as parallel arrays sized for rendering
//! and export. Filters report the removed IDs so the caller can propagate
//! removals back to the map; all filters are safe to run at any time and
//! in any order.

use std::collections::HashMap;

use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::map::MapPointId;

/// Cloud filter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Points below this confidence are dropped by the confidence filter.
    pub min_confidence: f32,
    /// Neighborhood radius for the statistical outlier filter, scene units.
    pub outlier_radius: f64,
    /// Outlier cutoff in standard deviations above the mean neighbor
    /// distance.
    pub outlier_k: f64,
    /// Voxel edge length for deduplication, scene units.
    pub voxel_size: f64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            outlier_radius: 0.5,
            outlier_k: 2.0,
            voxel_size: 0.05,
        }
    }
}

impl CloudConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.outlier_radius > 0.0) {
            return Err(ConfigError::invalid("outlier_radius", "must be positive"));
        }
        if !(self.outlier_k > 0.0) {
            return Err(ConfigError::invalid("outlier_k", "must be positive"));
        }
        if !(self.voxel_size > 0.0) {
            return Err(ConfigError::invalid("voxel_size", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::invalid("min_confidence", "expected in [0, 1]"));
        }
        Ok(())
    }
}

/// Consistent copy of the cloud for rendering or export.
///
/// Positions and colors are flat triples; all arrays share `count` entries.
#[derive(Debug, Clone, Default)]
pub struct CloudSnapshot {
    pub positions: Vec<f32>,
    pub colors: Vec<f32>,
    pub confidences: Vec<f32>,
    pub depths: Vec<f32>,
    pub count: usize,
}

/// Accumulated point cloud with parallel per-point arrays.
pub struct CloudAccumulator {
    config: CloudConfig,
    ids: Vec<MapPointId>,
    positions: Vec<Vector3<f64>>,
    colors: Vec<[f32; 3]>,
    confidences: Vec<f32>,
    depths: Vec<f64>,
    /// Point ID → array slot.
    index: HashMap<MapPointId, usize>,
}

impl CloudAccumulator {
    pub fn new(config: CloudConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            ids: Vec::new(),
            positions: Vec::new(),
            colors: Vec::new(),
            confidences: Vec::new(),
            depths: Vec::new(),
            index: HashMap::new(),
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Insert or overwrite a point.
    pub fn insert(
        &mut self,
        id: MapPointId,
        position: Vector3<f64>,
        color: [f32; 3],
        confidence: f32,
        depth: f64,
    ) {
        if let Some(&slot) = self.index.get(&id) {
            self.positions[slot] = position;
            self.colors[slot] = color;
            self.confidences[slot] = confidence;
            self.depths[slot] = depth;
            return;
        }
        let slot = self.ids.len();
        self.ids.push(id);
        self.positions.push(position);
        self.colors.push(color);
        self.confidences.push(confidence);
        self.depths.push(depth);
        self.index.insert(id, slot);
    }

    /// Remove a point. Returns true if it existed.
    pub fn remove(&mut self, id: MapPointId) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };
        self.ids.swap_remove(slot);
        self.positions.swap_remove(slot);
        self.colors.swap_remove(slot);
        self.confidences.swap_remove(slot);
        self.depths.swap_remove(slot);
        // The former tail now lives at `slot`.
        if slot < self.ids.len() {
            self.index.insert(self.ids[slot], slot);
        }
        true
    }

    /// Move an existing point.
    pub fn update_position(&mut self, id: MapPointId, position: Vector3<f64>) {
        if let Some(&slot) = self.index.get(&id) {
            self.positions[slot] = position;
        }
    }

    /// Current (id, position) pairs.
    pub fn iter_points(&self) -> impl Iterator<Item = (MapPointId, Vector3<f64>)> + '_ {
        self.ids.iter().zip(self.positions.iter()).map(|(&id, &p)| (id, p))
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.positions.clear();
        self.colors.clear();
        self.confidences.clear();
        self.depths.clear();
        self.index.clear();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filters
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop points below the configured minimum confidence.
    ///
    /// Returns the removed IDs.
    pub fn filter_confidence(&mut self) -> Vec<MapPointId> {
        let min = self.config.min_confidence;
        let removed: Vec<MapPointId> = self
            .ids
            .iter()
            .zip(self.confidences.iter())
            .filter(|(_, &c)| c < min)
            .map(|(&id, _)| id)
            .collect();
        for &id in &removed {
            self.remove(id);
        }
        removed
    }

    /// Statistical outlier removal.
    ///
    /// Computes each point's mean distance to neighbors within the
    /// configured radius, then drops points beyond `mean + k·σ` of the
    /// global distribution. Points with no neighbors at all are treated as
    /// maximal-distance outliers and always dropped.
    ///
    /// Returns the removed IDs.
    pub fn filter_statistical(&mut self) -> Vec<MapPointId> {
        let n = self.positions.len();
        if n == 0 {
            return Vec::new();
        }

        let radius_sq = self.config.outlier_radius * self.config.outlier_radius;
        let positions = &self.positions;

        // Mean neighbor distance per point; None when isolated.
        let mean_dists: Vec<Option<f64>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut sum = 0.0;
                let mut count = 0usize;
                for j in 0..n {
                    if i == j {
                        continue;
                    }
                    let d_sq = (positions[i] - positions[j]).norm_squared();
                    if d_sq <= radius_sq {
                        sum += d_sq.sqrt();
                        count += 1;
                    }
                }
                (count > 0).then(|| sum / count as f64)
            })
            .collect();

        let connected: Vec<f64> = mean_dists.iter().filter_map(|d| *d).collect();
        let cutoff = if connected.is_empty() {
            0.0
        } else {
            let mean = connected.iter().sum::<f64>() / connected.len() as f64;
            let var = connected
                .iter()
                .map(|d| (d - mean) * (d - mean))
                .sum::<f64>()
                / connected.len() as f64;
            mean + self.config.outlier_k * var.sqrt()
        };

        let removed: Vec<MapPointId> = self
            .ids
            .iter()
            .zip(mean_dists.iter())
            .filter(|(_, d)| match d {
                Some(dist) => *dist > cutoff,
                None => true,
            })
            .map(|(&id, _)| id)
            .collect();
        for &id in &removed {
            self.remove(id);
        }
        removed
    }

    /// Voxel deduplication.
    ///
    /// Points sharing a grid cell collapse into one entry at their averaged
    /// position/color/confidence/depth; the cell's first point survives.
    /// The averaged position stays inside the cell, so re-running with the
    /// same size changes nothing.
    ///
    /// Returns the removed IDs.
    pub fn merge_voxels(&mut self) -> Vec<MapPointId> {
        let size = self.config.voxel_size;

        // Cell → slots, in first-seen order.
        let mut cells: HashMap<(i64, i64, i64), Vec<usize>> = HashMap::new();
        let mut cell_order: Vec<(i64, i64, i64)> = Vec::new();
        for (slot, p) in self.positions.iter().enumerate() {
            let key = (
                (p.x / size).floor() as i64,
                (p.y / size).floor() as i64,
                (p.z / size).floor() as i64,
            );
            let members = cells.entry(key).or_default();
            if members.is_empty() {
                cell_order.push(key);
            }
            members.push(slot);
        }

        let mut removed = Vec::new();
        let mut ids = Vec::with_capacity(cell_order.len());
        let mut positions = Vec::with_capacity(cell_order.len());
        let mut colors = Vec::with_capacity(cell_order.len());
        let mut confidences = Vec::with_capacity(cell_order.len());
        let mut depths = Vec::with_capacity(cell_order.len());
        let mut index = HashMap::with_capacity(cell_order.len());

        for key in cell_order {
            let members = &cells[&key];
            let m = members.len() as f64;

            let mut position = Vector3::zeros();
            let mut color = [0.0f32; 3];
            let mut confidence = 0.0f32;
            let mut depth = 0.0f64;
            for &slot in members {
                position += self.positions[slot];
                for c in 0..3 {
                    color[c] += self.colors[slot][c];
                }
                confidence += self.confidences[slot];
                depth += self.depths[slot];
            }
            position /= m;
            for c in color.iter_mut() {
                *c /= m as f32;
            }
            confidence /= m as f32;
            depth /= m;

            let survivor = self.ids[members[0]];
            removed.extend(members[1..].iter().map(|&slot| self.ids[slot]));

            index.insert(survivor, ids.len());
            ids.push(survivor);
            positions.push(position);
            colors.push(color);
            confidences.push(confidence);
            depths.push(depth);
        }

        self.ids = ids;
        self.positions = positions;
        self.colors = colors;
        self.confidences = confidences;
        self.depths = depths;
        self.index = index;

        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Output
    // ─────────────────────────────────────────────────────────────────────────

    /// Per-point colors on a depth ramp, near = blue through to far = red.
    ///
    /// Purely for visualization; stored colors are untouched.
    pub fn colorize_by_depth(&self, near: f64, far: f64) -> Vec<[f32; 3]> {
        let span = (far - near).max(1e-9);
        self.depths
            .iter()
            .map(|&d| {
                let t = ((d - near) / span).clamp(0.0, 1.0);
                hue_to_rgb(240.0 * (1.0 - t))
            })
            .collect()
    }

    /// Flat-array copy for render/export collaborators.
    pub fn snapshot(&self) -> CloudSnapshot {
        let mut positions = Vec::with_capacity(self.positions.len() * 3);
        for p in &self.positions {
            positions.push(p.x as f32);
            positions.push(p.y as f32);
            positions.push(p.z as f32);
        }
        let mut colors = Vec::with_capacity(self.colors.len() * 3);
        for c in &self.colors {
            colors.extend_from_slice(c);
        }

        CloudSnapshot {
            positions,
            colors,
            confidences: self.confidences.clone(),
            depths: self.depths.iter().map(|&d| d as f32).collect(),
            count: self.ids.len(),
        }
    }
}

/// Fully saturated hue (degrees) to RGB.
fn hue_to_rgb(hue: f64) -> [f32; 3] {
    let h = hue.rem_euclid(360.0) / 60.0;
    let x = (1.0 - (h % 2.0 - 1.0).abs()) as f32;
    match h as u32 {
        0 => [1.0, x, 0.0],
        1 => [x, 1.0, 0.0],
        2 => [0.0, 1.0, x],
        3 => [0.0, x, 1.0],
        4 => [x, 0.0, 1.0],
        _ => [1.0, 0.0, x],
    }
}
