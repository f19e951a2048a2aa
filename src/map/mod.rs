//! Map module - core map data structures.
//!
//! This module contains:
//! - [`Keyframe`] - selected frames with poses and feature observations
//! - [`MapPoint`] - 3D landmarks observed by keyframes
//! - [`Map`] - container managing keyframes, map points, and associations
//!
//! The map forms a bipartite graph:
//! - keyframes observe map points (KF → MP via `map_point_ids`)
//! - map points track their observers (MP → KF via `observations`)

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::Keyframe;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyframeId, MapPointId};
