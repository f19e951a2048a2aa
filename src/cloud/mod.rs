//! Renderable point cloud: accumulation, filtering, snapshots.

pub mod accumulator;

pub use accumulator::{CloudAccumulator, CloudConfig, CloudSnapshot};
