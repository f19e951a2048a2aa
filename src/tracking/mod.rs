//! Frame-to-frame tracking: relative pose from matched features.

pub mod pose_estimation;

pub use pose_estimation::{EstimatorConfig, PoseEstimator, RelativePose};
