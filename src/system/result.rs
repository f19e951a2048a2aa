//! Per-frame pipeline output and diagnostics.
//!
//! Every call that hands the pipeline a frame gets one of these back:
//! - the high level frame status (bootstrapping / tracking / degraded)
//! - the dead-reckoned world pose after this frame
//! - correspondence counts and the estimated motion magnitude
//! - a per-stage timing breakdown for profiling

use crate::error::TrackFailure;
use crate::geometry::SE3;
use crate::map::KeyframeId;

/// What the pipeline did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Still collecting the initial keyframes; poses are not yet meaningful.
    Bootstrapping,
    /// Normal operation: motion estimated and folded into the trajectory.
    Tracking,
    /// Tracking failed for this frame. State is retained and the next frame
    /// is matched against the same reference.
    Degraded(TrackFailure),
    /// The frame arrived while another was still being processed and was
    /// discarded without touching any state.
    Dropped,
}

impl FrameStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, FrameStatus::Degraded(_))
    }
}

/// Summary of processing for a single frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub status: FrameStatus,
    /// World pose of the camera after this frame (T_wc). For degraded or
    /// dropped frames this is the last successfully tracked pose.
    pub pose: SE3,
    /// Keyframe committed for this frame, if the insertion policy fired.
    pub keyframe_id: Option<KeyframeId>,
    pub metrics: FrameMetrics,
    pub timing: StageTimings,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy)]
pub struct FrameMetrics {
    pub n_features: usize,
    /// Consensus-filtered frame-to-frame matches.
    pub n_matches: usize,
    /// Matches supporting the accepted two-view model.
    pub n_inliers: usize,
    pub inlier_ratio: f64,
    /// Translation magnitude applied to the pose this frame, in world units.
    pub delta_translation: f64,
    /// Degraded frames since the last successful track.
    pub consecutive_failures: u32,
}

impl FrameMetrics {
    pub fn zero() -> Self {
        Self {
            n_features: 0,
            n_matches: 0,
            n_inliers: 0,
            inlier_ratio: 0.0,
            delta_translation: 0.0,
            consecutive_failures: 0,
        }
    }
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone, Copy)]
pub struct StageTimings {
    pub total_ms: f64,
    pub detect_ms: f64,
    pub match_ms: f64,
    pub estimate_ms: f64,
    /// Keyframe decision, triangulation, and map commit.
    pub map_ms: f64,
}

impl StageTimings {
    pub fn zero() -> Self {
        Self {
            total_ms: 0.0,
            detect_ms: 0.0,
            match_ms: 0.0,
            estimate_ms: 0.0,
            map_ms: 0.0,
        }
    }
}
