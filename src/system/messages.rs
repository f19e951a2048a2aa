//! Messages from the frame path to the refinement worker.

use crate::map::KeyframeId;

/// Sent after a keyframe commit to request a refinement run.
///
/// Carries only the triggering keyframe id; the worker re-reads the current
/// window from the map, so a stale task after further insertions still
/// refines the freshest state.
#[derive(Debug, Clone, Copy)]
pub struct RefineTask {
    pub keyframe_id: KeyframeId,
}
