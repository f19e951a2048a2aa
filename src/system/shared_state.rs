//! State shared between the frame-processing path and the refinement worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cloud::CloudAccumulator;
use crate::map::Map;

/// Shared stores and control flags.
///
/// Lock ordering: when both locks are needed, take `map` before `cloud`.
/// The frame path holds both write locks only for keyframe commits; the
/// worker holds them only for the apply/filter steps, so snapshot readers
/// are never starved for long.
pub struct SharedState {
    /// Keyframes and map points. The frame path writes on keyframe
    /// insertion; the worker writes refined poses and positions.
    pub map: RwLock<Map>,

    /// Renderable point set mirroring accepted map points.
    pub cloud: RwLock<CloudAccumulator>,

    /// Raised by the frame path when a new keyframe is on its way, so an
    /// in-flight refinement run wraps up between passes.
    pub abort_refine: AtomicBool,

    /// Asks the worker to exit its receive loop.
    pub shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(cloud: CloudAccumulator) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(Map::new()),
            cloud: RwLock::new(cloud),
            abort_refine: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    /// Check whether an in-flight refinement should stop early.
    pub fn should_abort_refine(&self) -> bool {
        self.abort_refine.load(Ordering::SeqCst)
    }

    /// Signal that refinement should be aborted (new keyframe arriving).
    pub fn request_abort_refine(&self) {
        self.abort_refine.store(true, Ordering::SeqCst);
    }

    /// Clear the abort flag before starting fresh work.
    pub fn clear_abort_refine(&self) {
        self.abort_refine.store(false, Ordering::SeqCst);
    }

    /// Request shutdown of the refinement worker.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
