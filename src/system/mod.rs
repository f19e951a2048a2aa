//! Pipeline orchestration and thread management.
//!
//! This module contains the top-level `SlamPipeline` that runs the frame
//! path and spawns the refinement worker, along with the shared state and
//! the messaging types between them.

pub mod messages;
pub mod pipeline;
pub mod result;
pub mod shared_state;

pub use messages::RefineTask;
pub use pipeline::SlamPipeline;
pub use result::{FrameMetrics, FrameResult, FrameStatus, StageTimings};
pub use shared_state::SharedState;
