//! Map construction: keyframe insertion on the frame path, window
//! refinement and cloud maintenance on the background worker.

pub mod mapper;
pub mod refiner;

pub use mapper::{FrameInput, KeyframeInsertion, Mapper, MapperConfig, MapperState};
pub use refiner::Refiner;
