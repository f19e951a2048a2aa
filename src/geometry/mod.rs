//! Geometry utilities: SE3 transforms, camera model, two-view estimation.

pub mod camera;
pub mod essential;
pub mod se3;
pub mod triangulation;

pub use camera::CameraIntrinsics;
pub use essential::{decompose_essential, estimate_essential, sampson_error};
pub use se3::SE3;
pub use triangulation::triangulate_dlt;
