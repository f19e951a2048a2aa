//! Feature extraction and matching.
//!
//! Harris corners with binary patch descriptors, matched frame to frame by
//! Hamming distance and cleaned up with a translation consensus filter.

pub mod descriptor;
pub mod detector;
pub mod keypoint;
pub mod matcher;

pub use descriptor::BriefExtractor;
pub use detector::{DetectorConfig, FeatureDetector};
pub use keypoint::{hamming_distance, Descriptor, FeatureSet, Keypoint, Match, DESCRIPTOR_BYTES};
pub use matcher::{FeatureMatcher, MatcherConfig};
