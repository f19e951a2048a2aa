//! Failure taxonomy for the tracking pipeline.
//!
//! Every per-frame failure here is recoverable: the pipeline keeps its state
//! and retries on the next frame. Construction and configuration problems are
//! the only errors that abort startup.

use thiserror::Error;

/// Why tracking produced no map update for a frame.
///
/// Components signal these through absent results (`None`, empty sets); the
/// pipeline translates them into a degraded status for the caller. None of
/// them is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackFailure {
    /// Fewer than 8 correspondences, an empty feature set, or a frame with
    /// zero detected corners.
    #[error("insufficient data for two-view geometry")]
    InsufficientData,

    /// RANSAC found no model with acceptable inlier support, or no pose
    /// hypothesis passed the chirality test.
    #[error("geometric degeneracy: no acceptable two-view model")]
    GeometricDegeneracy,

    /// A NaN or otherwise non-finite result from a geometric computation.
    /// Offending points are discarded individually; this variant surfaces
    /// only when the whole frame produced nothing usable.
    #[error("numerically invalid geometry result")]
    NumericInvalid,
}

/// Invalid construction-time configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}

/// A frame buffer that does not match its declared dimensions.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame buffer has {actual} bytes, expected {expected} for {width}x{height}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("frame dimensions must be non-zero")]
    ZeroDimension,
}
