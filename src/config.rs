//! Pipeline configuration, loadable from TOML.
//!
//! Every section has working defaults, so an empty file (or no file at all)
//! yields the stock 640x480 setup. Sections map to TOML tables:
//!
//! ```text
//! [camera]
//! fx = 525.0
//!
//! [mapper]
//! keyframe_translation = 0.08
//! ```
//!
//! Unknown-to-invalid values are caught by `validate`, which runs each
//! section's own validation before any component is constructed.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cloud::CloudConfig;
use crate::error::ConfigError;
use crate::features::{DetectorConfig, MatcherConfig};
use crate::geometry::CameraIntrinsics;
use crate::mapping::MapperConfig;
use crate::optimizer::BaConfig;
use crate::tracking::EstimatorConfig;

/// Top-level configuration for [`SlamPipeline`](crate::system::SlamPipeline).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub camera: CameraIntrinsics,
    pub detector: DetectorConfig,
    pub matcher: MatcherConfig,
    pub estimator: EstimatorConfig,
    pub mapper: MapperConfig,
    pub refine: BaConfig,
    pub cloud: CloudConfig,
}

impl PipelineConfig {
    /// Load a TOML file, filling omitted sections and fields with defaults.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.camera.validate()?;
        self.detector.validate()?;
        self.matcher.validate()?;
        self.estimator.validate()?;
        self.mapper.validate()?;
        self.refine.validate()?;
        self.cloud.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let text = r#"
            [camera]
            fx = 600.0

            [mapper]
            keyframe_translation = 0.1
        "#;
        let config: PipelineConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();

        assert_eq!(config.camera.fx, 600.0);
        assert_eq!(config.camera.fy, 525.0);
        assert_eq!(config.mapper.keyframe_translation, 0.1);
        assert_eq!(config.mapper.translation_step, 0.02);
        assert_eq!(config.refine.window, 3);
    }

    #[test]
    fn test_invalid_section_rejected() {
        let text = r#"
            [refine]
            window = 1
        "#;
        let config: PipelineConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_path_roundtrip() {
        let path = std::env::temp_dir()
            .join(format!("monoscan-config-{}.toml", std::process::id()));
        fs::write(&path, "[estimator]\nransac_iterations = 50\n").unwrap();

        let config = PipelineConfig::from_toml_path(&path).unwrap();
        assert_eq!(config.estimator.ransac_iterations, 50);
        assert_eq!(config.detector.max_keypoints, 600);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = PipelineConfig::from_toml_path("/nonexistent/slam.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
