//! Harris corner detection over a small scale pyramid.
//!
//! Pipeline per scale:
//! 1. Sobel 3x3 gradients on the (rescaled) luminance image
//! 2. structure tensor summed over a square window
//! 3. corner response `det(M) - k * trace(M)^2`
//! 4. 3x3 local maxima above the response threshold
//!
//! Candidates from all scales are mapped back into base-image coordinates,
//! deduplicated by radius non-maximum suppression, capped at the configured
//! maximum, and described with BRIEF. Output order is response-descending.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::features::descriptor::BriefExtractor;
use crate::features::keypoint::{FeatureSet, Keypoint};
use crate::image::GrayFrame;

/// Detector tuning. Defaults suit 640x480 indoor footage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Hard cap on keypoints per frame, kept score-descending.
    pub max_keypoints: usize,
    /// Minimum Harris response for a candidate (luminance normalized to [0,1]).
    pub response_threshold: f32,
    /// Harris sensitivity factor k.
    pub harris_k: f32,
    /// Non-maximum suppression radius in base-image pixels, applied across scales.
    pub nms_radius: f32,
    /// Pyramid scale factors. 1.0 is the base image.
    pub scales: Vec<f32>,
    /// Half-width of the structure tensor window (2 gives a 5x5 window).
    pub window_radius: usize,
    /// Seed for the BRIEF sampling pattern. Must stay constant for the
    /// lifetime of the pipeline so descriptors remain comparable.
    pub descriptor_seed: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_keypoints: 600,
            response_threshold: 0.01,
            harris_k: 0.04,
            nms_radius: 8.0,
            scales: vec![0.8, 1.0, 1.2],
            window_radius: 2,
            descriptor_seed: 42,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_keypoints == 0 {
            return Err(ConfigError::invalid("max_keypoints", "must be positive"));
        }
        if !(self.harris_k > 0.0 && self.harris_k < 0.25) {
            return Err(ConfigError::invalid("harris_k", "expected in (0, 0.25)"));
        }
        if self.nms_radius < 0.0 {
            return Err(ConfigError::invalid("nms_radius", "must be non-negative"));
        }
        if self.scales.is_empty() {
            return Err(ConfigError::invalid("scales", "at least one scale required"));
        }
        if self.scales.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(ConfigError::invalid("scales", "factors must be finite and positive"));
        }
        Ok(())
    }
}

/// Multi-scale Harris detector with a fixed BRIEF extractor.
pub struct FeatureDetector {
    config: DetectorConfig,
    extractor: BriefExtractor,
}

impl FeatureDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let extractor = BriefExtractor::seeded(config.descriptor_seed);
        Ok(Self { config, extractor })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect and describe features in one frame.
    ///
    /// A blank or texture-free frame yields an empty set; that is not an
    /// error, the caller skips tracking for the frame.
    pub fn detect(&self, frame: &GrayFrame) -> FeatureSet {
        let mut candidates = Vec::new();

        for &scale in &self.config.scales {
            let owned;
            let img = if (scale - 1.0).abs() < 1e-6 {
                frame
            } else {
                owned = frame.resize(scale);
                &owned
            };
            self.collect_scale_candidates(img, scale, &mut candidates);
        }

        // Strongest first, then greedy radius suppression across all scales.
        candidates
            .sort_unstable_by(|a, b| b.response.partial_cmp(&a.response).unwrap_or(std::cmp::Ordering::Equal));
        let keypoints = self.suppress(&candidates);

        let descriptors = keypoints
            .par_iter()
            .map(|kp| self.extractor.describe(frame, kp))
            .collect();

        FeatureSet {
            keypoints,
            descriptors,
        }
    }

    /// Harris candidates for one pyramid level, in base-image coordinates.
    fn collect_scale_candidates(&self, img: &GrayFrame, scale: f32, out: &mut Vec<Keypoint>) {
        let w = img.width() as usize;
        let h = img.height() as usize;
        let margin = self.config.window_radius + 1;
        if w <= 2 * margin || h <= 2 * margin {
            return;
        }

        let responses = self.harris_responses(img);

        // 3x3 local maxima above threshold. Plateaus keep the first pixel in
        // scan order via the strict comparison on trailing neighbors.
        let threshold = self.config.response_threshold;
        for y in margin..h - margin {
            for x in margin..w - margin {
                let r = responses[y * w + x];
                if r <= threshold {
                    continue;
                }
                let mut is_max = true;
                'nhood: for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let ny = (y as i64 + dy) as usize;
                        let nx = (x as i64 + dx) as usize;
                        let neighbor = responses[ny * w + nx];
                        let later = dy > 0 || (dy == 0 && dx > 0);
                        if neighbor > r || (!later && neighbor == r) {
                            is_max = false;
                            break 'nhood;
                        }
                    }
                }
                if is_max {
                    out.push(Keypoint::new(x as f32 / scale, y as f32 / scale, r, scale));
                }
            }
        }
    }

    /// Per-pixel Harris responses, parallelized over rows.
    fn harris_responses(&self, img: &GrayFrame) -> Vec<f32> {
        let w = img.width() as usize;
        let h = img.height() as usize;
        let lum: Vec<f32> = img.pixels().iter().map(|&p| p as f32 / 255.0).collect();

        let mut ix = vec![0.0f32; w * h];
        let mut iy = vec![0.0f32; w * h];

        ix.par_chunks_mut(w)
            .zip(iy.par_chunks_mut(w))
            .enumerate()
            .for_each(|(y, (ix_row, iy_row))| {
                if y == 0 || y >= h - 1 {
                    return;
                }
                let above = &lum[(y - 1) * w..y * w];
                let here = &lum[y * w..(y + 1) * w];
                let below = &lum[(y + 1) * w..(y + 2) * w];
                for x in 1..w - 1 {
                    ix_row[x] = (above[x + 1] + 2.0 * here[x + 1] + below[x + 1])
                        - (above[x - 1] + 2.0 * here[x - 1] + below[x - 1]);
                    iy_row[x] = (below[x - 1] + 2.0 * below[x] + below[x + 1])
                        - (above[x - 1] + 2.0 * above[x] + above[x + 1]);
                }
            });

        let r = self.config.window_radius;
        let k = self.config.harris_k;
        let margin = r + 1;

        let mut responses = vec![0.0f32; w * h];
        responses
            .par_chunks_mut(w)
            .enumerate()
            .for_each(|(y, row)| {
                if y < margin || y >= h - margin {
                    return;
                }
                for x in margin..w - margin {
                    let mut sxx = 0.0f32;
                    let mut syy = 0.0f32;
                    let mut sxy = 0.0f32;
                    for wy in y - r..=y + r {
                        let base = wy * w;
                        for wx in x - r..=x + r {
                            let gx = ix[base + wx];
                            let gy = iy[base + wx];
                            sxx += gx * gx;
                            syy += gy * gy;
                            sxy += gx * gy;
                        }
                    }
                    let det = sxx * syy - sxy * sxy;
                    let trace = sxx + syy;
                    row[x] = det - k * trace * trace;
                }
            });

        responses
    }

    /// Greedy radius NMS over score-sorted candidates, capped at the maximum.
    fn suppress(&self, sorted: &[Keypoint]) -> Vec<Keypoint> {
        let radius_sq = self.config.nms_radius * self.config.nms_radius;
        let mut accepted: Vec<Keypoint> = Vec::with_capacity(self.config.max_keypoints);

        for cand in sorted {
            if accepted.len() >= self.config.max_keypoints {
                break;
            }
            if accepted.iter().all(|kp| kp.distance_sq(cand) >= radius_sq) {
                accepted.push(*cand);
            }
        }

        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bright squares on a dark background, which Harris sees as 4 corners each.
    fn frame_with_squares(width: u32, height: u32, step: u32, size: u32) -> GrayFrame {
        let mut pixels = vec![20u8; width as usize * height as usize];
        let mut y = step / 2;
        while y + size < height {
            let mut x = step / 2;
            while x + size < width {
                for sy in y..y + size {
                    for sx in x..x + size {
                        pixels[sy as usize * width as usize + sx as usize] = 230;
                    }
                }
                x += step;
            }
            y += step;
        }
        GrayFrame::from_gray(width, height, &pixels).unwrap()
    }

    #[test]
    fn test_cap_and_descending_order() {
        let config = DetectorConfig {
            max_keypoints: 25,
            ..Default::default()
        };
        let detector = FeatureDetector::new(config).unwrap();
        let frame = frame_with_squares(320, 240, 40, 14);

        let features = detector.detect(&frame);

        assert!(!features.is_empty());
        assert!(features.len() <= 25);
        assert_eq!(features.keypoints.len(), features.descriptors.len());
        for pair in features.keypoints.windows(2) {
            assert!(pair[0].response >= pair[1].response);
        }
    }

    #[test]
    fn test_blank_frame_yields_empty_set() {
        let detector = FeatureDetector::new(DetectorConfig::default()).unwrap();
        let frame = GrayFrame::from_gray(160, 120, &[128u8; 160 * 120]).unwrap();

        let features = detector.detect(&frame);
        assert!(features.is_empty());
    }

    #[test]
    fn test_nms_enforces_spacing() {
        let detector = FeatureDetector::new(DetectorConfig::default()).unwrap();
        let frame = frame_with_squares(320, 240, 32, 12);

        let features = detector.detect(&frame);
        let radius_sq = detector.config().nms_radius * detector.config().nms_radius;

        for (i, a) in features.keypoints.iter().enumerate() {
            for b in &features.keypoints[i + 1..] {
                assert!(
                    a.distance_sq(b) >= radius_sq - 1e-3,
                    "keypoints closer than NMS radius: {a:?} vs {b:?}"
                );
            }
        }
    }

    #[test]
    fn test_scale_tags_come_from_config() {
        let config = DetectorConfig {
            scales: vec![1.0, 1.2],
            ..Default::default()
        };
        let detector = FeatureDetector::new(config).unwrap();
        let frame = frame_with_squares(320, 240, 48, 16);

        let features = detector.detect(&frame);
        assert!(!features.is_empty());
        for kp in &features.keypoints {
            assert!(kp.scale == 1.0 || kp.scale == 1.2);
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DetectorConfig {
            scales: vec![],
            ..Default::default()
        };
        assert!(FeatureDetector::new(config).is_err());

        let config = DetectorConfig {
            max_keypoints: 0,
            ..Default::default()
        };
        assert!(FeatureDetector::new(config).is_err());
    }
}
