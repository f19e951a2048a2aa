//! BRIEF binary descriptors.
//!
//! Each descriptor bit records whether one patch pixel is darker than
//! another. The 256 coordinate pairs are drawn once from a seeded generator
//! at construction and then reused for every keypoint and every frame;
//! re-randomizing per call would silently make descriptors incomparable
//! across frames.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::features::keypoint::{Descriptor, Keypoint, DESCRIPTOR_BYTES};
use crate::image::GrayFrame;

/// Half-width of the sampling patch (31x31 pixels).
pub const PATCH_RADIUS: i32 = 15;

/// Comparisons per descriptor; one bit each.
pub const NUM_PAIRS: usize = DESCRIPTOR_BYTES * 8;

/// The fixed sampling pattern: 256 pairs of patch offsets.
pub struct BriefPattern {
    pairs: [(i8, i8, i8, i8); NUM_PAIRS],
}

impl BriefPattern {
    /// Draw the pattern from a seeded generator. Same seed, same pattern.
    pub fn seeded(seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut pairs = [(0i8, 0i8, 0i8, 0i8); NUM_PAIRS];
        for pair in pairs.iter_mut() {
            *pair = (
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS) as i8,
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS) as i8,
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS) as i8,
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS) as i8,
            );
        }
        Self { pairs }
    }
}

/// Applies a fixed `BriefPattern` to keypoints.
pub struct BriefExtractor {
    pattern: BriefPattern,
}

impl BriefExtractor {
    pub fn seeded(seed: u64) -> Self {
        Self {
            pattern: BriefPattern::seeded(seed),
        }
    }

    /// Describe one keypoint from the base image.
    ///
    /// Pattern offsets are divided by the keypoint's detection scale so the
    /// patch covers the same image region the detector responded to. Samples
    /// falling outside the image clamp to the border.
    pub fn describe(&self, frame: &GrayFrame, kp: &Keypoint) -> Descriptor {
        let inv_scale = 1.0 / kp.scale;
        let mut bytes = [0u8; DESCRIPTOR_BYTES];

        for (i, &(x1, y1, x2, y2)) in self.pattern.pairs.iter().enumerate() {
            let ax = (kp.x + x1 as f32 * inv_scale).round() as i64;
            let ay = (kp.y + y1 as f32 * inv_scale).round() as i64;
            let bx = (kp.x + x2 as f32 * inv_scale).round() as i64;
            let by = (kp.y + y2 as f32 * inv_scale).round() as i64;

            let a = frame.get_clamped(ax, ay);
            let b = frame.get_clamped(bx, by);
            if a < b {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        Descriptor(bytes)
    }
}
