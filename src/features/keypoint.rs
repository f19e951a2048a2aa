//! Feature primitives: keypoints, binary descriptors, and matches.

/// Number of bytes in a BRIEF descriptor (256 comparisons, 1 bit each).
pub const DESCRIPTOR_BYTES: usize = 32;

/// A detected 2D image location with a corner-strength score.
///
/// Coordinates are in base-image pixels regardless of which detection scale
/// produced the point; `scale` records the pyramid factor it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Harris corner response. Higher is stronger.
    pub response: f32,
    /// Detection scale factor (1.0 for the base image).
    pub scale: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, response: f32, scale: f32) -> Self {
        Self {
            x,
            y,
            response,
            scale,
        }
    }

    /// Squared pixel distance to another keypoint.
    #[inline]
    pub fn distance_sq(&self, other: &Keypoint) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// A 256-bit BRIEF descriptor.
///
/// Bit `i` is 1 iff the first pixel of sampling pair `i` was darker than the
/// second. Comparable across frames only because the sampling pattern is
/// fixed at construction (see `BriefPattern`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub const ZERO: Descriptor = Descriptor([0u8; DESCRIPTOR_BYTES]);
}

/// Hamming distance between two descriptors: XOR then popcount.
///
/// Symmetric, and zero iff the descriptors are bit-identical.
#[inline]
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.0.iter()
        .zip(b.0.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Keypoints and their descriptors for one frame, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            keypoints: Vec::with_capacity(cap),
            descriptors: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn push(&mut self, keypoint: Keypoint, descriptor: Descriptor) {
        self.keypoints.push(keypoint);
        self.descriptors.push(descriptor);
    }
}

/// A correspondence between two feature sets.
///
/// `prev_idx` indexes the earlier set (previous frame or reference keyframe),
/// `curr_idx` the later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub prev_idx: usize,
    pub curr_idx: usize,
    /// Hamming distance of the winning descriptor pair.
    pub distance: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_zero_iff_identical() {
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        bytes[3] = 0b1010_0001;
        let a = Descriptor(bytes);
        let b = Descriptor(bytes);

        assert_eq!(hamming_distance(&a, &b), 0);

        bytes[3] = 0b1010_0000;
        let c = Descriptor(bytes);
        assert_eq!(hamming_distance(&a, &c), 1);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hamming_symmetric() {
        let mut x = [0u8; DESCRIPTOR_BYTES];
        let mut y = [0u8; DESCRIPTOR_BYTES];
        x[0] = 0xFF;
        y[31] = 0x0F;
        let a = Descriptor(x);
        let b = Descriptor(y);

        assert_eq!(hamming_distance(&a, &b), hamming_distance(&b, &a));
        assert_eq!(hamming_distance(&a, &b), 12);
    }

    #[test]
    fn test_hamming_max() {
        let a = Descriptor([0x00; DESCRIPTOR_BYTES]);
        let b = Descriptor([0xFF; DESCRIPTOR_BYTES]);
        assert_eq!(hamming_distance(&a, &b), 256);
    }

    #[test]
    fn test_feature_set_alignment() {
        let mut set = FeatureSet::default();
        set.push(Keypoint::new(1.0, 2.0, 0.5, 1.0), Descriptor::ZERO);

        assert_eq!(set.len(), 1);
        assert_eq!(set.keypoints.len(), set.descriptors.len());
    }
}
