//! Grayscale frame buffers.
//!
//! The pipeline works on row-major 8-bit luminance images. Callers hand in
//! either an interleaved RGBA8 buffer or an already-gray buffer; conversion
//! uses the standard luminance weighting. All sampling helpers clamp into
//! bounds so descriptor patches near the border stay valid.

use crate::error::FrameError;

/// Luminance weights for RGBA -> gray conversion.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// A borrowed input frame, before grayscale conversion.
///
/// Keeps the caller's capture buffer alive only for the duration of one
/// `process` call; the pipeline copies what it needs.
#[derive(Clone, Copy)]
pub enum FramePixels<'a> {
    /// Interleaved RGBA, 4 bytes per pixel.
    Rgba8(&'a [u8]),
    /// Single-channel luminance, 1 byte per pixel.
    Gray8(&'a [u8]),
}

impl<'a> FramePixels<'a> {
    /// Convert to an owned grayscale frame, validating buffer size.
    pub fn to_gray(self, width: u32, height: u32) -> Result<GrayFrame, FrameError> {
        match self {
            FramePixels::Rgba8(buf) => GrayFrame::from_rgba8(width, height, buf),
            FramePixels::Gray8(buf) => GrayFrame::from_gray(width, height, buf),
        }
    }

    /// Sample an RGB color in [0,1] at integer pixel coordinates.
    ///
    /// The gray variant replicates luminance into all three channels, so
    /// point colors stay meaningful for callers that only capture gray.
    /// Coordinates are clamped into bounds.
    pub fn color_at(&self, x: i64, y: i64, width: u32, height: u32) -> [f32; 3] {
        let x = x.clamp(0, width as i64 - 1) as usize;
        let y = y.clamp(0, height as i64 - 1) as usize;
        let idx = y * width as usize + x;
        match self {
            FramePixels::Rgba8(buf) => {
                let off = idx * 4;
                [
                    buf[off] as f32 / 255.0,
                    buf[off + 1] as f32 / 255.0,
                    buf[off + 2] as f32 / 255.0,
                ]
            }
            FramePixels::Gray8(buf) => {
                let v = buf[idx] as f32 / 255.0;
                [v, v, v]
            }
        }
    }
}

/// Owned row-major grayscale image.
#[derive(Debug, Clone)]
pub struct GrayFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GrayFrame {
    /// Build from an interleaved RGBA8 buffer using luminance weighting.
    pub fn from_rgba8(width: u32, height: u32, rgba: &[u8]) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::ZeroDimension);
        }
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                expected,
                actual: rgba.len(),
            });
        }

        let pixels = rgba
            .chunks_exact(4)
            .map(|px| {
                let luma =
                    LUMA_R * px[0] as f32 + LUMA_G * px[1] as f32 + LUMA_B * px[2] as f32;
                luma.round().clamp(0.0, 255.0) as u8
            })
            .collect();

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Build from an already-gray buffer (copied).
    pub fn from_gray(width: u32, height: u32, gray: &[u8]) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::ZeroDimension);
        }
        let expected = width as usize * height as usize;
        if gray.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                expected,
                actual: gray.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels: gray.to_vec(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw row-major pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Unchecked-value sample; caller guarantees coordinates are in bounds.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Sample with coordinates clamped into bounds.
    ///
    /// Descriptor patches near the image border rely on this instead of
    /// skipping keypoints outright.
    #[inline]
    pub fn get_clamped(&self, x: i64, y: i64) -> u8 {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.pixels[y * self.width as usize + x]
    }

    /// Nearest-neighbor rescale by an arbitrary positive factor.
    ///
    /// Used by the multi-scale detector; output dimensions are at least 1x1.
    pub fn resize(&self, scale: f32) -> GrayFrame {
        let new_w = ((self.width as f32 * scale).round() as u32).max(1);
        let new_h = ((self.height as f32 * scale).round() as u32).max(1);

        let mut pixels = Vec::with_capacity(new_w as usize * new_h as usize);
        for y in 0..new_h {
            let src_y = ((y as f32 / scale) as u32).min(self.height - 1);
            for x in 0..new_w {
                let src_x = ((x as f32 / scale) as u32).min(self.width - 1);
                pixels.push(self.get(src_x, src_y));
            }
        }

        GrayFrame {
            width: new_w,
            height: new_h,
            pixels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_conversion_weights() {
        // Pure red, green, blue pixels in a 3x1 frame.
        let rgba = [255, 0, 0, 255, 0, 255, 0, 255, 0, 0, 255, 255];
        let frame = GrayFrame::from_rgba8(3, 1, &rgba).unwrap();

        assert_eq!(frame.get(0, 0), 76); // 0.299 * 255
        assert_eq!(frame.get(1, 0), 150); // 0.587 * 255
        assert_eq!(frame.get(2, 0), 29); // 0.114 * 255
    }

    #[test]
    fn test_buffer_size_mismatch() {
        let result = GrayFrame::from_rgba8(4, 4, &[0u8; 10]);
        assert!(matches!(result, Err(FrameError::BufferSize { .. })));

        let result = GrayFrame::from_gray(4, 4, &[0u8; 15]);
        assert!(matches!(result, Err(FrameError::BufferSize { .. })));
    }

    #[test]
    fn test_clamped_sampling() {
        let frame = GrayFrame::from_gray(2, 2, &[10, 20, 30, 40]).unwrap();

        assert_eq!(frame.get_clamped(-5, -5), 10);
        assert_eq!(frame.get_clamped(10, 0), 20);
        assert_eq!(frame.get_clamped(0, 10), 30);
        assert_eq!(frame.get_clamped(10, 10), 40);
    }

    #[test]
    fn test_resize_dimensions() {
        let frame = GrayFrame::from_gray(10, 8, &[128u8; 80]).unwrap();

        let half = frame.resize(0.5);
        assert_eq!((half.width(), half.height()), (5, 4));

        let up = frame.resize(1.2);
        assert_eq!((up.width(), up.height()), (12, 10));
        assert_eq!(up.get(11, 9), 128);
    }

    #[test]
    fn test_color_at_gray_replicates() {
        let buf = [0u8, 128, 255, 64];
        let px = FramePixels::Gray8(&buf);
        let c = px.color_at(1, 0, 2, 2);
        assert!((c[0] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(c[0], c[1]);
        assert_eq!(c[1], c[2]);
    }
}
