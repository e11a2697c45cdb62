//! Frames, image handles and image-quality readings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::limits::{self, FrameSize};
use crate::error::{DriverError, DriverErrorKind, DriverResult};

/// A single monochrome frame from the camera.
///
/// Pixels are stored row-major. 8-bit frames hold one byte per pixel,
/// 16-bit frames hold little-endian pairs.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (8 or 16)
    pub bit_depth: u32,

    /// Raw pixel data
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bit_depth", &self.bit_depth)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    /// Create a frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bit_depth: 8,
            data,
        }
    }

    /// Create a frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            bit_depth: 16,
            data,
        }
    }

    /// Validated size information for this frame.
    pub fn size(&self) -> DriverResult<FrameSize> {
        let bytes_per_pixel = if self.bit_depth > 8 { 2 } else { 1 };
        let size = limits::validate_frame_size(self.width, self.height, bytes_per_pixel)?;
        if size.bytes != self.data.len() {
            return Err(DriverError::new(
                "frame",
                DriverErrorKind::Protocol,
                format!(
                    "{}x{} frame at {} bits needs {} bytes, got {}",
                    self.width,
                    self.height,
                    self.bit_depth,
                    size.bytes,
                    self.data.len()
                ),
            ));
        }
        Ok(size)
    }

    /// Number of pixels.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Full-scale value for the bit depth.
    pub fn max_value(&self) -> f64 {
        if self.bit_depth > 8 {
            f64::from(u16::MAX)
        } else {
            f64::from(u8::MAX)
        }
    }

    /// Raw value at `(x, y)`, or `None` outside the frame.
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y as usize * self.width as usize + x as usize;
        if self.bit_depth > 8 {
            let lo = *self.data.get(idx * 2)?;
            let hi = *self.data.get(idx * 2 + 1)?;
            Some(u16::from_le_bytes([lo, hi]))
        } else {
            self.data.get(idx).map(|&v| u16::from(v))
        }
    }

    /// Pixels scaled to `[0, 1]`, row-major.
    pub fn normalized(&self) -> Vec<f64> {
        let max = self.max_value();
        if self.bit_depth > 8 {
            self.data
                .chunks_exact(2)
                .map(|c| f64::from(u16::from_le_bytes([c[0], c[1]])) / max)
                .collect()
        } else {
            self.data.iter().map(|&v| f64::from(v) / max).collect()
        }
    }

    /// Mean normalized intensity. Zero for an empty frame.
    pub fn mean(&self) -> f64 {
        let pixels = self.normalized();
        if pixels.is_empty() {
            return 0.0;
        }
        pixels.iter().sum::<f64>() / pixels.len() as f64
    }
}

/// Opaque reference to a stored image, issued by the image sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageHandle(pub Uuid);

impl ImageHandle {
    /// Fresh random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImageHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-frame image quality signal published by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageQuality {
    /// Tenengrad sharpness of the frame
    pub sharpness: f64,
    /// Standard deviation over mean
    pub contrast: f64,
    /// Mean normalized intensity
    pub mean_intensity: f64,
    /// Fraction of the border band that differs strongly from the interior.
    /// High values indicate the field sits on the edge of the specimen.
    pub boundary_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_frame_pixel_access() {
        let frame = Frame::from_u16(2, 2, &[0, 1000, 65535, 7]);
        assert_eq!(frame.get(1, 0), Some(1000));
        assert_eq!(frame.get(0, 1), Some(65535));
        assert_eq!(frame.get(2, 0), None);
        assert_eq!(frame.size().unwrap().bytes, 8);
    }

    #[test]
    fn normalized_mean_of_u8_frame() {
        let frame = Frame::from_u8(2, 1, vec![0, 255]);
        assert!((frame.mean() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn size_rejects_short_buffer() {
        let frame = Frame::from_u8(4, 4, vec![0; 10]);
        let err = frame.size().unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Protocol);
    }
}
