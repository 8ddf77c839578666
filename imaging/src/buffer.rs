//! Normalized pixel buffers
//!
//! Every decoded frame is held as planar `f32` samples in the 0..1 range,
//! one plane per channel. Mono frames have one plane, color frames three
//! (R, G, B). The FITS header travels with the pixels so exports can carry
//! it forward.

use crate::debayer::BayerPattern;
use crate::fits::FitsHeader;

/// Decoded image, planar, normalized to 0..1
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<f32>,
    pub header: FitsHeader,
    /// CFA layout of a raw one-shot-color frame, when the header declares one
    pub bayer: Option<BayerPattern>,
}

impl PixelBuffer {
    /// Zero-filled buffer
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; (width * height * channels) as usize],
            header: FitsHeader::new(),
            bayer: None,
        }
    }

    /// Build a mono buffer from 16-bit ADU samples
    pub fn from_u16(width: u32, height: u32, samples: &[u16]) -> Self {
        Self {
            width,
            height,
            channels: 1,
            data: samples.iter().map(|&v| v as f32 / 65535.0).collect(),
            header: FitsHeader::new(),
            bayer: None,
        }
    }

    pub fn is_mono(&self) -> bool {
        self.channels == 1
    }

    pub fn plane_len(&self) -> usize {
        (self.width * self.height) as usize
    }

    pub fn plane(&self, channel: u32) -> &[f32] {
        let len = self.plane_len();
        let start = channel as usize * len;
        &self.data[start..start + len]
    }

    pub fn plane_mut(&mut self, channel: u32) -> &mut [f32] {
        let len = self.plane_len();
        let start = channel as usize * len;
        &mut self.data[start..start + len]
    }

    #[inline]
    pub fn index(&self, channel: u32, x: u32, y: u32) -> usize {
        channel as usize * self.plane_len() + (y * self.width + x) as usize
    }

    #[inline]
    pub fn get(&self, channel: u32, x: u32, y: u32) -> f32 {
        self.data[self.index(channel, x, y)]
    }

    /// Median of one channel
    pub fn median(&self, channel: u32) -> f32 {
        median_of(self.plane(channel))
    }

    /// Median across all channels, used for flat exposure estimation
    pub fn overall_median(&self) -> f32 {
        median_of(&self.data)
    }

    /// Interleaved 8-bit samples, ready for raster encoders
    pub fn to_interleaved_u8(&self) -> Vec<u8> {
        let len = self.plane_len();
        let channels = self.channels as usize;
        let mut out = vec![0u8; len * channels];
        for c in 0..channels {
            let plane = self.plane(c as u32);
            for (i, v) in plane.iter().enumerate() {
                out[i * channels + c] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
        out
    }

    /// Apply a function to every sample, clamping the result to 0..1
    pub fn map_samples(&mut self, f: impl Fn(f32) -> f32) {
        for v in self.data.iter_mut() {
            *v = f(*v).clamp(0.0, 1.0);
        }
    }
}

/// Median of a slice of samples (NaN-free input expected). Even counts
/// average the two middle samples.
pub fn median_of(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f32> = samples.to_vec();
    let mid = sorted.len() / 2;
    let (lower, upper, _) = sorted.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *upper;
    if samples.len() % 2 == 1 {
        return upper;
    }
    // Everything below `mid` is <= upper, so its maximum is the lower middle
    let lower = lower.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    (lower + upper) / 2.0
}

/// Median absolute deviation around a known median
pub fn mad_of(samples: &[f32], median: f32) -> f32 {
    let deviations: Vec<f32> = samples.iter().map(|v| (v - median).abs()).collect();
    median_of(&deviations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u16_normalizes() {
        let buf = PixelBuffer::from_u16(2, 1, &[0, 65535]);
        assert_eq!(buf.data, vec![0.0, 1.0]);
        assert!(buf.is_mono());
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median_of(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_of(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median_of(&[0.2, 0.2, 0.8, 0.8]), 0.5);
        assert_eq!(median_of(&[]), 0.0);
    }

    #[test]
    fn test_interleaved_rgb_layout() {
        let mut buf = PixelBuffer::new(1, 1, 3);
        buf.data = vec![1.0, 0.0, 0.5];
        assert_eq!(buf.to_interleaved_u8(), vec![255, 0, 128]);
    }
}
