//! Pixel operations used by the transformation pipeline
//!
//! Each operation works in place on a normalized [`PixelBuffer`].

use crate::buffer::PixelBuffer;
use serde::{Deserialize, Serialize};

// =============================================================================
// GEOMETRY
// =============================================================================

/// Flip left/right
pub fn mirror_horizontal(image: &mut PixelBuffer) {
    let (w, h) = (image.width as usize, image.height as usize);
    for c in 0..image.channels {
        let plane = image.plane_mut(c);
        for row in plane.chunks_exact_mut(w).take(h) {
            row.reverse();
        }
    }
}

/// Flip top/bottom
pub fn mirror_vertical(image: &mut PixelBuffer) {
    let (w, h) = (image.width as usize, image.height as usize);
    for c in 0..image.channels {
        let plane = image.plane_mut(c);
        for y in 0..h / 2 {
            let (top, bottom) = plane.split_at_mut((h - 1 - y) * w);
            top[y * w..(y + 1) * w].swap_with_slice(&mut bottom[..w]);
        }
    }
}

// =============================================================================
// SCNR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScnrChannel {
    Red,
    Green,
    Blue,
}

impl ScnrChannel {
    fn index(&self) -> u32 {
        match self {
            ScnrChannel::Red => 0,
            ScnrChannel::Green => 1,
            ScnrChannel::Blue => 2,
        }
    }
}

/// Neutral reference the suppressed channel is limited to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScnrMethod {
    AverageNeutral,
    MaximumNeutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScnrOptions {
    pub channel: ScnrChannel,
    pub method: ScnrMethod,
    /// 0..1, blend between original and fully neutralized
    pub amount: f32,
}

/// Subtractive chromatic noise reduction. No-op on mono frames.
pub fn scnr(image: &mut PixelBuffer, options: &ScnrOptions) {
    if image.is_mono() {
        return;
    }
    let target = options.channel.index();
    let others: Vec<u32> = (0..3).filter(|c| *c != target).collect();
    let amount = options.amount.clamp(0.0, 1.0);

    for i in 0..image.plane_len() {
        let a = image.plane(others[0])[i];
        let b = image.plane(others[1])[i];
        let neutral = match options.method {
            ScnrMethod::AverageNeutral => (a + b) / 2.0,
            ScnrMethod::MaximumNeutral => a.max(b),
        };
        let v = &mut image.plane_mut(target)[i];
        let limited = v.min(neutral);
        *v = *v * (1.0 - amount) + limited * amount;
    }
}

// =============================================================================
// TONE ADJUSTMENTS
// =============================================================================

/// Brightness/contrast/gamma/saturation, all neutral at their defaults
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Adjustments {
    /// Offset added to every sample, -1..1
    pub brightness: f32,
    /// Gain around mid-grey, 1.0 is neutral
    pub contrast: f32,
    /// Power curve exponent is 1/gamma, 1.0 is neutral
    pub gamma: f32,
    /// Chroma gain for color frames, 1.0 is neutral
    pub saturation: f32,
}

impl Default for Adjustments {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            gamma: 1.0,
            saturation: 1.0,
        }
    }
}

pub fn apply_adjustments(image: &mut PixelBuffer, adj: &Adjustments) {
    let inv_gamma = 1.0 / adj.gamma.max(0.01);
    image.map_samples(|v| {
        let v = (v + adj.brightness).clamp(0.0, 1.0);
        let v = ((v - 0.5) * adj.contrast + 0.5).clamp(0.0, 1.0);
        v.powf(inv_gamma)
    });

    if image.channels == 3 && (adj.saturation - 1.0).abs() > f32::EPSILON {
        for i in 0..image.plane_len() {
            let (r, g, b) = (image.plane(0)[i], image.plane(1)[i], image.plane(2)[i]);
            let luma = 0.2126 * r + 0.7152 * g + 0.0722 * b;
            for (c, v) in [(0u32, r), (1, g), (2, b)] {
                image.plane_mut(c)[i] = (luma + (v - luma) * adj.saturation).clamp(0.0, 1.0);
            }
        }
    }
}

// =============================================================================
// FILTERS
// =============================================================================

/// Spatial filter, at most one per transformation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Filter {
    Sharpen { amount: f32 },
    Blur { radius: u32 },
    Mean { radius: u32 },
    GaussianBlur { sigma: f32 },
}

impl Filter {
    /// Parameter string used in cache signatures
    pub fn signature(&self) -> String {
        match self {
            Filter::Sharpen { amount } => format!("sharpen:{}", amount),
            Filter::Blur { radius } => format!("blur:{}", radius),
            Filter::Mean { radius } => format!("mean:{}", radius),
            Filter::GaussianBlur { sigma } => format!("gaussian:{}", sigma),
        }
    }
}

pub fn apply_filter(image: &mut PixelBuffer, filter: &Filter) {
    match *filter {
        Filter::Sharpen { amount } => {
            // Unsharp mask against a 3x3 box blur
            let blurred = convolve(image, &box_kernel(1));
            for (v, b) in image.data.iter_mut().zip(blurred.iter()) {
                *v = (*v + amount * (*v - b)).clamp(0.0, 1.0);
            }
        }
        Filter::Blur { radius } => {
            image.data = convolve(image, &tent_kernel(radius.max(1)));
        }
        Filter::Mean { radius } => {
            image.data = convolve(image, &box_kernel(radius.max(1)));
        }
        Filter::GaussianBlur { sigma } => {
            image.data = convolve(image, &gaussian_kernel(sigma.max(0.1)));
        }
    }
}

/// Square kernel, row-major, odd side length
struct Kernel {
    radius: i64,
    weights: Vec<f32>,
}

fn box_kernel(radius: u32) -> Kernel {
    let side = (2 * radius + 1) as usize;
    Kernel {
        radius: radius as i64,
        weights: vec![1.0 / (side * side) as f32; side * side],
    }
}

/// Separable triangle weights, heavier towards the centre than a box
fn tent_kernel(radius: u32) -> Kernel {
    let r = radius as i64;
    let mut weights = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            weights.push(((r + 1 - dx.abs()) * (r + 1 - dy.abs())) as f32);
        }
    }
    let sum: f32 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= sum);
    Kernel { radius: r, weights }
}

fn gaussian_kernel(sigma: f32) -> Kernel {
    let radius = (sigma * 3.0).ceil() as i64;
    let side = (2 * radius + 1) as usize;
    let mut weights = Vec::with_capacity(side * side);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let d2 = (dx * dx + dy * dy) as f32;
            weights.push((-d2 / (2.0 * sigma * sigma)).exp());
        }
    }
    let sum: f32 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= sum);
    Kernel { radius, weights }
}

/// Convolve every plane, clamping coordinates at the borders
fn convolve(image: &PixelBuffer, kernel: &Kernel) -> Vec<f32> {
    let (w, h) = (image.width as i64, image.height as i64);
    let side = (2 * kernel.radius + 1) as usize;
    let mut out = vec![0.0f32; image.data.len()];

    for c in 0..image.channels {
        let plane = image.plane(c);
        let offset = c as usize * image.plane_len();
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for ky in -kernel.radius..=kernel.radius {
                    let sy = (y + ky).clamp(0, h - 1);
                    for kx in -kernel.radius..=kernel.radius {
                        let sx = (x + kx).clamp(0, w - 1);
                        let weight = kernel.weights
                            [(ky + kernel.radius) as usize * side + (kx + kernel.radius) as usize];
                        acc += plane[(sy * w + sx) as usize] * weight;
                    }
                }
                out[offset + (y * w + x) as usize] = acc;
            }
        }
    }
    out
}

// =============================================================================
// CALIBRATION & INVERSION
// =============================================================================

/// Master frames applied before any cosmetic step
#[derive(Debug, Default, Clone)]
pub struct CalibrationFrames<'a> {
    pub dark: Option<&'a PixelBuffer>,
    pub flat: Option<&'a PixelBuffer>,
    pub bias: Option<&'a PixelBuffer>,
}

/// `(light - dark) / normalized(flat - bias)`. Frames whose geometry does not
/// match the light are skipped with a warning.
pub fn calibrate(image: &mut PixelBuffer, frames: &CalibrationFrames<'_>) {
    let (width, height, channels) = (image.width, image.height, image.channels);
    let matches =
        move |f: &PixelBuffer| f.width == width && f.height == height && f.channels == channels;

    if let Some(dark) = frames.dark.filter(|f| matches(*f)) {
        for (v, d) in image.data.iter_mut().zip(dark.data.iter()) {
            *v = (*v - d).max(0.0);
        }
    } else if let Some(bias) = frames.bias.filter(|f| matches(*f)) {
        for (v, b) in image.data.iter_mut().zip(bias.data.iter()) {
            *v = (*v - b).max(0.0);
        }
    }

    if let Some(flat) = frames.flat.filter(|f| matches(*f)) {
        let bias_of = |i: usize| {
            frames
                .bias
                .filter(|f| matches(*f))
                .map(|b| b.data[i])
                .unwrap_or(0.0)
        };
        let corrected: Vec<f32> = flat
            .data
            .iter()
            .enumerate()
            .map(|(i, f)| (f - bias_of(i)).max(f32::EPSILON))
            .collect();
        let mean = corrected.iter().sum::<f32>() / corrected.len().max(1) as f32;
        for (v, f) in image.data.iter_mut().zip(corrected.iter()) {
            *v = (*v * mean / f).clamp(0.0, 1.0);
        }
    }

    for (name, frame) in [("dark", frames.dark), ("flat", frames.flat), ("bias", frames.bias)] {
        if let Some(f) = frame {
            if !matches(f) {
                tracing::warn!(
                    "Skipping {} frame: {}x{}x{} does not match light {}x{}x{}",
                    name, f.width, f.height, f.channels, image.width, image.height, image.channels
                );
            }
        }
    }
}

pub fn invert(image: &mut PixelBuffer) {
    image.map_samples(|v| 1.0 - v);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> PixelBuffer {
        let samples: Vec<u16> = (0..width * height).map(|i| (i * 1000) as u16).collect();
        PixelBuffer::from_u16(width, height, &samples)
    }

    #[test]
    fn test_mirrors_are_involutions() {
        let original = ramp(5, 3);
        let mut image = original.clone();
        mirror_horizontal(&mut image);
        assert_eq!(image.get(0, 0, 0), original.get(0, 4, 0));
        mirror_horizontal(&mut image);
        assert_eq!(image.data, original.data);

        mirror_vertical(&mut image);
        assert_eq!(image.get(0, 1, 0), original.get(0, 1, 2));
        assert_eq!(image.get(0, 1, 1), original.get(0, 1, 1));
        mirror_vertical(&mut image);
        assert_eq!(image.data, original.data);
    }

    #[test]
    fn test_scnr_limits_green() {
        let mut image = PixelBuffer::new(1, 1, 3);
        image.data = vec![0.2, 0.9, 0.4];
        scnr(
            &mut image,
            &ScnrOptions {
                channel: ScnrChannel::Green,
                method: ScnrMethod::AverageNeutral,
                amount: 1.0,
            },
        );
        assert!((image.data[1] - 0.3).abs() < 1e-6);
        assert_eq!(image.data[0], 0.2);
    }

    #[test]
    fn test_neutral_adjustments_keep_pixels() {
        let original = ramp(4, 4);
        let mut image = original.clone();
        apply_adjustments(&mut image, &Adjustments::default());
        for (a, b) in image.data.iter().zip(original.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blur_preserves_flat_field() {
        let mut image = PixelBuffer::from_u16(6, 6, &[30_000; 36]);
        apply_filter(&mut image, &Filter::GaussianBlur { sigma: 1.0 });
        let expected = 30_000.0 / 65535.0;
        assert!(image.data.iter().all(|v| (v - expected).abs() < 1e-5));
    }

    #[test]
    fn test_dark_subtraction_and_flat_division() {
        let mut light = PixelBuffer::from_u16(2, 1, &[20_000, 20_000]);
        let dark = PixelBuffer::from_u16(2, 1, &[10_000, 10_000]);
        let flat = PixelBuffer::from_u16(2, 1, &[30_000, 60_000]);
        calibrate(
            &mut light,
            &CalibrationFrames {
                dark: Some(&dark),
                flat: Some(&flat),
                bias: None,
            },
        );
        // The vignetted pixel is brightened relative to the centre
        assert!(light.data[0] > light.data[1]);
        let mean = (light.data[0] + light.data[1]) / 2.0;
        assert!(mean > 10_000.0 / 65535.0);
    }

    #[test]
    fn test_invert() {
        let mut image = PixelBuffer::from_u16(1, 1, &[0]);
        invert(&mut image);
        assert_eq!(image.data, vec![1.0]);
    }
}
