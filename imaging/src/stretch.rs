//! Histogram stretching
//!
//! The automatic stretch follows the screen transfer function approach:
//! clip the shadows a fixed number of MADs below the median, then pick the
//! midtones balance that lands the background at a target brightness.

use crate::buffer::{mad_of, median_of, PixelBuffer};
use serde::{Deserialize, Serialize};

/// Shadows clipping point, in normalized MAD units from the median
pub const SHADOWS_CLIP: f32 = -2.8;

/// Background brightness the auto stretch aims for
pub const TARGET_BACKGROUND: f32 = 0.25;

/// MAD to standard deviation for a normal distribution
const MAD_TO_SIGMA: f32 = 1.4826;

/// Shadows/midtones/highlights triple
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StretchParams {
    pub shadows: f32,
    pub midtones: f32,
    pub highlights: f32,
}

impl Default for StretchParams {
    fn default() -> Self {
        Self {
            shadows: 0.0,
            midtones: 0.5,
            highlights: 1.0,
        }
    }
}

/// Midtones transfer function
#[inline]
pub fn mtf(midtones: f32, x: f32) -> f32 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    if (midtones - 0.5).abs() < f32::EPSILON {
        return x;
    }
    ((midtones - 1.0) * x) / ((2.0 * midtones - 1.0) * x - midtones)
}

/// Compute linked stretch parameters from the image statistics.
///
/// Color frames use the mean of the per-channel medians and MADs so all
/// channels get the same curve.
pub fn auto_stretch_stf(image: &PixelBuffer) -> StretchParams {
    let mut median = 0.0;
    let mut mad = 0.0;
    for c in 0..image.channels {
        let plane = image.plane(c);
        let m = median_of(plane);
        median += m;
        mad += mad_of(plane, m);
    }
    let n = image.channels.max(1) as f32;
    median /= n;
    mad /= n;

    let sigma = mad * MAD_TO_SIGMA;
    let shadows = if sigma > 0.0 {
        (median + SHADOWS_CLIP * sigma).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let midtones = mtf(TARGET_BACKGROUND, (median - shadows) / (1.0 - shadows).max(f32::EPSILON));

    StretchParams {
        shadows,
        midtones,
        highlights: 1.0,
    }
}

/// Apply a stretch in place
pub fn apply_stretch(image: &mut PixelBuffer, params: &StretchParams) {
    let range = (params.highlights - params.shadows).max(f32::EPSILON);
    let (shadows, midtones) = (params.shadows, params.midtones);
    image.map_samples(|v| mtf(midtones, (v - shadows) / range));
}
