//! Bilinear debayering of one-shot-color frames

use crate::buffer::PixelBuffer;
use serde::{Deserialize, Serialize};

/// CFA layout, named by the top-left 2x2 cell read row by row
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BayerPattern {
    RGGB,
    BGGR,
    GRBG,
    GBRG,
}

const R: u8 = 0;
const G: u8 = 1;
const B: u8 = 2;

impl BayerPattern {
    /// Parse the BAYERPAT header value
    pub fn from_keyword(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "RGGB" => Some(Self::RGGB),
            "BGGR" => Some(Self::BGGR),
            "GRBG" => Some(Self::GRBG),
            "GBRG" => Some(Self::GBRG),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::RGGB => "RGGB",
            Self::BGGR => "BGGR",
            Self::GRBG => "GRBG",
            Self::GBRG => "GBRG",
        }
    }

    fn cell(&self) -> [[u8; 2]; 2] {
        match self {
            Self::RGGB => [[R, G], [G, B]],
            Self::BGGR => [[B, G], [G, R]],
            Self::GRBG => [[G, R], [B, G]],
            Self::GBRG => [[G, B], [R, G]],
        }
    }

    /// Color filter over the photosite at (x, y)
    #[inline]
    fn color_at(&self, x: u32, y: u32) -> u8 {
        self.cell()[(y % 2) as usize][(x % 2) as usize]
    }
}

/// Interpolate a mono CFA frame into three planes.
///
/// Each output sample is the mean of the same-colored photosites in the
/// 3x3 neighbourhood, which is the classic bilinear reconstruction.
pub fn debayer(raw: &PixelBuffer, pattern: BayerPattern) -> PixelBuffer {
    let (width, height) = (raw.width, raw.height);
    let mut out = PixelBuffer::new(width, height, 3);
    out.header = raw.header.clone();

    for y in 0..height {
        for x in 0..width {
            let mut sums = [0.0f32; 3];
            let mut counts = [0u32; 3];
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let color = pattern.color_at(nx, ny) as usize;
                    sums[color] += raw.get(0, nx, ny);
                    counts[color] += 1;
                }
            }
            for c in 0..3u32 {
                let idx = out.index(c, x, y);
                let n = counts[c as usize];
                out.data[idx] = if n > 0 { sums[c as usize] / n as f32 } else { 0.0 };
            }
        }
    }

    out
}
