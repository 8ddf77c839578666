//! Transformation parameters and the fixed processing pipeline
//!
//! A [`Transformation`] describes everything that can be done to a frame
//! before display. Its [`signature`](Transformation::signature) is the stable
//! textual form hashed into cache keys, so two transformations with equal
//! values always address the same cache entry.
//!
//! Pipeline order is fixed:
//! debayer → calibration → mirror H → mirror V → SCNR → stretch →
//! adjustments → filter → invert

use crate::adjust::{
    apply_adjustments, apply_filter, calibrate, invert, mirror_horizontal, mirror_vertical,
    scnr, Adjustments, CalibrationFrames, Filter, ScnrOptions,
};
use crate::buffer::PixelBuffer;
use crate::debayer::{debayer, BayerPattern};
use crate::stretch::{apply_stretch, auto_stretch_stf, StretchParams};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Debayer step. Without an explicit pattern the header's BAYERPAT is used.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebayerOptions {
    pub pattern: Option<BayerPattern>,
}

/// Master frame paths, resolved through the same cache as the light frame
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Calibration {
    pub dark: Option<String>,
    pub flat: Option<String>,
    pub bias: Option<String>,
}

impl Calibration {
    pub fn is_empty(&self) -> bool {
        self.dark.is_none() && self.flat.is_none() && self.bias.is_none()
    }
}

/// Stretch step. In auto mode the computed parameters are written back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stretch {
    pub auto: bool,
    #[serde(flatten)]
    pub params: StretchParams,
}

impl Stretch {
    pub fn auto() -> Self {
        Self {
            auto: true,
            params: StretchParams::default(),
        }
    }

    pub fn manual(shadows: f32, midtones: f32, highlights: f32) -> Self {
        Self {
            auto: false,
            params: StretchParams {
                shadows,
                midtones,
                highlights,
            },
        }
    }
}

/// Full set of display transformations. The default is neutral.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Transformation {
    pub debayer: Option<DebayerOptions>,
    pub calibration: Calibration,
    pub horizontal_mirror: bool,
    pub vertical_mirror: bool,
    pub scnr: Option<ScnrOptions>,
    pub stretch: Option<Stretch>,
    pub adjustments: Option<Adjustments>,
    pub filter: Option<Filter>,
    pub invert: bool,
}

impl Transformation {
    /// Transformation that leaves the decoded pixels untouched
    pub fn neutral() -> Self {
        Self::default()
    }

    /// Stable description of every parameter that affects the output.
    ///
    /// Auto stretch is identified by mode only: its coefficients are an
    /// output of the pipeline, written back after the first run.
    pub fn signature(&self) -> String {
        let mut sig = String::new();

        match &self.debayer {
            Some(d) => {
                let pattern = d.pattern.map(|p| p.keyword()).unwrap_or("header");
                let _ = write!(sig, "debayer={};", pattern);
            }
            None => sig.push_str("debayer=off;"),
        }

        let _ = write!(
            sig,
            "dark={};flat={};bias={};",
            self.calibration.dark.as_deref().unwrap_or("-"),
            self.calibration.flat.as_deref().unwrap_or("-"),
            self.calibration.bias.as_deref().unwrap_or("-"),
        );

        let _ = write!(sig, "mirrorH={};mirrorV={};", self.horizontal_mirror, self.vertical_mirror);

        match &self.scnr {
            Some(s) => {
                let _ = write!(sig, "scnr={:?}/{:?}/{};", s.channel, s.method, s.amount);
            }
            None => sig.push_str("scnr=off;"),
        }

        match &self.stretch {
            Some(s) if s.auto => sig.push_str("stretch=auto;"),
            Some(s) => {
                let _ = write!(
                    sig,
                    "stretch={}/{}/{};",
                    s.params.shadows, s.params.midtones, s.params.highlights
                );
            }
            None => sig.push_str("stretch=off;"),
        }

        match &self.adjustments {
            Some(a) => {
                let _ = write!(
                    sig,
                    "adjust={}/{}/{}/{};",
                    a.brightness, a.contrast, a.gamma, a.saturation
                );
            }
            None => sig.push_str("adjust=off;"),
        }

        match &self.filter {
            Some(f) => {
                let _ = write!(sig, "filter={};", f.signature());
            }
            None => sig.push_str("filter=off;"),
        }

        let _ = write!(sig, "invert={}", self.invert);
        sig
    }

    /// Transformation used to prepare this one's calibration masters
    pub fn for_calibration_frame(&self) -> Self {
        Self {
            debayer: self.debayer,
            ..Self::default()
        }
    }
}

/// Signature used when a caller asks for the frame with transformation disabled
pub const DISABLED_SIGNATURE: &str = "disabled";

/// Run the pipeline on a decoded frame
pub fn apply(
    mut image: PixelBuffer,
    transformation: &mut Transformation,
    frames: &CalibrationFrames<'_>,
) -> PixelBuffer {
    if let Some(options) = transformation.debayer {
        if image.is_mono() {
            let pattern = options
                .pattern
                .or(image.bayer)
                .unwrap_or(BayerPattern::RGGB);
            image = debayer(&image, pattern);
        }
    }

    calibrate(&mut image, frames);

    if transformation.horizontal_mirror {
        mirror_horizontal(&mut image);
    }
    if transformation.vertical_mirror {
        mirror_vertical(&mut image);
    }

    if let Some(options) = &transformation.scnr {
        scnr(&mut image, options);
    }

    if let Some(stretch) = transformation.stretch.as_mut() {
        if stretch.auto {
            stretch.params = auto_stretch_stf(&image);
            tracing::debug!(
                "Auto stretch: shadows={:.6}, midtones={:.6}, highlights={:.6}",
                stretch.params.shadows,
                stretch.params.midtones,
                stretch.params.highlights
            );
        }
        apply_stretch(&mut image, &stretch.params);
    }

    if let Some(adjustments) = &transformation.adjustments {
        apply_adjustments(&mut image, adjustments);
    }

    if let Some(filter) = &transformation.filter {
        apply_filter(&mut image, filter);
    }

    if transformation.invert {
        invert(&mut image);
    }

    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjust::{ScnrChannel, ScnrMethod};

    #[test]
    fn test_equal_values_share_signature() {
        let a = Transformation {
            horizontal_mirror: true,
            stretch: Some(Stretch::manual(0.1, 0.3, 0.9)),
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_every_parameter_changes_signature() {
        let base = Transformation::neutral();
        let variants = vec![
            Transformation { debayer: Some(DebayerOptions::default()), ..base.clone() },
            Transformation {
                calibration: Calibration { dark: Some("dark.fits".into()), ..Default::default() },
                ..base.clone()
            },
            Transformation { horizontal_mirror: true, ..base.clone() },
            Transformation { vertical_mirror: true, ..base.clone() },
            Transformation {
                scnr: Some(ScnrOptions {
                    channel: ScnrChannel::Green,
                    method: ScnrMethod::MaximumNeutral,
                    amount: 0.5,
                }),
                ..base.clone()
            },
            Transformation { stretch: Some(Stretch::auto()), ..base.clone() },
            Transformation { adjustments: Some(Adjustments::default()), ..base.clone() },
            Transformation { filter: Some(Filter::Mean { radius: 2 }), ..base.clone() },
            Transformation { invert: true, ..base.clone() },
        ];
        for v in variants {
            assert_ne!(v.signature(), base.signature(), "{:?}", v);
        }
    }

    #[test]
    fn test_auto_stretch_writes_back_without_changing_signature() {
        let samples: Vec<u16> = (0..400u32).map(|i| 2_000 + (i % 50) as u16 * 10).collect();
        let image = PixelBuffer::from_u16(20, 20, &samples);
        let mut t = Transformation { stretch: Some(Stretch::auto()), ..Default::default() };
        let before = t.signature();

        let _ = apply(image, &mut t, &CalibrationFrames::default());

        let params = t.stretch.map(|s| s.params).unwrap();
        assert_ne!(params, StretchParams::default());
        assert_eq!(t.signature(), before);
    }

    #[test]
    fn test_debayer_uses_header_pattern() {
        let mut image = PixelBuffer::new(4, 4, 1);
        image.bayer = Some(BayerPattern::BGGR);
        let mut t = Transformation { debayer: Some(DebayerOptions::default()), ..Default::default() };
        let out = apply(image, &mut t, &CalibrationFrames::default());
        assert_eq!(out.channels, 3);
    }

    #[test]
    fn test_deserialize_camel_case() {
        let json = r#"{"horizontalMirror":true,"stretch":{"auto":false,"shadows":0.1,"midtones":0.2,"highlights":0.9},"filter":{"kind":"gaussianBlur","sigma":1.5}}"#;
        let t: Transformation = serde_json::from_str(json).unwrap();
        assert!(t.horizontal_mirror);
        assert_eq!(t.filter, Some(Filter::GaussianBlur { sigma: 1.5 }));
        assert_eq!(t.stretch.map(|s| s.params.midtones), Some(0.2));
    }
}
