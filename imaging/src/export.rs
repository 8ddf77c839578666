//! Encoding processed frames for display or archival

use crate::buffer::PixelBuffer;
use crate::error::{ImagingError, ImagingResult};
use crate::fits::{write_fits, WcsSolution};
use crate::transform::Transformation;
use crate::xisf::write_xisf;
use image::ImageEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Target format for an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Jpeg,
    Png,
    Tiff,
    Fits,
    Xisf,
}

impl ExportFormat {
    /// FITS and XISF are archival formats, only written to disk
    pub fn requires_destination(&self) -> bool {
        matches!(self, ExportFormat::Fits | ExportFormat::Xisf)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Png => "png",
            ExportFormat::Tiff => "tiff",
            ExportFormat::Fits => "fits",
            ExportFormat::Xisf => "xisf",
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExportFormat::Jpeg => "JPEG",
            ExportFormat::Png => "PNG",
            ExportFormat::Tiff => "TIFF",
            ExportFormat::Fits => "FITS",
            ExportFormat::Xisf => "XISF",
        };
        f.write_str(name)
    }
}

/// Facts about an exported frame that the UI shows next to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub mono: bool,
    pub header: BTreeMap<String, String>,
    pub solution: Option<WcsSolution>,
}

impl ImageMetadata {
    pub fn from_buffer(image: &PixelBuffer) -> Self {
        Self {
            width: image.width,
            height: image.height,
            mono: image.is_mono(),
            header: image.header.to_map(),
            solution: WcsSolution::from_header(&image.header),
        }
    }
}

/// Result of an export. Archival exports carry no bytes.
#[derive(Debug, Clone)]
pub struct ExportedImage {
    pub format: ExportFormat,
    pub bytes: Option<Vec<u8>>,
    pub metadata: ImageMetadata,
    /// Transformation the frame was rendered with, auto stretch values included
    pub transformation: Option<Transformation>,
}

/// Encode to a raster format in memory
pub fn encode_raster(image: &PixelBuffer, format: ExportFormat, jpeg_quality: u8) -> ImagingResult<Vec<u8>> {
    let samples = image.to_interleaved_u8();
    let color_type = if image.is_mono() {
        image::ColorType::L8
    } else {
        image::ColorType::Rgb8
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    match format {
        ExportFormat::Jpeg => {
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, jpeg_quality);
            encoder.write_image(&samples, image.width, image.height, color_type)?;
        }
        ExportFormat::Png => {
            let encoder = image::codecs::png::PngEncoder::new(&mut cursor);
            encoder.write_image(&samples, image.width, image.height, color_type)?;
        }
        ExportFormat::Tiff => {
            let encoder = image::codecs::tiff::TiffEncoder::new(&mut cursor);
            encoder.write_image(&samples, image.width, image.height, color_type)?;
        }
        ExportFormat::Fits | ExportFormat::Xisf => {
            return Err(ImagingError::SaveLocationRequired {
                format: format.to_string(),
            });
        }
    }
    Ok(cursor.into_inner())
}

/// Stream an archival format to a file
pub fn write_archival(image: &PixelBuffer, format: ExportFormat, path: &Path) -> ImagingResult<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    match format {
        ExportFormat::Fits => write_fits(&mut writer, image),
        ExportFormat::Xisf => write_xisf(&mut writer, image),
        other => Err(ImagingError::Decode(format!("{} is not an archival format", other))),
    }
}

/// Decode any supported buffered bytes: FITS first, then common raster formats
pub fn decode(bytes: &[u8]) -> ImagingResult<PixelBuffer> {
    if crate::fits::looks_like_fits(bytes) {
        return crate::fits::read_fits_from_bytes(bytes);
    }

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ImagingError::Decode(format!("Failed to decode raster image: {}", e)))?;
    let (width, height) = (decoded.width(), decoded.height());
    let is_mono = matches!(
        decoded.color(),
        image::ColorType::L8 | image::ColorType::L16 | image::ColorType::La8 | image::ColorType::La16
    );

    if is_mono {
        let luma = decoded.to_luma16();
        Ok(PixelBuffer::from_u16(width, height, luma.as_raw()))
    } else {
        let rgb = decoded.to_rgb16();
        let mut buffer = PixelBuffer::new(width, height, 3);
        let plane_len = buffer.plane_len();
        for (i, px) in rgb.as_raw().chunks_exact(3).enumerate() {
            for c in 0..3 {
                buffer.data[c * plane_len + i] = px[c] as f32 / 65535.0;
            }
        }
        Ok(buffer)
    }
}
