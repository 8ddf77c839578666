//! Error types for the imaging crate

use thiserror::Error;

/// Errors raised while decoding, processing or exporting images
#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Format Errors
    // =========================================================================

    #[error("Invalid FITS format: {0}")]
    InvalidFits(String),

    #[error("Unsupported BITPIX: {0}")]
    UnsupportedBitpix(i64),

    #[error("Missing required keyword: {0}")]
    MissingKeyword(String),

    #[error("XISF write failed: {0}")]
    Xisf(String),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    // =========================================================================
    // Export Errors
    // =========================================================================

    #[error("{format} export requires a destination path")]
    SaveLocationRequired { format: String },

    #[error("Image not found: {0}")]
    NotFound(String),
}

pub type ImagingResult<T> = Result<T, ImagingError>;
