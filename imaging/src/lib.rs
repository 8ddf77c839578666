//! Umbra imaging
//!
//! Frame decoding, the display transformation pipeline and the derived-image
//! cache shared by every acquisition task.
//!
//! - [`fits`] / [`xisf`]: archival formats
//! - [`transform`]: transformation parameters and the fixed pipeline order
//! - [`processor`]: the three-tier [`ImageProcessor`] cache
//! - [`export`]: raster and archival encoding

pub mod adjust;
pub mod buffer;
pub mod config;
pub mod debayer;
pub mod error;
pub mod export;
pub mod fits;
pub mod processor;
pub mod stretch;
pub mod transform;
pub mod xisf;

pub use buffer::PixelBuffer;
pub use config::ImagingConfig;
pub use debayer::BayerPattern;
pub use error::{ImagingError, ImagingResult};
pub use export::{ExportFormat, ExportedImage, ImageMetadata};
pub use fits::{FitsHeader, FitsValue, WcsSolution};
pub use processor::{
    BufferedItem, CacheKey, CacheStats, ImageProcessor, SharedImageProcessor, TransformedItem,
};
pub use transform::{Calibration, DebayerOptions, Stretch, Transformation};
