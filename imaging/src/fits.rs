//! FITS reading and writing
//!
//! FITS layout:
//! - 2880-byte blocks
//! - Header made of 80-character keyword records, terminated by `END`
//! - Big-endian pixel data, one plane after the other
//!
//! Frames are decoded straight into a normalized [`PixelBuffer`]. Writing
//! always produces unsigned 16-bit data (BITPIX 16 with BZERO 32768), which is
//! what the cameras deliver and what stacking software expects.

use crate::buffer::PixelBuffer;
use crate::debayer::BayerPattern;
use crate::error::{ImagingError, ImagingResult};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

const BLOCK_SIZE: usize = 2880;
const RECORD_SIZE: usize = 80;

/// Keywords the writer derives from the pixel buffer itself
const STRUCTURAL_KEYWORDS: [&str; 8] = [
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "BZERO", "BSCALE",
];

/// FITS header, preserving keyword order for writing
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    keywords: HashMap<String, FitsValue>,
    keyword_order: Vec<String>,
}

/// FITS value types
#[derive(Debug, Clone, PartialEq)]
pub enum FitsValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl FitsValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            FitsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FitsValue::Integer(i) => Some(*i),
            FitsValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FitsValue::Float(f) => Some(*f),
            FitsValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Value as it appears in a header card
    fn to_card(&self) -> String {
        match self {
            FitsValue::String(s) => format!("'{:<8}'", s.replace('\'', "''")),
            FitsValue::Integer(i) => i.to_string(),
            FitsValue::Float(f) => format!("{:.10E}", f),
            FitsValue::Boolean(b) => if *b { "T" } else { "F" }.to_string(),
        }
    }
}

impl std::fmt::Display for FitsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitsValue::String(s) => write!(f, "{}", s),
            FitsValue::Integer(i) => write!(f, "{}", i),
            FitsValue::Float(v) => write!(f, "{}", v),
            FitsValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: &str, value: FitsValue) {
        let key = key.to_uppercase();
        if !self.keywords.contains_key(&key) {
            self.keyword_order.push(key.clone());
        }
        self.keywords.insert(key, value);
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.insert(key, FitsValue::String(value.to_string()));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.insert(key, FitsValue::Integer(value));
    }

    pub fn set_float(&mut self, key: &str, value: f64) {
        self.insert(key, FitsValue::Float(value));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.insert(key, FitsValue::Boolean(value));
    }

    pub fn get(&self, key: &str) -> Option<&FitsValue> {
        self.keywords.get(&key.to_uppercase())
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_string())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    /// Keywords in header order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FitsValue)> {
        self.keyword_order
            .iter()
            .filter_map(|k| self.keywords.get(k).map(|v| (k.as_str(), v)))
    }

    /// Flattened header for metadata responses
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    pub fn len(&self) -> usize {
        self.keyword_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyword_order.is_empty()
    }
}

/// Quick signature check used to route buffered bytes to the right decoder
pub fn looks_like_fits(bytes: &[u8]) -> bool {
    bytes.len() >= RECORD_SIZE && bytes.starts_with(b"SIMPLE")
}

/// Decode a FITS file held in memory
pub fn read_fits_from_bytes(bytes: &[u8]) -> ImagingResult<PixelBuffer> {
    let mut reader = std::io::Cursor::new(bytes);
    read_fits_from_reader(&mut reader)
}

/// Decode a FITS stream into a normalized buffer
pub fn read_fits_from_reader<R: Read>(reader: &mut R) -> ImagingResult<PixelBuffer> {
    let header = read_header(reader)?;

    let bitpix = header
        .get_int("BITPIX")
        .ok_or_else(|| ImagingError::MissingKeyword("BITPIX".to_string()))?;
    let naxis = header
        .get_int("NAXIS")
        .ok_or_else(|| ImagingError::MissingKeyword("NAXIS".to_string()))?;
    if naxis == 0 {
        return Err(ImagingError::InvalidFits("primary HDU holds no image".to_string()));
    }

    let width = header
        .get_int("NAXIS1")
        .ok_or_else(|| ImagingError::MissingKeyword("NAXIS1".to_string()))? as u32;
    let height = header.get_int("NAXIS2").unwrap_or(1) as u32;
    let channels = if naxis >= 3 {
        header.get_int("NAXIS3").unwrap_or(1) as u32
    } else {
        1
    };
    if channels != 1 && channels != 3 {
        return Err(ImagingError::InvalidFits(format!(
            "unsupported channel count {}",
            channels
        )));
    }

    let bzero = header.get_float("BZERO").unwrap_or(0.0);
    let bscale = header.get_float("BSCALE").unwrap_or(1.0);
    let count = (width * height * channels) as usize;

    let data: Vec<f32> = match bitpix {
        8 => read_samples::<_, 1>(reader, count, |b| b[0] as f64)?
            .into_iter()
            .map(|v| ((v * bscale + bzero) / 255.0) as f32)
            .collect(),
        16 => read_samples::<_, 2>(reader, count, |b| i16::from_be_bytes(b) as f64)?
            .into_iter()
            .map(|v| ((v * bscale + bzero) / 65535.0) as f32)
            .collect(),
        32 => read_samples::<_, 4>(reader, count, |b| i32::from_be_bytes(b) as f64)?
            .into_iter()
            .map(|v| ((v * bscale + bzero) / u32::MAX as f64) as f32)
            .collect(),
        -32 => {
            let raw = read_samples::<_, 4>(reader, count, |b| f32::from_be_bytes(b) as f64)?;
            normalize_float(raw, bscale, bzero)
        }
        -64 => {
            let raw = read_samples::<_, 8>(reader, count, f64::from_be_bytes)?;
            normalize_float(raw, bscale, bzero)
        }
        other => return Err(ImagingError::UnsupportedBitpix(other)),
    };

    let bayer = if channels == 1 {
        header.get_string("BAYERPAT").and_then(BayerPattern::from_keyword)
    } else {
        None
    };

    Ok(PixelBuffer {
        width,
        height,
        channels,
        data: data.into_iter().map(|v| v.clamp(0.0, 1.0)).collect(),
        header,
        bayer,
    })
}

/// Floating point frames are stored either already normalized or in ADU
fn normalize_float(raw: Vec<f64>, bscale: f64, bzero: f64) -> Vec<f32> {
    let scaled: Vec<f64> = raw.into_iter().map(|v| v * bscale + bzero).collect();
    let max = scaled.iter().cloned().fold(0.0_f64, f64::max);
    let divisor = if max > 1.0 { 65535.0 } else { 1.0 };
    scaled.into_iter().map(|v| (v / divisor) as f32).collect()
}

fn read_samples<R: Read, const N: usize>(
    reader: &mut R,
    count: usize,
    convert: impl Fn([u8; N]) -> f64,
) -> ImagingResult<Vec<f64>> {
    let mut buffer = vec![0u8; count * N];
    reader.read_exact(&mut buffer)?;
    Ok(buffer
        .chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            convert(bytes)
        })
        .collect())
}

/// Read 80-character records until END, then skip the block padding
fn read_header<R: Read>(reader: &mut R) -> ImagingResult<FitsHeader> {
    let mut header = FitsHeader::new();
    let mut record = [0u8; RECORD_SIZE];
    let mut records_read = 0usize;

    loop {
        reader.read_exact(&mut record)?;
        records_read += 1;

        if !record.is_ascii() {
            return Err(ImagingError::InvalidFits("non-ASCII header record".to_string()));
        }
        let card = String::from_utf8_lossy(&record);
        let keyword = card[..8].trim();
        if keyword == "END" {
            break;
        }
        if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
            continue;
        }
        if &card[8..10] == "= " {
            header.insert(keyword, parse_fits_value(&card[10..]));
        }
    }

    let consumed = records_read * RECORD_SIZE;
    let padding = (BLOCK_SIZE - consumed % BLOCK_SIZE) % BLOCK_SIZE;
    if padding > 0 {
        let mut skip = vec![0u8; padding];
        reader.read_exact(&mut skip)?;
    }

    Ok(header)
}

fn parse_fits_value(s: &str) -> FitsValue {
    let s = s.trim();

    if let Some(rest) = s.strip_prefix('\'') {
        let mut value = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    value.push('\'');
                    chars.next();
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        return FitsValue::String(value.trim_end().to_string());
    }

    let value_part = match s.find('/') {
        Some(idx) => s[..idx].trim(),
        None => s,
    };

    match value_part {
        "T" => return FitsValue::Boolean(true),
        "F" => return FitsValue::Boolean(false),
        _ => {}
    }
    if let Ok(i) = value_part.parse::<i64>() {
        return FitsValue::Integer(i);
    }
    if let Ok(f) = value_part.replace(['D', 'd'], "E").parse::<f64>() {
        return FitsValue::Float(f);
    }
    FitsValue::String(value_part.to_string())
}

/// Write a buffer as unsigned 16-bit FITS to any sink
///
/// Returns the number of bytes written.
pub fn write_fits<W: Write>(writer: &mut W, image: &PixelBuffer) -> ImagingResult<usize> {
    let mut written = 0usize;
    let naxis = if image.channels > 1 { 3 } else { 2 };

    written += write_card(writer, "SIMPLE", "T")?;
    written += write_card(writer, "BITPIX", "16")?;
    written += write_card(writer, "NAXIS", &naxis.to_string())?;
    written += write_card(writer, "NAXIS1", &image.width.to_string())?;
    written += write_card(writer, "NAXIS2", &image.height.to_string())?;
    if image.channels > 1 {
        written += write_card(writer, "NAXIS3", &image.channels.to_string())?;
    }
    written += write_card(writer, "BZERO", "32768")?;
    written += write_card(writer, "BSCALE", "1")?;

    for (key, value) in image.header.iter() {
        if STRUCTURAL_KEYWORDS.contains(&key) {
            continue;
        }
        // A debayered frame no longer has a CFA layout
        if image.channels > 1 && key == "BAYERPAT" {
            continue;
        }
        written += write_card(writer, key, &value.to_card())?;
    }
    if image.channels == 1 && image.header.get("BAYERPAT").is_none() {
        if let Some(pattern) = image.bayer {
            written += write_card(writer, "BAYERPAT", &format!("'{}'", pattern.keyword()))?;
        }
    }
    written += write_card(writer, "END", "")?;
    written += pad_block(writer, written, b' ')?;

    let mut data = Vec::with_capacity(image.data.len() * 2);
    for v in &image.data {
        let adu = (v.clamp(0.0, 1.0) * 65535.0).round() as i32;
        data.extend_from_slice(&((adu - 32768) as i16).to_be_bytes());
    }
    writer.write_all(&data)?;
    written += data.len();
    written += pad_block(writer, data.len(), 0)?;

    writer.flush()?;
    Ok(written)
}

/// Encode a buffer as FITS bytes
pub fn encode_fits(image: &PixelBuffer) -> ImagingResult<Vec<u8>> {
    let mut bytes = Vec::new();
    write_fits(&mut bytes, image)?;
    Ok(bytes)
}

fn pad_block<W: Write>(writer: &mut W, len: usize, fill: u8) -> ImagingResult<usize> {
    let padding = (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE;
    writer.write_all(&vec![fill; padding])?;
    Ok(padding)
}

/// Write one 80-byte card. Strings start at column 11, numbers end at column 30.
fn write_card<W: Write>(writer: &mut W, keyword: &str, value: &str) -> ImagingResult<usize> {
    let mut record = [b' '; RECORD_SIZE];

    let keyword_bytes = keyword.as_bytes();
    let keyword_len = keyword_bytes.len().min(8);
    record[..keyword_len].copy_from_slice(&keyword_bytes[..keyword_len]);

    if keyword != "END" && !value.is_empty() {
        record[8] = b'=';
        let value_bytes = value.as_bytes();
        let start = if value.starts_with('\'') {
            10
        } else {
            30_usize.saturating_sub(value_bytes.len()).max(10)
        };
        let value_len = value_bytes.len().min(RECORD_SIZE - start);
        record[start..start + value_len].copy_from_slice(&value_bytes[..value_len]);
    }

    writer.write_all(&record)?;
    Ok(RECORD_SIZE)
}

/// Plate solution stored in the header (WCS reference point)
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WcsSolution {
    /// Right ascension of the reference pixel, degrees (CRVAL1)
    pub ra: f64,
    /// Declination of the reference pixel, degrees (CRVAL2)
    pub dec: f64,
    /// Image scale in arcseconds per pixel, when a CD matrix is present
    pub pixel_scale: Option<f64>,
    /// Field rotation in degrees, when a CD matrix is present
    pub rotation: Option<f64>,
}

impl WcsSolution {
    /// Extract the solution from CRVAL1/2 and the optional CD matrix
    pub fn from_header(header: &FitsHeader) -> Option<Self> {
        let ra = header.get_float("CRVAL1")?;
        let dec = header.get_float("CRVAL2")?;
        let (pixel_scale, rotation) =
            match (header.get_float("CD1_1"), header.get_float("CD2_1")) {
                (Some(cd1_1), Some(cd2_1)) => {
                    let scale = (cd1_1 * cd1_1 + cd2_1 * cd2_1).sqrt() * 3600.0;
                    (Some(scale), Some(cd2_1.atan2(-cd1_1).to_degrees()))
                }
                _ => (None, None),
            };
        Some(Self { ra, dec, pixel_scale, rotation })
    }

    /// Write the solution back as tangent-plane WCS keywords
    pub fn apply(&self, header: &mut FitsHeader, width: u32, height: u32) {
        header.set_float("CRVAL1", self.ra);
        header.set_float("CRVAL2", self.dec);
        header.set_float("CRPIX1", width as f64 / 2.0);
        header.set_float("CRPIX2", height as f64 / 2.0);
        if let (Some(scale), Some(rotation)) = (self.pixel_scale, self.rotation) {
            let scale_deg = scale / 3600.0;
            let (sin_rot, cos_rot) = rotation.to_radians().sin_cos();
            header.set_float("CD1_1", -scale_deg * cos_rot);
            header.set_float("CD1_2", scale_deg * sin_rot);
            header.set_float("CD2_1", scale_deg * sin_rot);
            header.set_float("CD2_2", scale_deg * cos_rot);
        }
        header.set_string("CTYPE1", "RA---TAN");
        header.set_string("CTYPE2", "DEC--TAN");
        header.set_float("EQUINOX", 2000.0);
    }
}
