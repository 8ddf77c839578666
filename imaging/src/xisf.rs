//! Monolithic XISF writer
//!
//! Layout: `XISF0100` signature, little-endian header length, four reserved
//! bytes, the XML header, then one attached planar UInt16 data block aligned
//! to a 4096-byte boundary. FITS keywords are carried over as `FITSKeyword`
//! elements so the frame's metadata survives conversion.

use crate::buffer::PixelBuffer;
use crate::error::{ImagingError, ImagingResult};
use std::io::Write;

const SIGNATURE: &[u8; 8] = b"XISF0100";
const BLOCK_ALIGNMENT: usize = 4096;
const PREAMBLE_LEN: usize = 16;

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn header_xml(image: &PixelBuffer, created: &str, data_offset: usize, data_len: usize) -> String {
    let color_space = if image.is_mono() { "Gray" } else { "RGB" };
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<xisf version=\"1.0\" xmlns=\"http://www.pixinsight.com/xisf\">\n");
    // Offsets are zero padded so the header length does not depend on them
    xml.push_str(&format!(
        "<Image geometry=\"{}:{}:{}\" sampleFormat=\"UInt16\" colorSpace=\"{}\" location=\"attachment:{:010}:{:010}\">\n",
        image.width, image.height, image.channels, color_space, data_offset, data_len
    ));
    for (key, value) in image.header.iter() {
        xml.push_str(&format!(
            "<FITSKeyword name=\"{}\" value=\"{}\" comment=\"\"/>\n",
            escape(key),
            escape(&value.to_string())
        ));
    }
    xml.push_str("</Image>\n");
    xml.push_str(&format!(
        "<Metadata><Property id=\"XISF:CreationTime\" type=\"String\" value=\"{}\"/></Metadata>\n",
        created
    ));
    xml.push_str("</xisf>");
    xml
}

/// Write a buffer as XISF to any sink. Returns the number of bytes written.
pub fn write_xisf<W: Write>(writer: &mut W, image: &PixelBuffer) -> ImagingResult<usize> {
    let data_len = image.data.len() * 2;

    let created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let probe = header_xml(image, &created, 0, data_len);
    let data_offset = (PREAMBLE_LEN + probe.len()).div_ceil(BLOCK_ALIGNMENT) * BLOCK_ALIGNMENT;
    let xml = header_xml(image, &created, data_offset, data_len);
    if xml.len() != probe.len() {
        return Err(ImagingError::Xisf("header length changed while laying out".to_string()));
    }

    writer.write_all(SIGNATURE)?;
    writer.write_all(&(xml.len() as u32).to_le_bytes())?;
    writer.write_all(&[0u8; 4])?;
    writer.write_all(xml.as_bytes())?;
    writer.write_all(&vec![0u8; data_offset - PREAMBLE_LEN - xml.len()])?;

    let mut data = Vec::with_capacity(data_len);
    for v in &image.data {
        data.extend_from_slice(&((v.clamp(0.0, 1.0) * 65535.0).round() as u16).to_le_bytes());
    }
    writer.write_all(&data)?;
    writer.flush()?;

    Ok(data_offset + data_len)
}
