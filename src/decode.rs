//! Format dispatch and binary decoding of camera frame payloads.
//!
//! A frame arrives as an opaque byte blob tagged with a file-extension-like
//! format tag. FITS and the fixed-header RAW format are parsed here directly;
//! everything else is delegated to the `image` codec collection. Decoding
//! produces the pixel buffer together with its luminance histogram in a single
//! pass over the payload.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::buffer::{BayerPattern, DecodedImage, PixelData, PixelFormat};
use crate::histogram::Histogram;

/// Raw frame payload handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct BlobPayload {
    pub bytes: Vec<u8>,
    /// Case-insensitive extension-like tag, e.g. ".fits", ".raw", ".jpg".
    pub format_tag: String,
}

impl BlobPayload {
    pub fn new(bytes: Vec<u8>, format_tag: impl Into<String>) -> Self {
        Self {
            bytes,
            format_tag: format_tag.into(),
        }
    }
}

/// Recoverable decode failures; the caller drops the frame and keeps the
/// previous preview.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported bit depth {0}")]
    UnsupportedBitDepth(i64),
    #[error("unsupported color space: {0}")]
    UnsupportedColorSpace(String),
    #[error("truncated buffer: need {expected} bytes, have {actual}")]
    TruncatedBuffer { expected: usize, actual: usize },
    #[error("header parse error: {0}")]
    HeaderParseError(String),
    #[error("delegated codec failure: {0}")]
    DelegatedCodecFailure(#[from] image::ImageError),
}

const FITS_BLOCK: usize = 2880;
const FITS_CARD: usize = 80;

/// RAW header signatures: a fixed 12-byte little-endian header
/// (signature, width, height) in front of the pixel data.
pub const RAW_SIG_MONO8: u32 = 1;
pub const RAW_SIG_MONO16: u32 = 2;
pub const RAW_SIG_RGB24: u32 = 3;
pub const RAW_SIG_RGB48: u32 = 4;

/// Decode a tagged payload into a pixel buffer and its luminance histogram.
pub fn decode(blob: &BlobPayload) -> Result<(DecodedImage, Histogram), DecodeError> {
    let tag = blob
        .format_tag
        .trim_start_matches('.')
        .to_ascii_lowercase();
    match tag.as_str() {
        "fits" | "fit" | "fts" => decode_fits(&blob.bytes),
        "raw" => decode_raw(&blob.bytes),
        _ => decode_delegated(&blob.bytes),
    }
}

/// Parse the FITS primary header: 2880-byte blocks of 80-character cards,
/// terminated by an END card. Returns the keyword map and the data offset.
fn parse_fits_header(
    bytes: &[u8],
) -> Result<(std::collections::HashMap<String, String>, usize), DecodeError> {
    let mut keywords = std::collections::HashMap::new();
    let mut offset = 0;

    loop {
        let block = bytes.get(offset..offset + FITS_BLOCK).ok_or_else(|| {
            DecodeError::HeaderParseError("header ended before END card".to_string())
        })?;
        offset += FITS_BLOCK;

        let mut saw_end = false;
        for card in block.chunks(FITS_CARD) {
            let card = String::from_utf8_lossy(card);
            let card = card.trim();
            if card == "END" || card.starts_with("END ") {
                saw_end = true;
                break;
            }
            if card.is_empty() || card.starts_with("COMMENT") || card.starts_with("HISTORY") {
                continue;
            }
            if let Some(eq_pos) = card.find('=') {
                let keyword = card[..eq_pos].trim();
                let value_part = &card[eq_pos + 1..];
                // Strip the inline comment, then any string quoting.
                let value = match value_part.find('/') {
                    Some(comment_pos) => value_part[..comment_pos].trim(),
                    None => value_part.trim(),
                };
                let cleaned = value.trim_matches('\'').trim().to_string();
                if !keyword.is_empty() {
                    keywords.insert(keyword.to_string(), cleaned);
                }
            }
        }
        if saw_end {
            break;
        }
    }

    Ok((keywords, offset))
}

fn fits_int(
    keywords: &std::collections::HashMap<String, String>,
    name: &str,
) -> Result<i64, DecodeError> {
    keywords
        .get(name)
        .ok_or_else(|| DecodeError::HeaderParseError(format!("missing {} keyword", name)))?
        .parse::<i64>()
        .map_err(|_| DecodeError::HeaderParseError(format!("{} is not an integer", name)))
}

fn decode_fits(bytes: &[u8]) -> Result<(DecodedImage, Histogram), DecodeError> {
    let (keywords, data_offset) = parse_fits_header(bytes)?;

    let bitpix = fits_int(&keywords, "BITPIX")?;
    if bitpix != 8 && bitpix != 16 {
        return Err(DecodeError::UnsupportedBitDepth(bitpix));
    }
    let naxis = fits_int(&keywords, "NAXIS")?;
    if naxis != 2 && naxis != 3 {
        return Err(DecodeError::UnsupportedColorSpace(format!("NAXIS={}", naxis)));
    }
    let width = fits_int(&keywords, "NAXIS1")?;
    let height = fits_int(&keywords, "NAXIS2")?;
    if width <= 0 || height <= 0 {
        return Err(DecodeError::HeaderParseError(format!(
            "invalid dimensions {}x{}",
            width, height
        )));
    }
    let channels = if naxis == 3 {
        let naxis3 = fits_int(&keywords, "NAXIS3")?;
        if naxis3 != 3 {
            return Err(DecodeError::UnsupportedColorSpace(format!("NAXIS3={}", naxis3)));
        }
        3usize
    } else {
        1usize
    };

    let bayer_pattern = if channels == 1 {
        keywords
            .get("BAYERPAT")
            .and_then(|v| BayerPattern::from_keyword(v))
    } else {
        None
    };

    let width = width as usize;
    let height = height as usize;
    let bytes_per_sample = (bitpix / 8) as usize;
    // Checked size arithmetic: a declared geometry whose byte size overflows
    // usize cannot fit in any payload.
    let expected = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(channels))
        .and_then(|n| n.checked_mul(bytes_per_sample))
        .and_then(|n| n.checked_add(data_offset))
        .unwrap_or(usize::MAX);
    if bytes.len() < expected {
        return Err(DecodeError::TruncatedBuffer {
            expected,
            actual: bytes.len(),
        });
    }
    let samples = width * height * channels;
    let payload = &bytes[data_offset..expected];

    let pixel_format = match (bitpix, channels, bayer_pattern.is_some()) {
        (8, 1, false) => PixelFormat::Mono8,
        (8, 1, true) => PixelFormat::BayerMono8,
        (8, 3, _) => PixelFormat::Rgb8,
        (16, 1, false) => PixelFormat::Mono16,
        (16, 1, true) => PixelFormat::BayerMono16,
        (16, 3, _) => PixelFormat::Rgb16,
        _ => unreachable!(),
    };

    let mut histogram = Histogram::new(pixel_format.bit_depth());
    let plane = width * height;

    // FITS NAXIS=3 data is channel-major planar; re-interleave while copying.
    // The histogram is filled in the same pass.
    let data = if bitpix == 8 {
        let mut out = vec![0u8; samples];
        for (i, &v) in payload.iter().enumerate() {
            let dst = if channels == 3 {
                (i % plane) * 3 + i / plane
            } else {
                i
            };
            out[dst] = v;
            histogram.record(v as u32);
        }
        PixelData::U8(out)
    } else {
        // 16-bit FITS samples are big-endian signed with the BZERO=32768
        // convention; shift back to unsigned.
        let mut out = vec![0u16; samples];
        for i in 0..samples {
            let raw = i16::from_be_bytes([payload[i * 2], payload[i * 2 + 1]]);
            let v = (raw as i32 + 32768) as u16;
            let dst = if channels == 3 {
                (i % plane) * 3 + i / plane
            } else {
                i
            };
            out[dst] = v;
            histogram.record(v as u32);
        }
        PixelData::U16(out)
    };

    Ok((
        DecodedImage::new(width, height, pixel_format, data, bayer_pattern),
        histogram,
    ))
}

fn decode_raw(bytes: &[u8]) -> Result<(DecodedImage, Histogram), DecodeError> {
    if bytes.len() < 12 {
        return Err(DecodeError::HeaderParseError(
            "RAW header shorter than 12 bytes".to_string(),
        ));
    }
    let signature = LittleEndian::read_u32(&bytes[0..4]);
    let width = LittleEndian::read_u32(&bytes[4..8]) as usize;
    let height = LittleEndian::read_u32(&bytes[8..12]) as usize;
    if width == 0 || height == 0 {
        return Err(DecodeError::HeaderParseError(format!(
            "invalid dimensions {}x{}",
            width, height
        )));
    }

    let pixel_format = match signature {
        RAW_SIG_MONO8 => PixelFormat::Mono8,
        RAW_SIG_MONO16 => PixelFormat::Mono16,
        RAW_SIG_RGB24 => PixelFormat::Rgb8,
        RAW_SIG_RGB48 => PixelFormat::Rgb16,
        other => {
            return Err(DecodeError::HeaderParseError(format!(
                "unknown RAW signature {:#x}",
                other
            )))
        }
    };

    // The declared geometry must fit inside the payload before any pixel
    // access happens; size arithmetic is checked so hostile dimensions
    // cannot overflow.
    let bytes_per_sample = pixel_format.bit_depth() as usize / 8;
    let expected = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(pixel_format.channel_count()))
        .and_then(|n| n.checked_mul(bytes_per_sample))
        .and_then(|n| n.checked_add(12))
        .unwrap_or(usize::MAX);
    if bytes.len() < expected {
        return Err(DecodeError::TruncatedBuffer {
            expected,
            actual: bytes.len(),
        });
    }
    let samples = width * height * pixel_format.channel_count();
    let payload = &bytes[12..expected];

    let mut histogram = Histogram::new(pixel_format.bit_depth());
    let data = if bytes_per_sample == 1 {
        let mut out = Vec::with_capacity(samples);
        for &v in payload {
            histogram.record(v as u32);
            out.push(v);
        }
        PixelData::U8(out)
    } else {
        let mut out = Vec::with_capacity(samples);
        for chunk in payload.chunks_exact(2) {
            let v = LittleEndian::read_u16(chunk);
            histogram.record(v as u32);
            out.push(v);
        }
        PixelData::U16(out)
    };

    Ok((
        DecodedImage::new(width, height, pixel_format, data, None),
        histogram,
    ))
}

/// Fallback for tags without a dedicated parser (JPEG, PNG, TIFF, ...):
/// hand the blob to the `image` codec collection and normalize whatever
/// comes back to mono or interleaved RGB at 8 or 16 bits.
fn decode_delegated(bytes: &[u8]) -> Result<(DecodedImage, Histogram), DecodeError> {
    use image::DynamicImage;

    let dynamic = image::load_from_memory(bytes)?;
    let width = dynamic.width() as usize;
    let height = dynamic.height() as usize;

    let (pixel_format, data, histogram) = match dynamic {
        DynamicImage::ImageLuma8(buf) => {
            let mut h = Histogram::new(8);
            let raw = buf.into_raw();
            for &v in &raw {
                h.record(v as u32);
            }
            (PixelFormat::Mono8, PixelData::U8(raw), h)
        }
        DynamicImage::ImageRgb8(buf) => {
            let mut h = Histogram::new(8);
            let raw = buf.into_raw();
            for &v in &raw {
                h.record(v as u32);
            }
            (PixelFormat::Rgb8, PixelData::U8(raw), h)
        }
        DynamicImage::ImageLuma16(buf) => {
            let mut h = Histogram::new(16);
            let raw = buf.into_raw();
            for &v in &raw {
                h.record(v as u32);
            }
            (PixelFormat::Mono16, PixelData::U16(raw), h)
        }
        DynamicImage::ImageRgb16(buf) => {
            let mut h = Histogram::new(16);
            let raw = buf.into_raw();
            for &v in &raw {
                h.record(v as u32);
            }
            (PixelFormat::Rgb16, PixelData::U16(raw), h)
        }
        other @ (DynamicImage::ImageRgba16(_) | DynamicImage::ImageLumaA16(_)) => {
            let mut h = Histogram::new(16);
            let raw = other.into_rgb16().into_raw();
            for &v in &raw {
                h.record(v as u32);
            }
            (PixelFormat::Rgb16, PixelData::U16(raw), h)
        }
        other => {
            let mut h = Histogram::new(8);
            let raw = other.into_rgb8().into_raw();
            for &v in &raw {
                h.record(v as u32);
            }
            (PixelFormat::Rgb8, PixelData::U8(raw), h)
        }
    };

    debug_assert_eq!(
        histogram.total() as usize,
        width * height * pixel_format.channel_count()
    );

    Ok((
        DecodedImage::new(width, height, pixel_format, data, None),
        histogram,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal FITS blob: header cards padded to one or more
    /// 2880-byte blocks, then big-endian signed 16-bit (or plain 8-bit) data.
    pub fn make_fits_16(
        width: usize,
        height: usize,
        pixels: &[u16],
        bayerpat: Option<&str>,
    ) -> Vec<u8> {
        let mut cards: Vec<String> = vec![
            "SIMPLE  =                    T".to_string(),
            "BITPIX  =                   16".to_string(),
            "NAXIS   =                    2".to_string(),
            format!("NAXIS1  = {:>20}", width),
            format!("NAXIS2  = {:>20}", height),
            "BZERO   =                32768".to_string(),
        ];
        if let Some(pat) = bayerpat {
            cards.push(format!("BAYERPAT= '{}'", pat));
        }
        cards.push("END".to_string());

        let mut out = pad_cards_to_block(&cards);
        for &v in pixels {
            let signed = (v as i32 - 32768) as i16;
            out.extend_from_slice(&signed.to_be_bytes());
        }
        out
    }

    fn pad_cards_to_block(cards: &[String]) -> Vec<u8> {
        let mut out = Vec::new();
        for card in cards {
            let mut bytes = card.clone().into_bytes();
            bytes.resize(80, b' ');
            out.extend_from_slice(&bytes);
        }
        while out.len() % 2880 != 0 {
            out.push(b' ');
        }
        out
    }

    fn make_raw(signature: u32, width: u32, height: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&signature.to_le_bytes());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_fits_mono16_roundtrip() {
        let pixels: Vec<u16> = (0..12).map(|i| 1000 + i * 100).collect();
        let blob = BlobPayload::new(make_fits_16(4, 3, &pixels, None), ".fits");
        let (img, hist) = decode(&blob).unwrap();
        assert_eq!(img.width, 4);
        assert_eq!(img.height, 3);
        assert_eq!(img.pixel_format, PixelFormat::Mono16);
        assert_eq!(img.data, PixelData::U16(pixels));
        assert_eq!(hist.total(), 12);
        assert_eq!(hist.black_point(), 1000);
    }

    #[test]
    fn test_fits_mono8() {
        let cards = vec![
            "SIMPLE  =                    T".to_string(),
            "BITPIX  =                    8".to_string(),
            "NAXIS   =                    2".to_string(),
            "NAXIS1  =                    3".to_string(),
            "NAXIS2  =                    2".to_string(),
            "END".to_string(),
        ];
        let mut bytes = pad_cards_to_block(&cards);
        bytes.extend_from_slice(&[10, 20, 30, 40, 50, 60]);
        let (img, hist) = decode(&BlobPayload::new(bytes, ".fts")).unwrap();
        assert_eq!(img.pixel_format, PixelFormat::Mono8);
        assert_eq!(img.data, PixelData::U8(vec![10, 20, 30, 40, 50, 60]));
        assert_eq!(hist.bit_depth(), 8);
        assert_eq!(hist.black_point(), 10);
    }

    #[test]
    fn test_fits_planar_rgb_is_reinterleaved() {
        // NAXIS=3 data arrives as whole channel planes; the decoder must
        // emit interleaved RGB.
        let cards = vec![
            "SIMPLE  =                    T".to_string(),
            "BITPIX  =                   16".to_string(),
            "NAXIS   =                    3".to_string(),
            "NAXIS1  =                    2".to_string(),
            "NAXIS2  =                    1".to_string(),
            "NAXIS3  =                    3".to_string(),
            "BZERO   =                32768".to_string(),
            "END".to_string(),
        ];
        let mut bytes = pad_cards_to_block(&cards);
        for v in [100u16, 200, 300, 400, 500, 600] {
            let signed = (v as i32 - 32768) as i16;
            bytes.extend_from_slice(&signed.to_be_bytes());
        }
        let (img, _) = decode(&BlobPayload::new(bytes, ".fits")).unwrap();
        assert_eq!(img.pixel_format, PixelFormat::Rgb16);
        assert_eq!(img.width, 2);
        assert_eq!(img.height, 1);
        assert_eq!(
            img.data,
            PixelData::U16(vec![100, 300, 500, 200, 400, 600])
        );
    }

    #[test]
    fn test_fits_bayer_keyword() {
        let pixels = vec![500u16; 16];
        let blob = BlobPayload::new(make_fits_16(4, 4, &pixels, Some("RGGB")), "FIT");
        let (img, _) = decode(&blob).unwrap();
        assert_eq!(img.pixel_format, PixelFormat::BayerMono16);
        assert_eq!(img.bayer_pattern, Some(BayerPattern::Rggb));
    }

    #[test]
    fn test_fits_truncated_payload() {
        let pixels = vec![500u16; 16];
        let mut bytes = make_fits_16(8, 8, &pixels, None); // declares 64 pixels
        bytes.truncate(bytes.len() - 2);
        let err = decode(&BlobPayload::new(bytes, ".fits")).unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedBuffer { .. }));
    }

    #[test]
    fn test_fits_unsupported_bitpix() {
        let mut bytes = make_fits_16(2, 2, &[0; 4], None);
        // Rewrite the BITPIX card in place.
        let card = b"BITPIX  =                  -32";
        bytes[80..80 + card.len()].copy_from_slice(card);
        let err = decode(&BlobPayload::new(bytes, ".fits")).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedBitDepth(-32)));
    }

    #[test]
    fn test_fits_missing_end_card() {
        let bytes = vec![b' '; 2880];
        let err = decode(&BlobPayload::new(bytes, ".fits")).unwrap_err();
        assert!(matches!(err, DecodeError::HeaderParseError(_)));
    }

    #[test]
    fn test_raw_mono8() {
        let payload: Vec<u8> = (0..6).map(|i| i * 10).collect();
        let blob = BlobPayload::new(make_raw(RAW_SIG_MONO8, 3, 2, &payload), ".raw");
        let (img, hist) = decode(&blob).unwrap();
        assert_eq!(img.pixel_format, PixelFormat::Mono8);
        assert_eq!(img.data, PixelData::U8(payload));
        assert_eq!(hist.total(), 6);
    }

    #[test]
    fn test_raw_rgb48() {
        let mut payload = Vec::new();
        for v in [100u16, 200, 300, 400, 500, 600] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let blob = BlobPayload::new(make_raw(RAW_SIG_RGB48, 2, 1, &payload), ".raw");
        let (img, _) = decode(&blob).unwrap();
        assert_eq!(img.pixel_format, PixelFormat::Rgb16);
        assert_eq!(img.channel_count(), 3);
        assert_eq!(img.data, PixelData::U16(vec![100, 200, 300, 400, 500, 600]));
    }

    #[test]
    fn test_raw_truncated_never_reads_past_payload() {
        // Declared geometry larger than payload in every format.
        for sig in [RAW_SIG_MONO8, RAW_SIG_MONO16, RAW_SIG_RGB24, RAW_SIG_RGB48] {
            let blob = BlobPayload::new(make_raw(sig, 1000, 1000, &[0u8; 64]), ".raw");
            let err = decode(&blob).unwrap_err();
            assert!(
                matches!(err, DecodeError::TruncatedBuffer { .. }),
                "signature {} accepted a short payload",
                sig
            );
        }
    }

    #[test]
    fn test_raw_overflowing_geometry_is_truncated() {
        // Maximal dimensions must fail the size check, not overflow it.
        let blob = BlobPayload::new(make_raw(RAW_SIG_RGB24, u32::MAX, u32::MAX, &[0u8; 64]), ".raw");
        assert!(matches!(
            decode(&blob).unwrap_err(),
            DecodeError::TruncatedBuffer { .. }
        ));
    }

    #[test]
    fn test_fits_overflowing_geometry_is_truncated() {
        let cards = vec![
            "SIMPLE  =                    T".to_string(),
            "BITPIX  =                   16".to_string(),
            "NAXIS   =                    2".to_string(),
            "NAXIS1  =           4294967295".to_string(),
            "NAXIS2  =           4294967295".to_string(),
            "END".to_string(),
        ];
        let mut bytes = pad_cards_to_block(&cards);
        bytes.extend_from_slice(&[0u8; 128]);
        assert!(matches!(
            decode(&BlobPayload::new(bytes, ".fits")).unwrap_err(),
            DecodeError::TruncatedBuffer { .. }
        ));
    }

    #[test]
    fn test_raw_unknown_signature() {
        let blob = BlobPayload::new(make_raw(99, 2, 2, &[0u8; 16]), ".raw");
        assert!(matches!(
            decode(&blob).unwrap_err(),
            DecodeError::HeaderParseError(_)
        ));
    }

    #[test]
    fn test_delegated_png() {
        let img = image::GrayImage::from_fn(8, 8, |x, y| image::Luma([(x * 8 + y) as u8 * 4]));
        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        let (decoded, hist) = decode(&BlobPayload::new(bytes, ".png")).unwrap();
        assert_eq!(decoded.pixel_format, PixelFormat::Mono8);
        assert_eq!(decoded.width, 8);
        assert_eq!(hist.total(), 64);
    }

    #[test]
    fn test_delegated_garbage_fails() {
        let blob = BlobPayload::new(vec![0xde, 0xad, 0xbe, 0xef], ".jpg");
        assert!(matches!(
            decode(&blob).unwrap_err(),
            DecodeError::DelegatedCodecFailure(_)
        ));
    }
}
