//! Owned pixel buffers and format descriptors shared by all pipeline stages.

use serde::Serialize;

/// 2x2 color filter array layout of a Bayer-patterned sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Gbrg,
    Grbg,
}

impl BayerPattern {
    /// Parse a FITS BAYERPAT keyword value ("RGGB", "BGGR", ...).
    pub fn from_keyword(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "RGGB" => Some(BayerPattern::Rggb),
            "BGGR" => Some(BayerPattern::Bggr),
            "GBRG" => Some(BayerPattern::Gbrg),
            "GRBG" => Some(BayerPattern::Grbg),
            _ => None,
        }
    }

    /// Filter color in front of the sensor pixel at (x, y).
    pub fn color_at(self, x: usize, y: usize) -> CfaColor {
        // Index into the repeating 2x2 tile.
        let idx = (y % 2) * 2 + (x % 2);
        match self {
            BayerPattern::Rggb => [CfaColor::Red, CfaColor::Green, CfaColor::Green, CfaColor::Blue][idx],
            BayerPattern::Bggr => [CfaColor::Blue, CfaColor::Green, CfaColor::Green, CfaColor::Red][idx],
            BayerPattern::Gbrg => [CfaColor::Green, CfaColor::Blue, CfaColor::Red, CfaColor::Green][idx],
            BayerPattern::Grbg => [CfaColor::Green, CfaColor::Red, CfaColor::Blue, CfaColor::Green][idx],
        }
    }

    /// True when the red-filtered pixels of this pattern sit on even rows.
    pub fn red_row_even(self) -> bool {
        matches!(self, BayerPattern::Rggb | BayerPattern::Grbg)
    }
}

/// Color of a single photosite in the CFA mosaic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaColor {
    Red,
    Green,
    Blue,
}

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    Mono8,
    Mono16,
    /// Single-channel 8-bit buffer carrying an undemosaiced CFA mosaic.
    BayerMono8,
    /// Single-channel 16-bit buffer carrying an undemosaiced CFA mosaic.
    BayerMono16,
    /// Interleaved 8-bit RGB.
    Rgb8,
    /// Interleaved 16-bit RGB.
    Rgb16,
}

impl PixelFormat {
    pub fn bit_depth(self) -> u8 {
        match self {
            PixelFormat::Mono8 | PixelFormat::BayerMono8 | PixelFormat::Rgb8 => 8,
            PixelFormat::Mono16 | PixelFormat::BayerMono16 | PixelFormat::Rgb16 => 16,
        }
    }

    pub fn channel_count(self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Rgb16 => 3,
            _ => 1,
        }
    }

    pub fn is_bayer(self) -> bool {
        matches!(self, PixelFormat::BayerMono8 | PixelFormat::BayerMono16)
    }

    /// Largest representable sample value for this depth.
    pub fn max_value(self) -> u32 {
        (1u32 << self.bit_depth()) - 1
    }

    /// Format after demosaicing a Bayer mosaic of this depth.
    pub fn demosaiced(self) -> PixelFormat {
        match self {
            PixelFormat::BayerMono8 => PixelFormat::Rgb8,
            PixelFormat::BayerMono16 => PixelFormat::Rgb16,
            other => other,
        }
    }
}

/// Owned sample storage at the source bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl PixelData {
    pub fn sample_count(&self) -> usize {
        match self {
            PixelData::U8(v) => v.len(),
            PixelData::U16(v) => v.len(),
        }
    }

    /// Sample at a flat index, widened for arithmetic.
    pub fn sample(&self, idx: usize) -> u32 {
        match self {
            PixelData::U8(v) => v[idx] as u32,
            PixelData::U16(v) => v[idx] as u32,
        }
    }
}

/// A fully decoded frame with its pixel geometry.
///
/// The buffer invariant `data.sample_count() == width * height * channel_count`
/// is established by the decoder and preserved by every stage that hands the
/// image onward.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: usize,
    pub height: usize,
    pub pixel_format: PixelFormat,
    pub data: PixelData,
    pub bayer_pattern: Option<BayerPattern>,
}

impl DecodedImage {
    pub fn new(
        width: usize,
        height: usize,
        pixel_format: PixelFormat,
        data: PixelData,
        bayer_pattern: Option<BayerPattern>,
    ) -> Self {
        debug_assert_eq!(
            data.sample_count(),
            width * height * pixel_format.channel_count()
        );
        Self {
            width,
            height,
            pixel_format,
            data,
            bayer_pattern,
        }
    }

    pub fn bit_depth(&self) -> u8 {
        self.pixel_format.bit_depth()
    }

    pub fn channel_count(&self) -> usize {
        self.pixel_format.channel_count()
    }

    /// Luminance sample at (x, y); the channel mean for interleaved RGB.
    /// Returns `None` outside the frame so callers can clamp or skip.
    pub fn luma(&self, x: i64, y: i64) -> Option<f64> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        let channels = self.channel_count();
        let base = (y as usize * self.width + x as usize) * channels;
        if channels == 1 {
            Some(self.data.sample(base) as f64)
        } else {
            let sum: u32 = (0..channels).map(|c| self.data.sample(base + c)).sum();
            Some(sum as f64 / channels as f64)
        }
    }
}
