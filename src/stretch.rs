//! Histogram-driven linear stretch of a decoded frame into an 8-bit display
//! raster.
//!
//! The black point is the lowest occupied histogram bin; the white point is
//! found by walking the histogram down from the top until a level-dependent
//! fraction of the pixels has been clipped. Multi-channel frames are mapped
//! with the shared min/max from the combined luminance histogram so the stretch
//! itself never shifts color balance.

use serde::{Deserialize, Serialize};

use crate::buffer::{BayerPattern, DecodedImage};
use crate::histogram::Histogram;

/// Stretch aggressiveness selected in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StretchLevel {
    /// Full-range mapping, no highlight clipping.
    None,
    Slight,
    Moderate,
    #[default]
    Normal,
    Hard,
}

impl StretchLevel {
    /// Fraction of the brightest pixels clipped to white at this level.
    pub fn white_fraction(self) -> f64 {
        match self {
            StretchLevel::None => 0.0,
            StretchLevel::Slight => 0.0005,
            StretchLevel::Moderate => 0.002,
            StretchLevel::Normal => 0.01,
            StretchLevel::Hard => 0.05,
        }
    }
}

/// Per-channel gain handling for color frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorBalance {
    /// Equalize channel means against the green channel.
    #[default]
    Auto,
    /// Channels pass through with only the shared min/max map applied.
    None,
}

/// Display settings applied when building or rebuilding a preview raster.
#[derive(Debug, Clone, Copy, Default)]
pub struct StretchConfig {
    pub level: StretchLevel,
    pub color_balance: ColorBalance,
    /// Overrides the pattern carried by the decoded frame, for sensors whose
    /// driver reports the wrong CFA layout.
    pub bayer_pattern: Option<BayerPattern>,
}

/// Map a decoded frame to an interleaved RGB8 display raster.
///
/// Mono input is replicated into all three lanes. A flat frame (empty
/// histogram range) maps to black; there is no division by zero.
pub fn stretch(image: &DecodedImage, histogram: &Histogram, config: StretchConfig) -> Vec<u8> {
    let min = histogram.black_point();
    let max = histogram.white_point(config.level.white_fraction());
    let channels = image.channel_count();
    let pixel_count = image.width * image.height;

    if max <= min {
        return vec![0u8; pixel_count * 3];
    }
    let range = (max - min) as f64;
    let scale = 255.0 / range;

    let gains = match (channels, config.color_balance) {
        (3, ColorBalance::Auto) => channel_gains(image),
        _ => [1.0; 3],
    };

    let mut out = Vec::with_capacity(pixel_count * 3);
    if channels == 1 {
        for i in 0..pixel_count {
            let v = map_sample(image.data.sample(i), min, range, scale, 1.0);
            out.push(v);
            out.push(v);
            out.push(v);
        }
    } else {
        for i in 0..pixel_count {
            for c in 0..3 {
                let raw = image.data.sample(i * 3 + c);
                out.push(map_sample(raw, min, range, scale, gains[c]));
            }
        }
    }
    out
}

fn map_sample(raw: u32, min: u32, range: f64, scale: f64, gain: f64) -> u8 {
    let v = (raw.saturating_sub(min) as f64 * gain).clamp(0.0, range);
    (v * scale) as u8
}

/// Per-channel gains that bring the red and blue means onto the green mean.
/// Clamped so a dead channel cannot blow up the raster.
fn channel_gains(image: &DecodedImage) -> [f64; 3] {
    let pixel_count = image.width * image.height;
    if pixel_count == 0 {
        return [1.0; 3];
    }
    let mut sums = [0u64; 3];
    for i in 0..pixel_count {
        for (c, sum) in sums.iter_mut().enumerate() {
            *sum += image.data.sample(i * 3 + c) as u64;
        }
    }
    let means = sums.map(|s| s as f64 / pixel_count as f64);
    let reference = means[1];
    if reference <= 0.0 {
        return [1.0; 3];
    }
    means.map(|m| {
        if m > 0.0 {
            (reference / m).clamp(0.25, 4.0)
        } else {
            1.0
        }
    })
}
