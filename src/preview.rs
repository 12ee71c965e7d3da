//! Display-ready preview images and their retained raw data.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::{DecodedImage, PixelFormat};
use crate::histogram::Histogram;

/// Sky-coordinate solution attached to a preview after plate solving.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WcsInfo {
    pub center_ra: f64,
    pub center_dec: f64,
    pub telescope_ra: f64,
    pub telescope_dec: f64,
    /// Field rotation in degrees.
    pub rotation_angle: f64,
    /// Mirror parity of the solution, +1 or -1.
    pub parity: f64,
    /// Arcseconds per pixel.
    pub pix_scale: f64,
}

/// A displayable frame plus everything needed to rebuild it.
///
/// The raw decoded buffer and its histogram are retained behind `Arc` so a
/// re-stretch shares them instead of copying, and pixel-value inspection reads
/// the original sample depth rather than the display raster.
#[derive(Debug, Clone)]
pub struct PreviewImage {
    pub width: usize,
    pub height: usize,
    /// Format of the retained raw frame, not of the display raster.
    pub pixel_format: PixelFormat,
    /// Interleaved RGB8 display raster.
    pub rgb_raster: Vec<u8>,
    pub raw: Arc<DecodedImage>,
    pub histogram: Arc<Histogram>,
    pub wcs: Option<WcsInfo>,
    /// Busy marker: a replacement exposure is in flight, keep showing this
    /// frame but overlay it as stale.
    pub obsolete: bool,
}

impl PreviewImage {
    pub fn new(raw: Arc<DecodedImage>, histogram: Arc<Histogram>, rgb_raster: Vec<u8>) -> Self {
        Self {
            width: raw.width,
            height: raw.height,
            pixel_format: raw.pixel_format,
            rgb_raster,
            raw,
            histogram,
            wcs: None,
            obsolete: false,
        }
    }

    /// Original-depth luminance value under a display pixel, for readout
    /// overlays. `None` outside the frame.
    pub fn raw_value(&self, x: usize, y: usize) -> Option<f64> {
        self.raw.luma(x as i64, y as i64)
    }
}
