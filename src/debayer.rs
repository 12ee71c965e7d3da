//! Bilinear demosaic of Bayer-patterned mosaics into interleaved RGB.
//!
//! Pure functions over borrowed buffers; output keeps the source bit depth.
//! Edge sampling is clamped to the frame, so odd widths and heights can never
//! index out of bounds.

use crate::buffer::{BayerPattern, CfaColor, DecodedImage, PixelData, PixelFormat};

/// Sample type that can round-trip through u32 accumulation.
trait BayerSample: Copy {
    fn widen(self) -> u32;
    fn narrow(v: u32) -> Self;
}

impl BayerSample for u8 {
    fn widen(self) -> u32 {
        self as u32
    }
    fn narrow(v: u32) -> Self {
        v as u8
    }
}

impl BayerSample for u16 {
    fn widen(self) -> u32 {
        self as u32
    }
    fn narrow(v: u32) -> Self {
        v as u16
    }
}

/// Demosaic an 8-bit mosaic into interleaved RGB8.
pub fn demosaic_u8(src: &[u8], width: usize, height: usize, pattern: BayerPattern) -> Vec<u8> {
    demosaic(src, width, height, pattern)
}

/// Demosaic a 16-bit mosaic into interleaved RGB16.
pub fn demosaic_u16(src: &[u16], width: usize, height: usize, pattern: BayerPattern) -> Vec<u16> {
    demosaic(src, width, height, pattern)
}

/// Demosaic a whole decoded frame. Non-Bayer frames pass through unchanged.
pub fn demosaic_image(image: &DecodedImage, pattern: BayerPattern) -> DecodedImage {
    if !image.pixel_format.is_bayer() {
        return image.clone();
    }
    let (data, format) = match &image.data {
        PixelData::U8(buf) => (
            PixelData::U8(demosaic_u8(buf, image.width, image.height, pattern)),
            PixelFormat::Rgb8,
        ),
        PixelData::U16(buf) => (
            PixelData::U16(demosaic_u16(buf, image.width, image.height, pattern)),
            PixelFormat::Rgb16,
        ),
    };
    DecodedImage::new(image.width, image.height, format, data, Some(pattern))
}

fn demosaic<T: BayerSample>(
    src: &[T],
    width: usize,
    height: usize,
    pattern: BayerPattern,
) -> Vec<T> {
    assert_eq!(src.len(), width * height);
    let mut out = Vec::with_capacity(width * height * 3);

    // Clamped fetch; edge pixels reuse their nearest in-bounds neighbor.
    let at = |x: i64, y: i64| -> u32 {
        let x = x.clamp(0, width as i64 - 1) as usize;
        let y = y.clamp(0, height as i64 - 1) as usize;
        src[y * width + x].widen()
    };

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let here = at(x, y);
            let plus = (at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1)) / 4;
            let cross = (at(x - 1, y - 1) + at(x + 1, y - 1) + at(x - 1, y + 1) + at(x + 1, y + 1)) / 4;
            let horizontal = (at(x - 1, y) + at(x + 1, y)) / 2;
            let vertical = (at(x, y - 1) + at(x, y + 1)) / 2;

            let (r, g, b) = match pattern.color_at(x as usize, y as usize) {
                CfaColor::Red => (here, plus, cross),
                CfaColor::Blue => (cross, plus, here),
                CfaColor::Green => {
                    // Red neighbors sit horizontally when this green shares a
                    // row with red pixels, vertically otherwise.
                    let red_row = (y as usize % 2 == 0) == pattern.red_row_even();
                    if red_row {
                        (horizontal, here, vertical)
                    } else {
                        (vertical, here, horizontal)
                    }
                }
            };
            out.push(T::narrow(r));
            out.push(T::narrow(g));
            out.push(T::narrow(b));
        }
    }

    out
}
