//! End-to-end tests over synthetic frames: payload bytes in, cached preview
//! and star metrics out.

use std::sync::Arc;

use anyhow::{Context, Result};
use rand::prelude::*;

use crate::buffer::{BayerPattern, PixelFormat};
use crate::cache::{CacheKey, PreviewCache};
use crate::decode::{BlobPayload, RAW_SIG_MONO16};
use crate::inspection::{inspect, GridSpec, InspectionOutcome, InspectionScheduler};
use crate::photometry::measure_star;
use crate::stretch::{StretchConfig, StretchLevel};

fn raw_mono16_blob(width: usize, height: usize, pixels: &[u16]) -> BlobPayload {
    let mut bytes = Vec::with_capacity(12 + pixels.len() * 2);
    bytes.extend_from_slice(&RAW_SIG_MONO16.to_le_bytes());
    bytes.extend_from_slice(&(width as u32).to_le_bytes());
    bytes.extend_from_slice(&(height as u32).to_le_bytes());
    for &v in pixels {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    BlobPayload::new(bytes, ".raw")
}

/// Noisy flat field with one Gaussian star, quantized to u16.
fn star_field(
    width: usize,
    height: usize,
    x0: f64,
    y0: f64,
    sigma: f64,
    amplitude: f64,
    seed: u64,
) -> Vec<u16> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pixels: Vec<f64> = (0..width * height)
        .map(|_| 1000.0 + (rng.gen::<f64>() - 0.5) * 120.0)
        .collect();
    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 - x0;
            let dy = y as f64 - y0;
            pixels[y * width + x] += amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
        }
    }
    pixels.iter().map(|&v| v.clamp(0.0, 65535.0) as u16).collect()
}

#[test]
fn test_exposure_to_preview_to_photometry() -> Result<()> {
    // One camera exposure travels the whole pipeline: decode into the cache,
    // read the preview, photometer the star from the retained raw frame.
    let pixels = star_field(200, 200, 100.0, 100.0, 2.0, 20000.0, 21);
    let blob = raw_mono16_blob(200, 200, &pixels);

    let cache = PreviewCache::new();
    let key = CacheKey::new("cam", "main", "0");
    assert!(cache.create(&key, &blob, StretchConfig::default()));

    let preview = cache.get(&key).context("preview missing after create")?;
    assert_eq!(preview.width, 200);
    assert_eq!(preview.pixel_format, PixelFormat::Mono16);
    assert_eq!(preview.rgb_raster.len(), 200 * 200 * 3);
    // The star must survive the stretch as a bright display pixel.
    let center = (100 * 200 + 100) * 3;
    assert!(preview.rgb_raster[center] > 200);

    let m = measure_star(&preview.raw, 100.0, 100.0);
    assert!(m.valid, "reason: {:?}", m.reason);
    assert!(m.snr > 8.0, "snr = {}", m.snr);
    assert!((m.centroid_x - 100.0).abs() < 0.5);
    assert!((m.centroid_y - 100.0).abs() < 0.5);
    Ok(())
}

#[test]
fn test_restretch_shares_raw_and_changes_raster() -> Result<()> {
    let pixels = star_field(64, 64, 32.0, 32.0, 2.0, 15000.0, 22);
    let blob = raw_mono16_blob(64, 64, &pixels);

    let cache = PreviewCache::new();
    let key = CacheKey::new("cam", "main", "0");
    cache.create(&key, &blob, StretchConfig::default());
    let before = cache.get(&key).context("preview missing after create")?;

    assert!(cache.recreate(
        &key,
        StretchConfig {
            level: StretchLevel::Hard,
            ..Default::default()
        },
    ));
    let after = cache.get(&key).context("preview missing after recreate")?;
    assert!(Arc::ptr_eq(&before.raw, &after.raw));
    assert_ne!(before.rgb_raster, after.rgb_raster);
    Ok(())
}

/// Minimal Bayer FITS blob: one padded header block, then big-endian
/// signed 16-bit data under the BZERO=32768 convention.
fn bayer_fits_blob(width: usize, height: usize, value: u16) -> BlobPayload {
    let cards = [
        "SIMPLE  =                    T".to_string(),
        "BITPIX  =                   16".to_string(),
        "NAXIS   =                    2".to_string(),
        format!("NAXIS1  = {:>20}", width),
        format!("NAXIS2  = {:>20}", height),
        "BZERO   =                32768".to_string(),
        "BAYERPAT= 'RGGB'".to_string(),
        "END".to_string(),
    ];
    let mut bytes = Vec::new();
    for card in &cards {
        let mut card = card.clone().into_bytes();
        card.resize(80, b' ');
        bytes.extend_from_slice(&card);
    }
    while bytes.len() % 2880 != 0 {
        bytes.push(b' ');
    }
    let signed = (value as i32 - 32768) as i16;
    for _ in 0..width * height {
        bytes.extend_from_slice(&signed.to_be_bytes());
    }
    BlobPayload::new(bytes, ".fits")
}

#[test]
fn test_bayer_exposure_demosaics_in_preview() -> Result<()> {
    // A flat Bayer mosaic must come out as a flat RGB raster.
    let blob = bayer_fits_blob(32, 32, 3000);

    let cache = PreviewCache::new();
    let key = CacheKey::new("cam", "osc", "0");
    assert!(cache.create(&key, &blob, StretchConfig::default()));
    let preview = cache.get(&key).context("preview missing after create")?;
    assert_eq!(preview.pixel_format, PixelFormat::BayerMono16);
    assert_eq!(preview.raw.bayer_pattern, Some(BayerPattern::Rggb));
    assert_eq!(preview.rgb_raster.len(), 32 * 32 * 3);
    let first = preview.rgb_raster[0];
    assert!(preview.rgb_raster.iter().all(|&v| v == first));
    Ok(())
}

#[test]
fn test_inspection_over_cached_frame() -> Result<()> {
    let pixels = star_field(200, 200, 100.0, 100.0, 2.0, 20000.0, 23);
    let blob = raw_mono16_blob(200, 200, &pixels);

    let cache = PreviewCache::new();
    let key = CacheKey::new("cam", "main", "0");
    cache.create(&key, &blob, StretchConfig::default());
    let preview = cache.get(&key).context("preview missing after create")?;

    let scheduler = InspectionScheduler::new();
    let generation = scheduler.begin();
    let result = inspect(&preview.raw, GridSpec::default());
    match scheduler.complete(generation, result) {
        InspectionOutcome::Applied(result) => {
            assert_eq!(result.center.used, 1);
            assert_eq!(result.used_points.len(), 1);
        }
        InspectionOutcome::Superseded => panic!("no newer run was issued"),
    }
    Ok(())
}
