//! Concurrent store of live preview images, one entry per logical stream.
//!
//! The cache is the only shared mutable structure in the pipeline. A single
//! lock serializes every mutating operation, which also pins the apply order
//! of `create`/`recreate` calls per key; readers receive `Arc` clones and can
//! never observe a half-built entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::buffer::DecodedImage;
use crate::debayer::demosaic_image;
use crate::decode::{decode, BlobPayload};
use crate::histogram::Histogram;
use crate::preview::{PreviewImage, WcsInfo};
use crate::stretch::{stretch, StretchConfig};

/// Stable identity of one live preview slot:
/// `{producer_id}.{stream_id}.{channel_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(producer: &str, stream: &str, channel: &str) -> Self {
        Self(format!("{}.{}.{}", producer, stream, channel))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key → preview store with at most one live entry per key.
#[derive(Default)]
pub struct PreviewCache {
    entries: Mutex<HashMap<CacheKey, Arc<PreviewImage>>>,
}

impl PreviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a fresh payload and replace whatever lives under `key`.
    ///
    /// Returns false on decode failure; the previous entry, if any, stays
    /// untouched so the last good frame remains visible.
    pub fn create(&self, key: &CacheKey, blob: &BlobPayload, config: StretchConfig) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let (decoded, histogram) = match decode(blob) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "frame decode failed, keeping previous preview");
                return false;
            }
        };
        let preview = build_preview(Arc::new(decoded), Arc::new(histogram), config);
        if entries.insert(key.clone(), Arc::new(preview)).is_some() {
            tracing::debug!(key = %key, "replaced preview");
        }
        true
    }

    /// Rebuild the display raster from the retained raw buffer, without
    /// touching the original payload. False when `key` has no entry.
    pub fn recreate(&self, key: &CacheKey, config: StretchConfig) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(existing) = entries.get(key) else {
            return false;
        };
        let raw = Arc::clone(&existing.raw);
        let histogram = Arc::clone(&existing.histogram);
        let wcs = existing.wcs;
        let mut preview = build_preview(raw, histogram, config);
        preview.wcs = wcs;
        entries.insert(key.clone(), Arc::new(preview));
        true
    }

    /// Clone-on-read handle to the current entry.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<PreviewImage>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Mark the entry stale while a replacement exposure is in flight.
    pub fn obsolete(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) => {
                Arc::make_mut(entry).obsolete = true;
                true
            }
            None => false,
        }
    }

    /// Evict and free the entry.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    /// Attach a plate-solve solution to the current entry.
    pub fn attach_wcs(&self, key: &CacheKey, wcs: WcsInfo) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) => {
                Arc::make_mut(entry).wcs = Some(wcs);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// Demosaic (when the frame or config calls for it) and stretch into a
/// display raster. The retained raw frame stays pre-demosaic so a later
/// pattern change can rebuild from the mosaic.
fn build_preview(
    raw: Arc<DecodedImage>,
    histogram: Arc<Histogram>,
    config: StretchConfig,
) -> PreviewImage {
    let raster = if raw.pixel_format.is_bayer() {
        let pattern = config
            .bayer_pattern
            .or(raw.bayer_pattern)
            .unwrap_or(crate::buffer::BayerPattern::Rggb);
        let rgb = demosaic_image(&raw, pattern);
        stretch(&rgb, &histogram, config)
    } else {
        stretch(&raw, &histogram, config)
    };
    PreviewImage::new(raw, histogram, raster)
}
