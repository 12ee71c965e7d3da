//! Length-tagged luminance histogram sized by source bit depth.

/// Pixel-count histogram with one bin per representable sample value.
///
/// The bin array length is fixed by the bit depth at construction (256 or
/// 65536), so bin indexing can never disagree with the source depth.
#[derive(Debug, Clone)]
pub struct Histogram {
    bins: Vec<u32>,
    bit_depth: u8,
    total: u64,
}

impl Histogram {
    pub fn new(bit_depth: u8) -> Self {
        debug_assert!(bit_depth == 8 || bit_depth == 16);
        Self {
            bins: vec![0; 1usize << bit_depth],
            bit_depth,
            total: 0,
        }
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn bins(&self) -> &[u32] {
        &self.bins
    }

    /// Total number of recorded samples.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn record(&mut self, value: u32) {
        self.bins[value as usize] += 1;
        self.total += 1;
    }

    /// Lowest bin with a nonzero count; the display black point.
    pub fn black_point(&self) -> u32 {
        self.bins
            .iter()
            .position(|&c| c > 0)
            .map(|i| i as u32)
            .unwrap_or(0)
    }

    /// Display white point for a given white-point fraction.
    ///
    /// Walks from the top of the range downward, accumulating counts until the
    /// cumulative count reaches `white_fraction` of all samples. A fraction of
    /// zero keeps the full range.
    pub fn white_point(&self, white_fraction: f64) -> u32 {
        let threshold = white_fraction * self.total as f64;
        let mut cumulative = 0u64;
        for i in (0..self.bins.len()).rev() {
            cumulative += self.bins[i] as u64;
            if cumulative as f64 >= threshold {
                return i as u32;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram_from(values: &[u32]) -> Histogram {
        let mut h = Histogram::new(8);
        for &v in values {
            h.record(v);
        }
        h
    }

    #[test]
    fn test_black_point_lowest_nonzero() {
        let h = histogram_from(&[12, 40, 200]);
        assert_eq!(h.black_point(), 12);
    }

    #[test]
    fn test_white_point_zero_fraction_is_full_range() {
        let h = histogram_from(&[12, 40, 200]);
        assert_eq!(h.white_point(0.0), 255);
    }

    #[test]
    fn test_white_point_walks_down() {
        // 100 pixels at 10, 1 pixel at 250: clipping 1% of pixels white
        // lands the white point at the bright outlier, 5% walks past it.
        let mut h = Histogram::new(8);
        for _ in 0..100 {
            h.record(10);
        }
        h.record(250);
        assert_eq!(h.white_point(0.005), 250);
        assert_eq!(h.white_point(0.05), 10);
    }

    #[test]
    fn test_white_point_monotonic_in_fraction() {
        let mut h = Histogram::new(16);
        for v in [100u32, 500, 1000, 30000, 60000, 60001, 65000] {
            for _ in 0..10 {
                h.record(v);
            }
        }
        let fractions = [0.0, 0.001, 0.01, 0.05, 0.2, 0.5, 1.0];
        let mut last = u32::MAX;
        for f in fractions {
            let wp = h.white_point(f);
            assert!(wp <= last, "white point rose from {} to {} at fraction {}", last, wp, f);
            last = wp;
        }
    }

    #[test]
    fn test_empty_histogram() {
        let h = Histogram::new(8);
        assert_eq!(h.total(), 0);
        assert_eq!(h.black_point(), 0);
        assert_eq!(h.white_point(0.01), 255);
    }
}
