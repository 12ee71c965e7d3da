//! Sub-pixel star photometry: centroid refinement, half-flux diameter, and
//! signal-to-noise statistics around a seed coordinate.
//!
//! `measure_star` is a total function: every failure path reports
//! `valid = false` with a human-readable reason instead of an error, so a bad
//! frame can never abort a focus or alignment loop. All loops are bounded by
//! fixed window and radius limits.

use serde::Serialize;

use crate::buffer::DecodedImage;

/// Half-size of the square window used for local statistics (17x17 pixels).
const STAT_RADIUS: i64 = 8;
/// Half-size of the centroid refinement window.
const CENTROID_RADIUS: i64 = 8;
const MAX_CENTROID_PASSES: usize = 5;
/// Positional convergence bound in pixels.
const CENTROID_TOLERANCE: f64 = 0.01;
/// Minimum pixels above the centroid threshold for a credible star.
const MIN_STAR_PIXELS: usize = 3;
/// Outer bound for flux collection, aperture, and annulus radii.
const MAX_RADIUS: f64 = 50.0;
const MIN_HALF_FLUX_RADIUS: f64 = 0.5;
/// Aperture radius as a multiple of the half-flux radius; 2x HFR captures
/// roughly 94% of a Gaussian-like PSF.
const APERTURE_FACTOR: f64 = 2.0;
const ANNULUS_INNER_FACTOR: f64 = 1.5;
const ANNULUS_OUTER_FACTOR: f64 = 3.0;
/// MAD to standard deviation conversion for a normal distribution.
const MAD_SIGMA: f64 = 1.4826;
const SIGMA_CLIP: f64 = 3.0;
/// Sanity bound against pathological inputs.
const MAX_SNR: f64 = 1000.0;
/// Peak at or above this fraction of the bit-depth ceiling counts as clipped.
const SATURATION_FRACTION: f64 = 0.95;

/// One star measurement. Always recomputed from current pixel data; never
/// carries identity across frames.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StarMeasurement {
    pub valid: bool,
    pub snr: f64,
    /// Half-flux diameter in pixels.
    pub hfd: f64,
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub signal_mean: f64,
    pub signal_stddev: f64,
    pub background_mean: f64,
    pub background_stddev: f64,
    /// Aperture radius used for the signal statistics.
    pub star_radius: f64,
    /// 0 = circular, toward 1 = elongated.
    pub eccentricity: f64,
    /// Major-axis position angle in radians, counter-clockwise from +X.
    pub major_axis_angle: f64,
    pub peak_value: f64,
    pub is_saturated: bool,
    /// Failure reason when `valid` is false.
    pub reason: Option<String>,
}

impl StarMeasurement {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Measure the star nearest to a seed coordinate.
pub fn measure_star(image: &DecodedImage, seed_x: f64, seed_y: f64) -> StarMeasurement {
    // Local statistics over a fixed window around the seed.
    let sx = seed_x.round() as i64;
    let sy = seed_y.round() as i64;
    let mut window = Vec::with_capacity(((2 * STAT_RADIUS + 1) * (2 * STAT_RADIUS + 1)) as usize);
    for dy in -STAT_RADIUS..=STAT_RADIUS {
        for dx in -STAT_RADIUS..=STAT_RADIUS {
            if let Some(v) = image.luma(sx + dx, sy + dy) {
                window.push(v);
            }
        }
    }
    if window.is_empty() {
        return StarMeasurement::invalid("seed outside image");
    }
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let variance =
        window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64;
    let stddev = variance.sqrt();
    let peak = window.iter().cloned().fold(f64::MIN, f64::max);

    // Detection gate.
    if peak <= mean + 3.0 * stddev {
        return StarMeasurement::invalid("no star detected");
    }

    // Robust background: median of the window pixels the star does not reach.
    let mut background_sample: Vec<f64> =
        window.iter().cloned().filter(|&v| v < mean + stddev).collect();
    if background_sample.is_empty() {
        return StarMeasurement::invalid("no background sample");
    }
    let background = median(&mut background_sample);

    // Iterative intensity-weighted centroid refinement.
    let mut cx = seed_x;
    let mut cy = seed_y;
    let threshold = mean + 2.0 * stddev;
    for _ in 0..MAX_CENTROID_PASSES {
        let ix = cx.round() as i64;
        let iy = cy.round() as i64;
        let mut weight_sum = 0.0;
        let mut wx = 0.0;
        let mut wy = 0.0;
        let mut qualifying = 0usize;
        for dy in -CENTROID_RADIUS..=CENTROID_RADIUS {
            for dx in -CENTROID_RADIUS..=CENTROID_RADIUS {
                let (px, py) = (ix + dx, iy + dy);
                let Some(v) = image.luma(px, py) else { continue };
                if v <= threshold {
                    continue;
                }
                let w = (v - background).max(0.0);
                weight_sum += w;
                wx += px as f64 * w;
                wy += py as f64 * w;
                qualifying += 1;
            }
        }
        if qualifying < MIN_STAR_PIXELS {
            return StarMeasurement::invalid("too few pixels above threshold");
        }
        if weight_sum <= 0.0 {
            return StarMeasurement::invalid("zero centroid weight");
        }
        let nx = wx / weight_sum;
        let ny = wy / weight_sum;
        let shift = ((nx - cx).powi(2) + (ny - cy).powi(2)).sqrt();
        cx = nx;
        cy = ny;
        if shift < CENTROID_TOLERANCE {
            break;
        }
    }

    // Half-flux radius from the radially sorted flux profile.
    let collect_threshold = mean + stddev;
    let reach = MAX_RADIUS.ceil() as i64;
    let ix = cx.round() as i64;
    let iy = cy.round() as i64;
    let mut profile: Vec<(f64, f64)> = Vec::new();
    let mut total_flux = 0.0;
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            let (px, py) = (ix + dx, iy + dy);
            let Some(v) = image.luma(px, py) else { continue };
            if v <= collect_threshold {
                continue;
            }
            let dist = ((px as f64 - cx).powi(2) + (py as f64 - cy).powi(2)).sqrt();
            if dist > MAX_RADIUS {
                continue;
            }
            let flux = (v - background).max(0.0);
            total_flux += flux;
            profile.push((dist, flux));
        }
    }
    if total_flux <= 0.0 {
        return StarMeasurement::invalid("no flux above background");
    }
    profile.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut cumulative = 0.0;
    let mut half_flux_radius = MAX_RADIUS;
    for &(dist, flux) in &profile {
        cumulative += flux;
        if cumulative >= total_flux * 0.5 {
            half_flux_radius = dist;
            break;
        }
    }
    if !(MIN_HALF_FLUX_RADIUS..=MAX_RADIUS).contains(&half_flux_radius) {
        return StarMeasurement::invalid(format!(
            "half-flux radius {:.2} px out of range",
            half_flux_radius
        ));
    }
    let star_radius = (APERTURE_FACTOR * half_flux_radius).min(MAX_RADIUS);

    // Signal statistics inside the aperture, background statistics from a
    // sigma-clipped annulus around it.
    let annulus_inner = ANNULUS_INNER_FACTOR * star_radius;
    let annulus_outer = (ANNULUS_OUTER_FACTOR * star_radius).min(MAX_RADIUS);
    let outer_reach = annulus_outer.ceil().max(star_radius.ceil()) as i64;
    let mut signal = Vec::new();
    let mut annulus = Vec::new();
    for dy in -outer_reach..=outer_reach {
        for dx in -outer_reach..=outer_reach {
            let (px, py) = (ix + dx, iy + dy);
            let Some(v) = image.luma(px, py) else { continue };
            let dist = ((px as f64 - cx).powi(2) + (py as f64 - cy).powi(2)).sqrt();
            if dist <= star_radius {
                signal.push(v);
            } else if dist > annulus_inner && dist <= annulus_outer {
                annulus.push(v);
            }
        }
    }
    if signal.is_empty() {
        return StarMeasurement::invalid("empty star aperture");
    }
    if annulus.is_empty() {
        return StarMeasurement::invalid("empty background annulus");
    }
    let (signal_mean, signal_stddev) = mean_stddev(&signal);
    let (background_mean, background_stddev) = sigma_clipped_stats(&mut annulus);
    if background_stddev <= 0.0 {
        return StarMeasurement::invalid("zero background deviation");
    }
    let snr = (signal_mean - background_mean) / background_stddev;
    if snr <= 0.0 || snr >= MAX_SNR {
        return StarMeasurement::invalid(format!("snr {:.1} out of range", snr));
    }

    let (eccentricity, major_axis_angle) =
        shape_from_moments(image, cx, cy, star_radius, background_mean);

    let max_value = image.pixel_format.max_value() as f64;
    StarMeasurement {
        valid: true,
        snr,
        hfd: 2.0 * half_flux_radius,
        centroid_x: cx,
        centroid_y: cy,
        signal_mean,
        signal_stddev,
        background_mean,
        background_stddev,
        star_radius,
        eccentricity,
        major_axis_angle,
        peak_value: peak,
        is_saturated: peak >= SATURATION_FRACTION * max_value,
        reason: None,
    }
}

/// Eccentricity and major-axis angle from intensity-weighted second-order
/// moments of the background-subtracted aperture, via the eigenvalues of the
/// 2x2 covariance matrix.
fn shape_from_moments(
    image: &DecodedImage,
    cx: f64,
    cy: f64,
    radius: f64,
    background: f64,
) -> (f64, f64) {
    let reach = radius.ceil() as i64;
    let ix = cx.round() as i64;
    let iy = cy.round() as i64;
    let mut sum_w = 0.0;
    let mut m_xx = 0.0;
    let mut m_yy = 0.0;
    let mut m_xy = 0.0;
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            let (px, py) = (ix + dx, iy + dy);
            let Some(v) = image.luma(px, py) else { continue };
            let rx = px as f64 - cx;
            let ry = py as f64 - cy;
            if rx * rx + ry * ry > radius * radius {
                continue;
            }
            let w = (v - background).max(0.0);
            if w <= 0.0 {
                continue;
            }
            sum_w += w;
            m_xx += w * rx * rx;
            m_yy += w * ry * ry;
            m_xy += w * rx * ry;
        }
    }
    if sum_w <= 0.0 {
        return (0.0, 0.0);
    }
    m_xx /= sum_w;
    m_yy /= sum_w;
    m_xy /= sum_w;

    let trace = m_xx + m_yy;
    let det = m_xx * m_yy - m_xy * m_xy;
    let disc = (trace * trace - 4.0 * det).max(0.0).sqrt();
    let lambda1 = (trace + disc) * 0.5;
    let lambda2 = (trace - disc) * 0.5;
    if lambda1 <= 0.0 {
        return (0.0, 0.0);
    }
    let eccentricity = (1.0 - (lambda2 / lambda1).max(0.0)).max(0.0).sqrt();
    let angle = 0.5 * (2.0 * m_xy).atan2(m_xx - m_yy);
    (eccentricity, angle)
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn mean_stddev(values: &[f64]) -> (f64, f64) {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

/// Median + MAD based sigma clip, then plain statistics of the survivors.
/// Falls back to unclipped statistics when the sample has no spread.
fn sigma_clipped_stats(values: &mut Vec<f64>) -> (f64, f64) {
    let med = median(values);
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&mut deviations);
    let sigma = MAD_SIGMA * mad;
    if sigma > 0.0 {
        let lo = med - SIGMA_CLIP * sigma;
        let hi = med + SIGMA_CLIP * sigma;
        values.retain(|&v| v >= lo && v <= hi);
        if values.is_empty() {
            return (med, 0.0);
        }
    }
    mean_stddev(values)
}
