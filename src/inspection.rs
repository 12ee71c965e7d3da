//! Frame-wide star quality inspection over a compass grid of cells.
//!
//! The frame is partitioned into a G x G grid; eight compass cells plus the
//! center cell are photometered and aggregated into per-direction HFD,
//! eccentricity, and star counts for the aberration/tilt overlay. Results are
//! always recomputed from scratch, and long runs are superseded rather than
//! aborted: a generation tag decides whether a finished run still applies.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::buffer::DecodedImage;
use crate::photometry::measure_star;

/// Candidate seeds examined per cell.
const MAX_CANDIDATES_PER_CELL: usize = 3;
/// Minimum separation between candidate seeds in one cell.
const CANDIDATE_SEPARATION: f64 = 16.0;
/// Inset that keeps seeds away from cell borders.
const CELL_MARGIN: usize = 4;
/// Stars more elongated than this fail shape sanity.
const MAX_ECCENTRICITY: f64 = 0.9;

/// Grid geometry and acceptance threshold for one inspection run.
#[derive(Debug, Clone, Copy)]
pub struct GridSpec {
    pub gx: usize,
    pub gy: usize,
    pub min_snr: f64,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            gx: 5,
            gy: 5,
            min_snr: 8.0,
        }
    }
}

/// The eight compass cells, clockwise from north.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// Grid cell for this direction; north is the top row.
    pub fn cell(self, gx: usize, gy: usize) -> (usize, usize) {
        match self {
            Direction::North => (gx / 2, 0),
            Direction::NorthEast => (gx - 1, 0),
            Direction::East => (gx - 1, gy / 2),
            Direction::SouthEast => (gx - 1, gy - 1),
            Direction::South => (gx / 2, gy - 1),
            Direction::SouthWest => (0, gy - 1),
            Direction::West => (0, gy / 2),
            Direction::NorthWest => (0, 0),
        }
    }
}

/// Aggregated star quality for one grid cell.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CellMetrics {
    /// Mean half-flux diameter of the accepted stars, 0 when none.
    pub hfd: f64,
    /// Mean eccentricity of the accepted stars, 0 when none.
    pub eccentricity: f64,
    pub detected: usize,
    pub used: usize,
    pub rejected: usize,
}

/// One complete inspection pass; superseded wholesale by the next run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InspectionResult {
    /// Indexed in `Direction::ALL` order.
    pub directions: [CellMetrics; 8],
    pub center: CellMetrics,
    /// Centroids of all accepted stars across the grid.
    pub used_points: Vec<(f64, f64)>,
    /// Aperture radii matching `used_points`.
    pub used_radii: Vec<f64>,
    /// Representative eccentricity per inspected cell, directions first,
    /// center last.
    pub cell_eccentricity: Vec<f64>,
    /// Representative major-axis angle per inspected cell, same order.
    pub cell_major_angle: Vec<f64>,
}

impl InspectionResult {
    pub fn direction(&self, direction: Direction) -> &CellMetrics {
        &self.directions[direction as usize]
    }
}

/// Photometer the eight compass cells and the center cell of the frame.
pub fn inspect(image: &DecodedImage, grid: GridSpec) -> InspectionResult {
    let mut result = InspectionResult::default();

    for (idx, direction) in Direction::ALL.iter().enumerate() {
        let (cx, cy) = direction.cell(grid.gx, grid.gy);
        let (metrics, shape) = inspect_cell(image, grid, cx, cy, &mut result);
        result.directions[idx] = metrics;
        result.cell_eccentricity.push(shape.0);
        result.cell_major_angle.push(shape.1);
    }

    let (center, shape) = inspect_cell(image, grid, grid.gx / 2, grid.gy / 2, &mut result);
    result.center = center;
    result.cell_eccentricity.push(shape.0);
    result.cell_major_angle.push(shape.1);

    result
}

/// Measure up to `MAX_CANDIDATES_PER_CELL` bright spots in one cell.
/// Returns the cell metrics plus the representative (eccentricity, angle)
/// of its first accepted star.
fn inspect_cell(
    image: &DecodedImage,
    grid: GridSpec,
    cell_x: usize,
    cell_y: usize,
    result: &mut InspectionResult,
) -> (CellMetrics, (f64, f64)) {
    let mut metrics = CellMetrics::default();
    let mut shape = (0.0, 0.0);

    let cell_w = image.width / grid.gx;
    let cell_h = image.height / grid.gy;
    if cell_w <= 2 * CELL_MARGIN || cell_h <= 2 * CELL_MARGIN {
        return (metrics, shape);
    }
    let x0 = cell_x * cell_w + CELL_MARGIN;
    let y0 = cell_y * cell_h + CELL_MARGIN;
    let x1 = cell_x * cell_w + cell_w - CELL_MARGIN;
    let y1 = cell_y * cell_h + cell_h - CELL_MARGIN;

    // Brightest pixels first, separated enough to be distinct stars.
    let mut candidates: Vec<(f64, usize, usize)> = Vec::with_capacity((x1 - x0) * (y1 - y0));
    for y in y0..y1 {
        for x in x0..x1 {
            if let Some(v) = image.luma(x as i64, y as i64) {
                candidates.push((v, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut seeds: Vec<(f64, f64)> = Vec::new();
    for &(_, x, y) in &candidates {
        if seeds.len() >= MAX_CANDIDATES_PER_CELL {
            break;
        }
        let (fx, fy) = (x as f64, y as f64);
        let separated = seeds
            .iter()
            .all(|&(sx, sy)| ((fx - sx).powi(2) + (fy - sy).powi(2)).sqrt() >= CANDIDATE_SEPARATION);
        if separated {
            seeds.push((fx, fy));
        }
    }

    let mut hfd_sum = 0.0;
    let mut ecc_sum = 0.0;
    let mut centroids: Vec<(f64, f64)> = Vec::new();
    for &(sx, sy) in &seeds {
        let m = measure_star(image, sx, sy);
        if !m.valid {
            continue;
        }
        // Separated seeds can still converge onto the same star; count each
        // star once, by refined centroid.
        let already_counted = centroids.iter().any(|&(ax, ay)| {
            ((m.centroid_x - ax).powi(2) + (m.centroid_y - ay).powi(2)).sqrt()
                < CANDIDATE_SEPARATION
        });
        if already_counted {
            continue;
        }
        centroids.push((m.centroid_x, m.centroid_y));
        metrics.detected += 1;
        if m.snr >= grid.min_snr && m.eccentricity <= MAX_ECCENTRICITY {
            metrics.used += 1;
            hfd_sum += m.hfd;
            ecc_sum += m.eccentricity;
            if metrics.used == 1 {
                shape = (m.eccentricity, m.major_axis_angle);
            }
            result.used_points.push((m.centroid_x, m.centroid_y));
            result.used_radii.push(m.star_radius);
        } else {
            metrics.rejected += 1;
        }
    }
    if metrics.used > 0 {
        metrics.hfd = hfd_sum / metrics.used as f64;
        metrics.eccentricity = ecc_sum / metrics.used as f64;
    }

    (metrics, shape)
}

/// Outcome of a finished inspection run under the supersede policy.
#[derive(Debug)]
pub enum InspectionOutcome {
    Applied(InspectionResult),
    /// A newer run was issued while this one was in flight; discard.
    Superseded,
}

/// Issues generation numbers for inspection runs and applies only the result
/// matching the latest issued generation. There is no mid-run abort, only
/// post-hoc discard.
#[derive(Debug, Default)]
pub struct InspectionScheduler {
    latest: AtomicU64,
}

impl InspectionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag a new run; invalidates every earlier in-flight run.
    pub fn begin(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resolve a finished run against the latest issued generation.
    pub fn complete(&self, generation: u64, result: InspectionResult) -> InspectionOutcome {
        if generation == self.latest.load(Ordering::SeqCst) {
            InspectionOutcome::Applied(result)
        } else {
            tracing::debug!(generation, "inspection run superseded");
            InspectionOutcome::Superseded
        }
    }
}
