//! Chessboard corner detection.
//!
//! Interior corners are located with the ChESS X-corner response (16 samples on
//! a ring around each pixel), thinned by non-maximum suppression and assembled
//! into a 4-connected lattice that is grown outwards from a seed corner. Only a
//! lattice with exactly `cols x rows` nodes is accepted; it is then ordered
//! row-major and refined to sub-pixel accuracy.

use std::collections::{HashMap, VecDeque};

use image::GrayImage;
use nalgebra::{Point2, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pattern::{corner_subpix, CalibrationPattern, CornerDetection, SubpixCriteria};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChessboardParams {
    /// Ring radius of the X-corner response, in pixels.
    pub response_radius: u32,
    /// Candidates weaker than this fraction of the strongest response are dropped.
    pub threshold_rel: f32,
    /// Absolute response floor; keeps flat or noise-only images from producing candidates.
    pub min_response: f32,
    /// Minimum distance between two accepted candidates, in pixels.
    pub nms_radius: f32,
    /// Search radius around a predicted lattice node, as a fraction of the local step.
    pub grid_tolerance: f64,
    /// Number of seed candidates tried before giving up.
    pub max_seeds: usize,
    pub subpix: SubpixCriteria,
}

impl Default for ChessboardParams {
    fn default() -> Self {
        Self {
            response_radius: 5,
            threshold_rel: 0.1,
            min_response: 40.0,
            nms_radius: 5.0,
            grid_tolerance: 0.3,
            max_seeds: 12,
            subpix: SubpixCriteria::default(),
        }
    }
}

/// Response map in row-major layout.
#[derive(Clone, Debug)]
pub struct ResponseMap {
    pub w: usize,
    pub h: usize,
    pub data: Vec<f32>,
}

impl ResponseMap {
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.w + x]
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(0.0f32, f32::max)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChessboardDetector {
    pub params: ChessboardParams,
}

impl ChessboardDetector {
    pub fn new(params: ChessboardParams) -> Self {
        Self { params }
    }

    /// Locates and orders the interior corners of `pattern` in `image`.
    pub fn detect(&self, image: &GrayImage, pattern: &CalibrationPattern) -> CornerDetection {
        let (cols, rows) = pattern.pattern_size();
        let need = pattern.corner_count();
        let radius = self.params.response_radius.max(1) as usize;
        if (image.width() as usize) < 4 * radius || (image.height() as usize) < 4 * radius {
            debug!("image {}x{} too small for chessboard detection", image.width(), image.height());
            return CornerDetection::not_found();
        }

        let response = chess_response(image, radius);
        let candidates = response_candidates(&response, &self.params);
        if candidates.len() < need {
            debug!(
                "insufficient corner candidates: found {}, need {need}",
                candidates.len()
            );
            return CornerDetection::not_found();
        }

        let Some(mut corners) = assemble_grid(&candidates, cols, rows, &self.params) else {
            debug!(
                "no {cols}x{rows} lattice among {} candidates",
                candidates.len()
            );
            return CornerDetection::not_found();
        };

        if let Err(e) = corner_subpix(image, &mut corners, &self.params.subpix) {
            debug!("sub-pixel refinement rejected: {e}");
            return CornerDetection::not_found();
        }
        CornerDetection {
            found: true,
            corners,
        }
    }
}

fn ring_offsets(radius: usize) -> [(i32, i32); 16] {
    let mut ring = [(0i32, 0i32); 16];
    for (n, slot) in ring.iter_mut().enumerate() {
        let theta = n as f64 * std::f64::consts::PI / 8.0;
        *slot = (
            (radius as f64 * theta.cos()).round() as i32,
            (radius as f64 * theta.sin()).round() as i32,
        );
    }
    ring
}

/// ChESS response `R = SR - DR - 16 * MR`.
///
/// SR rewards opposite sectors of equal brightness in quadrature, DR penalises
/// edges (opposite samples that differ), MR penalises blobs whose ring mean
/// departs from the local mean. Pixels closer than `radius` to the border get 0.
pub fn chess_response(image: &GrayImage, radius: usize) -> ResponseMap {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let raw = image.as_raw();
    let ring = ring_offsets(radius);
    let mut data = vec![0.0f32; w * h];
    if w <= 2 * radius || h <= 2 * radius {
        return ResponseMap { w, h, data };
    }

    data.par_chunks_mut(w)
        .enumerate()
        .filter(|(y, _)| *y >= radius && *y < h - radius)
        .for_each(|(y, row)| {
            let px = |x: i32, y: i32| raw[y as usize * w + x as usize] as f32;
            for x in radius..w - radius {
                let (xi, yi) = (x as i32, y as i32);
                let mut s = [0.0f32; 16];
                for (n, (dx, dy)) in ring.iter().enumerate() {
                    s[n] = px(xi + dx, yi + dy);
                }
                let mut sr = 0.0f32;
                for n in 0..4 {
                    sr += ((s[n] + s[n + 8]) - (s[n + 4] + s[n + 12])).abs();
                }
                let mut dr = 0.0f32;
                for n in 0..8 {
                    dr += (s[n] - s[n + 8]).abs();
                }
                let ring_mean = s.iter().sum::<f32>() / 16.0;
                let local_mean = (px(xi, yi)
                    + px(xi - 1, yi)
                    + px(xi + 1, yi)
                    + px(xi, yi - 1)
                    + px(xi, yi + 1))
                    / 5.0;
                row[x] = sr - dr - 16.0 * (ring_mean - local_mean).abs();
            }
        });

    ResponseMap { w, h, data }
}

/// Local maxima above threshold, strongest first, thinned to `nms_radius`.
fn response_candidates(response: &ResponseMap, params: &ChessboardParams) -> Vec<Point2<f64>> {
    let max_r = response.max();
    if max_r < params.min_response {
        return Vec::new();
    }
    let threshold = (max_r * params.threshold_rel).max(params.min_response);
    let (w, h) = (response.w, response.h);

    let mut peaks: Vec<(usize, usize, f32)> = (1..h.saturating_sub(1))
        .into_par_iter()
        .flat_map_iter(|y| {
            (1..w - 1).filter_map(move |x| {
                let r = response.at(x, y);
                if r <= threshold {
                    return None;
                }
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = (x as i32 + dx) as usize;
                        let ny = (y as i32 + dy) as usize;
                        if response.at(nx, ny) > r {
                            return None;
                        }
                    }
                }
                Some((x, y, r))
            })
        })
        .collect();

    peaks.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
            .then(a.0.cmp(&b.0))
    });

    let min_d2 = (params.nms_radius as f64).powi(2);
    let mut accepted: Vec<Point2<f64>> = Vec::new();
    for (x, y, _) in peaks {
        let p = Point2::new(x as f64, y as f64);
        if accepted.iter().all(|q| (q - p).norm_squared() >= min_d2) {
            accepted.push(p);
        }
    }
    accepted
}

type Cell = (i32, i32);

const STEPS: [Cell; 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

fn assemble_grid(
    candidates: &[Point2<f64>],
    cols: usize,
    rows: usize,
    params: &ChessboardParams,
) -> Option<Vec<Point2<f64>>> {
    let seeds = candidates.len().min(params.max_seeds.max(1));
    (0..seeds).find_map(|seed| {
        let lattice = grow_lattice(candidates, seed, cols * rows, params.grid_tolerance)?;
        order_lattice(&lattice, candidates, cols, rows)
    })
}

fn nearest(
    candidates: &[Point2<f64>],
    target: &Point2<f64>,
    taken: &[bool],
    max_dist: f64,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (k, c) in candidates.iter().enumerate() {
        if taken[k] {
            continue;
        }
        let d = (c - target).norm();
        if d <= max_dist && best.map_or(true, |(_, bd)| d < bd) {
            best = Some((k, d));
        }
    }
    best.map(|(k, _)| k)
}

/// Picks the two lattice axes at `seed`: the closest candidate, then the
/// closest one roughly perpendicular to it with a comparable spacing.
fn seed_axes(candidates: &[Point2<f64>], seed: usize) -> Option<(usize, usize)> {
    let s = candidates[seed];
    let mut taken = vec![false; candidates.len()];
    taken[seed] = true;
    let first = nearest(candidates, &s, &taken, f64::INFINITY)?;
    let u = candidates[first] - s;
    let u_len = u.norm();
    if u_len < 1e-9 {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for (k, c) in candidates.iter().enumerate() {
        if k == seed || k == first {
            continue;
        }
        let v = c - s;
        let v_len = v.norm();
        let ratio = v_len / u_len;
        if !(0.5..=2.0).contains(&ratio) {
            continue;
        }
        let cos = (u.dot(&v) / (u_len * v_len)).abs();
        if cos > 0.4 {
            continue;
        }
        if best.map_or(true, |(_, bl)| v_len < bl) {
            best = Some((k, v_len));
        }
    }
    best.map(|(k, _)| (first, k))
}

/// Lattice step from `cell` towards `dir`, estimated from already placed nodes.
fn local_step(
    cells: &HashMap<Cell, usize>,
    candidates: &[Point2<f64>],
    cell: Cell,
    dir: Cell,
) -> Option<Vector2<f64>> {
    let pos = |c: Cell| cells.get(&c).map(|&k| candidates[k]);
    let here = pos(cell)?;
    if let Some(back) = pos((cell.0 - dir.0, cell.1 - dir.1)) {
        return Some(here - back);
    }
    let sides: [Cell; 2] = if dir.0 != 0 { [(0, 1), (0, -1)] } else { [(1, 0), (-1, 0)] };
    for side in sides {
        let base = (cell.0 + side.0, cell.1 + side.1);
        let ahead = (base.0 + dir.0, base.1 + dir.1);
        let behind = (base.0 - dir.0, base.1 - dir.1);
        if let (Some(b), Some(a)) = (pos(base), pos(ahead)) {
            return Some(a - b);
        }
        if let (Some(b), Some(a)) = (pos(base), pos(behind)) {
            return Some(b - a);
        }
    }
    None
}

/// Node index per lattice cell, normalized so the lattice starts at (0, 0).
struct Lattice {
    width: usize,
    height: usize,
    nodes: Vec<usize>,
}

impl Lattice {
    fn at(&self, i: usize, j: usize) -> usize {
        self.nodes[j * self.width + i]
    }
}

fn grow_lattice(
    candidates: &[Point2<f64>],
    seed: usize,
    need: usize,
    tolerance: f64,
) -> Option<Lattice> {
    let (first, second) = seed_axes(candidates, seed)?;
    let mut taken = vec![false; candidates.len()];
    let mut cells: HashMap<Cell, usize> = HashMap::new();
    let mut queue: VecDeque<Cell> = VecDeque::new();
    for (cell, k) in [((0, 0), seed), ((1, 0), first), ((0, 1), second)] {
        taken[k] = true;
        cells.insert(cell, k);
        queue.push_back(cell);
    }

    while let Some(cell) = queue.pop_front() {
        let here = candidates[cells[&cell]];
        for dir in STEPS {
            let next = (cell.0 + dir.0, cell.1 + dir.1);
            if cells.contains_key(&next) {
                continue;
            }
            let Some(step) = local_step(&cells, candidates, cell, dir) else {
                continue;
            };
            let predicted = here + step;
            if let Some(k) = nearest(candidates, &predicted, &taken, tolerance * step.norm()) {
                taken[k] = true;
                cells.insert(next, k);
                queue.push_back(next);
            }
        }
        if cells.len() > need {
            return None;
        }
    }

    let min_i = cells.keys().map(|c| c.0).min()?;
    let max_i = cells.keys().map(|c| c.0).max()?;
    let min_j = cells.keys().map(|c| c.1).min()?;
    let max_j = cells.keys().map(|c| c.1).max()?;
    let width = (max_i - min_i + 1) as usize;
    let height = (max_j - min_j + 1) as usize;
    if width * height != cells.len() || cells.len() != need {
        return None;
    }

    let mut nodes = vec![0usize; width * height];
    for (&(i, j), &k) in &cells {
        nodes[(j - min_j) as usize * width + (i - min_i) as usize] = k;
    }
    Some(Lattice {
        width,
        height,
        nodes,
    })
}

/// Maps lattice axes onto pattern columns/rows and fixes their direction:
/// columns run towards +x, rows complete a right-handed frame in image
/// coordinates (towards +y for an upright board).
fn order_lattice(
    lattice: &Lattice,
    candidates: &[Point2<f64>],
    cols: usize,
    rows: usize,
) -> Option<Vec<Point2<f64>>> {
    let (w, h) = (lattice.width, lattice.height);
    if !((w == cols && h == rows) || (w == rows && h == cols)) {
        return None;
    }

    let pos = |i: usize, j: usize| candidates[lattice.at(i, j)];
    let along_i: Vector2<f64> = (0..h).map(|j| pos(w - 1, j) - pos(0, j)).sum();
    let along_j: Vector2<f64> = (0..w).map(|i| pos(i, h - 1) - pos(i, 0)).sum();
    let i_is_col = if cols != rows {
        w == cols
    } else {
        along_i.x.abs() / along_i.norm().max(1e-12) >= along_j.x.abs() / along_j.norm().max(1e-12)
    };

    let (mut col_dir, row_dir) = if i_is_col {
        (along_i, along_j)
    } else {
        (along_j, along_i)
    };
    let flip_cols = col_dir.x < -1e-9 || (col_dir.x.abs() <= 1e-9 && col_dir.y < 0.0);
    if flip_cols {
        col_dir = -col_dir;
    }
    let flip_rows = col_dir.x * row_dir.y - col_dir.y * row_dir.x < 0.0;

    let mut ordered = Vec::with_capacity(cols * rows);
    for r in 0..rows {
        for c in 0..cols {
            let c = if flip_cols { cols - 1 - c } else { c };
            let r = if flip_rows { rows - 1 - r } else { r };
            let (i, j) = if i_is_col { (c, r) } else { (r, c) };
            ordered.push(pos(i, j));
        }
    }
    Some(ordered)
}
