//! Neighbor search over padded cubes.
//!
//! Queries are restricted to the original particles; candidates include
//! every padded row, so particles near a face find neighbors across the
//! periodic boundary. Candidate indices that point into the padding are
//! remapped to the particle they image before the CSR is finalized.
//!
//! The search uses a uniform cell grid and visits cells in growing
//! Chebyshev shells around the query cell. Results are ordered by
//! `(distance, index)`, which makes ties deterministic.

use crate::adjacency::SparseAdjacency;
use crate::config::NeighborSearch;
use crate::error::{Error, Result};
use crate::pad::PaddedCube;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Target average occupancy of a grid cell.
const POINTS_PER_CELL: f32 = 2.0;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist2: f32,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2.total_cmp(&other.dist2).then(self.index.cmp(&other.index))
    }
}

#[inline]
fn dist2(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

/// Uniform cell grid over a point cloud.
pub struct CellGrid<'a> {
    points: &'a [[f32; 3]],
    origin: [f32; 3],
    cell: [f32; 3],
    dims: [usize; 3],
    cell_start: Vec<usize>,
    cell_points: Vec<usize>,
}

impl<'a> CellGrid<'a> {
    pub fn new(points: &'a [[f32; 3]]) -> Self {
        let mut lo = [f32::INFINITY; 3];
        let mut hi = [f32::NEG_INFINITY; 3];
        for p in points {
            for axis in 0..3 {
                lo[axis] = lo[axis].min(p[axis]);
                hi[axis] = hi[axis].max(p[axis]);
            }
        }
        if points.is_empty() {
            lo = [0.0; 3];
            hi = [1.0; 3];
        }

        let per_axis = ((points.len() as f32 / POINTS_PER_CELL).cbrt().floor() as usize).max(1);
        let mut dims = [per_axis; 3];
        let mut cell = [1.0f32; 3];
        for axis in 0..3 {
            let extent = hi[axis] - lo[axis];
            if extent <= f32::EPSILON {
                dims[axis] = 1;
                cell[axis] = 1.0;
            } else {
                cell[axis] = extent / dims[axis] as f32;
            }
        }

        let num_cells = dims[0] * dims[1] * dims[2];
        let mut counts = vec![0usize; num_cells + 1];
        let mut owner = Vec::with_capacity(points.len());
        let mut grid = Self {
            points,
            origin: lo,
            cell,
            dims,
            cell_start: Vec::new(),
            cell_points: Vec::new(),
        };
        for p in points {
            let c = grid.flat(grid.cell_of(p));
            counts[c + 1] += 1;
            owner.push(c);
        }
        for c in 0..num_cells {
            counts[c + 1] += counts[c];
        }
        let mut cursor = counts.clone();
        let mut cell_points = vec![0usize; points.len()];
        for (i, &c) in owner.iter().enumerate() {
            cell_points[cursor[c]] = i;
            cursor[c] += 1;
        }
        grid.cell_start = counts;
        grid.cell_points = cell_points;
        grid
    }

    fn cell_of(&self, p: &[f32; 3]) -> [usize; 3] {
        let mut c = [0usize; 3];
        for axis in 0..3 {
            let x = ((p[axis] - self.origin[axis]) / self.cell[axis]).floor();
            c[axis] = (x.max(0.0) as usize).min(self.dims[axis] - 1);
        }
        c
    }

    fn flat(&self, c: [usize; 3]) -> usize {
        (c[0] * self.dims[1] + c[1]) * self.dims[2] + c[2]
    }

    fn min_cell_side(&self) -> f32 {
        self.cell.iter().copied().fold(f32::INFINITY, f32::min)
    }

    fn max_shell(&self) -> usize {
        self.dims.iter().copied().max().unwrap_or(1)
    }

    /// Visit every point in the cells at Chebyshev distance exactly `r`
    /// from `center`.
    fn visit_shell(&self, center: [usize; 3], r: usize, mut f: impl FnMut(usize)) {
        let r = r as isize;
        let bounds = |axis: usize| {
            let c = center[axis] as isize;
            let lo = (c - r).max(0);
            let hi = (c + r).min(self.dims[axis] as isize - 1);
            (c, lo, hi)
        };
        let (cx, x0, x1) = bounds(0);
        let (cy, y0, y1) = bounds(1);
        let (cz, z0, z1) = bounds(2);
        for x in x0..=x1 {
            for y in y0..=y1 {
                let on_shell = (x - cx).abs() == r || (y - cy).abs() == r;
                let mut visit = |z: isize| {
                    let c = self.flat([x as usize, y as usize, z as usize]);
                    for &i in &self.cell_points[self.cell_start[c]..self.cell_start[c + 1]] {
                        f(i);
                    }
                };
                if on_shell {
                    for z in z0..=z1 {
                        visit(z);
                    }
                } else {
                    if cz - r >= z0 {
                        visit(cz - r);
                    }
                    if r > 0 && cz + r <= z1 {
                        visit(cz + r);
                    }
                }
            }
        }
    }

    /// The `k` nearest points to `query`, nearest first.
    ///
    /// `exclude` removes one index from the candidates (the query itself
    /// when self-loops are not wanted).
    pub fn knn(&self, query: &[f32; 3], k: usize, exclude: Option<usize>) -> Vec<(f32, usize)> {
        let center = self.cell_of(query);
        let side = self.min_cell_side();
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for r in 0..=self.max_shell() {
            self.visit_shell(center, r, |i| {
                if Some(i) == exclude {
                    return;
                }
                let cand = Candidate { dist2: dist2(query, &self.points[i]), index: i };
                if heap.len() < k {
                    heap.push(cand);
                } else if heap.peek().is_some_and(|worst| cand < *worst) {
                    heap.pop();
                    heap.push(cand);
                }
            });
            // Anything outside shells 0..=r is at least r * side away; ties
            // there may still win on index.
            let reach = r as f32 * side;
            if heap.len() == k && heap.peek().is_some_and(|w| w.dist2 < reach * reach) {
                break;
            }
        }
        heap.into_sorted_vec().into_iter().map(|c| (c.dist2.sqrt(), c.index)).collect()
    }

    /// Every point within `radius` of `query`, nearest first.
    pub fn within(&self, query: &[f32; 3], radius: f32, exclude: Option<usize>) -> Vec<(f32, usize)> {
        let center = self.cell_of(query);
        let side = self.min_cell_side();
        let shells = ((radius / side).ceil() as usize + 1).min(self.max_shell());
        let r2 = radius * radius;
        let mut found = Vec::new();
        for r in 0..=shells {
            self.visit_shell(center, r, |i| {
                if Some(i) == exclude {
                    return;
                }
                let d2 = dist2(query, &self.points[i]);
                if d2 <= r2 {
                    found.push(Candidate { dist2: d2, index: i });
                }
            });
        }
        found.sort_unstable();
        found.into_iter().map(|c| (c.dist2.sqrt(), c.index)).collect()
    }
}

/// Replace every index that points into the padding with the index of the
/// particle it images.
pub fn remap_padding(indices: &mut [usize], num_original: usize, index_map: &[usize]) -> usize {
    let mut remapped = 0;
    for idx in indices.iter_mut().filter(|idx| **idx >= num_original) {
        *idx = index_map[*idx - num_original];
        remapped += 1;
    }
    remapped
}

/// Build the `N x N` neighbor adjacency of a padded sample.
///
/// Only the first `N` padded rows are queried. With `include_self = false`
/// only the query point itself is left out of its candidate set. Its
/// periodic images stay in, and one that ranks among the neighbors remaps
/// back to the particle's own index: row `i` then contains `i` even though
/// self-loops were not requested. This happens when a boundary particle has
/// fewer than `k` other particles (or none within `r`) nearer than one box
/// length.
pub fn build(padded: &PaddedCube, search: NeighborSearch, include_self: bool) -> Result<SparseAdjacency> {
    let n = padded.num_original;
    let candidates = padded.positions.len() - usize::from(!include_self);
    if let NeighborSearch::Knn { k } = search {
        if k > candidates {
            return Err(Error::InvalidConfig(format!(
                "k = {k} exceeds the {candidates} candidate points of a sample"
            )));
        }
    }

    let grid = CellGrid::new(&padded.positions);
    let rows: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let exclude = (!include_self).then_some(i);
            let query = &padded.positions[i];
            let hits = match search {
                NeighborSearch::Knn { k } => grid.knn(query, k, exclude),
                NeighborSearch::Radius { r } => grid.within(query, r, exclude),
            };
            let mut row: Vec<usize> = hits.into_iter().map(|(_, idx)| idx).collect();
            remap_padding(&mut row, n, &padded.index_map);
            row
        })
        .collect();

    SparseAdjacency::from_rows(rows)
}
