//! Batch COO assembly.
//!
//! Per-sample CSR adjacencies are flattened into one coordinate list for the
//! whole batch. Sample `i` contributes its entries in CSR order with row and
//! column offset by `i * N`, so every index array lines up with the edge
//! feature tensor of shape `(S, k)`.
//!
//! Derived arrays:
//!
//! - `diag`: edge positions `e` with `row[e] == col[e]`, in edge order.
//! - `dal`: for each diagonal entry, the sample it belongs to; the segment
//!   id used to pool diagonal features per sample.
//! - `tra`: for each edge `(r, c)`, the position of the edge `(c, r)`.
//!
//! K-NN graphs are generally asymmetric, so `(c, r)` may not exist. Such
//! edges get [`BatchGraph::missing_transpose`] (`S`, one past the last
//! edge). Layers gather transposes from features extended by a zero row,
//! which turns a missing transpose into a zero contribution. When `(c, r)`
//! is stored more than once the first occurrence wins.

use crate::adjacency::SparseAdjacency;
use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::debug;

/// Flattened index bundle for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGraph {
    pub batch_size: usize,
    pub num_particles: usize,
    pub row: Vec<u32>,
    pub col: Vec<u32>,
    pub cube: Vec<u32>,
    pub diag: Vec<u32>,
    pub dal: Vec<u32>,
    pub tra: Vec<u32>,
    /// Number of edges whose transpose is absent.
    pub missing_transposes: usize,
}

impl BatchGraph {
    /// Total number of edges `S`.
    pub fn num_edges(&self) -> usize {
        self.row.len()
    }

    /// Number of particles across the batch, `b * N`.
    pub fn num_nodes(&self) -> usize {
        self.batch_size * self.num_particles
    }

    /// Sentinel stored in `tra` for edges without a transpose.
    pub fn missing_transpose(&self) -> u32 {
        self.row.len() as u32
    }

    /// First particle whose self-loop count is not exactly one.
    ///
    /// Coincident particles, or a particle whose own periodic image lands
    /// among its neighbors, yield rows with two self entries.
    pub fn diagonal_gap(&self) -> Option<DiagonalGap> {
        let mut counts = vec![0usize; self.num_nodes()];
        for &e in &self.diag {
            counts[self.row[e as usize] as usize] += 1;
        }
        let n = self.num_particles.max(1);
        counts
            .iter()
            .position(|&c| c != 1)
            .map(|j| DiagonalGap { sample: j / n, row: j % n, count: counts[j] })
    }

    /// Whether every particle has exactly one diagonal entry. Entries are
    /// emitted in row order, so `diag[j]` then lies in row `j`.
    pub fn has_complete_diagonal(&self) -> bool {
        self.diagonal_gap().is_none()
    }

    /// [`Error::IncompleteDiagonal`] naming the first offending row.
    pub fn check_diagonal(&self) -> Result<()> {
        match self.diagonal_gap() {
            Some(gap) => Err(gap.into()),
            None => Ok(()),
        }
    }
}

/// A row with zero or several self-loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagonalGap {
    pub sample: usize,
    /// Row within the sample.
    pub row: usize,
    pub count: usize,
}

impl From<DiagonalGap> for Error {
    fn from(gap: DiagonalGap) -> Self {
        Error::IncompleteDiagonal { sample: gap.sample, row: gap.row, count: gap.count }
    }
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::IndexOutOfRange { index: value, bound: u32::MAX as usize })
}

/// Merge per-sample adjacencies into one batch COO bundle.
///
/// Samples are processed in order `0..b`; all samples must have the same
/// number of particles.
pub fn assemble(adjacencies: &[SparseAdjacency]) -> Result<BatchGraph> {
    let b = adjacencies.len();
    let Some(first) = adjacencies.first() else {
        return Err(Error::InvalidData("cannot assemble an empty batch".into()));
    };
    let n = first.num_rows();
    if let Some(bad) = adjacencies.iter().find(|a| a.num_rows() != n) {
        return Err(Error::DimensionMismatch { expected: n, got: bad.num_rows() });
    }
    to_u32(b * n)?;

    let total: usize = adjacencies.iter().map(SparseAdjacency::nnz).sum();
    let sentinel = to_u32(total)?;
    let mut row = vec![0u32; total];
    let mut col = vec![0u32; total];
    let mut cube = vec![0u32; total];
    let mut tra = vec![sentinel; total];
    let mut diag = Vec::with_capacity(b * n);
    let mut dal = Vec::with_capacity(b * n);
    let mut missing = 0usize;

    let mut offset = 0usize;
    for (i, adj) in adjacencies.iter().enumerate() {
        let base = i * n;
        let mut position: HashMap<(usize, usize), usize> = HashMap::with_capacity(adj.nnz());
        for (local, (r, c)) in adj.iter().enumerate() {
            let e = offset + local;
            row[e] = (base + r) as u32;
            col[e] = (base + c) as u32;
            cube[e] = i as u32;
            if r == c {
                diag.push(e as u32);
                dal.push(i as u32);
            }
            position.entry((r, c)).or_insert(e);
        }
        for (local, (r, c)) in adj.iter().enumerate() {
            match position.get(&(c, r)) {
                Some(&t) => tra[offset + local] = t as u32,
                None => missing += 1,
            }
        }
        offset += adj.nnz();
    }

    if missing > 0 {
        debug!(missing, edges = total, "edges without a transpose map to the zero row");
    }

    Ok(BatchGraph {
        batch_size: b,
        num_particles: n,
        row,
        col,
        cube,
        diag,
        dal,
        tra,
        missing_transposes: missing,
    })
}

/// Column indices obtained by concatenating each sample's CSR `indices`
/// plus `i * N`.
pub fn offset_csr_indices(adjacencies: &[SparseAdjacency]) -> Vec<u32> {
    let n = adjacencies.first().map_or(0, SparseAdjacency::num_rows);
    adjacencies
        .iter()
        .enumerate()
        .flat_map(|(i, a)| a.indices().iter().map(move |&c| (c + i * n) as u32))
        .collect()
}

/// Check that the assembled `col` equals the directly offset CSR indices.
pub fn verify_column_integrity(adjacencies: &[SparseAdjacency], graph: &BatchGraph) -> Result<()> {
    let direct = offset_csr_indices(adjacencies);
    if direct.len() != graph.col.len() {
        return Err(Error::DimensionMismatch { expected: direct.len(), got: graph.col.len() });
    }
    match direct.iter().zip(&graph.col).position(|(a, b)| a != b) {
        Some(e) => Err(Error::InvalidData(format!("column index mismatch at edge {e}"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adj(rows: Vec<Vec<usize>>) -> SparseAdjacency {
        SparseAdjacency::from_rows(rows).unwrap()
    }

    #[test]
    fn two_sample_batch_matches_hand_computed_arrays() {
        let a0 = adj(vec![vec![0, 1], vec![1, 0], vec![2, 3], vec![3, 2]]);
        let a1 = adj(vec![vec![0, 2], vec![1, 3], vec![2, 0], vec![3, 1]]);
        let g = assemble(&[a0.clone(), a1.clone()]).unwrap();

        assert_eq!(g.row, vec![0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7]);
        assert_eq!(g.col, vec![0, 1, 1, 0, 2, 3, 3, 2, 4, 6, 5, 7, 6, 4, 7, 5]);
        assert_eq!(g.cube, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1]);
        assert_eq!(g.diag, vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(g.dal, vec![0, 0, 0, 0, 1, 1, 1, 1]);
        assert!(g.has_complete_diagonal());
        assert_eq!(g.missing_transposes, 0);
        verify_column_integrity(&[a0, a1], &g).unwrap();
    }

    #[test]
    fn transpose_is_an_involution_on_symmetric_graphs() {
        let a = adj(vec![vec![0, 1, 2], vec![1, 0, 2], vec![2, 1, 0]]);
        let g = assemble(&[a]).unwrap();
        for e in 0..g.num_edges() {
            let t = g.tra[e] as usize;
            assert_eq!(g.row[t], g.col[e]);
            assert_eq!(g.col[t], g.row[e]);
            assert_eq!(g.tra[t] as usize, e);
        }
    }

    #[test]
    fn missing_transpose_maps_to_sentinel() {
        // 0 -> 1 but not 1 -> 0
        let a = adj(vec![vec![0, 1], vec![1, 2], vec![2, 1]]);
        let g = assemble(&[a]).unwrap();
        assert_eq!(g.tra[1], g.missing_transpose());
        assert_eq!(g.missing_transposes, 1);
        assert_eq!(g.tra[3], 5);
        assert_eq!(g.tra[5], 3);
    }

    #[test]
    fn incomplete_diagonal_is_detected() {
        let a = adj(vec![vec![1], vec![0]]);
        let g = assemble(&[a]).unwrap();
        assert!(g.diag.is_empty());
        assert!(!g.has_complete_diagonal());
        assert_eq!(g.diagonal_gap(), Some(DiagonalGap { sample: 0, row: 0, count: 0 }));
    }

    #[test]
    fn duplicate_self_loop_names_sample_and_row() {
        // row 1 of the second sample lists itself twice
        let a0 = adj(vec![vec![0, 1], vec![1, 0]]);
        let a1 = adj(vec![vec![0, 1], vec![1, 1]]);
        let g = assemble(&[a0, a1]).unwrap();
        assert_eq!(g.diag.len(), 5);
        assert_eq!(g.diagonal_gap(), Some(DiagonalGap { sample: 1, row: 1, count: 2 }));
        let err = g.check_diagonal().unwrap_err();
        assert!(matches!(err, Error::IncompleteDiagonal { sample: 1, row: 1, count: 2 }));
        assert_eq!(err.to_string(), "sample 1, row 1: expected one self-loop, found 2");
    }

    #[test]
    fn rejects_mismatched_samples() {
        let a = adj(vec![vec![0], vec![1]]);
        let b = adj(vec![vec![0]]);
        assert!(assemble(&[a, b]).is_err());
        assert!(assemble(&[]).is_err());
    }
}
