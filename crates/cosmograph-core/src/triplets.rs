//! Third-order adjacency for rotation-invariant layers.
//!
//! For every stored edge `(r, c)` with `c != r`, and every other neighbor
//! `d` of `r` with `d != c` and `d != r`, the triplet `(r, c, d)` is
//! emitted. With a fixed neighbor count `M` (self included) this gives
//! `N * (M - 1) * (M - 2)` triplets per sample.
//!
//! Pooling needs seven segment id arrays over the triplets:
//!
//! | segment      | grouped by | pools over   |
//! |--------------|------------|--------------|
//! | `ColDepth`   | `r`        | col, depth   |
//! | `RowDepth`   | `c`        | row, depth   |
//! | `RowCol`     | `d`        | row, col     |
//! | `Depth`      | `(r, c)`   | depth        |
//! | `Col`        | `(r, d)`   | col          |
//! | `Row`        | `(c, d)`   | row          |
//! | `All`        | sample     | everything   |
//!
//! Ids are ranks of the sorted distinct keys within a sample, offset by the
//! number of segments of all earlier samples. Ids are therefore dense and no
//! segment is empty.

use crate::adjacency::SparseAdjacency;
use crate::error::{Error, Result};
use tracing::debug;

/// The seven triplet poolings, in layer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TripletSegment {
    ColDepth,
    RowDepth,
    RowCol,
    Depth,
    Col,
    Row,
    All,
}

impl TripletSegment {
    pub const ALL: [TripletSegment; 7] = [
        Self::ColDepth,
        Self::RowDepth,
        Self::RowCol,
        Self::Depth,
        Self::Col,
        Self::Row,
        Self::All,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ColDepth => "col_depth",
            Self::RowDepth => "row_depth",
            Self::RowCol => "row_col",
            Self::Depth => "depth",
            Self::Col => "col",
            Self::Row => "row",
            Self::All => "all",
        }
    }

    pub fn position(&self) -> usize {
        *self as usize
    }
}

/// Segment ids of one pooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentIds {
    pub ids: Vec<u32>,
    pub num_segments: usize,
}

/// Batched triplet structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripletGraph {
    pub batch_size: usize,
    pub num_particles: usize,
    /// Global particle ids (`i * N` offset) of each triplet.
    pub rows: Vec<u32>,
    pub cols: Vec<u32>,
    pub depths: Vec<u32>,
    /// Indexed by [`TripletSegment::position`].
    pub segments: Vec<SegmentIds>,
    /// Global `(row, col)` particle pair of each `Depth` segment, in
    /// segment id order.
    pub pair_rows: Vec<u32>,
    pub pair_cols: Vec<u32>,
}

impl TripletGraph {
    pub fn num_triplets(&self) -> usize {
        self.rows.len()
    }

    pub fn segment(&self, which: TripletSegment) -> &SegmentIds {
        &self.segments[which.position()]
    }

    /// Number of `(particle, neighbor)` pairs, the row count after pooling
    /// over depth.
    pub fn num_pairs(&self) -> usize {
        self.pair_rows.len()
    }
}

/// Dense ranks of `keys` among their sorted distinct values.
fn compact<K: Ord + Copy>(keys: &[K]) -> (Vec<u32>, Vec<K>) {
    let mut distinct = keys.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    let ids = keys
        .iter()
        .map(|k| distinct.binary_search(k).map_or(0, |p| p as u32))
        .collect();
    (ids, distinct)
}

/// Local `(row, col, depth)` triplets of one sample.
pub fn sample_triplets(adj: &SparseAdjacency) -> Vec<(usize, usize, usize)> {
    let mut out = Vec::new();
    for r in 0..adj.num_rows() {
        let neighbors: Vec<usize> = adj.row(r).iter().copied().filter(|&c| c != r).collect();
        for &c in &neighbors {
            out.extend(neighbors.iter().filter(|&&d| d != c).map(|&d| (r, c, d)));
        }
    }
    out
}

/// Build the batched triplet structure.
///
/// Every sample must yield at least one triplet, so each row needs two
/// distinct neighbors other than itself somewhere in the sample.
pub fn build_triplets(adjacencies: &[SparseAdjacency]) -> Result<TripletGraph> {
    let Some(first) = adjacencies.first() else {
        return Err(Error::InvalidData("cannot build triplets for an empty batch".into()));
    };
    let n = first.num_rows();
    if let Some(bad) = adjacencies.iter().find(|a| a.num_rows() != n) {
        return Err(Error::DimensionMismatch { expected: n, got: bad.num_rows() });
    }

    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let mut depths = Vec::new();
    let mut segments: Vec<SegmentIds> =
        (0..7).map(|_| SegmentIds { ids: Vec::new(), num_segments: 0 }).collect();
    let mut pair_rows = Vec::new();
    let mut pair_cols = Vec::new();

    for (i, adj) in adjacencies.iter().enumerate() {
        let triplets = sample_triplets(adj);
        if triplets.is_empty() {
            return Err(Error::InvalidData(format!(
                "sample {i} has no triplets; rows need at least two neighbors besides themselves"
            )));
        }
        let base = i * n;
        rows.extend(triplets.iter().map(|t| (base + t.0) as u32));
        cols.extend(triplets.iter().map(|t| (base + t.1) as u32));
        depths.extend(triplets.iter().map(|t| (base + t.2) as u32));

        let r: Vec<usize> = triplets.iter().map(|t| t.0).collect();
        let c: Vec<usize> = triplets.iter().map(|t| t.1).collect();
        let d: Vec<usize> = triplets.iter().map(|t| t.2).collect();
        let rc: Vec<(usize, usize)> = triplets.iter().map(|t| (t.0, t.1)).collect();
        let rd: Vec<(usize, usize)> = triplets.iter().map(|t| (t.0, t.2)).collect();
        let cd: Vec<(usize, usize)> = triplets.iter().map(|t| (t.1, t.2)).collect();

        let (rc_ids, rc_pairs) = compact(&rc);
        let local = [
            compact(&r).0,
            compact(&c).0,
            compact(&d).0,
            rc_ids,
            compact(&rd).0,
            compact(&cd).0,
            vec![0u32; triplets.len()],
        ];
        for (seg, ids) in segments.iter_mut().zip(local) {
            let offset = seg.num_segments as u32;
            let count = ids.iter().max().map_or(0, |&m| m as usize + 1);
            seg.ids.extend(ids.into_iter().map(|id| id + offset));
            seg.num_segments += count;
        }
        pair_rows.extend(rc_pairs.iter().map(|&(a, _)| (base + a) as u32));
        pair_cols.extend(rc_pairs.iter().map(|&(_, b)| (base + b) as u32));
    }

    debug!(
        triplets = rows.len(),
        pairs = pair_rows.len(),
        samples = adjacencies.len(),
        "built triplet adjacency"
    );

    Ok(TripletGraph {
        batch_size: adjacencies.len(),
        num_particles: n,
        rows,
        cols,
        depths,
        segments,
        pair_rows,
        pair_cols,
    })
}
