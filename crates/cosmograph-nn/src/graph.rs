//! Graph index bundles uploaded to the compute device.
//!
//! Built once per minibatch from the host-side [`BatchGraph`] or
//! [`TripletGraph`] and shared, unchanged, by every layer of the forward
//! pass.

use crate::error::{Error, Result};
use crate::segment::{index_tensor, SegmentIndex};
use candle_core::{Device, Tensor};
use cosmograph_core::{BatchGraph, DiagonalGap, TripletGraph, TripletSegment};
use tracing::debug;

/// Diagonal index sets of an edge graph.
#[derive(Debug, Clone)]
pub struct DiagonalTensors {
    /// Edge position of particle `j`'s self-loop, for `j` in `0..b*N`.
    pub edges: Tensor,
    /// Sample id of each diagonal entry (`dal`).
    pub samples: SegmentIndex,
}

/// Edge (second-order) graph on the device.
#[derive(Debug, Clone)]
pub struct EdgeTensors {
    pub batch_size: usize,
    pub num_particles: usize,
    pub num_edges: usize,
    /// Row index of each edge; pooling by it averages over columns.
    pub rows: SegmentIndex,
    /// Column index of each edge; pooling by it averages over rows.
    pub cols: SegmentIndex,
    /// Sample index of each edge.
    pub cube: SegmentIndex,
    /// Transpose position of each edge, `num_edges` when absent.
    pub transpose: Tensor,
    /// Present when every particle has exactly one self-loop; otherwise
    /// the first row that breaks this.
    pub diagonal: std::result::Result<DiagonalTensors, DiagonalGap>,
    /// Raw row/column ids, for input feature gathers.
    pub row_ids: Tensor,
    pub col_ids: Tensor,
}

impl EdgeTensors {
    pub fn from_graph(graph: &BatchGraph, device: &Device) -> Result<Self> {
        let nodes = graph.num_nodes();
        let rows = SegmentIndex::new("row", &graph.row, nodes, device)?;
        let cols = SegmentIndex::new("col", &graph.col, nodes, device)?;
        let cube = SegmentIndex::new("cube", &graph.cube, graph.batch_size, device)?;
        let diagonal = match graph.diagonal_gap() {
            None => Ok(DiagonalTensors {
                edges: index_tensor(&graph.diag, device)?,
                samples: SegmentIndex::new("dal", &graph.dal, graph.batch_size, device)?,
            }),
            Some(gap) => Err(gap),
        };
        debug!(
            edges = graph.num_edges(),
            nodes,
            diagonal = diagonal.is_ok(),
            missing_transposes = graph.missing_transposes,
            "uploaded edge graph"
        );
        Ok(Self {
            batch_size: graph.batch_size,
            num_particles: graph.num_particles,
            num_edges: graph.num_edges(),
            row_ids: rows.ids().clone(),
            col_ids: cols.ids().clone(),
            rows,
            cols,
            cube,
            transpose: index_tensor(&graph.tra, device)?,
            diagonal,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.batch_size * self.num_particles
    }

    /// Diagonal index sets; fails with
    /// [`cosmograph_core::Error::IncompleteDiagonal`] naming the offending
    /// sample and row.
    pub fn diagonal(&self) -> Result<&DiagonalTensors> {
        self.diagonal.as_ref().map_err(|&gap| cosmograph_core::Error::from(gap).into())
    }
}

/// Triplet (third-order) graph on the device.
#[derive(Debug, Clone)]
pub struct TripletTensors {
    pub batch_size: usize,
    pub num_particles: usize,
    pub num_triplets: usize,
    /// Segment ids in [`TripletSegment::ALL`] order.
    pub segments: Vec<SegmentIndex>,
    pub rows: Tensor,
    pub cols: Tensor,
    pub depths: Tensor,
    /// Particle pair of each depth segment.
    pub pair_rows: Tensor,
    pub pair_cols: Tensor,
    pub num_pairs: usize,
}

impl TripletTensors {
    pub fn from_graph(graph: &TripletGraph, device: &Device) -> Result<Self> {
        let segments = TripletSegment::ALL
            .iter()
            .map(|&which| {
                let seg = graph.segment(which);
                SegmentIndex::new(which.name(), &seg.ids, seg.num_segments, device)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(triplets = graph.num_triplets(), pairs = graph.num_pairs(), "uploaded triplet graph");
        Ok(Self {
            batch_size: graph.batch_size,
            num_particles: graph.num_particles,
            num_triplets: graph.num_triplets(),
            segments,
            rows: index_tensor(&graph.rows, device)?,
            cols: index_tensor(&graph.cols, device)?,
            depths: index_tensor(&graph.depths, device)?,
            pair_rows: index_tensor(&graph.pair_rows, device)?,
            pair_cols: index_tensor(&graph.pair_cols, device)?,
            num_pairs: graph.num_pairs(),
        })
    }

    pub fn segment(&self, which: TripletSegment) -> &SegmentIndex {
        &self.segments[which.position()]
    }

    pub fn num_nodes(&self) -> usize {
        self.batch_size * self.num_particles
    }
}

/// Index bundle for one forward pass.
#[derive(Debug, Clone)]
pub enum GraphTensors {
    Edges(EdgeTensors),
    Triplets(TripletTensors),
}

impl GraphTensors {
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Edges(g) => g.batch_size,
            Self::Triplets(g) => g.batch_size,
        }
    }

    pub fn num_particles(&self) -> usize {
        match self {
            Self::Edges(g) => g.num_particles,
            Self::Triplets(g) => g.num_particles,
        }
    }

    pub fn edges(&self) -> Result<&EdgeTensors> {
        match self {
            Self::Edges(g) => Ok(g),
            Self::Triplets(_) => Err(Error::InvalidConfig("layer expects an edge graph".into())),
        }
    }

    pub fn triplets(&self) -> Result<&TripletTensors> {
        match self {
            Self::Triplets(g) => Ok(g),
            Self::Edges(_) => Err(Error::InvalidConfig("layer expects a triplet graph".into())),
        }
    }
}
