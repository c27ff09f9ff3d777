//! Per-batch graph construction: pad, search, assemble.

use crate::adjacency::SparseAdjacency;
use crate::config::GraphConfig;
use crate::coo::{assemble, BatchGraph};
use crate::data::{positions, CHANNELS};
use crate::error::{Error, Result};
use crate::neighbors;
use crate::pad::pad;
use crate::triplets::{build_triplets, TripletGraph};
use ndarray::{ArrayView3, Axis};
use rayon::prelude::*;
use tracing::{debug, info_span};

/// Builds neighbor graphs for batches of samples.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new(config: GraphConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Adjacency of one sample's positions.
    pub fn sample_adjacency(&self, positions: &[[f32; 3]]) -> Result<SparseAdjacency> {
        let padded = pad(positions, self.config.boundary_threshold);
        let adj = neighbors::build(&padded, self.config.search, self.config.include_self)?;
        if let Some(k) = self.config.search.fixed_degree() {
            debug_assert_eq!(adj.uniform_degree(), Some(k));
        }
        Ok(adj)
    }

    /// Adjacencies of a `(b, N, 6)` batch, in sample order.
    pub fn adjacencies(&self, batch: ArrayView3<f32>) -> Result<Vec<SparseAdjacency>> {
        if batch.shape()[2] < 3 {
            return Err(Error::DimensionMismatch { expected: CHANNELS, got: batch.shape()[2] });
        }
        let _span = info_span!("neighbor_graphs", samples = batch.shape()[0], particles = batch.shape()[1]).entered();
        let samples: Vec<Vec<[f32; 3]>> = batch.axis_iter(Axis(0)).map(positions).collect();
        let adjacencies = samples
            .par_iter()
            .map(|p| self.sample_adjacency(p))
            .collect::<Result<Vec<_>>>()?;
        debug!(edges = adjacencies.iter().map(SparseAdjacency::nnz).sum::<usize>(), "neighbor search done");
        Ok(adjacencies)
    }

    /// Batch COO bundle for edge layers.
    pub fn batch_graph(&self, batch: ArrayView3<f32>) -> Result<BatchGraph> {
        assemble(&self.adjacencies(batch)?)
    }

    /// Triplet structure for rotation-invariant layers.
    pub fn triplet_graph(&self, batch: ArrayView3<f32>) -> Result<TripletGraph> {
        build_triplets(&self.adjacencies(batch)?)
    }
}
