//! `cosmograph` learns the evolution of N-body particle simulations with
//! permutation-equivariant graph networks on the periodic unit cube.
//!
//! The facade re-exports the two library crates:
//!
//! - [`graph`]: boundary padding, neighbor search, batch COO assembly,
//!   triplet adjacency, datasets (`cosmograph-core`)
//! - [`nn`]: segment pooling, the vanilla, shift-invariant and
//!   rotation-invariant layers, losses and training (`cosmograph-nn`)
//!
//! ```rust
//! use cosmograph::graph::{Dataset, GraphBuilder, GraphConfig};
//! use cosmograph::nn::{LayerKind, ModelConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = Dataset::synthetic(3, 2, 2, 0.01, 42)?;
//! let graph = GraphConfig::default().with_k(4).with_boundary_threshold(0.2);
//! let model = ModelConfig::new(LayerKind::ShiftInvariant, vec![9, 16, 3]);
//! model.validate()?;
//! model.validate_graph(&graph)?;
//!
//! let batch = GraphBuilder::new(graph)?.batch_graph(data.redshift(0))?;
//! assert_eq!(batch.num_edges(), 2 * 27 * 4);
//! # Ok(())
//! # }
//! ```

pub use cosmograph_core as graph;
pub use cosmograph_nn as nn;

pub use cosmograph_core::{Dataset, GraphBuilder, GraphConfig, NeighborSearch};
pub use cosmograph_nn::{LayerKind, Model, ModelConfig, Trainer, TrainingConfig};
