//! Host-side graph construction for periodic particle simulations.
//!
//! `cosmograph-core` turns batches of particles in the periodic unit cube into
//! the index arrays consumed by the graph layers in `cosmograph-nn`:
//!
//! ```text
//! positions ─► pad ─► neighbor search ─► remap ─► CSR per sample
//!                                                    │
//!                     BatchGraph (row/col/cube/diag/dal/tra) ◄─ assemble
//!                     TripletGraph (7 segment id arrays)     ◄─ build_triplets
//! ```
//!
//! # Modules
//!
//! - [`pad`]: periodic images of particles near faces, edges and corners
//! - [`neighbors`]: cell-grid K-NN and radius search with padding remap
//! - [`adjacency`]: per-sample CSR adjacency
//! - [`coo`]: batch COO assembly and derived index sets
//! - [`triplets`]: third-order adjacency and its segment ids
//! - [`pipeline`]: [`GraphBuilder`], the staged per-batch driver
//! - [`data`]: dataset loading, normalization, splitting, augmentation
//! - [`config`]: serde-backed configuration
//!
//! # Example
//!
//! ```rust
//! use cosmograph_core::{Dataset, GraphBuilder, GraphConfig};
//!
//! let data = Dataset::synthetic(3, 2, 1, 0.0, 42)?;
//! let builder = GraphBuilder::new(GraphConfig::default().with_k(4).with_boundary_threshold(0.2))?;
//! let graph = builder.batch_graph(data.redshift(0))?;
//! assert_eq!(graph.num_edges(), 2 * 27 * 4);
//! # Ok::<(), cosmograph_core::Error>(())
//! ```

#![allow(clippy::needless_range_loop)]

pub mod adjacency;
pub mod config;
pub mod coo;
pub mod data;
pub mod error;
pub mod neighbors;
pub mod pad;
pub mod pipeline;
pub mod triplets;

pub use adjacency::SparseAdjacency;
pub use config::{GraphConfig, NeighborSearch};
pub use coo::{assemble, BatchGraph, DiagonalGap};
pub use data::Dataset;
pub use error::{Error, Result};
pub use pad::{pad, PaddedCube};
pub use pipeline::GraphBuilder;
pub use triplets::{build_triplets, TripletGraph, TripletSegment};
