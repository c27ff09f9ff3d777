//! Permutation-equivariant graph layers for particle simulations.
//!
//! `cosmograph-nn` is the tensor side of the pipeline. It uploads the index
//! arrays built by `cosmograph-core` to a candle device, turns particles
//! into edge or triplet features, runs a stack of equivariant layers and
//! reads the result out as predicted positions.
//!
//! # Modules
//!
//! - [`segment`]: segment-mean pooling and gathers
//! - [`graph`]: device-resident edge and triplet index bundles
//! - [`conv`]: vanilla, shift-invariant and rotation-invariant layers
//! - [`params`]: typed parameter store with safetensors checkpoints
//! - [`features`]: particle, Zel'dovich and triplet input features, the
//!   redshift column, triplet readout
//! - [`model`]: layer kinds, model configuration, forward pass
//! - [`loss`]: periodic wrap, bounded and minimum-image losses
//! - [`training`]: AdamW training loop
//!
//! # Example
//!
//! ```rust
//! use candle_core::Device;
//! use cosmograph_core::{Dataset, GraphConfig};
//! use cosmograph_nn::{Model, ModelConfig, Trainer, TrainingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = Dataset::synthetic(3, 4, 2, 0.01, 42)?;
//! let model = Model::new(ModelConfig::default(), 42, &Device::Cpu)?;
//! let graph = GraphConfig::default().with_k(4).with_boundary_threshold(0.2);
//! let config = TrainingConfig::default().with_iterations(2).with_batch_size(2);
//! let mut trainer = Trainer::new(model, graph, config, Device::Cpu)?;
//! let report = trainer.fit(&data, None, None)?;
//! assert_eq!(report.losses.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod conv;
pub mod error;
pub mod features;
pub mod graph;
pub mod loss;
pub mod model;
pub mod params;
pub mod segment;
pub mod training;

pub use conv::{RotInvConv, ShiftInvConv, VanillaConv};
pub use error::{Error, Result};
pub use graph::{EdgeTensors, GraphTensors, TripletTensors};
pub use model::{GraphLayer, InputMode, LayerKind, Model, ModelConfig, Prediction};
pub use params::{LayerParams, ParamKey, ParamStore, RedshiftPair};
pub use training::{Trainer, TrainingConfig, TrainingReport};
