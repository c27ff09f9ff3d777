//! Layer stacks and the model forward pass.
//!
//! A [`Model`] is a sequence of [`GraphLayer`]s of one [`LayerKind`], with
//! ReLU between layers, followed by a readout that turns the last layer's
//! output into predicted particle positions (and velocities for 6-channel
//! edge models).
//!
//! Edge models read either particle states or Zel'dovich inputs
//! ([`InputMode`]). Any model can also be conditioned on the source redshift
//! of its step, which appends one constant feature column.
//!
//! ```rust
//! use candle_core::Device;
//! use cosmograph_core::{Dataset, GraphBuilder, GraphConfig};
//! use cosmograph_nn::{EdgeTensors, GraphTensors, LayerKind, Model, ModelConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = Dataset::synthetic(3, 1, 1, 0.0, 42)?;
//! let builder = GraphBuilder::new(GraphConfig::default().with_k(4).with_boundary_threshold(0.2))?;
//! let graph = GraphTensors::Edges(EdgeTensors::from_graph(&builder.batch_graph(data.redshift(0))?, &Device::Cpu)?);
//!
//! let batch = data.redshift(0);
//! let particles = candle_core::Tensor::from_iter(batch.iter().copied(), &Device::Cpu)?.reshape(batch.dim())?;
//! let model = Model::new(ModelConfig::new(LayerKind::ShiftInvariant, vec![9, 8, 3]), 42, &Device::Cpu)?;
//! let prediction = model.forward(&particles, &graph)?;
//! assert_eq!(prediction.location.dims(), &[1, 27, 3]);
//! # Ok(())
//! # }
//! ```

use crate::conv::{RotInvConv, ShiftInvConv, VanillaConv};
use crate::error::{Error, Result};
use crate::features::{displace, edge_features, triplet_features, with_redshift, za_edge_features, ZA_EDGE_FEATURES};
use crate::graph::GraphTensors;
use crate::params::{LayerParams, ParamStore, RedshiftPair};
use candle_core::{Device, Tensor};
use cosmograph_core::GraphConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-particle input channels: position then velocity.
pub const PARTICLE_CHANNELS: usize = 6;

/// Which family of layers a model is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Four-operator edge layers.
    Vanilla,
    /// Fifteen-operator edge layers.
    ShiftInvariant,
    /// Triplet layers on rotation-invariant features.
    RotationInvariant,
}

impl LayerKind {
    pub fn num_weights(&self) -> usize {
        match self {
            Self::Vanilla => VanillaConv::NUM_WEIGHTS,
            Self::ShiftInvariant => ShiftInvConv::NUM_WEIGHTS,
            Self::RotationInvariant => RotInvConv::NUM_WEIGHTS,
        }
    }

    pub fn num_biases(&self) -> usize {
        match self {
            Self::Vanilla => VanillaConv::NUM_BIASES,
            Self::ShiftInvariant => ShiftInvConv::NUM_BIASES,
            Self::RotationInvariant => RotInvConv::NUM_BIASES,
        }
    }

    /// Width of the input features this kind consumes.
    pub fn input_channels(&self) -> usize {
        match self {
            Self::Vanilla | Self::ShiftInvariant => 9,
            Self::RotationInvariant => 10,
        }
    }

    /// Whether the graphs fed to this kind must contain self-loops.
    pub fn requires_self_loops(&self) -> bool {
        !self.uses_triplets()
    }

    pub fn uses_triplets(&self) -> bool {
        matches!(self, Self::RotationInvariant)
    }
}

/// What the `(b, N, 6)` input of an edge model holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Positions and velocities.
    #[default]
    Particles,
    /// Initial grid positions and Zel'dovich displacements. The model
    /// predicts a correction to the displaced positions.
    Zeldovich,
}

/// Model architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Layer family (default: shift-invariant).
    pub kind: LayerKind,
    /// Channel widths, input first (default: `[9, 32, 16, 8, 3]`).
    pub channels: Vec<usize>,
    /// Learn a scalar coefficient on the input velocity in the readout
    /// (default: false).
    pub velocity_coefficient: bool,
    /// Input interpretation (default: particles).
    pub input: InputMode,
    /// Redshift step the parameters are scoped to (default: none).
    pub redshifts: Option<RedshiftPair>,
    /// Append the source redshift as a feature column; needs `redshifts`
    /// (default: false).
    pub redshift_channel: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: LayerKind::ShiftInvariant,
            channels: vec![9, 32, 16, 8, 3],
            velocity_coefficient: false,
            input: InputMode::Particles,
            redshifts: None,
            redshift_channel: false,
        }
    }
}

impl ModelConfig {
    pub fn new(kind: LayerKind, channels: Vec<usize>) -> Self {
        Self { kind, channels, ..Self::default() }
    }

    pub fn with_velocity_coefficient(mut self, enabled: bool) -> Self {
        self.velocity_coefficient = enabled;
        self
    }

    /// Switch the input mode; the first channel width follows.
    pub fn with_input(mut self, input: InputMode) -> Self {
        self.input = input;
        self.sync_input_width();
        self
    }

    pub fn with_redshifts(mut self, redshifts: Option<RedshiftPair>) -> Self {
        self.redshifts = redshifts;
        self
    }

    /// Toggle the redshift feature column; the first channel width follows.
    pub fn with_redshift_channel(mut self, enabled: bool) -> Self {
        self.redshift_channel = enabled;
        self.sync_input_width();
        self
    }

    fn sync_input_width(&mut self) {
        let width = self.input_channels();
        if let Some(first) = self.channels.first_mut() {
            *first = width;
        }
    }

    /// Width of the first layer's input features.
    pub fn input_channels(&self) -> usize {
        let base = match self.input {
            InputMode::Particles => self.kind.input_channels(),
            InputMode::Zeldovich => ZA_EDGE_FEATURES,
        };
        base + usize::from(self.redshift_channel)
    }

    /// Check channel widths against the layer kind.
    pub fn validate(&self) -> Result<()> {
        if self.channels.len() < 2 {
            return Err(Error::InvalidConfig("channels needs at least input and output widths".into()));
        }
        if self.channels.contains(&0) {
            return Err(Error::InvalidConfig(format!("zero-width layer in {:?}", self.channels)));
        }
        if self.input == InputMode::Zeldovich {
            if self.kind.uses_triplets() {
                return Err(Error::InvalidConfig("Zel'dovich input needs an edge model".into()));
            }
            if self.velocity_coefficient {
                return Err(Error::InvalidConfig("Zel'dovich input has no velocity for a coefficient".into()));
            }
            if self.output_channels() != 3 {
                return Err(Error::InvalidConfig("Zel'dovich models predict 3 channels".into()));
            }
        }
        if self.redshift_channel && self.redshifts.is_none() {
            return Err(Error::InvalidConfig("redshift_channel needs a redshifts pair".into()));
        }
        let first = self.channels[0];
        if first != self.input_channels() {
            return Err(Error::DimensionMismatch { expected: self.input_channels(), got: first });
        }
        let last = self.output_channels();
        let ok = match self.kind {
            LayerKind::RotationInvariant => last == 1,
            LayerKind::Vanilla | LayerKind::ShiftInvariant => last == 3 || last == 6,
        };
        if !ok {
            return Err(Error::InvalidConfig(format!(
                "{:?} models cannot produce {last} output channels",
                self.kind
            )));
        }
        Ok(())
    }

    /// Check that graphs built with `graph` can feed this model.
    pub fn validate_graph(&self, graph: &GraphConfig) -> Result<()> {
        if self.kind.requires_self_loops() && !graph.include_self {
            return Err(Error::InvalidConfig(format!("{:?} layers need graphs built with include_self", self.kind)));
        }
        if self.kind.uses_triplets() {
            if let Some(k) = graph.search.fixed_degree() {
                let others = if graph.include_self { k.saturating_sub(1) } else { k };
                if others < 2 {
                    return Err(Error::InvalidConfig(format!(
                        "triplets need two neighbors besides self, k = {k} gives {others}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn num_layers(&self) -> usize {
        self.channels.len().saturating_sub(1)
    }

    /// `(k_in, k_out)` of each layer.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        self.channels.windows(2).map(|w| (w[0], w[1])).collect()
    }

    pub fn output_channels(&self) -> usize {
        self.channels.last().copied().unwrap_or(0)
    }

    /// Whether the readout also predicts velocities.
    pub fn predicts_velocity(&self) -> bool {
        !self.kind.uses_triplets() && self.input == InputMode::Particles && self.output_channels() == PARTICLE_CHANNELS
    }
}

/// One layer of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphLayer {
    Vanilla(VanillaConv),
    ShiftInvariant(ShiftInvConv),
    RotationInvariant(RotInvConv),
}

impl GraphLayer {
    pub fn new(kind: LayerKind, k_in: usize, k_out: usize) -> Self {
        match kind {
            LayerKind::Vanilla => Self::Vanilla(VanillaConv::new(k_in, k_out)),
            LayerKind::ShiftInvariant => Self::ShiftInvariant(ShiftInvConv::new(k_in, k_out)),
            LayerKind::RotationInvariant => Self::RotationInvariant(RotInvConv::new(k_in, k_out)),
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        match self {
            Self::Vanilla(l) => (l.k_in, l.k_out),
            Self::ShiftInvariant(l) => (l.k_in, l.k_out),
            Self::RotationInvariant(l) => (l.k_in, l.k_out),
        }
    }

    pub fn forward(&self, h: &Tensor, graph: &GraphTensors, params: &LayerParams, is_last: bool) -> Result<Tensor> {
        let (k_in, _) = self.dims();
        if h.dim(1)? != k_in {
            return Err(Error::DimensionMismatch { expected: k_in, got: h.dim(1)? });
        }
        match self {
            Self::Vanilla(l) => l.forward(h, graph.edges()?, params, is_last),
            Self::ShiftInvariant(l) => l.forward(h, graph.edges()?, params, is_last),
            Self::RotationInvariant(l) => l.forward(h, graph.triplets()?, params, is_last),
        }
    }
}

/// Predicted particle state, `(b, N, 3)` each.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Unwrapped positions; fold with [`crate::loss::wrap_positions`].
    pub location: Tensor,
    pub velocity: Option<Tensor>,
}

/// A layer stack with its parameters.
pub struct Model {
    config: ModelConfig,
    layers: Vec<GraphLayer>,
    params: ParamStore,
}

impl Model {
    pub fn new(config: ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        config.validate()?;
        let params = ParamStore::new(&config, seed, device)?;
        let layers = config
            .layer_dims()
            .into_iter()
            .map(|(k_in, k_out)| GraphLayer::new(config.kind, k_in, k_out))
            .collect();
        debug!(kind = ?config.kind, channels = ?config.channels, parameters = params.num_parameters(), "built model");
        Ok(Self { config, layers, params })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn kind(&self) -> LayerKind {
        self.config.kind
    }

    pub fn layers(&self) -> &[GraphLayer] {
        &self.layers
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Redshift fed to the feature column: the source of the scoped step.
    pub fn conditioning_redshift(&self) -> Option<f32> {
        match (self.config.redshift_channel, self.config.redshifts) {
            (true, Some(pair)) => Some(pair.from as f32),
            _ => None,
        }
    }

    /// Input features of the first layer for a `(b, N, 6)` batch.
    pub fn features(&self, particles: &Tensor, graph: &GraphTensors) -> Result<Tensor> {
        self.features_at(particles, graph, self.conditioning_redshift())
    }

    /// As [`Model::features`], with an explicit redshift for the feature
    /// column. `redshift` is required exactly when the column is enabled.
    pub fn features_at(&self, particles: &Tensor, graph: &GraphTensors, redshift: Option<f32>) -> Result<Tensor> {
        let base = match (self.config.kind, self.config.input) {
            (LayerKind::RotationInvariant, _) => triplet_features(particles, graph.triplets()?)?,
            (_, InputMode::Particles) => edge_features(particles, graph.edges()?)?,
            (_, InputMode::Zeldovich) => za_edge_features(particles, graph.edges()?)?,
        };
        match (self.config.redshift_channel, redshift) {
            (true, Some(z)) => with_redshift(&base, z),
            (false, None) => Ok(base),
            (true, None) => Err(Error::InvalidConfig("model expects a redshift feature".into())),
            (false, Some(_)) => Err(Error::InvalidConfig("model has no redshift feature column".into())),
        }
    }

    /// Run every layer on `features`, ReLU between layers.
    ///
    /// Edge models return `(b, N, k_out)`, triplet models `(P, 1)` with one
    /// row per `(particle, neighbor)` pair.
    pub fn network(&self, features: &Tensor, graph: &GraphTensors) -> Result<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut h = features.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, graph, self.params.layer(i)?, i == last)?;
            if i != last {
                h = h.relu()?;
            }
        }
        Ok(h)
    }

    /// Predict the next particle state for a `(b, N, 6)` batch.
    ///
    /// Zel'dovich models return `q + psi + correction`.
    pub fn forward(&self, particles: &Tensor, graph: &GraphTensors) -> Result<Prediction> {
        self.forward_at(particles, graph, self.conditioning_redshift())
    }

    /// As [`Model::forward`], conditioned on an explicit redshift.
    pub fn forward_at(&self, particles: &Tensor, graph: &GraphTensors, redshift: Option<f32>) -> Result<Prediction> {
        let (b, n, c) = particles.dims3()?;
        if b != graph.batch_size() {
            return Err(Error::DimensionMismatch { expected: graph.batch_size(), got: b });
        }
        if n != graph.num_particles() {
            return Err(Error::DimensionMismatch { expected: graph.num_particles(), got: n });
        }
        if c != PARTICLE_CHANNELS {
            return Err(Error::DimensionMismatch { expected: PARTICLE_CHANNELS, got: c });
        }

        let out = self.network(&self.features_at(particles, graph, redshift)?, graph)?;
        let x = particles.narrow(2, 0, 3)?;
        let v = particles.narrow(2, 3, 3)?;

        let mut location = match self.config.kind {
            LayerKind::RotationInvariant => displace(particles, &out, graph.triplets()?)?,
            LayerKind::Vanilla | LayerKind::ShiftInvariant => (&x + out.narrow(2, 0, 3)?)?,
        };
        if self.config.input == InputMode::Zeldovich {
            location = (location + &v)?;
        }
        if let Some(coefficient) = self.params.velocity_coefficient() {
            location = (location + v.broadcast_mul(coefficient)?)?;
        }
        let velocity = if self.config.predicts_velocity() {
            Some((&v + out.narrow(2, 3, 3)?)?)
        } else {
            None
        };
        Ok(Prediction { location, velocity })
    }
}
