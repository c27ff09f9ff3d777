//! Model parameters.
//!
//! Every trainable array is addressed by a [`ParamKey`] `(kind, layer, slot)`
//! and stored under the checkpoint name `"{tag}_{layer}_{slot}"`, with tag
//! `W` for weights, `B` for biases and `V` for scalar coefficients. The
//! store owns the backing [`VarMap`]; layers receive their
//! [`LayerParams`] explicitly on each call.
//!
//! A model trained for one redshift step carries that step as a
//! [`RedshiftPair`] scope, and every name gets the prefix `"z{from}_{to}/"`.
//! A checkpoint written for one step therefore does not restore into a
//! model for another.
//!
//! Weights are Glorot-normal, `N(0, 2 / (k_in + k_out))`, drawn from a
//! seeded generator. Biases start at `1e-8`.

use crate::error::{Error, Result};
use crate::model::ModelConfig;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarMap};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

const BIAS_INIT: f64 = 1e-8;
const VELOCITY_COEFFICIENT_INIT: f64 = 0.002;

/// What a parameter is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKind {
    Weight,
    Bias,
    Scalar,
}

impl ParamKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Weight => "W",
            Self::Bias => "B",
            Self::Scalar => "V",
        }
    }
}

/// Source and target redshift of the step a model learns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RedshiftPair {
    pub from: u32,
    pub to: u32,
}

impl RedshiftPair {
    pub fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    /// Name prefix of parameters in this scope.
    pub fn scope(&self) -> String {
        format!("z{}_{}", self.from, self.to)
    }
}

impl fmt::Display for RedshiftPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Address of one parameter array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    pub kind: ParamKind,
    pub layer: usize,
    pub slot: usize,
    pub scope: Option<RedshiftPair>,
}

impl ParamKey {
    pub fn weight(layer: usize, slot: usize) -> Self {
        Self { kind: ParamKind::Weight, layer, slot, scope: None }
    }

    pub fn bias(layer: usize, slot: usize) -> Self {
        Self { kind: ParamKind::Bias, layer, slot, scope: None }
    }

    /// The velocity coefficient of the skip connection.
    pub fn velocity_coefficient() -> Self {
        Self { kind: ParamKind::Scalar, layer: 0, slot: 0, scope: None }
    }

    pub fn in_scope(mut self, scope: Option<RedshiftPair>) -> Self {
        self.scope = scope;
        self
    }

    /// Checkpoint name.
    pub fn name(&self) -> String {
        let base = format!("{}_{}_{}", self.kind.tag(), self.layer, self.slot);
        match self.scope {
            Some(pair) => format!("{}/{base}", pair.scope()),
            None => base,
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Parameters of one layer.
#[derive(Debug, Clone)]
pub struct LayerParams {
    pub k_in: usize,
    pub k_out: usize,
    weights: Vec<Tensor>,
    biases: Vec<Tensor>,
}

impl LayerParams {
    /// Weight of `slot`, shape `(k_in, k_out)`.
    pub fn weight(&self, slot: usize) -> Result<&Tensor> {
        self.weights
            .get(slot)
            .ok_or_else(|| Error::InvalidConfig(format!("layer has no weight slot {slot}")))
    }

    /// Bias of `slot`, shape `(k_out,)`.
    pub fn bias(&self, slot: usize) -> Result<&Tensor> {
        self.biases
            .get(slot)
            .ok_or_else(|| Error::InvalidConfig(format!("layer has no bias slot {slot}")))
    }

    /// Parameters from explicit tensors, `(k_in, k_out)` weights and
    /// `(k_out,)` biases.
    pub fn from_tensors(weights: Vec<Tensor>, biases: Vec<Tensor>) -> Result<Self> {
        let Some(first) = weights.first() else {
            return Err(Error::InvalidConfig("a layer needs at least one weight".into()));
        };
        let (k_in, k_out) = first.dims2()?;
        for w in &weights {
            if w.dims2()? != (k_in, k_out) {
                return Err(Error::DimensionMismatch { expected: k_in * k_out, got: w.elem_count() });
            }
        }
        for b in &biases {
            if b.dims1()? != k_out {
                return Err(Error::DimensionMismatch { expected: k_out, got: b.elem_count() });
            }
        }
        Ok(Self { k_in, k_out, weights, biases })
    }

    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    pub fn num_biases(&self) -> usize {
        self.biases.len()
    }
}

/// Owner of every trainable array of a model.
pub struct ParamStore {
    varmap: VarMap,
    layers: Vec<LayerParams>,
    velocity_coefficient: Option<Tensor>,
    scope: Option<RedshiftPair>,
    keys: Vec<ParamKey>,
}

impl ParamStore {
    /// Create freshly initialized parameters for `config`.
    pub fn new(config: &ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut varmap = VarMap::new();
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let mut keys = Vec::new();
        let mut layers = Vec::with_capacity(config.num_layers());
        let scope = config.redshifts;

        for (layer, (k_in, k_out)) in config.layer_dims().into_iter().enumerate() {
            let std = (2.0 / (k_in + k_out) as f64).sqrt();
            let normal = Normal::new(0.0f32, std as f32).map_err(|e| Error::InvalidConfig(e.to_string()))?;
            let mut weights = Vec::with_capacity(config.kind.num_weights());
            for slot in 0..config.kind.num_weights() {
                let key = ParamKey::weight(layer, slot).in_scope(scope);
                let values: Vec<f32> = (0..k_in * k_out).map(|_| normal.sample(&mut rng)).collect();
                let init = Tensor::from_vec(values, (k_in, k_out), device)?;
                let var = varmap.get((k_in, k_out), &key.name(), Init::Const(0.0), DType::F32, device)?;
                varmap.set_one(key.name(), &init)?;
                weights.push(var);
                keys.push(key);
            }
            let mut biases = Vec::with_capacity(config.kind.num_biases());
            for slot in 0..config.kind.num_biases() {
                let key = ParamKey::bias(layer, slot).in_scope(scope);
                biases.push(varmap.get(k_out, &key.name(), Init::Const(BIAS_INIT), DType::F32, device)?);
                keys.push(key);
            }
            layers.push(LayerParams { k_in, k_out, weights, biases });
        }

        let velocity_coefficient = if config.velocity_coefficient {
            let key = ParamKey::velocity_coefficient().in_scope(scope);
            keys.push(key);
            Some(varmap.get(1usize, &key.name(), Init::Const(VELOCITY_COEFFICIENT_INIT), DType::F32, device)?)
        } else {
            None
        };

        debug!(layers = layers.len(), arrays = keys.len(), seed, scope = ?scope, "initialized parameters");
        Ok(Self { varmap, layers, velocity_coefficient, scope, keys })
    }

    pub fn layer(&self, index: usize) -> Result<&LayerParams> {
        self.layers
            .get(index)
            .ok_or_else(|| Error::InvalidConfig(format!("no parameters for layer {index}")))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Learned velocity coefficient, shape `(1,)`, if the model has one.
    pub fn velocity_coefficient(&self) -> Option<&Tensor> {
        self.velocity_coefficient.as_ref()
    }

    /// Redshift step the parameters belong to, if scoped.
    pub fn scope(&self) -> Option<RedshiftPair> {
        self.scope
    }

    /// Look up a parameter by key. Keys from another scope find nothing.
    pub fn get(&self, key: ParamKey) -> Option<&Tensor> {
        if key.scope != self.scope {
            return None;
        }
        match key.kind {
            ParamKind::Weight => self.layers.get(key.layer)?.weights.get(key.slot),
            ParamKind::Bias => self.layers.get(key.layer)?.biases.get(key.slot),
            ParamKind::Scalar => (key.layer == 0 && key.slot == 0)
                .then_some(self.velocity_coefficient.as_ref())
                .flatten(),
        }
    }

    /// Keys in creation order.
    pub fn keys(&self) -> &[ParamKey] {
        &self.keys
    }

    pub fn num_parameters(&self) -> usize {
        self.keys.iter().filter_map(|&k| self.get(k)).map(Tensor::elem_count).sum()
    }

    /// Variables handed to the optimizer.
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Write all arrays to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap.save(path)?;
        info!(path = %path.display(), arrays = self.keys.len(), "saved checkpoint");
        Ok(())
    }

    /// Restore every array from a safetensors file written by [`save`].
    ///
    /// Arrays are updated in place, so tensors handed out earlier observe
    /// the restored values. Missing names or mismatched shapes are errors.
    ///
    /// [`save`]: ParamStore::save
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap.load(path)?;
        info!(path = %path.display(), "restored checkpoint");
        Ok(())
    }
}
