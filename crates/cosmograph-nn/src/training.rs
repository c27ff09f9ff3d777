//! Training loop.
//!
//! Each step builds the batch graph on the host, uploads it with the
//! particles, runs the model, evaluates the loss against the last redshift
//! and applies one AdamW update. Parameters are the only state carried
//! between steps.
//!
//! # Example
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use cosmograph_core::{Dataset, GraphConfig};
//! use cosmograph_nn::training::{Trainer, TrainingConfig};
//! use cosmograph_nn::{Model, ModelConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (train, validation) = Dataset::synthetic(8, 64, 2, 0.01, 7)?.split_validation(8, 7)?;
//! let model = Model::new(ModelConfig::default(), 42, &Device::Cpu)?;
//! let config = TrainingConfig::default().with_iterations(500).with_batch_size(4);
//! let mut trainer = Trainer::new(model, GraphConfig::default(), config, Device::Cpu)?;
//! let report = trainer.fit(&train, Some(&validation), Some(Path::new("checkpoints")))?;
//! println!("final loss {:?}", report.final_loss());
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::graph::{EdgeTensors, GraphTensors, TripletTensors};
use crate::loss::{bounded_mse, bounded_mse_with_velocity, min_image_mse, wrap_positions};
use crate::model::{Model, Prediction};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use cosmograph_core::{Dataset, GraphBuilder, GraphConfig};
use ndarray::{ArrayView3, Axis};
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span};

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Learning rate (default: 0.01).
    pub learning_rate: f64,
    /// AdamW weight decay (default: 0.0, plain Adam).
    pub weight_decay: f64,
    /// Optimizer steps (default: 1000).
    pub iterations: usize,
    /// Samples per minibatch (default: 8).
    pub batch_size: usize,
    /// Seed for minibatch sampling and augmentation (default: 42).
    pub seed: u64,
    /// Boundary width of the bounded loss; `None` switches to the
    /// minimum-image loss on unwrapped positions (default: `Some(0.095)`).
    pub boundary: Option<f32>,
    /// Steps between validation and checkpoints (default: 100).
    pub checkpoint_every: usize,
    /// Random axis swaps, reflections and shifts (default: true).
    pub augmentation: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            weight_decay: 0.0,
            iterations: 1000,
            batch_size: 8,
            seed: 42,
            boundary: Some(0.095),
            checkpoint_every: 100,
            augmentation: true,
        }
    }
}

impl TrainingConfig {
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_weight_decay(mut self, decay: f64) -> Self {
        self.weight_decay = decay;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_boundary(mut self, boundary: Option<f32>) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn with_checkpoint_every(mut self, steps: usize) -> Self {
        self.checkpoint_every = steps;
        self
    }

    pub fn with_augmentation(mut self, enabled: bool) -> Self {
        self.augmentation = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::InvalidConfig(format!("learning_rate must be positive, got {}", self.learning_rate)));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::InvalidConfig("weight_decay must be non-negative".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.checkpoint_every == 0 {
            return Err(Error::InvalidConfig("checkpoint_every must be at least 1".into()));
        }
        if let Some(b) = self.boundary {
            if !(0.0..0.5).contains(&b) {
                return Err(Error::InvalidConfig(format!("boundary must lie in [0, 0.5), got {b}")));
            }
        }
        Ok(())
    }
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    /// Loss of every step.
    pub losses: Vec<f32>,
    /// `(step, median validation loss)` at each checkpoint.
    pub validation: Vec<(usize, f32)>,
    /// Checkpoint files written.
    pub checkpoints: Vec<PathBuf>,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

/// Median of `values`; the mean of the middle pair for even lengths.
pub fn median(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 { (sorted[mid - 1] + sorted[mid]) / 2.0 } else { sorted[mid] })
}

/// Drives optimization of one [`Model`].
pub struct Trainer {
    model: Model,
    optimizer: AdamW,
    builder: GraphBuilder,
    config: TrainingConfig,
    device: Device,
    rng: XorShiftRng,
    step: usize,
}

impl Trainer {
    pub fn new(model: Model, graph: GraphConfig, config: TrainingConfig, device: Device) -> Result<Self> {
        config.validate()?;
        model.config().validate_graph(&graph)?;
        let builder = GraphBuilder::new(graph)?;
        let optimizer = AdamW::new(
            model.params().vars(),
            ParamsAdamW { lr: config.learning_rate, weight_decay: config.weight_decay, ..Default::default() },
        )?;
        let rng = XorShiftRng::seed_from_u64(config.seed);
        Ok(Self { model, optimizer, builder, config, device, rng, step: 0 })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn graph_builder(&self) -> &GraphBuilder {
        &self.builder
    }

    /// Optimizer steps taken so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Copy a `(b, N, C)` host array to the device.
    pub fn upload(&self, batch: ArrayView3<f32>) -> Result<Tensor> {
        let shape = batch.dim();
        Ok(Tensor::from_iter(batch.iter().copied(), &self.device)?.reshape(shape)?)
    }

    /// Particles and graph tensors for one input batch.
    pub fn prepare(&self, input: ArrayView3<f32>) -> Result<(Tensor, GraphTensors)> {
        let graph = if self.model.kind().uses_triplets() {
            GraphTensors::Triplets(TripletTensors::from_graph(&self.builder.triplet_graph(input)?, &self.device)?)
        } else {
            GraphTensors::Edges(EdgeTensors::from_graph(&self.builder.batch_graph(input)?, &self.device)?)
        };
        Ok((self.upload(input)?, graph))
    }

    /// Scalar loss of `prediction` against a `(b, N, 6)` target.
    pub fn loss(&self, prediction: &Prediction, target: &Tensor) -> Result<Tensor> {
        match self.config.boundary {
            Some(boundary) => {
                let location = wrap_positions(&prediction.location)?;
                match &prediction.velocity {
                    Some(velocity) => bounded_mse_with_velocity(&location, velocity, target, boundary)?.combined(),
                    None => bounded_mse(&location, target, boundary),
                }
            }
            None => min_image_mse(&prediction.location, target),
        }
    }

    fn forward_loss(&self, input: ArrayView3<f32>, target: ArrayView3<f32>) -> Result<Tensor> {
        if input.dim() != target.dim() {
            return Err(Error::DimensionMismatch { expected: input.len(), got: target.len() });
        }
        let (particles, graph) = self.prepare(input)?;
        let prediction = self.model.forward(&particles, &graph)?;
        self.loss(&prediction, &self.upload(target)?)
    }

    /// One optimizer update on `input -> target`; returns the loss before
    /// the update.
    pub fn step(&mut self, input: ArrayView3<f32>, target: ArrayView3<f32>) -> Result<f32> {
        let loss = self.forward_loss(input, target)?;
        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            return Err(Error::Training(format!("loss diverged to {value} at step {}", self.step)));
        }
        self.optimizer.backward_step(&loss)?;
        self.step += 1;
        Ok(value)
    }

    /// Loss on `input -> target` without updating parameters.
    pub fn evaluate(&self, input: ArrayView3<f32>, target: ArrayView3<f32>) -> Result<f32> {
        Ok(self.forward_loss(input, target)?.to_scalar::<f32>()?)
    }

    /// Median loss over consecutive `batch_size` windows of `dataset`,
    /// first redshift to last.
    pub fn validation_loss(&self, dataset: &Dataset) -> Result<f32> {
        let last = last_redshift(dataset)?;
        let mut losses = Vec::new();
        let mut start = 0;
        while start < dataset.num_samples() {
            let len = self.config.batch_size.min(dataset.num_samples() - start);
            let window = dataset.window(start, len);
            losses.push(self.evaluate(window.index_axis(Axis(0), 0), window.index_axis(Axis(0), last))?);
            start += len;
        }
        median(&losses).ok_or_else(|| Error::Training("empty validation set".into()))
    }

    /// Save parameters to `dir/checkpoint_{step}.safetensors`.
    pub fn checkpoint(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(cosmograph_core::Error::from)?;
        let path = dir.join(format!("checkpoint_{}.safetensors", self.step));
        self.model.params().save(&path)?;
        Ok(path)
    }

    /// Run `iterations` steps on random minibatches of `train`.
    ///
    /// Every `checkpoint_every` steps, and after the last step, the median
    /// validation loss is recorded and a checkpoint written when `validation`
    /// and `checkpoint_dir` are given.
    pub fn fit(&mut self, train: &Dataset, validation: Option<&Dataset>, checkpoint_dir: Option<&Path>) -> Result<TrainingReport> {
        let last = last_redshift(train)?;
        let _span = info_span!("fit", iterations = self.config.iterations, batch_size = self.config.batch_size).entered();
        let mut report = TrainingReport::default();

        for i in 0..self.config.iterations {
            let batch = train.minibatch(self.config.batch_size, self.config.augmentation, &mut self.rng);
            let loss = self.step(batch.index_axis(Axis(0), 0), batch.index_axis(Axis(0), last))?;
            report.losses.push(loss);
            debug!(step = self.step, loss, "step");

            let done = i + 1 == self.config.iterations;
            if self.step % self.config.checkpoint_every == 0 || done {
                if let Some(validation) = validation {
                    let median_loss = self.validation_loss(validation)?;
                    report.validation.push((self.step, median_loss));
                    info!(step = self.step, loss, validation = median_loss, "checkpoint");
                } else {
                    info!(step = self.step, loss, "checkpoint");
                }
                if let Some(dir) = checkpoint_dir {
                    report.checkpoints.push(self.checkpoint(dir)?);
                }
            }
        }
        Ok(report)
    }
}

fn last_redshift(dataset: &Dataset) -> Result<usize> {
    match dataset.num_redshifts() {
        0 | 1 => Err(Error::Training("datasets need an input and a target redshift".into())),
        n => Ok(n - 1),
    }
}
