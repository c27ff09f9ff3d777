//! Cosmograph CLI - build particle graphs and train equivariant models.
//!
//! # Usage
//!
//! ```bash
//! # Summarize the batch graph of a synthetic 8^3 lattice
//! cosmograph graph --n-p 8 --samples 2 --k 14
//!
//! # Same for simulation files (one file per sample)
//! cosmograph graph --n-p 32 --input sim_z0_a.bin sim_z0_b.bin
//!
//! # Train on synthetic data, checkpointing every 100 steps
//! cosmograph train --iterations 500 --checkpoint-dir runs/a
//!
//! # Restore a checkpoint and report the validation loss
//! cosmograph eval --config runs/a/config.json --checkpoint runs/a/checkpoint_500.safetensors
//! ```
//!
//! A JSON run configuration (`--config`) holds `graph`, `model` and
//! `training` sections; flags override it.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand, ValueEnum};
use cosmograph_core::{Dataset, GraphBuilder, GraphConfig, NeighborSearch};
use cosmograph_nn::{LayerKind, Model, ModelConfig, RedshiftPair, Trainer, TrainingConfig};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "cosmograph")]
#[command(about = "Equivariant graph networks for periodic particle simulations", long_about = None)]
struct Cli {
    /// Verbosity (-v debug, -vv trace); RUST_LOG applies otherwise
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and summarize the neighbor graph of one batch
    Graph {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        data: DataArgs,

        /// Also derive the triplet structure
        #[arg(long)]
        triplets: bool,
    },

    /// Train a model
    Train {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        data: DataArgs,

        /// Optimizer steps
        #[arg(long)]
        iterations: Option<usize>,

        /// Samples per minibatch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// Samples held out for validation
        #[arg(long, default_value = "0")]
        validation: usize,

        /// Directory for checkpoints and the resolved config
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Report the median loss of a checkpoint
    Eval {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        data: DataArgs,

        /// Checkpoint file (.safetensors)
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

/// Configuration file and overrides shared by every command.
#[derive(Args)]
struct RunArgs {
    /// JSON run configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of nearest neighbors
    #[arg(short, long)]
    k: Option<usize>,

    /// Use a radius search instead of K-NN
    #[arg(long, conflicts_with = "k")]
    radius: Option<f32>,

    /// Boundary padding threshold
    #[arg(long)]
    threshold: Option<f32>,

    /// Leave particles out of their own neighbor lists
    #[arg(long)]
    no_self: bool,

    /// Layer family
    #[arg(long)]
    kind: Option<KindArg>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Scope parameters to a redshift step: FROM TO
    #[arg(long, num_args = 2, value_names = ["FROM", "TO"])]
    redshifts: Option<Vec<u32>>,
}

/// Where particles come from.
#[derive(Args)]
struct DataArgs {
    /// Particles per side; each sample has n_p^3 particles
    #[arg(long, default_value = "4")]
    n_p: usize,

    /// Initial snapshots, one raw f32 file per sample (synthetic if absent)
    #[arg(long, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Final snapshots, one per input file
    #[arg(long, num_args = 1..)]
    target: Vec<PathBuf>,

    /// Rescale positions and standardize velocities
    #[arg(long)]
    normalize: bool,

    /// Synthetic samples
    #[arg(long, default_value = "4")]
    samples: usize,

    /// Synthetic time step between snapshots
    #[arg(long, default_value = "0.01")]
    dt: f32,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    /// Four-operator edge layers
    Vanilla,
    /// Fifteen-operator edge layers
    ShiftInvariant,
    /// Triplet layers
    RotationInvariant,
}

impl From<KindArg> for LayerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Vanilla => LayerKind::Vanilla,
            KindArg::ShiftInvariant => LayerKind::ShiftInvariant,
            KindArg::RotationInvariant => LayerKind::RotationInvariant,
        }
    }
}

/// Everything needed to reproduce a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    graph: GraphConfig,
    model: ModelConfig,
    training: TrainingConfig,
}

impl RunArgs {
    fn resolve(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str::<RunConfig>(&text)
                    .with_context(|| format!("Failed to parse run config {}", path.display()))?
            }
            None => RunConfig::default(),
        };
        if let Some(k) = self.k {
            config.graph.search = NeighborSearch::Knn { k };
        }
        if let Some(r) = self.radius {
            config.graph.search = NeighborSearch::Radius { r };
        }
        if let Some(t) = self.threshold {
            config.graph.boundary_threshold = t;
        }
        if self.no_self {
            config.graph.include_self = false;
        }
        if let Some(kind) = self.kind {
            let kind = LayerKind::from(kind);
            if kind != config.model.kind {
                config.model = default_model(kind);
            }
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
        if let Some(&[from, to]) = self.redshifts.as_deref() {
            config.model.redshifts = Some(RedshiftPair::new(from, to));
        }
        config.graph.validate()?;
        config.model.validate()?;
        Ok(config)
    }
}

/// Default channel layout for a layer family.
fn default_model(kind: LayerKind) -> ModelConfig {
    let channels = match kind {
        LayerKind::RotationInvariant => vec![10, 32, 16, 8, 1],
        LayerKind::Vanilla | LayerKind::ShiftInvariant => vec![9, 32, 16, 8, 3],
    };
    ModelConfig::new(kind, channels)
}

impl DataArgs {
    fn load(&self, seed: u64) -> Result<Dataset> {
        let start = Instant::now();
        let pb = ProgressBar::new_spinner();
        let mut dataset = if self.input.is_empty() {
            if !self.target.is_empty() {
                bail!("--target needs matching --input files");
            }
            pb.set_message(format!("Generating {} synthetic samples...", self.samples));
            Dataset::synthetic(self.n_p, self.samples, 2, self.dt, seed)?
        } else {
            pb.set_message(format!("Loading {} samples...", self.input.len()));
            let mut redshifts = vec![self.input.clone()];
            if !self.target.is_empty() {
                if self.target.len() != self.input.len() {
                    bail!("{} input files but {} target files", self.input.len(), self.target.len());
                }
                redshifts.push(self.target.clone());
            }
            Dataset::from_sim_files(&redshifts, self.n_p).context("Failed to load simulation files")?
        };
        if self.normalize {
            dataset.normalize().context("Failed to normalize dataset")?;
        }
        pb.finish_with_message(format!("Loaded in {:.2?}", start.elapsed()));
        Ok(dataset)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match cli.command {
        Commands::Graph { run, data, triplets } => cmd_graph(&run, &data, triplets),
        Commands::Train {
            run,
            data,
            iterations,
            batch_size,
            lr,
            validation,
            checkpoint_dir,
        } => {
            let mut config = run.resolve()?;
            if let Some(iterations) = iterations {
                config.training.iterations = iterations;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(lr) = lr {
                config.training.learning_rate = lr;
            }
            cmd_train(config, &data, validation, checkpoint_dir.as_deref())
        }
        Commands::Eval { run, data, checkpoint } => cmd_eval(run.resolve()?, &data, &checkpoint),
    }
}

fn cmd_graph(run: &RunArgs, data: &DataArgs, triplets: bool) -> Result<()> {
    let config = run.resolve()?;
    let dataset = data.load(config.training.seed)?;
    let builder = GraphBuilder::new(config.graph.clone())?;
    let batch = dataset.redshift(0);

    let start = Instant::now();
    let graph = builder.batch_graph(batch)?;
    let elapsed = start.elapsed();

    println!("Batch Graph");
    println!("===========");
    println!("Samples:            {}", graph.batch_size);
    println!("Particles:          {}", graph.num_particles);
    println!("Edges:              {}", graph.num_edges());
    println!("Self-loops:         {}", graph.diag.len());
    println!("Missing transposes: {}", graph.missing_transposes);
    println!("Built in:           {elapsed:.2?}");

    if triplets {
        let triplet_graph = builder.triplet_graph(batch)?;
        println!("Triplets:           {}", triplet_graph.num_triplets());
        println!("Pairs:              {}", triplet_graph.num_pairs());
    }
    Ok(())
}

fn cmd_train(config: RunConfig, data: &DataArgs, validation: usize, checkpoint_dir: Option<&Path>) -> Result<()> {
    let dataset = data.load(config.training.seed)?;
    if dataset.num_redshifts() < 2 {
        bail!("training needs --target files (or synthetic data)");
    }
    let (train, held_out) = if validation > 0 {
        let (train, held_out) = dataset.split_validation(validation, config.training.seed)?;
        (train, Some(held_out))
    } else {
        (dataset, None)
    };

    if let Some(dir) = checkpoint_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let model = Model::new(config.model.clone(), config.training.seed, &Device::Cpu)?;
    info!(parameters = model.params().num_parameters(), kind = ?config.model.kind, "model ready");
    let mut trainer = Trainer::new(model, config.graph, config.training.clone(), Device::Cpu)?;

    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Training for {} steps...", config.training.iterations));
    let report = trainer.fit(&train, held_out.as_ref(), checkpoint_dir)?;
    pb.finish_with_message(format!("Trained in {:.2?}", start.elapsed()));

    match report.final_loss() {
        Some(loss) => println!("Final loss: {loss:.6}"),
        None => println!("Final loss: n/a"),
    }
    for (step, loss) in &report.validation {
        println!("Validation loss at step {step}: {loss:.6}");
    }
    println!("Checkpoints: {}", report.checkpoints.len());
    Ok(())
}

fn cmd_eval(config: RunConfig, data: &DataArgs, checkpoint: &Path) -> Result<()> {
    let dataset = data.load(config.training.seed)?;
    let mut model = Model::new(config.model.clone(), config.training.seed, &Device::Cpu)?;
    model
        .params_mut()
        .load(checkpoint)
        .with_context(|| format!("Failed to restore {}", checkpoint.display()))?;
    let trainer = Trainer::new(model, config.graph, config.training, Device::Cpu)?;
    let loss = trainer.validation_loss(&dataset)?;
    println!("Validation loss: {loss:.6}");
    Ok(())
}
