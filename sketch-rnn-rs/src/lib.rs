//! Sketch-RNN: a sequence-to-sequence variational autoencoder for vector sketches
//!
//! Sketches are sequences of pen offsets. This crate provides:
//! - A bidirectional LSTM encoder producing a latent code `z` by reparameterisation
//! - An autoregressive LSTM decoder emitting a bivariate Gaussian mixture over
//!   the next offset and a categorical distribution over the pen state
//! - Reconstruction and KL losses, gradient clipping and per-sub-network Adam
//! - A stroke dataset, a training loop with checkpoints, and temperature sampling
//!
//! # Example
//!
//! ```no_run
//! use sketch_rnn_rs::{SketchRnn, SketchRnnConfig};
//! use candle_core::Device;
//!
//! let config = SketchRnnConfig::default();
//! let model = SketchRnn::new(&config.model, &Device::Cpu, config.seed).unwrap();
//! println!("{} parameters", model.parameter_count());
//! ```
//!
//! # Training
//!
//! ```no_run
//! use sketch_rnn_rs::{SketchRnnConfig, Trainer};
//! use candle_core::Device;
//!
//! let config = SketchRnnConfig::from_file("config.yaml").unwrap();
//! let mut trainer = Trainer::new(config, Device::Cpu).unwrap();
//! trainer.train().unwrap();
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod loss;
pub mod lstm;
pub mod metrics;
pub mod mixture;
pub mod model;
pub mod optimizer;
pub mod sampler;
pub mod schedule;
pub mod train_step;
pub mod trainer;

pub use checkpoint::{CheckpointStore, TrainingState};
pub use config::{DatasetConfig, ModelConfig, SketchRnnConfig, TrainingConfig};
pub use data::{DataLoader, Stroke3, StrokeBatch, StrokeSplits, StrokesDataset};
pub use error::{SketchError, SketchResult};
pub use metrics::{JsonlSink, Metrics, MetricsSink, MultiSink, RecordingSink, TracingSink};
pub use mixture::BivariateGaussianMixture;
pub use model::SketchRnn;
pub use sampler::Sampler;
pub use train_step::{StepOutput, TrainingStep};
pub use trainer::Trainer;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::SketchRnnConfig;
    pub use crate::data::{DataLoader, StrokeBatch, StrokeSplits, StrokesDataset};
    pub use crate::error::{SketchError, SketchResult};
    pub use crate::metrics::{Metrics, MetricsSink};
    pub use crate::model::SketchRnn;
    pub use crate::sampler::Sampler;
    pub use crate::train_step::TrainingStep;
    pub use crate::trainer::Trainer;
}
