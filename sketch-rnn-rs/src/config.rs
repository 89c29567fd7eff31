//! Hyper-parameters for Sketch-RNN training.
//!
//! The defaults reproduce the settings of the Sketch-RNN paper: a 256-wide
//! bidirectional encoder, a 512-wide decoder, a 128-dimensional latent code and
//! a 20-component bivariate Gaussian mixture. Configurations round-trip through
//! YAML so a run can be reproduced from its `config.yaml`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SketchError, SketchResult};

/// Full configuration for a Sketch-RNN run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SketchRnnConfig {
    /// Network sizes.
    #[serde(default)]
    pub model: ModelConfig,

    /// Optimisation and schedule settings.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Stroke dataset settings.
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Directory that receives one sub-directory per run.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Fixed run identifier; a random 7-digit id is drawn when absent.
    #[serde(default)]
    pub run_id: Option<String>,

    /// Seed for parameter init, latent noise, shuffling and sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "models".into()
}

fn default_seed() -> u64 {
    42
}

/// Encoder/decoder dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden size of each encoder direction
    #[serde(default = "default_enc_hidden_size")]
    pub enc_hidden_size: usize,
    /// Hidden size of the decoder
    #[serde(default = "default_dec_hidden_size")]
    pub dec_hidden_size: usize,
    /// Latent dimension
    #[serde(default = "default_d_z")]
    pub d_z: usize,
    /// Number of mixture components
    #[serde(default = "default_n_distributions")]
    pub n_distributions: usize,
}

fn default_enc_hidden_size() -> usize {
    256
}
fn default_dec_hidden_size() -> usize {
    512
}
fn default_d_z() -> usize {
    128
}
fn default_n_distributions() -> usize {
    20
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            enc_hidden_size: default_enc_hidden_size(),
            dec_hidden_size: default_dec_hidden_size(),
            d_z: default_d_z(),
            n_distributions: default_n_distributions(),
        }
    }
}

/// Optimisation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Sequences per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Initial learning rate for both optimizers
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Multiply the learning rate by `lr_decay` after every epoch
    #[serde(default)]
    pub use_lr_decay: bool,
    /// Floor for the decayed learning rate
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    /// Per-epoch decay factor
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,
    /// Weight of the KL term in the total loss
    #[serde(default = "default_kl_div_loss_weight")]
    pub kl_div_loss_weight: f64,
    /// Anneal the KL term with the eta schedule
    #[serde(default)]
    pub use_eta: bool,
    /// Starting eta
    #[serde(default = "default_eta_min")]
    pub eta_min: f64,
    /// Eta annealing rate
    #[serde(default = "default_eta_r")]
    pub eta_r: f64,
    /// Global gradient norm limit per sub-network
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f64,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Checkpoint and sample every N epochs
    #[serde(default = "default_save_every_n_epochs")]
    pub save_every_n_epochs: usize,
    /// Number of fixed validation sequences sampled at each save
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    /// Draw an indicatif progress bar
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_epochs() -> usize {
    100
}
fn default_batch_size() -> usize {
    100
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_min_lr() -> f64 {
    1e-5
}
fn default_lr_decay() -> f64 {
    0.9999
}
fn default_kl_div_loss_weight() -> f64 {
    0.5
}
fn default_eta_min() -> f64 {
    1e-2
}
fn default_eta_r() -> f64 {
    0.99995
}
fn default_grad_clip() -> f64 {
    1.0
}
fn default_temperature() -> f64 {
    0.4
}
fn default_save_every_n_epochs() -> usize {
    100
}
fn default_num_samples() -> usize {
    5
}
fn default_show_progress() -> bool {
    true
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            use_lr_decay: false,
            min_lr: default_min_lr(),
            lr_decay: default_lr_decay(),
            kl_div_loss_weight: default_kl_div_loss_weight(),
            use_eta: false,
            eta_min: default_eta_min(),
            eta_r: default_eta_r(),
            grad_clip: default_grad_clip(),
            temperature: default_temperature(),
            save_every_n_epochs: default_save_every_n_epochs(),
            num_samples: default_num_samples(),
            show_progress: default_show_progress(),
        }
    }
}

/// Location and filtering of the stroke dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// JSON file with `train`/`valid`/`test` stroke-3 splits
    #[serde(default = "default_dataset_path")]
    pub path: String,
    /// Longest sequence kept (inclusive)
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    /// Sequences must be strictly longer than this
    #[serde(default = "default_min_seq_length")]
    pub min_seq_length: usize,
}

fn default_dataset_path() -> String {
    "data/sketch/bicycle.json".into()
}
fn default_max_seq_length() -> usize {
    200
}
fn default_min_seq_length() -> usize {
    10
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: default_dataset_path(),
            max_seq_length: default_max_seq_length(),
            min_seq_length: default_min_seq_length(),
        }
    }
}

impl Default for SketchRnnConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            dataset: DatasetConfig::default(),
            output_dir: default_output_dir(),
            run_id: None,
            seed: default_seed(),
        }
    }
}

impl SketchRnnConfig {
    /// Tiny configuration for unit tests and smoke runs.
    pub fn test() -> Self {
        Self {
            model: ModelConfig {
                enc_hidden_size: 8,
                dec_hidden_size: 16,
                d_z: 4,
                n_distributions: 3,
            },
            training: TrainingConfig {
                epochs: 2,
                batch_size: 4,
                save_every_n_epochs: 1,
                num_samples: 2,
                show_progress: false,
                ..TrainingConfig::default()
            },
            dataset: DatasetConfig {
                path: "strokes.json".into(),
                max_seq_length: 40,
                min_seq_length: 2,
            },
            output_dir: "models".into(),
            run_id: None,
            seed: 7,
        }
    }

    /// Width of one decoder input step: a stroke-5 vector followed by `z`.
    pub fn decoder_input_size(&self) -> usize {
        5 + self.model.d_z
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SketchResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> SketchResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> SketchResult<()> {
        let m = &self.model;
        if m.enc_hidden_size == 0 || m.dec_hidden_size == 0 {
            return Err(SketchError::invalid_config("hidden sizes must be > 0"));
        }
        if m.d_z == 0 {
            return Err(SketchError::invalid_config("d_z must be > 0"));
        }
        if m.n_distributions == 0 {
            return Err(SketchError::invalid_config("n_distributions must be > 0"));
        }

        let t = &self.training;
        if t.batch_size == 0 {
            return Err(SketchError::invalid_config("batch_size must be > 0"));
        }
        if t.learning_rate <= 0.0 {
            return Err(SketchError::invalid_config("learning_rate must be > 0"));
        }
        if t.use_lr_decay && !(0.0..=1.0).contains(&t.lr_decay) {
            return Err(SketchError::invalid_config("lr_decay must be in [0, 1]"));
        }
        if t.grad_clip <= 0.0 {
            return Err(SketchError::invalid_config("grad_clip must be > 0"));
        }
        if t.temperature <= 0.0 {
            return Err(SketchError::invalid_config("temperature must be > 0"));
        }
        if t.eta_min <= 0.0 || t.eta_min > 1.0 {
            return Err(SketchError::invalid_config("eta_min must be in (0, 1]"));
        }
        if t.save_every_n_epochs == 0 {
            return Err(SketchError::invalid_config(
                "save_every_n_epochs must be > 0",
            ));
        }

        let d = &self.dataset;
        if d.path.is_empty() {
            return Err(SketchError::invalid_config("dataset.path is required"));
        }
        if d.min_seq_length >= d.max_seq_length {
            return Err(SketchError::invalid_config(format!(
                "min_seq_length ({}) must be < max_seq_length ({})",
                d.min_seq_length, d.max_seq_length
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_matches_paper_hparams() {
        let config = SketchRnnConfig::default();
        assert_eq!(config.model.enc_hidden_size, 256);
        assert_eq!(config.model.dec_hidden_size, 512);
        assert_eq!(config.model.d_z, 128);
        assert_eq!(config.model.n_distributions, 20);
        assert_eq!(config.training.batch_size, 100);
        assert_eq!(config.training.kl_div_loss_weight, 0.5);
        assert_eq!(config.training.grad_clip, 1.0);
        assert_eq!(config.dataset.max_seq_length, 200);
        assert_eq!(config.decoder_input_size(), 133);
        config.validate().unwrap();
    }

    #[test]
    fn test_test_preset_is_valid() {
        SketchRnnConfig::test().validate().unwrap();
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = SketchRnnConfig::test();
        config.run_id = Some("1234567".into());
        config.to_file(&path).unwrap();

        let loaded = SketchRnnConfig::from_file(&path).unwrap();
        assert_eq!(loaded.model, config.model);
        assert_eq!(loaded.training, config.training);
        assert_eq!(loaded.run_id.as_deref(), Some("1234567"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: SketchRnnConfig = serde_yaml::from_str(
            "model:\n  d_z: 32\ntraining:\n  use_eta: true\n",
        )
        .unwrap();
        assert_eq!(config.model.d_z, 32);
        assert_eq!(config.model.dec_hidden_size, 512);
        assert!(config.training.use_eta);
        assert_eq!(config.training.eta_r, 0.99995);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SketchRnnConfig::test();
        config.model.d_z = 0;
        assert!(config.validate().is_err());

        let mut config = SketchRnnConfig::test();
        config.training.temperature = 0.0;
        assert!(config.validate().is_err());

        let mut config = SketchRnnConfig::test();
        config.training.eta_min = 0.0;
        assert!(config.validate().is_err());

        let mut config = SketchRnnConfig::test();
        config.dataset.min_seq_length = config.dataset.max_seq_length;
        assert!(matches!(
            config.validate(),
            Err(SketchError::InvalidConfig(_))
        ));
    }
}
