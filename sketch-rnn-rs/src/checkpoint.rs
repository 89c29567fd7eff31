//! Run directories, weight checkpoints and resumable training state.
//!
//! Every run writes into `{output_dir}/{run_id}/`:
//! - `runid-{id}_epoch-{epoch:05}_encoder.safetensors`
//! - `runid-{id}_epoch-{epoch:05}_decoder.safetensors`
//! - `training_state.json` for the latest save
//! - `config.yaml` with the configuration the run was started with
//! - sampled sketches as `..._sample-{idx:04}_{orig,decoded}.json`

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SketchRnnConfig;
use crate::data::Stroke3;
use crate::error::{SketchError, SketchResult};
use crate::model::SketchRnn;

const STATE_FILE: &str = "training_state.json";
const CONFIG_FILE: &str = "config.yaml";

/// Progress saved alongside each checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Run identifier
    pub run_id: String,
    /// Last completed epoch
    pub epoch: usize,
    /// Optimizer steps taken so far
    pub global_step: usize,
    /// Learning rate at save time
    pub learning_rate: f64,
    /// KL multiplier at save time
    pub eta: f64,
}

/// Draw a 7-digit run id.
pub fn random_run_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{:07}", rng.gen_range(0..1_000_000u32))
}

/// File layout of one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    run_id: String,
    run_dir: PathBuf,
}

impl CheckpointStore {
    /// Store for `run_id` under `output_dir`. Nothing is created on disk yet.
    pub fn new(output_dir: impl AsRef<Path>, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let run_dir = output_dir.as_ref().join(&run_id);
        Self { run_id, run_dir }
    }

    /// Run identifier
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Directory holding this run's files
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Create the run directory if needed.
    pub fn ensure_dir(&self) -> SketchResult<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        Ok(())
    }

    fn prefix(&self, epoch: usize) -> String {
        format!("runid-{}_epoch-{epoch:05}", self.run_id)
    }

    /// Encoder weights for `epoch`
    pub fn encoder_path(&self, epoch: usize) -> PathBuf {
        self.run_dir
            .join(format!("{}_encoder.safetensors", self.prefix(epoch)))
    }

    /// Decoder weights for `epoch`
    pub fn decoder_path(&self, epoch: usize) -> PathBuf {
        self.run_dir
            .join(format!("{}_decoder.safetensors", self.prefix(epoch)))
    }

    /// Sample output for validation sketch `idx`; `kind` is `orig` or `decoded`.
    pub fn sample_path(&self, epoch: usize, idx: usize, kind: &str) -> PathBuf {
        self.run_dir
            .join(format!("{}_sample-{idx:04}_{kind}.json", self.prefix(epoch)))
    }

    /// Persist both sub-networks and the training state.
    pub fn save(&self, model: &SketchRnn, state: &TrainingState) -> SketchResult<()> {
        self.ensure_dir()?;
        model.save(&self.encoder_path(state.epoch), &self.decoder_path(state.epoch))?;
        std::fs::write(
            self.run_dir.join(STATE_FILE),
            serde_json::to_string_pretty(state)?,
        )?;
        tracing::info!(
            "Saved checkpoint: run {} epoch {} -> {}",
            self.run_id,
            state.epoch,
            self.run_dir.display()
        );
        Ok(())
    }

    /// Restore both sub-networks from the files of `epoch`.
    pub fn load(&self, model: &mut SketchRnn, epoch: usize) -> SketchResult<()> {
        model.load(&self.encoder_path(epoch), &self.decoder_path(epoch))?;
        tracing::info!("Loaded checkpoint: run {} epoch {}", self.run_id, epoch);
        Ok(())
    }

    /// Read the state written by the latest [`CheckpointStore::save`].
    pub fn load_state(&self) -> SketchResult<TrainingState> {
        let path = self.run_dir.join(STATE_FILE);
        let json = std::fs::read_to_string(&path).map_err(|e| {
            SketchError::checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;
        let state: TrainingState = serde_json::from_str(&json)
            .map_err(|e| SketchError::checkpoint(format!("failed to parse state: {e}")))?;
        Ok(state)
    }

    /// Write the run configuration.
    pub fn save_config(&self, config: &SketchRnnConfig) -> SketchResult<()> {
        self.ensure_dir()?;
        config.to_file(self.run_dir.join(CONFIG_FILE))
    }

    /// Highest epoch with both weight files present.
    pub fn latest_epoch(&self) -> SketchResult<Option<usize>> {
        if !self.run_dir.exists() {
            return Ok(None);
        }
        let prefix = format!("runid-{}_epoch-", self.run_id);
        let mut latest = None;
        for entry in std::fs::read_dir(&self.run_dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(epoch) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix("_encoder.safetensors"))
                .and_then(|digits| digits.parse::<usize>().ok())
            else {
                continue;
            };
            if self.decoder_path(epoch).exists() {
                latest = latest.max(Some(epoch));
            }
        }
        Ok(latest)
    }

    /// Write a stroke-3 sketch as JSON.
    pub fn save_strokes(&self, path: &Path, strokes: &[Stroke3]) -> SketchResult<()> {
        self.ensure_dir()?;
        std::fs::write(path, serde_json::to_string(strokes)?)?;
        Ok(())
    }
}
