//! Epoch loop: training, validation, checkpoints and periodic sampling.

use std::path::PathBuf;

use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{random_run_id, CheckpointStore, TrainingState};
use crate::config::SketchRnnConfig;
use crate::data::{stroke5_to_stroke3, DataLoader, Stroke3, StrokeSplits, StrokesDataset};
use crate::error::{SketchError, SketchResult};
use crate::metrics::{JsonlSink, Metrics, MetricsSink, MultiSink, TracingSink};
use crate::model::SketchRnn;
use crate::sampler::Sampler;
use crate::schedule::{KlWeightSchedule, LrDecay};
use crate::train_step::TrainingStep;

// Offsets from `config.seed` so each random stream is independent.
const NOISE_SEED_OFFSET: u64 = 1;
const SHUFFLE_SEED_OFFSET: u64 = 2;
const SAMPLE_SEED_OFFSET: u64 = 3;

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use sketch_rnn_rs::{SketchRnnConfig, Trainer};
/// use candle_core::Device;
///
/// # fn main() -> sketch_rnn_rs::SketchResult<()> {
/// let config = SketchRnnConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::new(config, Device::Cpu)?;
/// trainer.train()?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: SketchRnnConfig,
    step: TrainingStep,
    train_data: StrokesDataset,
    valid_data: StrokesDataset,
    store: CheckpointStore,
    lr_decay: Option<LrDecay>,
    kl_schedule: KlWeightSchedule,
    shuffle_rng: ChaCha8Rng,
    sample_rng: ChaCha8Rng,
    sample_indices: Vec<usize>,
    sink: Box<dyn MetricsSink>,
    global_step: usize,
    start_epoch: usize,
}

impl Trainer {
    /// Load the dataset named in `config` and build a fresh run.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the dataset cannot
    /// be read.
    pub fn new(config: SketchRnnConfig, device: Device) -> SketchResult<Self> {
        let splits = StrokeSplits::from_json_file(&config.dataset.path)?;
        Self::from_splits(config, &splits, device)
    }

    /// Build a run over in-memory splits.
    ///
    /// The validation set is normalised with the training scale. Metrics go to
    /// `tracing` and to `{run_dir}/metrics.jsonl` unless replaced with
    /// [`Trainer::with_sink`].
    pub fn from_splits(
        config: SketchRnnConfig,
        splits: &StrokeSplits,
        device: Device,
    ) -> SketchResult<Self> {
        config.validate()?;

        let ds = &config.dataset;
        let train_data =
            StrokesDataset::new(&splits.train, ds.max_seq_length, ds.min_seq_length, None)?;
        let valid_data = StrokesDataset::new(
            &splits.valid,
            ds.max_seq_length,
            ds.min_seq_length,
            Some(train_data.scale()),
        )?;

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let run_id = match &config.run_id {
            Some(id) => id.clone(),
            None => random_run_id(&mut rng),
        };
        let store = CheckpointStore::new(&config.output_dir, run_id);

        let num_samples = config.training.num_samples.min(valid_data.len());
        let sample_indices =
            rand::seq::index::sample(&mut rng, valid_data.len(), num_samples).into_vec();

        let model = SketchRnn::new(&config.model, &device, config.seed)?;
        let mut step = TrainingStep::new(
            model,
            &config.training,
            config.seed.wrapping_add(NOISE_SEED_OFFSET),
        )?;
        let kl_schedule = KlWeightSchedule::from_config(&config.training);
        step.set_eta(kl_schedule.eta(0));

        tracing::info!(
            "Run {}: {} train / {} valid sketches, seq_len {}, scale {:.4}, {} parameters",
            store.run_id(),
            train_data.len(),
            valid_data.len(),
            train_data.seq_len(),
            train_data.scale(),
            step.model().parameter_count()
        );

        let sink = MultiSink::new()
            .with(TracingSink)
            .with(JsonlSink::new(store.run_dir().join("metrics.jsonl")));

        Ok(Self {
            lr_decay: LrDecay::from_config(&config.training),
            kl_schedule,
            shuffle_rng: ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(SHUFFLE_SEED_OFFSET)),
            sample_rng: ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(SAMPLE_SEED_OFFSET)),
            config,
            step,
            train_data,
            valid_data,
            store,
            sample_indices,
            sink: Box::new(sink),
            global_step: 0,
            start_epoch: 0,
        })
    }

    /// Replace the metrics sink.
    pub fn with_sink(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Run identifier
    pub fn run_id(&self) -> &str {
        self.store.run_id()
    }

    /// Checkpoint layout of this run
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// The model being trained
    pub fn model(&self) -> &SketchRnn {
        self.step.model()
    }

    /// Training set
    pub fn train_data(&self) -> &StrokesDataset {
        &self.train_data
    }

    /// Validation set
    pub fn valid_data(&self) -> &StrokesDataset {
        &self.valid_data
    }

    /// Validation sketches sampled at every save
    pub fn sample_indices(&self) -> &[usize] {
        &self.sample_indices
    }

    /// Optimizer steps taken so far
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.step.learning_rate()
    }

    /// Current KL multiplier
    pub fn eta(&self) -> f64 {
        self.step.eta()
    }

    /// First epoch [`Trainer::train`] will run
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    fn progress_bar(&self, len: usize, prefix: String) -> SketchResult<ProgressBar> {
        if !self.config.training.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{prefix} {spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}",
                )?
                .progress_chars("#>-"),
        );
        pb.set_prefix(prefix);
        Ok(pb)
    }

    /// One shuffled pass over the training set.
    ///
    /// Logs per-step metrics at global step `idx + epoch · steps_per_epoch`,
    /// then applies learning-rate decay if enabled. Returns the batch-weighted
    /// averages of the epoch.
    pub fn train_one_epoch(&mut self, epoch: usize) -> SketchResult<Metrics> {
        self.step.set_eta(self.kl_schedule.eta(epoch));

        let device = self.step.model().device().clone();
        let loader = DataLoader::new(&self.train_data, self.config.training.batch_size, device)
            .shuffled(&mut self.shuffle_rng);
        let steps_per_epoch = loader.num_batches();
        let pb = self.progress_bar(steps_per_epoch, format!("epoch {epoch}"))?;

        let mut totals = LossTotals::default();
        for (idx, batch) in loader.enumerate() {
            let batch = batch?;
            let out = self.step.step(&batch, true)?;
            if !out.loss.is_finite() {
                return Err(SketchError::training(format!(
                    "non-finite loss at epoch {epoch} step {idx}"
                )));
            }
            totals.add(out.loss, out.reconstruction_loss, out.kl_loss, out.batch_size);

            self.global_step = idx + epoch * steps_per_epoch;
            let metrics = Metrics::new()
                .with("loss", f64::from(out.loss))
                .with("reconstruction_loss", f64::from(out.reconstruction_loss))
                .with("kl_loss", f64::from(out.kl_loss))
                .with("learning_rate", self.step.learning_rate())
                .with("epoch", epoch as f64);
            self.sink.log(&metrics, self.global_step);

            pb.set_message(format!("loss {:.4}", out.loss));
            pb.inc(1);
        }
        pb.finish_and_clear();

        if let Some(decay) = self.lr_decay {
            let lr = decay.next(self.step.learning_rate());
            self.step.set_learning_rate(lr);
        }

        Ok(totals.averages(""))
    }

    /// One pass over the validation set without parameter updates.
    ///
    /// Returns `val_avg_loss`, `val_avg_reconstruction_loss` and
    /// `val_avg_kl_loss`, each weighted by batch size.
    pub fn validate_one_epoch(&mut self, epoch: usize) -> SketchResult<Metrics> {
        let device = self.step.model().device().clone();
        let loader = DataLoader::new(&self.valid_data, self.config.training.batch_size, device);

        let mut totals = LossTotals::default();
        for batch in loader {
            let out = self.step.step(&batch?, false)?;
            totals.add(out.loss, out.reconstruction_loss, out.kl_loss, out.batch_size);
        }

        let mut metrics = totals.averages("val_avg_");
        metrics.insert("epoch", epoch as f64);
        self.sink.log(&metrics, self.global_step);
        Ok(metrics)
    }

    /// Run every remaining epoch.
    ///
    /// Each epoch trains and validates; every `save_every_n_epochs` epochs
    /// (starting with the first) the weights are saved and the fixed
    /// validation sketches are re-sampled. Returns the validation metrics of
    /// each epoch run.
    pub fn train(&mut self) -> SketchResult<Vec<Metrics>> {
        self.store.save_config(&self.config)?;
        let epochs = self.config.training.epochs;
        let save_every = self.config.training.save_every_n_epochs.max(1);
        tracing::info!(
            "Training run {} for epochs {}..{}",
            self.store.run_id(),
            self.start_epoch,
            epochs
        );

        let mut history = Vec::new();
        for epoch in self.start_epoch..epochs {
            self.train_one_epoch(epoch)?;
            let val = self.validate_one_epoch(epoch)?;
            if epoch % save_every == 0 {
                self.save(epoch)?;
                self.sample(epoch)?;
            }
            tracing::info!(
                "Finished epoch {}. Validation Loss: {:.6}",
                epoch,
                val.get("val_avg_loss").unwrap_or(f64::NAN)
            );
            history.push(val);
            self.start_epoch = epoch + 1;
        }
        Ok(history)
    }

    /// Save the weights and training state for `epoch`.
    pub fn save(&self, epoch: usize) -> SketchResult<()> {
        let state = TrainingState {
            run_id: self.store.run_id().to_string(),
            epoch,
            global_step: self.global_step,
            learning_rate: self.step.learning_rate(),
            eta: self.step.eta(),
        };
        self.store.save(self.step.model(), &state)
    }

    /// Restore the weights saved for `epoch`.
    pub fn load(&mut self, epoch: usize) -> SketchResult<()> {
        self.store.load(self.step.model_mut(), epoch)
    }

    /// Restore `epoch` and continue training from the epoch after it.
    ///
    /// Learning rate and step count come from `training_state.json` when it
    /// was written for the same epoch.
    pub fn resume(&mut self, epoch: usize) -> SketchResult<()> {
        self.load(epoch)?;
        match self.store.load_state() {
            Ok(state) if state.epoch == epoch => {
                self.step.set_learning_rate(state.learning_rate);
                self.step.set_eta(state.eta);
                self.global_step = state.global_step;
            }
            Ok(state) => tracing::warn!(
                "training state is for epoch {}, not {}; keeping configured learning rate",
                state.epoch,
                epoch
            ),
            Err(e) => tracing::warn!("no training state to resume from: {e}"),
        }
        self.start_epoch = epoch + 1;
        tracing::info!("Resuming run {} at epoch {}", self.store.run_id(), self.start_epoch);
        Ok(())
    }

    /// Encode validation sketch `idx` and decode a new sketch from it.
    ///
    /// Both results are in un-normalised stroke-3 form.
    pub fn sample_one(
        &mut self,
        idx: usize,
        temperature: f64,
    ) -> SketchResult<(Vec<Stroke3>, Vec<Stroke3>)> {
        let orig = self.valid_data.stroke3(idx).ok_or_else(|| {
            SketchError::data(format!(
                "validation index {idx} out of range ({} sketches)",
                self.valid_data.len()
            ))
        })?;
        let model = self.step.model();
        let batch = self.valid_data.batch(&[idx], model.device())?;
        let rows = Sampler::new(model).sample(&batch.data, temperature, &mut self.sample_rng)?;
        let decoded = stroke5_to_stroke3(&rows, self.valid_data.scale());
        Ok((orig, decoded))
    }

    /// Sample every fixed validation sketch and write `orig`/`decoded` JSON
    /// files for `epoch`. Returns the decoded paths.
    pub fn sample(&mut self, epoch: usize) -> SketchResult<Vec<PathBuf>> {
        let temperature = self.config.training.temperature;
        let mut decoded_paths = Vec::with_capacity(self.sample_indices.len());
        for idx in self.sample_indices.clone() {
            let (orig, decoded) = self.sample_one(idx, temperature)?;
            let orig_path = self.store.sample_path(epoch, idx, "orig");
            let decoded_path = self.store.sample_path(epoch, idx, "decoded");
            self.store.save_strokes(&orig_path, &orig)?;
            self.store.save_strokes(&decoded_path, &decoded)?;
            decoded_paths.push(decoded_path);
        }
        decoded_paths.sort();
        tracing::debug!(epoch, count = decoded_paths.len(), "wrote samples");
        Ok(decoded_paths)
    }
}

#[derive(Default)]
struct LossTotals {
    loss: f64,
    reconstruction: f64,
    kl: f64,
    items: usize,
}

impl LossTotals {
    fn add(&mut self, loss: f32, reconstruction: f32, kl: f32, batch_size: usize) {
        let n = batch_size as f64;
        self.loss += f64::from(loss) * n;
        self.reconstruction += f64::from(reconstruction) * n;
        self.kl += f64::from(kl) * n;
        self.items += batch_size;
    }

    fn averages(&self, prefix: &str) -> Metrics {
        let n = self.items.max(1) as f64;
        Metrics::new()
            .with(format!("{prefix}loss"), self.loss / n)
            .with(format!("{prefix}reconstruction_loss"), self.reconstruction / n)
            .with(format!("{prefix}kl_loss"), self.kl / n)
    }
}
