//! One forward/backward/update cycle of the VAE.

use candle_core::{Tensor, D};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::TrainingConfig;
use crate::data::StrokeBatch;
use crate::encoder::standard_normal;
use crate::error::{SketchError, SketchResult};
use crate::loss::{kl_div_loss, reconstruction_loss};
use crate::model::SketchRnn;
use crate::optimizer::AdamOptimizer;

/// Scalar results of one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// `reconstruction_loss + kl_weight · kl_loss`
    pub loss: f32,
    /// Offset NLL plus pen cross-entropy
    pub reconstruction_loss: f32,
    /// KL term after eta scaling, before the KL weight
    pub kl_loss: f32,
    /// Sequences in the batch
    pub batch_size: usize,
}

/// Owns the model, both optimizers and the latent-noise generator.
pub struct TrainingStep {
    model: SketchRnn,
    encoder_optimizer: AdamOptimizer,
    decoder_optimizer: AdamOptimizer,
    noise_rng: ChaCha8Rng,
    kl_weight: f64,
    grad_clip: f64,
    eta: f64,
}

impl TrainingStep {
    /// Wrap `model` with fresh Adam optimizers. Latent noise is drawn from a
    /// generator seeded with `seed`.
    pub fn new(model: SketchRnn, config: &TrainingConfig, seed: u64) -> SketchResult<Self> {
        let encoder_optimizer = AdamOptimizer::new(model.encoder_vars(), config.learning_rate)?;
        let decoder_optimizer = AdamOptimizer::new(model.decoder_vars(), config.learning_rate)?;

        Ok(Self {
            model,
            encoder_optimizer,
            decoder_optimizer,
            noise_rng: ChaCha8Rng::seed_from_u64(seed),
            kl_weight: config.kl_div_loss_weight,
            grad_clip: config.grad_clip,
            eta: 1.0,
        })
    }

    /// The model being trained
    pub fn model(&self) -> &SketchRnn {
        &self.model
    }

    /// Mutable access to the model (checkpoint restore)
    pub fn model_mut(&mut self) -> &mut SketchRnn {
        &mut self.model
    }

    /// KL multiplier applied before the KL weight
    pub fn eta(&self) -> f64 {
        self.eta
    }

    /// Set the KL multiplier for subsequent steps
    pub fn set_eta(&mut self, eta: f64) {
        self.eta = eta;
    }

    /// Shared learning rate of both optimizers
    pub fn learning_rate(&self) -> f64 {
        self.encoder_optimizer.learning_rate()
    }

    /// Set the learning rate of both optimizers
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.encoder_optimizer.set_learning_rate(lr);
        self.decoder_optimizer.set_learning_rate(lr);
    }

    /// Run one step on `batch`.
    ///
    /// The decoder is teacher-forced on `data[..T-1]` (each step concatenated
    /// with `z`) and scored against `data[1..]` under `mask[1..]`. Gradients are
    /// computed and applied only when `is_training` is set.
    pub fn step(&mut self, batch: &StrokeBatch, is_training: bool) -> SketchResult<StepOutput> {
        self.model.set_training(is_training);

        let (seq_len, batch_size, _) = batch.data.dims3()?;
        if seq_len < 2 {
            return Err(SketchError::shape_mismatch(
                "seq_len >= 2",
                seq_len.to_string(),
            ));
        }
        let d_z = self.model.config().d_z;
        let device = self.model.device().clone();

        let eps = standard_normal(&mut self.noise_rng, (batch_size, d_z), &device)?;
        let encoded = self.model.encoder().forward(&batch.data, &eps)?;

        let z_steps = encoded
            .z
            .unsqueeze(0)?
            .broadcast_as((seq_len - 1, batch_size, d_z))?
            .contiguous()?;
        let inputs = Tensor::cat(&[&batch.data.narrow(0, 0, seq_len - 1)?, &z_steps], D::Minus1)?;
        let decoded = self.model.decoder().forward(&inputs, &encoded.z, None)?;

        let kl = kl_div_loss(&encoded.sigma_hat, &encoded.mu)?.affine(self.eta, 0.0)?;
        let reconstruction = reconstruction_loss(
            &batch.mask.narrow(0, 1, seq_len - 1)?,
            &batch.data.narrow(0, 1, seq_len - 1)?,
            &decoded.mixture,
            &decoded.q_log_probs,
        )?;
        let loss = (&reconstruction + kl.affine(self.kl_weight, 0.0)?)?;

        if is_training {
            let mut grads = loss.backward()?;
            let encoder_norm = self
                .encoder_optimizer
                .clip_and_step(&mut grads, self.grad_clip)?;
            let decoder_norm = self
                .decoder_optimizer
                .clip_and_step(&mut grads, self.grad_clip)?;
            tracing::trace!(encoder_norm, decoder_norm, "applied gradients");
        }

        Ok(StepOutput {
            loss: loss.to_scalar()?,
            reconstruction_loss: reconstruction.to_scalar()?,
            kl_loss: kl.to_scalar()?,
            batch_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SketchRnnConfig;
    use candle_core::{DType, Device};

    fn zero_batch(seq_len: usize, batch: usize) -> StrokeBatch {
        let device = Device::Cpu;
        let mut rows = Vec::new();
        for t in 0..seq_len {
            for _ in 0..batch {
                let row = if t == 0 {
                    [0.0f32, 0.0, 1.0, 0.0, 0.0]
                } else {
                    [0.0f32, 0.0, 0.0, 0.0, 1.0]
                };
                rows.extend_from_slice(&row);
            }
        }
        let data = Tensor::from_vec(rows, (seq_len, batch, 5), &device).unwrap();
        let mask = Tensor::ones((seq_len, batch), DType::F32, &device).unwrap();
        StrokeBatch::new(data, mask).unwrap()
    }

    fn step_for(config: &SketchRnnConfig) -> TrainingStep {
        let model = SketchRnn::new(&config.model, &Device::Cpu, config.seed).unwrap();
        TrainingStep::new(model, &config.training, config.seed).unwrap()
    }

    #[test]
    fn test_step_reports_batch_size() {
        let config = SketchRnnConfig::test();
        let mut step = step_for(&config);
        let out = step.step(&zero_batch(6, 3), false).unwrap();
        assert_eq!(out.batch_size, 3);
        assert!(out.loss.is_finite());
        assert!(out.kl_loss > -1e-6);
        let expected = out.reconstruction_loss + 0.5 * out.kl_loss;
        assert!((out.loss - expected).abs() < 1e-4);
    }

    #[test]
    fn test_eval_step_leaves_weights_untouched() {
        let config = SketchRnnConfig::test();
        let mut step = step_for(&config);
        let before: Vec<f32> = step.model().decoder_vars().all_vars()[0]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        step.step(&zero_batch(5, 2), false).unwrap();

        let after: Vec<f32> = step.model().decoder_vars().all_vars()[0]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(before, after);
        assert!(!step.model().is_training());
    }

    #[test]
    fn test_eta_scales_kl() {
        let config = SketchRnnConfig::test();
        let batch = zero_batch(5, 2);

        let full = step_for(&config).step(&batch, false).unwrap();
        let mut scaled = step_for(&config);
        scaled.set_eta(0.25);
        let scaled = scaled.step(&batch, false).unwrap();

        assert!((scaled.kl_loss - 0.25 * full.kl_loss).abs() < 1e-6);
        assert_eq!(scaled.reconstruction_loss, full.reconstruction_loss);
    }

    #[test]
    fn test_training_reduces_loss_on_fixed_batch() {
        let mut config = SketchRnnConfig::test();
        config.training.learning_rate = 1e-2;
        let mut step = step_for(&config);
        let batch = zero_batch(6, 2);

        let first = step.step(&batch, true).unwrap();
        assert!(step.model().is_training());
        let mut last = first;
        for _ in 0..30 {
            last = step.step(&batch, true).unwrap();
        }
        assert!(
            last.reconstruction_loss < first.reconstruction_loss,
            "{} !< {}",
            last.reconstruction_loss,
            first.reconstruction_loss
        );
    }

    #[test]
    fn test_learning_rate_applies_to_both_optimizers() {
        let config = SketchRnnConfig::test();
        let mut step = step_for(&config);
        assert_eq!(step.learning_rate(), 1e-3);
        step.set_learning_rate(5e-4);
        assert_eq!(step.learning_rate(), 5e-4);
        assert_eq!(step.decoder_optimizer.learning_rate(), 5e-4);
    }

    #[test]
    fn test_single_step_sequence_is_rejected() {
        let config = SketchRnnConfig::test();
        let mut step = step_for(&config);
        assert!(step.step(&zero_batch(1, 2), false).is_err());
    }
}
