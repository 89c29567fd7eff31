//! Autoregressive sketch generation.

use candle_core::{Tensor, D};
use rand::Rng;

use crate::data::START_TOKEN;
use crate::encoder::{standard_normal, STROKE_FEATURES};
use crate::error::{SketchError, SketchResult};
use crate::lstm::LstmState;
use crate::mixture::Categorical;
use crate::model::SketchRnn;

/// Draws sketches from a trained model.
pub struct Sampler<'a> {
    model: &'a SketchRnn,
}

impl<'a> Sampler<'a> {
    /// Sampler over `model`
    pub fn new(model: &'a SketchRnn) -> Self {
        Self { model }
    }

    /// Encode `data` (`[T, 1, 5]`) and decode a new sketch from its `z`.
    ///
    /// Decoding starts from the start token and feeds every sampled stroke back
    /// in. It stops after a sampled end state or `T` steps. The returned
    /// stroke-5 rows exclude the start token and include the final end row if
    /// one was drawn.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        data: &Tensor,
        temperature: f64,
        rng: &mut R,
    ) -> SketchResult<Vec<[f32; 5]>> {
        let (seq_len, batch, features) = data.dims3()?;
        if batch != 1 || features != STROKE_FEATURES {
            return Err(SketchError::shape_mismatch(
                "[T, 1, 5]",
                format!("{:?}", data.dims()),
            ));
        }
        if temperature <= 0.0 {
            return Err(SketchError::invalid_config("temperature must be > 0"));
        }

        let device = self.model.device();
        let d_z = self.model.config().d_z;

        let eps = standard_normal(rng, (1, d_z), device)?;
        let z = self.model.encoder().forward(data, &eps)?.z;
        let z_step = z.unsqueeze(0)?;

        let mut stroke = START_TOKEN;
        let mut state: Option<LstmState> = None;
        let mut strokes = Vec::new();

        for _ in 0..seq_len {
            let s = Tensor::new(&[[stroke]], device)?;
            let input = Tensor::cat(&[&s, &z_step], D::Minus1)?;
            let out = self.model.decoder().forward(&input, &z, state.take())?;
            state = Some(out.state);

            stroke = sample_step(&out.mixture, &out.q_log_probs, temperature, rng)?;
            strokes.push(stroke);
            if stroke[4] == 1.0 {
                break;
            }
        }

        tracing::debug!(steps = strokes.len(), temperature, "sampled sketch");
        Ok(strokes)
    }
}

/// Draw one stroke-5 row from single-step decoder emissions.
fn sample_step<R: Rng + ?Sized>(
    mixture: &crate::mixture::BivariateGaussianMixture,
    q_log_probs: &Tensor,
    temperature: f64,
    rng: &mut R,
) -> SketchResult<[f32; 5]> {
    let (pi, normal) = mixture.with_temperature(temperature)?.get_distribution()?;
    let component = pi.sample(rng)?;
    let pen = Categorical::new((q_log_probs / temperature)?).sample(rng)?;
    let (dx, dy) = normal.sample(component, rng)?;

    let mut stroke = [dx, dy, 0.0, 0.0, 0.0];
    stroke[2 + pen] = 1.0;
    Ok(stroke)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use candle_core::{DType, Device};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model() -> SketchRnn {
        let config = ModelConfig {
            enc_hidden_size: 4,
            dec_hidden_size: 8,
            d_z: 3,
            n_distributions: 2,
        };
        SketchRnn::new(&config, &Device::Cpu, 3).unwrap()
    }

    fn sketch(seq_len: usize) -> Tensor {
        Tensor::randn(0.0f32, 1.0, (seq_len, 1, 5), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_sample_is_bounded_and_one_hot() {
        let model = model();
        let sampler = Sampler::new(&model);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let strokes = sampler.sample(&sketch(12), 0.4, &mut rng).unwrap();
        assert!(!strokes.is_empty() && strokes.len() <= 12);
        for s in &strokes {
            assert_eq!(s[2] + s[3] + s[4], 1.0);
            assert!(s[0].is_finite() && s[1].is_finite());
        }
        // only the last row may be an end token
        for s in &strokes[..strokes.len() - 1] {
            assert_eq!(s[4], 0.0);
        }
    }

    #[test]
    fn test_sample_is_reproducible() {
        let model = model();
        let sampler = Sampler::new(&model);
        let data = sketch(8);

        let a = sampler
            .sample(&data, 0.4, &mut ChaCha8Rng::seed_from_u64(7))
            .unwrap();
        let b = sampler
            .sample(&data, 0.4, &mut ChaCha8Rng::seed_from_u64(7))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_rejects_batches() {
        let model = model();
        let sampler = Sampler::new(&model);
        let data = Tensor::zeros((5, 2, 5), DType::F32, &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            sampler.sample(&data, 0.4, &mut rng),
            Err(SketchError::ShapeMismatch { .. })
        ));
        assert!(sampler.sample(&sketch(4), 0.0, &mut rng).is_err());
    }
}
