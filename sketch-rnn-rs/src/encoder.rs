//! Bidirectional LSTM encoder producing the latent code `z`.

use candle_core::{Device, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{SketchError, SketchResult};
use crate::lstm::{BidirLstm, LstmState};

/// Width of a stroke-5 step.
pub const STROKE_FEATURES: usize = 5;

/// Latent sample and the parameters it was drawn from.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `z = mu + exp(sigma_hat / 2) * eps`, `[batch, d_z]`
    pub z: Tensor,
    /// Posterior mean, `[batch, d_z]`
    pub mu: Tensor,
    /// Posterior log-variance, `[batch, d_z]`
    pub sigma_hat: Tensor,
}

/// Encoder network.
#[derive(Debug, Clone)]
pub struct EncoderRnn {
    lstm: BidirLstm,
    mu_head: Linear,
    sigma_head: Linear,
    d_z: usize,
}

impl EncoderRnn {
    /// Build the encoder under `vb`.
    pub fn new(d_z: usize, enc_hidden_size: usize, vb: VarBuilder) -> SketchResult<Self> {
        let lstm = BidirLstm::new(STROKE_FEATURES, enc_hidden_size, vb.pp("lstm"))?;
        let mu_head = linear(2 * enc_hidden_size, d_z, vb.pp("mu_head"))?;
        let sigma_head = linear(2 * enc_hidden_size, d_z, vb.pp("sigma_head"))?;
        Ok(Self {
            lstm,
            mu_head,
            sigma_head,
            d_z,
        })
    }

    /// Latent dimension
    pub fn d_z(&self) -> usize {
        self.d_z
    }

    /// Encode a padded batch `[T, B, 5]` with noise `eps` (`[B, d_z]`).
    ///
    /// The whole padded sequence is read; padding rows are ordinary input.
    pub fn forward(&self, inputs: &Tensor, eps: &Tensor) -> SketchResult<EncoderOutput> {
        let (_, batch, features) = inputs.dims3()?;
        if features != STROKE_FEATURES {
            return Err(SketchError::shape_mismatch(
                format!("[T, B, {STROKE_FEATURES}]"),
                format!("{:?}", inputs.dims()),
            ));
        }
        if eps.dims() != [batch, self.d_z].as_slice() {
            return Err(SketchError::shape_mismatch(
                format!("[{batch}, {}]", self.d_z),
                format!("{:?}", eps.dims()),
            ));
        }

        let hidden = self.lstm.hidden_size();
        let zeros = LstmState::zeros(batch, hidden, inputs.device())?;
        let (_, state) = self.lstm.forward(inputs, zeros.clone(), zeros)?;

        // [2, B, H] -> [B, 2H], forward half first
        let h = Tensor::cat(&[state.h.get(0)?, state.h.get(1)?], D::Minus1)?;

        let mu = self.mu_head.forward(&h)?;
        let sigma_hat = self.sigma_head.forward(&h)?;
        let sigma = sigma_hat.affine(0.5, 0.0)?.exp()?;
        let z = (&mu + (sigma * eps)?)?;

        Ok(EncoderOutput { z, mu, sigma_hat })
    }
}

/// Standard-normal tensor drawn from `rng`.
pub fn standard_normal<R: Rng + ?Sized>(
    rng: &mut R,
    shape: (usize, usize),
    device: &Device,
) -> SketchResult<Tensor> {
    let values: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn encoder(device: &Device) -> (VarMap, EncoderRnn) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let enc = EncoderRnn::new(4, 6, vb).unwrap();
        (varmap, enc)
    }

    #[test]
    fn test_encoder_shapes() {
        let device = Device::Cpu;
        let (_vm, enc) = encoder(&device);
        let x = Tensor::randn(0.0f32, 1.0, (9, 3, 5), &device).unwrap();
        let eps = Tensor::zeros((3, 4), DType::F32, &device).unwrap();

        let out = enc.forward(&x, &eps).unwrap();
        assert_eq!(out.z.dims(), &[3, 4]);
        assert_eq!(out.mu.dims(), &[3, 4]);
        assert_eq!(out.sigma_hat.dims(), &[3, 4]);

        // zero noise gives z == mu
        let z: Vec<f32> = out.z.flatten_all().unwrap().to_vec1().unwrap();
        let mu: Vec<f32> = out.mu.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(z, mu);
    }

    #[test]
    fn test_fresh_noise_changes_z() {
        let device = Device::Cpu;
        let (_vm, enc) = encoder(&device);
        let x = Tensor::randn(0.0f32, 1.0, (4, 2, 5), &device).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        let a = enc
            .forward(&x, &standard_normal(&mut rng, (2, 4), &device).unwrap())
            .unwrap();
        let b = enc
            .forward(&x, &standard_normal(&mut rng, (2, 4), &device).unwrap())
            .unwrap();

        let za: Vec<f32> = a.z.flatten_all().unwrap().to_vec1().unwrap();
        let zb: Vec<f32> = b.z.flatten_all().unwrap().to_vec1().unwrap();
        assert_ne!(za, zb);
    }

    #[test]
    fn test_standard_normal_is_seeded() {
        let device = Device::Cpu;
        let a = standard_normal(&mut ChaCha8Rng::seed_from_u64(5), (3, 2), &device).unwrap();
        let b = standard_normal(&mut ChaCha8Rng::seed_from_u64(5), (3, 2), &device).unwrap();
        assert_eq!(a.dims(), &[3, 2]);
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_encoder_rejects_wrong_width() {
        let device = Device::Cpu;
        let (_vm, enc) = encoder(&device);
        let x = Tensor::zeros((4, 2, 3), DType::F32, &device).unwrap();
        let eps = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            enc.forward(&x, &eps),
            Err(SketchError::ShapeMismatch { .. })
        ));
    }
}
