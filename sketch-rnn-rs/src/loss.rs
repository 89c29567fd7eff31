//! Reconstruction and KL-divergence losses.
//!
//! Both return scalar tensors that stay on the autograd graph.

use candle_core::{Tensor, D};

use crate::error::{SketchError, SketchResult};
use crate::mixture::BivariateGaussianMixture;

/// Floor added to the mixture density before taking the log.
pub const DENSITY_FLOOR: f64 = 1e-5;

/// Negative log-likelihood of `target` under the decoder's emissions.
///
/// * `mask` - `[T, B]`, 1 on positions that contribute to the offset term
/// * `target` - `[T, B, 5]` stroke-5 targets
/// * `mixture` - offset mixture with parameters `[T, B, M]`
/// * `q_log_probs` - `[T, B, 3]` pen-state log-probabilities
///
/// The offset term averages over every `T × B` position, masked or not, so
/// padding dilutes it. The pen term is unmasked: the model also learns to keep
/// emitting the end state through the padding.
pub fn reconstruction_loss(
    mask: &Tensor,
    target: &Tensor,
    mixture: &BivariateGaussianMixture,
    q_log_probs: &Tensor,
) -> SketchResult<Tensor> {
    let (seq_len, batch, features) = target.dims3()?;
    if features != 5 {
        return Err(SketchError::shape_mismatch(
            "[T, B, 5]",
            format!("{:?}", target.dims()),
        ));
    }
    if mask.dims() != [seq_len, batch].as_slice() {
        return Err(SketchError::shape_mismatch(
            format!("[{seq_len}, {batch}]"),
            format!("{:?}", mask.dims()),
        ));
    }

    let (categorical, normal) = mixture.get_distribution()?;

    let dx = target.narrow(D::Minus1, 0, 1)?;
    let dy = target.narrow(D::Minus1, 1, 1)?;
    let component_density = normal.log_prob(&dx, &dy)?.exp()?;
    let density = (categorical.probs()? * component_density)?.sum(D::Minus1)?;

    let log_density = (density + DENSITY_FLOOR)?.log()?;
    let loss_stroke = (mask * log_density)?.mean_all()?.neg()?;

    let pen_target = target.narrow(D::Minus1, 2, 3)?;
    let loss_pen = (pen_target * q_log_probs)?
        .sum(D::Minus1)?
        .mean_all()?
        .neg()?;

    Ok((loss_stroke + loss_pen)?)
}

/// KL divergence from `N(mu, exp(sigma_hat))` to `N(0, 1)`, averaged over
/// every latent element: `-0.5 · mean(1 + σ̂ - μ² - exp σ̂)`.
pub fn kl_div_loss(sigma_hat: &Tensor, mu: &Tensor) -> SketchResult<Tensor> {
    let inner = ((sigma_hat.affine(1.0, 1.0)? - mu.sqr()?)? - sigma_hat.exp()?)?;
    Ok(inner.mean_all()?.affine(-0.5, 0.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn standard_mixture(seq_len: usize, device: &Device) -> BivariateGaussianMixture {
        let zeros = Tensor::zeros((seq_len, 1, 1), DType::F32, device).unwrap();
        let ones = Tensor::ones((seq_len, 1, 1), DType::F32, device).unwrap();
        BivariateGaussianMixture::new(
            zeros.clone(),
            zeros.clone(),
            zeros.clone(),
            ones.clone(),
            ones,
            zeros,
        )
        .unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_kl_zero_at_prior() {
        let device = Device::Cpu;
        let zeros = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let kl = kl_div_loss(&zeros, &zeros).unwrap();
        assert!(scalar(&kl).abs() < 1e-7);
    }

    #[test]
    fn test_kl_positive_away_from_prior() {
        let device = Device::Cpu;
        let mu = Tensor::new(&[[1.0f32, -2.0]], &device).unwrap();
        let sigma_hat = Tensor::new(&[[0.5f32, -0.5]], &device).unwrap();
        let kl = scalar(&kl_div_loss(&sigma_hat, &mu).unwrap());

        let expected = -0.5
            * ((1.0 + 0.5 - 1.0 - 0.5f32.exp()) + (1.0 - 0.5 - 4.0 - (-0.5f32).exp()))
            / 2.0;
        assert!((kl - expected).abs() < 1e-5);
        assert!(kl > 0.0);
    }

    #[test]
    fn test_single_component_reconstruction() {
        let device = Device::Cpu;
        let mixture = standard_mixture(1, &device);
        let target = Tensor::zeros((1, 1, 5), DType::F32, &device).unwrap();
        let mask = Tensor::ones((1, 1), DType::F32, &device).unwrap();
        let q = Tensor::zeros((1, 1, 3), DType::F32, &device).unwrap();

        let loss = scalar(&reconstruction_loss(&mask, &target, &mixture, &q).unwrap());
        let expected = -(1e-5 + 1.0 / (2.0 * std::f64::consts::PI)).ln() as f32;
        assert!((loss - expected).abs() < 1e-5, "{loss} vs {expected}");
    }

    #[test]
    fn test_padding_dilutes_offset_term() {
        let device = Device::Cpu;
        let q = Tensor::zeros((2, 1, 3), DType::F32, &device).unwrap();

        let one = reconstruction_loss(
            &Tensor::ones((1, 1), DType::F32, &device).unwrap(),
            &Tensor::zeros((1, 1, 5), DType::F32, &device).unwrap(),
            &standard_mixture(1, &device),
            &q.narrow(0, 0, 1).unwrap(),
        )
        .unwrap();

        let two = reconstruction_loss(
            &Tensor::new(&[[1.0f32], [0.0]], &device).unwrap(),
            &Tensor::zeros((2, 1, 5), DType::F32, &device).unwrap(),
            &standard_mixture(2, &device),
            &q,
        )
        .unwrap();

        let (one, two) = (scalar(&one), scalar(&two));
        assert!((two - one / 2.0).abs() < 1e-5, "{two} vs {one}");
    }

    #[test]
    fn test_pen_term_is_unmasked() {
        let device = Device::Cpu;
        let mixture = standard_mixture(2, &device);
        // pen target "end" everywhere, uniform pen prediction
        let target = Tensor::new(
            &[[[0.0f32, 0.0, 0.0, 0.0, 1.0]], [[0.0, 0.0, 0.0, 0.0, 1.0]]],
            &device,
        )
        .unwrap();
        let q = Tensor::full((1.0f32 / 3.0).ln(), (2, 1, 3), &device).unwrap();
        let mask = Tensor::zeros((2, 1), DType::F32, &device).unwrap();

        let loss = scalar(&reconstruction_loss(&mask, &target, &mixture, &q).unwrap());
        assert!((loss - 3.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_reconstruction_rejects_bad_mask() {
        let device = Device::Cpu;
        let mixture = standard_mixture(2, &device);
        let target = Tensor::zeros((2, 1, 5), DType::F32, &device).unwrap();
        let q = Tensor::zeros((2, 1, 3), DType::F32, &device).unwrap();
        let mask = Tensor::ones((3, 1), DType::F32, &device).unwrap();
        assert!(reconstruction_loss(&mask, &target, &mixture, &q).is_err());
    }
}
