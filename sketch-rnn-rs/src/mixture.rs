//! Bivariate Gaussian mixture over stroke offsets.
//!
//! A mixture is an immutable bundle of per-component parameter tensors, all of
//! shape `[..., M]`. Temperature scaling returns a new value. Clamping for
//! numerical safety happens in [`BivariateGaussianMixture::get_distribution`],
//! which is what both the loss and the sampler evaluate.

use std::f64::consts::PI;

use candle_core::{Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{SketchError, SketchResult};

/// Lower bound applied to standard deviations.
pub const SIGMA_FLOOR: f32 = 1e-5;

/// Distance kept between the correlation and ±1.
pub const RHO_MARGIN: f32 = 1e-5;

/// Raw mixture parameters as produced by the decoder.
#[derive(Debug, Clone)]
pub struct BivariateGaussianMixture {
    pi_logits: Tensor,
    mu_x: Tensor,
    mu_y: Tensor,
    sigma_x: Tensor,
    sigma_y: Tensor,
    rho_xy: Tensor,
}

impl BivariateGaussianMixture {
    /// Bundle the six parameter tensors; all must share one shape.
    pub fn new(
        pi_logits: Tensor,
        mu_x: Tensor,
        mu_y: Tensor,
        sigma_x: Tensor,
        sigma_y: Tensor,
        rho_xy: Tensor,
    ) -> SketchResult<Self> {
        let shape = pi_logits.dims().to_vec();
        for t in [&mu_x, &mu_y, &sigma_x, &sigma_y, &rho_xy] {
            if t.dims() != shape.as_slice() {
                return Err(SketchError::shape_mismatch(
                    format!("{shape:?}"),
                    format!("{:?}", t.dims()),
                ));
            }
        }

        Ok(Self {
            pi_logits,
            mu_x,
            mu_y,
            sigma_x,
            sigma_y,
            rho_xy,
        })
    }

    /// Number of mixture components (last axis)
    pub fn n_distributions(&self) -> SketchResult<usize> {
        Ok(self.pi_logits.dim(D::Minus1)?)
    }

    /// Unnormalised component weights
    pub fn pi_logits(&self) -> &Tensor {
        &self.pi_logits
    }

    /// Component means along x
    pub fn mu_x(&self) -> &Tensor {
        &self.mu_x
    }

    /// Component means along y
    pub fn mu_y(&self) -> &Tensor {
        &self.mu_y
    }

    /// Component standard deviations along x
    pub fn sigma_x(&self) -> &Tensor {
        &self.sigma_x
    }

    /// Component standard deviations along y
    pub fn sigma_y(&self) -> &Tensor {
        &self.sigma_y
    }

    /// Component correlations
    pub fn rho_xy(&self) -> &Tensor {
        &self.rho_xy
    }

    /// Mixture sharpened (`τ < 1`) or flattened (`τ > 1`) for sampling.
    ///
    /// Logits are divided by `τ`, standard deviations multiplied by `√τ`.
    pub fn with_temperature(&self, temperature: f64) -> SketchResult<Self> {
        let scale = temperature.sqrt();
        Ok(Self {
            pi_logits: (&self.pi_logits / temperature)?,
            mu_x: self.mu_x.clone(),
            mu_y: self.mu_y.clone(),
            sigma_x: (&self.sigma_x * scale)?,
            sigma_y: (&self.sigma_y * scale)?,
            rho_xy: self.rho_xy.clone(),
        })
    }

    /// Component selector and per-component bivariate normals.
    ///
    /// Standard deviations are floored at [`SIGMA_FLOOR`] and correlations
    /// clamped to `[-1 + RHO_MARGIN, 1 - RHO_MARGIN]`, so every covariance is
    /// positive-definite.
    pub fn get_distribution(&self) -> SketchResult<(Categorical, BivariateNormal)> {
        let sigma_x = self.sigma_x.maximum(SIGMA_FLOOR)?;
        let sigma_y = self.sigma_y.maximum(SIGMA_FLOOR)?;
        let rho = self.rho_xy.clamp(-1.0 + RHO_MARGIN, 1.0 - RHO_MARGIN)?;

        Ok((
            Categorical::new(self.pi_logits.clone()),
            BivariateNormal {
                mean_x: self.mu_x.clone(),
                mean_y: self.mu_y.clone(),
                sigma_x,
                sigma_y,
                rho,
            },
        ))
    }
}

/// Categorical distribution over the last axis of `logits`.
#[derive(Debug, Clone)]
pub struct Categorical {
    logits: Tensor,
}

impl Categorical {
    /// Wrap unnormalised logits
    pub fn new(logits: Tensor) -> Self {
        Self { logits }
    }

    /// Raw logits
    pub fn logits(&self) -> &Tensor {
        &self.logits
    }

    /// Softmax over the last axis
    pub fn probs(&self) -> SketchResult<Tensor> {
        Ok(candle_nn::ops::softmax(&self.logits, D::Minus1)?)
    }

    /// Draw one category. The logits must describe exactly one distribution.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SketchResult<usize> {
        let probs: Vec<f32> = self.probs()?.flatten_all()?.to_vec1()?;
        let n = self.logits.dim(D::Minus1)?;
        if probs.len() != n {
            return Err(SketchError::shape_mismatch(
                format!("[{n}] (single distribution)"),
                format!("{:?}", self.logits.dims()),
            ));
        }
        let index = WeightedIndex::new(&probs)
            .map_err(|e| SketchError::training(format!("invalid categorical weights: {e}")))?;
        Ok(index.sample(rng))
    }
}

/// Independent bivariate normals, one per mixture component.
#[derive(Debug, Clone)]
pub struct BivariateNormal {
    mean_x: Tensor,
    mean_y: Tensor,
    sigma_x: Tensor,
    sigma_y: Tensor,
    rho: Tensor,
}

impl BivariateNormal {
    /// Means along x
    pub fn mean_x(&self) -> &Tensor {
        &self.mean_x
    }

    /// Means along y
    pub fn mean_y(&self) -> &Tensor {
        &self.mean_y
    }

    /// Clamped standard deviations along x
    pub fn sigma_x(&self) -> &Tensor {
        &self.sigma_x
    }

    /// Clamped standard deviations along y
    pub fn sigma_y(&self) -> &Tensor {
        &self.sigma_y
    }

    /// Clamped correlations
    pub fn rho(&self) -> &Tensor {
        &self.rho
    }

    /// Covariance matrices `[..., M, 2, 2]`:
    /// `[[σx², ρσxσy], [ρσxσy, σy²]]`.
    pub fn covariance(&self) -> SketchResult<Tensor> {
        let var_x = self.sigma_x.sqr()?;
        let var_y = self.sigma_y.sqr()?;
        let cov_xy = ((&self.rho * &self.sigma_x)? * &self.sigma_y)?;

        let row_x = Tensor::stack(&[&var_x, &cov_xy], D::Minus1)?;
        let row_y = Tensor::stack(&[&cov_xy, &var_y], D::Minus1)?;
        let rows_dim = row_x.rank() - 1;
        Ok(Tensor::stack(&[row_x, row_y], rows_dim)?)
    }

    /// Covariance determinants `σx² σy² (1 - ρ²)`, shape `[..., M]`.
    pub fn determinant(&self) -> SketchResult<Tensor> {
        let one_minus_rho2 = self.rho.sqr()?.affine(-1.0, 1.0)?;
        Ok(((self.sigma_x.sqr()? * self.sigma_y.sqr()?)? * one_minus_rho2)?)
    }

    /// Log density of `(x, y)` under every component.
    ///
    /// `x` and `y` must broadcast against the component axis, typically
    /// `[..., 1]` against `[..., M]`.
    pub fn log_prob(&self, x: &Tensor, y: &Tensor) -> SketchResult<Tensor> {
        let dx = (x.broadcast_sub(&self.mean_x)? / &self.sigma_x)?;
        let dy = (y.broadcast_sub(&self.mean_y)? / &self.sigma_y)?;

        let z = ((dx.sqr()? + dy.sqr()?)? - ((dx * dy)? * &self.rho)?.affine(2.0, 0.0)?)?;
        let one_minus_rho2 = self.rho.sqr()?.affine(-1.0, 1.0)?;

        let exponent = (z / one_minus_rho2.affine(2.0, 0.0)?)?.neg()?;
        let log_norm = ((self.sigma_x.log()? + self.sigma_y.log()?)?
            + one_minus_rho2.log()?.affine(0.5, 0.0)?)?;

        Ok((exponent - log_norm)?.affine(1.0, -(2.0 * PI).ln())?)
    }

    /// Draw an offset from one component. Parameters must describe a single
    /// mixture (`M` elements in total).
    pub fn sample<R: Rng + ?Sized>(
        &self,
        component: usize,
        rng: &mut R,
    ) -> SketchResult<(f32, f32)> {
        let pick = |t: &Tensor| -> SketchResult<f32> {
            let vals: Vec<f32> = t.flatten_all()?.to_vec1()?;
            vals.get(component).copied().ok_or_else(|| {
                SketchError::shape_mismatch(
                    format!("component < {}", vals.len()),
                    component.to_string(),
                )
            })
        };

        let mean_x = pick(&self.mean_x)?;
        let mean_y = pick(&self.mean_y)?;
        let sigma_x = pick(&self.sigma_x)?;
        let sigma_y = pick(&self.sigma_y)?;
        let rho = pick(&self.rho)?;

        let e1: f32 = StandardNormal.sample(rng);
        let e2: f32 = StandardNormal.sample(rng);

        let x = mean_x + sigma_x * e1;
        let y = mean_y + sigma_y * (rho * e1 + (1.0 - rho * rho).sqrt() * e2);
        Ok((x, y))
    }
}
