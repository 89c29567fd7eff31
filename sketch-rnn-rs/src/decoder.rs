//! Autoregressive mixture-density decoder.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::encoder::STROKE_FEATURES;
use crate::error::{SketchError, SketchResult};
use crate::lstm::{Direction, LstmLayer, LstmState};
use crate::mixture::BivariateGaussianMixture;

/// Per-step emission parameters and the state after the last step.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Offset mixture, parameters `[T, B, M]`
    pub mixture: BivariateGaussianMixture,
    /// Pen-state log-probabilities `[T, B, 3]`
    pub q_log_probs: Tensor,
    /// Recurrent state after the final step
    pub state: LstmState,
}

/// Decoder network.
#[derive(Debug, Clone)]
pub struct DecoderRnn {
    init_state: Linear,
    lstm: LstmLayer,
    mixtures: Linear,
    q_head: Linear,
    d_z: usize,
    n_distributions: usize,
}

impl DecoderRnn {
    /// Build the decoder under `vb`.
    pub fn new(
        d_z: usize,
        dec_hidden_size: usize,
        n_distributions: usize,
        vb: VarBuilder,
    ) -> SketchResult<Self> {
        let init_state = linear(d_z, 2 * dec_hidden_size, vb.pp("init_state"))?;
        let lstm = LstmLayer::new(
            d_z + STROKE_FEATURES,
            dec_hidden_size,
            Direction::Forward,
            vb.pp("lstm"),
        )?;
        let mixtures = linear(dec_hidden_size, 6 * n_distributions, vb.pp("mixtures"))?;
        let q_head = linear(dec_hidden_size, 3, vb.pp("q_head"))?;

        Ok(Self {
            init_state,
            lstm,
            mixtures,
            q_head,
            d_z,
            n_distributions,
        })
    }

    /// Number of mixture components
    pub fn n_distributions(&self) -> usize {
        self.n_distributions
    }

    /// Initial `(h, c)` derived from `z`: `split(tanh(W z + b), 2)`.
    pub fn initial_state(&self, z: &Tensor) -> SketchResult<LstmState> {
        let hc = self.init_state.forward(z)?.tanh()?;
        let hc = hc.chunk(2, D::Minus1)?;
        Ok(LstmState::new(hc[0].clone(), hc[1].clone()))
    }

    /// Decode `inputs` (`[T, B, 5 + d_z]`).
    ///
    /// When `state` is `None` the initial state is derived from `z`; sampling
    /// passes the previous step's state back in with `T = 1`.
    pub fn forward(
        &self,
        inputs: &Tensor,
        z: &Tensor,
        state: Option<LstmState>,
    ) -> SketchResult<DecoderOutput> {
        let (_, _, features) = inputs.dims3()?;
        if features != STROKE_FEATURES + self.d_z {
            return Err(SketchError::shape_mismatch(
                format!("[T, B, {}]", STROKE_FEATURES + self.d_z),
                format!("{:?}", inputs.dims()),
            ));
        }

        let state = match state {
            Some(state) => state,
            None => self.initial_state(z)?,
        };
        let (outputs, state) = self.lstm.forward(inputs, state)?;

        let q_log_probs = candle_nn::ops::log_softmax(&self.q_head.forward(&outputs)?, D::Minus1)?;

        let params = self.mixtures.forward(&outputs)?.chunk(6, D::Minus1)?;
        let mixture = BivariateGaussianMixture::new(
            params[0].clone(),
            params[1].clone(),
            params[2].clone(),
            params[3].exp()?,
            params[4].exp()?,
            params[5].tanh()?,
        )?;

        Ok(DecoderOutput {
            mixture,
            q_log_probs,
            state,
        })
    }
}
