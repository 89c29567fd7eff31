//! The Sketch-RNN VAE: encoder and decoder with separate parameter maps.
//!
//! Encoder and decoder parameters live in two [`VarMap`]s so that each
//! sub-network gets its own optimizer, its own gradient clipping and its own
//! checkpoint file.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::ModelConfig;
use crate::decoder::DecoderRnn;
use crate::encoder::EncoderRnn;
use crate::error::{SketchError, SketchResult};

/// Encoder/decoder pair.
pub struct SketchRnn {
    encoder: EncoderRnn,
    decoder: DecoderRnn,
    encoder_vars: VarMap,
    decoder_vars: VarMap,
    config: ModelConfig,
    device: Device,
    training: bool,
}

impl SketchRnn {
    /// Create a model whose parameters are drawn deterministically from `seed`.
    pub fn new(config: &ModelConfig, device: &Device, seed: u64) -> SketchResult<Self> {
        let encoder_vars = VarMap::new();
        let decoder_vars = VarMap::new();

        let enc_vb = VarBuilder::from_varmap(&encoder_vars, DType::F32, device);
        let dec_vb = VarBuilder::from_varmap(&decoder_vars, DType::F32, device);

        let encoder = EncoderRnn::new(config.d_z, config.enc_hidden_size, enc_vb.pp("encoder"))?;
        let decoder = DecoderRnn::new(
            config.d_z,
            config.dec_hidden_size,
            config.n_distributions,
            dec_vb.pp("decoder"),
        )?;

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        init_parameters(&encoder_vars, &mut rng)?;
        init_parameters(&decoder_vars, &mut rng)?;

        tracing::debug!(
            encoder_params = count_parameters(&encoder_vars),
            decoder_params = count_parameters(&decoder_vars),
            "initialised sketch-rnn"
        );

        Ok(Self {
            encoder,
            decoder,
            encoder_vars,
            decoder_vars,
            config: config.clone(),
            device: device.clone(),
            training: true,
        })
    }

    /// Encoder network
    pub fn encoder(&self) -> &EncoderRnn {
        &self.encoder
    }

    /// Decoder network
    pub fn decoder(&self) -> &DecoderRnn {
        &self.decoder
    }

    /// Encoder parameters
    pub fn encoder_vars(&self) -> &VarMap {
        &self.encoder_vars
    }

    /// Decoder parameters
    pub fn decoder_vars(&self) -> &VarMap {
        &self.decoder_vars
    }

    /// Model dimensions
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Device the parameters live on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Switch both sub-networks between training and evaluation mode.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Whether the model is in training mode
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Total number of scalar parameters in both sub-networks
    pub fn parameter_count(&self) -> usize {
        count_parameters(&self.encoder_vars) + count_parameters(&self.decoder_vars)
    }

    /// Write encoder and decoder parameters to two safetensors files.
    pub fn save(&self, encoder_path: &Path, decoder_path: &Path) -> SketchResult<()> {
        self.encoder_vars.save(encoder_path)?;
        self.decoder_vars.save(decoder_path)?;
        Ok(())
    }

    /// Overwrite parameters in place from two safetensors files.
    ///
    /// Every parameter of the model must be present in the matching file.
    pub fn load(&mut self, encoder_path: &Path, decoder_path: &Path) -> SketchResult<()> {
        for path in [encoder_path, decoder_path] {
            if !path.exists() {
                return Err(SketchError::checkpoint(format!(
                    "missing weights file {}",
                    path.display()
                )));
            }
        }
        self.encoder_vars.load(encoder_path)?;
        self.decoder_vars.load(decoder_path)?;
        Ok(())
    }
}

fn count_parameters(vars: &VarMap) -> usize {
    vars.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Re-draw every parameter in `vars` from `U(-1/√fan_in, 1/√fan_in)`.
///
/// Names are visited in sorted order so the draw sequence does not depend on
/// hash-map iteration. A bias uses the fan-in of its sibling `weight`.
pub fn init_parameters<R: Rng + ?Sized>(vars: &VarMap, rng: &mut R) -> SketchResult<()> {
    let data = vars
        .data()
        .lock()
        .map_err(|e| SketchError::training(format!("parameter map lock poisoned: {e}")))?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();

        let fan_in = match dims.as_slice() {
            [_, cols] => *cols,
            [len] => name
                .strip_suffix("bias")
                .and_then(|prefix| data.get(&format!("{prefix}weight")))
                .and_then(|w| w.dims().get(1).copied())
                .unwrap_or(*len),
            other => other.iter().skip(1).product::<usize>().max(1),
        };

        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        let values: Vec<f32> = (0..var.elem_count())
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        var.set(&Tensor::from_vec(values, dims.as_slice(), var.device())?)?;
    }

    Ok(())
}
