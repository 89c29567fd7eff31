//! Per-epoch schedules: exponential learning-rate decay and KL annealing.

use crate::config::TrainingConfig;

/// Multiplicative learning-rate decay with a floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrDecay {
    /// Per-epoch factor
    pub decay: f64,
    /// No decay is applied once the rate is at or below this value
    pub min_lr: f64,
}

impl LrDecay {
    /// Decay from the training configuration, or `None` when disabled.
    pub fn from_config(config: &TrainingConfig) -> Option<Self> {
        config.use_lr_decay.then_some(Self {
            decay: config.lr_decay,
            min_lr: config.min_lr,
        })
    }

    /// Learning rate for the next epoch.
    pub fn next(&self, lr: f64) -> f64 {
        if lr > self.min_lr {
            lr * self.decay
        } else {
            lr
        }
    }
}

/// KL weight annealing: `eta = 1 - (1 - eta_min) · R^epoch`.
///
/// Starts at `eta_min` and rises towards 1. When disabled the weight is a
/// constant 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlWeightSchedule {
    enabled: bool,
    eta_min: f64,
    rate: f64,
}

impl KlWeightSchedule {
    /// Schedule from the training configuration
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            enabled: config.use_eta,
            eta_min: config.eta_min,
            rate: config.eta_r,
        }
    }

    /// Constant weight of 1
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            eta_min: 1.0,
            rate: 1.0,
        }
    }

    /// Whether annealing is active
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// KL multiplier for `epoch`
    pub fn eta(&self, epoch: usize) -> f64 {
        if !self.enabled {
            return 1.0;
        }
        let exponent = i32::try_from(epoch).unwrap_or(i32::MAX);
        1.0 - (1.0 - self.eta_min) * self.rate.powi(exponent)
    }
}
