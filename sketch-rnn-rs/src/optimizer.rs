//! Adam optimizer wrapper and global-norm gradient clipping.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::error::{SketchError, SketchResult};

/// Adam (AdamW with zero weight decay) over one parameter map.
pub struct AdamOptimizer {
    inner: candle_nn::AdamW,
    vars: Vec<Var>,
}

impl AdamOptimizer {
    /// Build an optimizer over every variable in `vars`.
    pub fn new(vars: &VarMap, learning_rate: f64) -> SketchResult<Self> {
        let vars = vars.all_vars();
        let params = ParamsAdamW {
            lr: learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        };

        let inner = candle_nn::AdamW::new(vars.clone(), params)
            .map_err(|e| SketchError::training(format!("failed to create Adam: {e}")))?;

        Ok(Self { inner, vars })
    }

    /// Variables updated by this optimizer
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Clip this optimizer's gradients in `grads` to `max_norm`, then apply one
    /// update. Returns the pre-clipping gradient norm.
    pub fn clip_and_step(&mut self, grads: &mut GradStore, max_norm: f64) -> SketchResult<f64> {
        let norm = clip_grad_norm(grads, &self.vars, max_norm)?;
        self.step(grads)?;
        Ok(norm)
    }

    /// Apply one update from `grads`.
    pub fn step(&mut self, grads: &GradStore) -> SketchResult<()> {
        self.inner
            .step(grads)
            .map_err(|e| SketchError::training(format!("optimizer step failed: {e}")))
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set the learning rate (used by the decay schedule)
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}

/// L2 norm over the gradients of `vars` that are present in `grads`.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> SketchResult<f64> {
    let mut norm_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            norm_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(norm_sq.sqrt())
}

/// Rescale the gradients of `vars` so their global norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> SketchResult<f64> {
    let total = grad_norm(grads, vars)?;
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.get(var) {
                let scaled = (grad * coef)?;
                grads.insert(var, scaled);
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn setup() -> (VarMap, Tensor) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb
            .get_with_hints((2,), "w", Init::Const(1.0))
            .unwrap();
        (varmap, w)
    }

    #[test]
    fn test_clip_rescales_large_gradients() {
        let (varmap, w) = setup();
        // d/dw sum(3w) = 3 per element, norm = 3 * sqrt(2)
        let loss = (w * 3.0).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = varmap.all_vars();

        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((before - 3.0 * 2f64.sqrt()).abs() < 1e-5);

        let after = grad_norm(&grads, &vars).unwrap();
        assert!((after - 1.0).abs() < 1e-4, "{after}");
    }

    #[test]
    fn test_clip_keeps_small_gradients() {
        let (varmap, w) = setup();
        let loss = (w * 0.1).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = varmap.all_vars();

        clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        let g: Vec<f32> = grads.get(&vars[0]).unwrap().to_vec1().unwrap();
        assert!(g.iter().all(|v| (v - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_adam_step_moves_against_gradient() {
        let (varmap, w) = setup();
        let mut opt = AdamOptimizer::new(&varmap, 0.1).unwrap();
        assert_eq!(opt.learning_rate(), 0.1);

        let loss = w.sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        opt.clip_and_step(&mut grads, 1.0).unwrap();

        let values: Vec<f32> = opt.vars()[0].to_vec1().unwrap();
        // first Adam step moves every coordinate by ~lr
        assert!(values.iter().all(|v| (v - 0.9).abs() < 1e-3), "{values:?}");

        opt.set_learning_rate(0.05);
        assert_eq!(opt.learning_rate(), 0.05);
    }
}
