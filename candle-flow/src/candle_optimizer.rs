use crate::config::{OptimizerKind, TrainConfig};

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::{Optimizer, VarMap};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
    /// rectified Adam (Liu et al., 2020)
    pub rectified: bool,
}

struct VarAdam {
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

///
/// Adam with moment estimates kept in a `VarMap` (`{var}.m`,
/// `{var}.v`) so they can be checkpointed next to the parameters.
///
/// The rectified variant falls back to momentum SGD while the variance
/// of the adaptive rate is intractable (ρ_t ≤ 5).
///
pub struct Adam {
    vars: Vec<VarAdam>,
    moments: VarMap,
    step_t: usize,
    params: ParamsAdam,
}

impl Adam {
    /// * `vars` - parameters with stable names, e.g. from a `VarMap`
    pub fn from_named(vars: Vec<(String, Var)>, params: ParamsAdam) -> Result<Self> {
        let moments = VarMap::new();
        let mut adam_vars = Vec::with_capacity(vars.len());
        {
            let mut data = moments
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("moment map lock poisoned".into()))?;
            for (name, var) in vars.into_iter().filter(|(_, v)| v.dtype().is_float()) {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                data.insert(format!("{}.m", name), first_moment.clone());
                data.insert(format!("{}.v", name), second_moment.clone());
                adam_vars.push(VarAdam {
                    var,
                    first_moment,
                    second_moment,
                });
            }
        }
        Ok(Self {
            vars: adam_vars,
            moments,
            step_t: 0,
            params,
        })
    }

    /// first and second moments; loading into them restores the optimizer
    pub fn moments(&self) -> &VarMap {
        &self.moments
    }

    pub fn step_t(&self) -> usize {
        self.step_t
    }

    pub fn set_step_t(&mut self, step_t: usize) {
        self.step_t = step_t;
    }

    /// rectification factor of step `t`; `None` while ρ_t ≤ 5
    fn rectification(&self, t: f64) -> Option<f64> {
        if !self.params.rectified {
            return Some(1.0);
        }
        let beta2 = self.params.beta2;
        let rho_inf = 2.0 / (1.0 - beta2) - 1.0;
        let rho_t = rho_inf - 2.0 * t * beta2.powf(t) / (1.0 - beta2.powf(t));
        (rho_t > 5.0).then(|| {
            ((rho_t - 4.0) * (rho_t - 2.0) * rho_inf / ((rho_inf - 4.0) * (rho_inf - 2.0) * rho_t))
                .sqrt()
        })
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (i.to_string(), var))
            .collect();
        Self::from_named(named, params)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let t = self.step_t as f64;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            ..
        } = self.params;

        let bias_correction1 = 1.0 - beta1.powf(t);
        let bias_correction2 = 1.0 - beta2.powf(t);
        let rect = self.rectification(t);

        for var in self.vars.iter() {
            let theta = &var.var;
            let m = &var.first_moment;
            let v = &var.second_moment;
            if let Some(g) = grads.get(theta) {
                let g = if weight_decay > 0.0 {
                    (g + (theta.as_tensor() * weight_decay)?)?
                } else {
                    g.clone()
                };
                let next_m = ((m.as_tensor() * beta1)? + (&g * (1.0 - beta1))?)?;
                let next_v = ((v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m / bias_correction1)?;

                let update = match rect {
                    Some(r) => {
                        let denom = ((&next_v / bias_correction2)?.sqrt()? + eps)?;
                        ((m_hat / denom)? * (lr * r))?
                    }
                    None => (m_hat * lr)?,
                };

                theta.set(&theta.sub(&update)?)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
            }
        }
        Ok(())
    }
}

/// what the checkpoint json keeps of an optimizer; the moments go to
/// the safetensors file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OptimizerState {
    pub lr: f64,
    pub step: usize,
    pub scheduler_step: usize,
}

/// Adam or RAdam chosen by configuration over the variables of a `VarMap`
pub struct FlowOptimizer {
    inner: Adam,
}

impl FlowOptimizer {
    pub fn new(varmap: &VarMap, config: &TrainConfig) -> Result<Self> {
        let mut vars: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        let [beta1, beta2] = config.betas;
        let params = ParamsAdam {
            lr: config.lr,
            beta1,
            beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
            rectified: config.optimizer == OptimizerKind::Radam,
        };
        Ok(Self {
            inner: Adam::from_named(vars, params)?,
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.inner.backward_step(loss)
    }

    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr)
    }

    pub fn steps(&self) -> usize {
        self.inner.step_t()
    }

    pub fn moments(&self) -> &VarMap {
        self.inner.moments()
    }

    pub fn state(&self, scheduler_step: usize) -> OptimizerState {
        OptimizerState {
            lr: self.learning_rate(),
            step: self.steps(),
            scheduler_step,
        }
    }

    /// restores the learning rate and step counter; the moments are
    /// restored by loading `moments()` from the same checkpoint
    pub fn restore(&mut self, state: &OptimizerState) {
        self.set_learning_rate(state.lr);
        self.inner.set_step_t(state.step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_checkpoint::{CheckpointState, CheckpointStore};
    use candle_core::{DType, Device};
    use candle_nn::Init;

    fn quadratic_loss(varmap: &VarMap) -> Result<Tensor> {
        let dev = Device::Cpu;
        let target = Tensor::new(&[1f32, -2., 0.5], &dev)?;
        let w = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("lock".into()))?["w"]
            .as_tensor()
            .clone();
        (w - &target)?.sqr()?.sum_all()
    }

    fn weights(varmap: &VarMap) -> Result<Vec<f32>> {
        varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("lock".into()))?["w"]
            .as_tensor()
            .to_vec1::<f32>()
    }

    fn quadratic(kind: OptimizerKind) -> Result<(VarMap, FlowOptimizer)> {
        let varmap = VarMap::new();
        varmap.get(3, "w", Init::Const(0.0), DType::F32, &Device::Cpu)?;
        let config = TrainConfig {
            optimizer: kind,
            lr: 0.05,
            ..Default::default()
        };
        let opt = FlowOptimizer::new(&varmap, &config)?;
        Ok((varmap, opt))
    }

    #[test]
    fn adam_and_radam_converge() -> Result<()> {
        for kind in [OptimizerKind::Adam, OptimizerKind::Radam] {
            let (varmap, mut opt) = quadratic(kind)?;
            for _ in 0..500 {
                opt.backward_step(&quadratic_loss(&varmap)?)?;
            }
            assert_eq!(opt.steps(), 500);
            let w = weights(&varmap)?;
            let err = w
                .iter()
                .zip([1f32, -2., 0.5])
                .map(|(a, b)| (a - b).abs())
                .fold(0f32, f32::max);
            assert!(err < 0.05, "{:?} stopped at error {}", kind, err);
        }
        Ok(())
    }

    #[test]
    fn resumed_step_matches_uninterrupted_step() -> anyhow::Result<()> {
        for kind in [OptimizerKind::Adam, OptimizerKind::Radam] {
            let dir = tempfile::tempdir()?;
            let store = CheckpointStore::new(dir.path())?;

            let (varmap, mut opt) = quadratic(kind)?;
            for _ in 0..8 {
                opt.backward_step(&quadratic_loss(&varmap)?)?;
            }
            let attributes = vec![
                ("model".to_string(), varmap.clone()),
                ("optimizer".to_string(), opt.moments().clone()),
            ];
            let state = CheckpointState {
                optimizer: Some(opt.state(0)),
                ..Default::default()
            };
            store.save("final", &attributes, &state)?;

            opt.backward_step(&quadratic_loss(&varmap)?)?;
            let uninterrupted = weights(&varmap)?;

            let (resumed_map, mut resumed) = quadratic(kind)?;
            let attributes = vec![
                ("model".to_string(), resumed_map.clone()),
                ("optimizer".to_string(), resumed.moments().clone()),
            ];
            let loaded = store.load("final", &attributes, &Device::Cpu)?;
            let opt_state = loaded
                .optimizer
                .ok_or_else(|| anyhow::anyhow!("no optimizer state"))?;
            resumed.restore(&opt_state);
            assert_eq!(resumed.steps(), 8);

            resumed.backward_step(&quadratic_loss(&resumed_map)?)?;
            let after_resume = weights(&resumed_map)?;
            for (a, b) in after_resume.iter().zip(uninterrupted.iter()) {
                assert!((a - b).abs() < 1e-6, "{:?}: {} vs. {}", kind, a, b);
            }
        }
        Ok(())
    }
}
