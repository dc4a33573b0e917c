use crate::candle_bayesian::EvalMode;
use crate::candle_variational_linear::PosteriorDraw;

use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;

/// named scalar loss terms of one batch, e.g. `loss`, `nll`, `kl`
pub type LossTerms = BTreeMap<String, f32>;

pub trait BayesianModelT {
    fn is_bayesian(&self) -> bool;

    /// Σ KL(q || p) over all variational layers
    fn kl(&self) -> anyhow::Result<Tensor>;

    /// install a fresh posterior draw
    fn reset_random_state(&mut self) -> anyhow::Result<()>;

    /// install a fresh posterior draw and return it for later replay
    fn sample_random_state(&mut self) -> anyhow::Result<PosteriorDraw>;

    /// install a draw returned by `sample_random_state`
    fn import_random_state(&mut self, draw: PosteriorDraw) -> anyhow::Result<()>;
}

pub trait BatchLossT: BayesianModelT {
    /// Loss of one minibatch
    ///
    /// # Arguments
    /// * `x_nd` - inputs (n x dims_in)
    /// * `c_nk` - conditions (n x dims_c)
    /// * `kl_scale` - weight of the KL term, typically 1 / #training samples
    /// * `mode` - evaluation mode
    ///
    /// # Returns `(loss, terms)`
    /// * `loss` - scalar tensor to back-propagate
    /// * `terms` - scalar values for bookkeeping
    fn batch_loss(
        &self,
        x_nd: &Tensor,
        c_nk: &Tensor,
        kl_scale: f64,
        mode: EvalMode,
    ) -> anyhow::Result<(Tensor, LossTerms)>;

    fn device(&self) -> &Device;
}

pub trait GenerativeModelT: BatchLossT {
    /// draw one `x` for every row of `c_nk`
    fn sample(&self, c_nk: &Tensor, mode: EvalMode) -> anyhow::Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_cond(&self) -> usize;
}

pub trait ClassifierModelT: BatchLossT {
    /// probability of label 1 for every row of `c_nk`, (n x 1)
    fn probs(&self, c_nk: &Tensor, mode: EvalMode) -> anyhow::Result<Tensor>;
}

/// value of a scalar tensor of any float dtype
pub fn scalar_f32(t: &Tensor) -> candle_core::Result<f32> {
    t.to_dtype(DType::F32)?.to_scalar::<f32>()
}

/// replace NaN entries by zero
pub fn mask_nan(c_nk: &Tensor) -> candle_core::Result<Tensor> {
    let is_nan = c_nk.ne(c_nk)?;
    is_nan.where_cond(&c_nk.zeros_like()?, c_nk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_becomes_zero() -> candle_core::Result<()> {
        let c = Tensor::new(&[[1f32, f32::NAN], [f32::NAN, -2.]], &Device::Cpu)?;
        let masked = mask_nan(&c)?.to_vec2::<f32>()?;
        assert_eq!(masked, vec![vec![1., 0.], vec![0., -2.]]);
        Ok(())
    }
}
