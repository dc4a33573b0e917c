//! Linear layer with a factorized Gaussian posterior over its weights
//!
//! q(W) = N(μ_w, σ_w²), q(b) = N(μ_b, σ_b²) with σ² = exp(logsig2).
//! The prior is N(0, 1/λ) for every entry.

use crate::candle_loss_functions::gaussian_prior_kl;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

const LOGSIG2_MIN: f64 = -11.0;
const LOGSIG2_MAX: f64 = 11.0;

/// Standard normal noise of one variational layer
#[derive(Clone, Debug)]
pub struct LayerNoise {
    pub weight: Tensor,
    pub bias: Tensor,
}

/// One realization of every variational layer of a model, ordered by
/// layer index. Installing the same draw twice replays the same network.
#[derive(Clone, Debug)]
pub struct PosteriorDraw {
    noise: Vec<LayerNoise>,
}

impl PosteriorDraw {
    pub fn new(noise: Vec<LayerNoise>) -> Self {
        Self { noise }
    }

    pub fn num_layers(&self) -> usize {
        self.noise.len()
    }

    pub fn layer(&self, index: usize) -> Option<&LayerNoise> {
        self.noise.get(index)
    }

    pub fn layers(&self) -> &[LayerNoise] {
        &self.noise
    }
}

/// How variational weights are realized in a forward pass
#[derive(Clone, Copy, Debug)]
pub enum Realization<'a> {
    /// posterior means
    Map,
    /// replay the noise stored in a draw
    Draw(&'a PosteriorDraw),
    /// draw new weight noise for this pass
    Fresh,
    /// local reparameterization: noise on the pre-activations (training)
    LocalReparam,
}

#[derive(Clone, Debug)]
pub struct VariationalLinear {
    mu_w: Tensor,      // out x in
    logsig2_w: Tensor, // out x in
    mu_b: Tensor,      // out
    logsig2_b: Tensor, // out
    prior_prec: f64,
    index: usize,
}

impl VariationalLinear {
    pub fn from_tensors(
        mu_w: Tensor,
        logsig2_w: Tensor,
        mu_b: Tensor,
        logsig2_b: Tensor,
        prior_prec: f64,
        index: usize,
    ) -> Self {
        Self {
            mu_w,
            logsig2_w,
            mu_b,
            logsig2_b,
            prior_prec,
            index,
        }
    }

    /// position of this layer in its model's posterior draw
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dims(&self) -> Result<(usize, usize)> {
        let (d_out, d_in) = self.mu_w.dims2()?;
        Ok((d_in, d_out))
    }

    fn sig2_w(&self) -> Result<Tensor> {
        self.logsig2_w.clamp(LOGSIG2_MIN, LOGSIG2_MAX)?.exp()
    }

    fn sig2_b(&self) -> Result<Tensor> {
        self.logsig2_b.clamp(LOGSIG2_MIN, LOGSIG2_MAX)?.exp()
    }

    /// fresh ε ~ N(0, I) with the shapes of this layer
    pub fn sample_noise(&self) -> Result<LayerNoise> {
        Ok(LayerNoise {
            weight: self.mu_w.randn_like(0., 1.)?,
            bias: self.mu_b.randn_like(0., 1.)?,
        })
    }

    /// KL(q || p) against the N(0, 1/λ) prior
    ///
    /// 0.5 * Σ [ λ (μ² + σ²) - log σ² - 1 - log λ ]
    ///
    pub fn kl(&self) -> Result<Tensor> {
        let logsig2_w = self.logsig2_w.clamp(LOGSIG2_MIN, LOGSIG2_MAX)?;
        let logsig2_b = self.logsig2_b.clamp(LOGSIG2_MIN, LOGSIG2_MAX)?;
        gaussian_prior_kl(&self.mu_w, &logsig2_w, self.prior_prec)?
            + gaussian_prior_kl(&self.mu_b, &logsig2_b, self.prior_prec)?
    }

    fn forward_noise(&self, x: &Tensor, noise: &LayerNoise) -> Result<Tensor> {
        let w = (&self.mu_w + self.sig2_w()?.sqrt()?.mul(&noise.weight)?)?;
        let b = (&self.mu_b + self.sig2_b()?.sqrt()?.mul(&noise.bias)?)?;
        x.matmul(&w.t()?)?.broadcast_add(&b)
    }

    pub fn forward_with(&self, x: &Tensor, realization: Realization) -> Result<Tensor> {
        match realization {
            Realization::Map => x.matmul(&self.mu_w.t()?)?.broadcast_add(&self.mu_b),
            Realization::Draw(draw) => {
                let noise = draw.layer(self.index).ok_or_else(|| {
                    candle_core::Error::Msg(format!(
                        "posterior draw has {} layer(s), no noise for layer {}",
                        draw.num_layers(),
                        self.index
                    ))
                })?;
                self.forward_noise(x, noise)
            }
            Realization::Fresh => {
                let noise = self.sample_noise()?;
                self.forward_noise(x, &noise)
            }
            Realization::LocalReparam => {
                let mu_out = x.matmul(&self.mu_w.t()?)?.broadcast_add(&self.mu_b)?;
                let var_out = x
                    .sqr()?
                    .matmul(&self.sig2_w()?.t()?)?
                    .broadcast_add(&self.sig2_b()?)?;
                let std_out = (var_out + 1e-8)?.sqrt()?;
                mu_out + std_out.mul(&std_out.randn_like(0., 1.)?)?
            }
        }
    }
}

///
/// Create a variational layer `d_in -> d_out`
///
/// * `prior_prec` - prior precision λ
/// * `std_init` - mean of the initial log variance
/// * `init_scale` - multiplies the spread of the initial means
/// * `index` - slot of the layer in posterior draws
///
pub fn variational_linear(
    d_in: usize,
    d_out: usize,
    prior_prec: f64,
    std_init: f64,
    init_scale: f64,
    index: usize,
    vb: VarBuilder,
) -> Result<VariationalLinear> {
    let stdev = init_scale / (d_in as f64).sqrt();
    let mu_w = vb.get_with_hints(
        (d_out, d_in),
        "mu_w",
        candle_nn::Init::Randn { mean: 0.0, stdev },
    )?;
    let logsig2_w = vb.get_with_hints(
        (d_out, d_in),
        "logsig2_w",
        candle_nn::Init::Randn {
            mean: std_init,
            stdev: 0.001,
        },
    )?;
    let mu_b = vb.get_with_hints(d_out, "mu_b", candle_nn::init::ZERO)?;
    let logsig2_b = vb.get_with_hints(d_out, "logsig2_b", candle_nn::Init::Const(std_init))?;

    Ok(VariationalLinear::from_tensors(
        mu_w, logsig2_w, mu_b, logsig2_b, prior_prec, index,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer_at_prior(prior_prec: f64) -> Result<VariationalLinear> {
        let dev = Device::Cpu;
        let logsig2 = -prior_prec.ln();
        Ok(VariationalLinear::from_tensors(
            Tensor::zeros((3, 4), DType::F32, &dev)?,
            Tensor::full(logsig2 as f32, (3, 4), &dev)?,
            Tensor::zeros(3, DType::F32, &dev)?,
            Tensor::full(logsig2 as f32, 3, &dev)?,
            prior_prec,
            0,
        ))
    }

    #[test]
    fn kl_vanishes_at_prior() -> Result<()> {
        for prior_prec in [0.5, 1.0, 4.0] {
            let kl = layer_at_prior(prior_prec)?.kl()?.to_scalar::<f32>()?;
            assert!(kl.abs() < 1e-5, "Expected 0, got {}", kl);
        }
        Ok(())
    }

    #[test]
    fn kl_is_nonnegative() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (i, std_init) in [-9.0, -2.0, 0.0, 3.0].iter().enumerate() {
            let layer = variational_linear(5, 7, 2.0, *std_init, 1.0, i, vb.pp(i.to_string()))?;
            let kl = layer.kl()?.to_scalar::<f32>()?;
            assert!(kl >= 0.0, "negative KL {} at std_init {}", kl, std_init);
        }
        Ok(())
    }

    #[test]
    fn draw_replays_and_map_is_deterministic() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = variational_linear(4, 3, 1.0, -1.0, 1.0, 0, vb)?;
        let x = Tensor::randn(0f32, 1f32, (6, 4), &Device::Cpu)?;

        let draw = PosteriorDraw::new(vec![layer.sample_noise()?]);
        let a = layer.forward_with(&x, Realization::Draw(&draw))?;
        let b = layer.forward_with(&x, Realization::Draw(&draw))?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        let m1 = layer.forward_with(&x, Realization::Map)?;
        let m2 = layer.forward_with(&x, Realization::Map)?;
        assert_eq!((m1 - m2)?.abs()?.max_all()?.to_scalar::<f32>()?, 0.0);

        let t = layer.forward_with(&x, Realization::LocalReparam)?;
        assert_eq!(t.dims(), &[6, 3]);
        Ok(())
    }

    #[test]
    fn missing_layer_noise_is_an_error() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = variational_linear(2, 2, 1.0, -9.0, 1.0, 3, vb)?;
        let x = Tensor::ones((1, 2), DType::F32, &Device::Cpu)?;
        let draw = PosteriorDraw::new(vec![]);
        assert!(layer.forward_with(&x, Realization::Draw(&draw)).is_err());
        Ok(())
    }
}
