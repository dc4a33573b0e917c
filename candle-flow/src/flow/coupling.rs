use super::permutation::Permutation;
use super::spline::*;

use crate::candle_aux_layers::{subnet, StackLayers, SubnetSpec};
use crate::candle_bayesian::BayesianLayers;
use crate::candle_variational_linear::Realization;
use crate::config::{CouplingType, FlowConfig, LatentSpace};

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// coupling outputs are damped before use
const SUBNET_OUTPUT_SCALE: f64 = 0.1;

/// softplus with β = 0.5, scaled so that `global_scale` starts at
/// `global_affine_init`
const GLOBAL_SCALE_BETA: f64 = 0.5;
const GLOBAL_SCALE_FACTOR: f64 = 0.1;

fn split_dims(dims: usize) -> (usize, usize) {
    let len2 = dims / 2;
    (dims - len2, len2)
}

fn split(x: &Tensor, len1: usize, len2: usize) -> Result<(Tensor, Tensor)> {
    Ok((x.narrow(1, 0, len1)?, x.narrow(1, len1, len2)?))
}

///
/// Affine coupling followed by a learned global affine map and a
/// fixed permutation:
///
/// y2 = x2 * exp(s(x1, c)) + t(x1, c)
/// y = ([x1, y2] * scale + offset) Wᵀ
///
#[derive(Clone, Debug)]
pub struct AffineCouplingBlock {
    len1: usize,
    len2: usize,
    clamp: f64,
    subnet: StackLayers,
    global_scale: Tensor,  // 1 x d, pre-activation
    global_offset: Tensor, // 1 x d
    permutation: Permutation,
}

impl AffineCouplingBlock {
    fn scale(&self) -> Result<Tensor> {
        (softplus(&(&self.global_scale * GLOBAL_SCALE_BETA)?)?
            * (GLOBAL_SCALE_FACTOR / GLOBAL_SCALE_BETA))
    }

    /// (s, t) for the second half
    fn coefficients(
        &self,
        x1: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let h = Tensor::cat(&[x1, c], 1)?;
        let a = (self.subnet.forward_t(&h, realization, train)? * SUBNET_OUTPUT_SCALE)?;
        let s = ((a.narrow(1, 0, self.len2)? / self.clamp)?.tanh()? * self.clamp)?;
        let t = a.narrow(1, self.len2, self.len2)?;
        Ok((s, t))
    }

    pub fn forward(
        &self,
        x: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let (x1, x2) = split(x, self.len1, self.len2)?;
        let (s, t) = self.coefficients(&x1, c, realization, train)?;
        let y2 = (x2.mul(&s.exp()?)? + t)?;
        let y = Tensor::cat(&[&x1, &y2], 1)?;

        let scale = self.scale()?;
        let y = y.broadcast_mul(&scale)?.broadcast_add(&self.global_offset)?;
        let y = self.permutation.forward(&y)?;

        let logdet = s.sum(1)?.broadcast_add(&scale.log()?.sum_all()?)?;
        Ok((y, logdet))
    }

    pub fn inverse(
        &self,
        y: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let scale = self.scale()?;
        let y = self.permutation.inverse(y)?;
        let y = y
            .broadcast_sub(&self.global_offset)?
            .broadcast_div(&scale)?;

        let (x1, y2) = split(&y, self.len1, self.len2)?;
        let (s, t) = self.coefficients(&x1, c, realization, train)?;
        let x2 = (y2 - t)?.mul(&s.neg()?.exp()?)?;
        let x = Tensor::cat(&[&x1, &x2], 1)?;

        let logdet = s.sum(1)?.neg()?.broadcast_sub(&scale.log()?.sum_all()?)?;
        Ok((x, logdet))
    }
}

///
/// Rational-quadratic spline coupling followed by a fixed permutation
///
#[derive(Clone, Debug)]
pub struct SplineCouplingBlock {
    len1: usize,
    len2: usize,
    num_bins: usize,
    bounds: SplineBounds,
    subnet: StackLayers,
    permutation: Permutation,
}

impl SplineCouplingBlock {
    /// unnormalized widths, heights and derivatives, each (n, len2, ·)
    fn spline_params(
        &self,
        x1: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let k = self.num_bins;
        let n = x1.dim(0)?;
        let h = Tensor::cat(&[x1, c], 1)?;
        let theta = self
            .subnet
            .forward_t(&h, realization, train)?
            .reshape((n, self.len2, 3 * k - 1))?;
        Ok((
            theta.narrow(2, 0, k)?,
            theta.narrow(2, k, k)?,
            theta.narrow(2, 2 * k, k - 1)?,
        ))
    }

    pub fn forward(
        &self,
        x: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let (x1, x2) = split(x, self.len1, self.len2)?;
        let (uw, uh, ud) = self.spline_params(&x1, c, realization, train)?;
        let (y2, lad) =
            unconstrained_rational_quadratic_spline(&x2, &uw, &uh, &ud, &self.bounds, false)?;
        let y = Tensor::cat(&[&x1, &y2], 1)?;
        let y = self.permutation.forward(&y)?;
        Ok((y, lad.sum(1)?))
    }

    pub fn inverse(
        &self,
        y: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let y = self.permutation.inverse(y)?;
        let (x1, y2) = split(&y, self.len1, self.len2)?;
        let (uw, uh, ud) = self.spline_params(&x1, c, realization, train)?;
        let (x2, lad) =
            unconstrained_rational_quadratic_spline(&y2, &uw, &uh, &ud, &self.bounds, true)?;
        let x = Tensor::cat(&[&x1, &x2], 1)?;
        Ok((x, lad.sum(1)?))
    }
}

#[derive(Clone, Debug)]
pub enum CouplingBlock {
    Affine(AffineCouplingBlock),
    Spline(SplineCouplingBlock),
}

impl CouplingBlock {
    pub fn forward(
        &self,
        x: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        match self {
            CouplingBlock::Affine(block) => block.forward(x, c, realization, train),
            CouplingBlock::Spline(block) => block.forward(x, c, realization, train),
        }
    }

    pub fn inverse(
        &self,
        y: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        match self {
            CouplingBlock::Affine(block) => block.inverse(y, c, realization, train),
            CouplingBlock::Spline(block) => block.inverse(y, c, realization, train),
        }
    }
}

/// Spline domain and range implied by the latent space
pub fn spline_bounds(config: &FlowConfig) -> SplineBounds {
    match config.latent_space {
        LatentSpace::Uniform => SplineBounds {
            left: -config.input_bound,
            right: config.input_bound,
            bottom: config.uniform_bounds[0],
            top: config.uniform_bounds[1],
        },
        LatentSpace::Gaussian | LatentSpace::Mixture => SplineBounds::symmetric(config.bounds),
    }
}

///
/// Composition of coupling blocks; a bijection of ℝ^dims_in given a
/// condition in ℝ^dims_c
///
#[derive(Clone, Debug)]
pub struct CouplingBlockStack {
    blocks: Vec<CouplingBlock>,
}

impl CouplingBlockStack {
    ///
    /// Build `n_blocks` blocks; variational layers go to `registry`.
    /// With `bayesian_very_last` only the last block is Bayesian, and
    /// only in the last layer of its subnet.
    ///
    pub fn new(
        config: &FlowConfig,
        registry: &mut BayesianLayers,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let device = vb.device().clone();
        let (len1, len2) = split_dims(config.dims_in);

        let mut blocks = Vec::with_capacity(config.n_blocks);
        for b in 0..config.n_blocks {
            let very_last = config.bayesian_very_last && b + 1 == config.n_blocks;
            let spec = SubnetSpec {
                layers: config.layers_per_block,
                internal_size: config.internal_size,
                activation: config.activation,
                dropout: config.dropout,
                last_layer_init_scale: config.last_layer_init_scale,
                bayesian: (config.bayesian && !config.bayesian_very_last) || very_last,
                bayesian_last: config.bayesian_last || very_last,
                prior_prec: config.prior_prec,
                std_init: config.std_init,
            };
            let vb_b = vb.pp(format!("block.{}", b));
            let permutation = Permutation::new(
                config.permutation,
                config.dims_in,
                config.seed.wrapping_add(b as u64),
                &device,
            )?;
            let d_sub_in = len1 + config.dims_c;

            let block = match config.coupling_type {
                CouplingType::Affine => {
                    let subnet = subnet(d_sub_in, 2 * len2, &spec, registry, vb_b.pp("subnet"))?;
                    CouplingBlock::Affine(affine_block(
                        config, len1, len2, subnet, permutation, &vb_b,
                    )?)
                }
                CouplingType::RationalQuadratic => {
                    let k = config.num_bins;
                    let subnet = subnet(
                        d_sub_in,
                        len2 * (3 * k - 1),
                        &spec,
                        registry,
                        vb_b.pp("subnet"),
                    )?;
                    CouplingBlock::Spline(SplineCouplingBlock {
                        len1,
                        len2,
                        num_bins: k,
                        bounds: spline_bounds(config),
                        subnet,
                        permutation,
                    })
                }
            };
            blocks.push(block);
        }

        log::debug!(
            "built {} {:?} block(s), {} variational layer(s) on {:?}",
            blocks.len(),
            config.coupling_type,
            registry.num_layers(),
            device
        );
        Ok(Self { blocks })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// x -> (z, log|det J|)
    pub fn forward(
        &self,
        x: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let mut z = x.clone();
        let mut logdet = Tensor::zeros(x.dim(0)?, x.dtype(), x.device())?;
        for block in self.blocks.iter() {
            let (z_next, ld) = block.forward(&z, c, realization, train)?;
            z = z_next;
            logdet = (logdet + ld)?;
        }
        Ok((z, logdet))
    }

    /// z -> (x, log|det J⁻¹|)
    pub fn inverse(
        &self,
        z: &Tensor,
        c: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let mut x = z.clone();
        let mut logdet = Tensor::zeros(z.dim(0)?, z.dtype(), z.device())?;
        for block in self.blocks.iter().rev() {
            let (x_prev, ld) = block.inverse(&x, c, realization, train)?;
            x = x_prev;
            logdet = (logdet + ld)?;
        }
        Ok((x, logdet))
    }
}

fn affine_block(
    config: &FlowConfig,
    len1: usize,
    len2: usize,
    subnet: StackLayers,
    permutation: Permutation,
    vb: &VarBuilder,
) -> Result<AffineCouplingBlock> {
    // softplus_β(g) * (0.1 / β) = init  <=>  g = log(exp(β * init / 0.1) - 1) / β
    let target = GLOBAL_SCALE_BETA * config.global_affine_init / GLOBAL_SCALE_FACTOR;
    let g0 = target.exp_m1().ln() / GLOBAL_SCALE_BETA;

    let global_scale = vb.get_with_hints(
        (1, config.dims_in),
        "global_scale",
        candle_nn::Init::Const(g0),
    )?;
    let global_offset =
        vb.get_with_hints((1, config.dims_in), "global_offset", candle_nn::init::ZERO)?;

    Ok(AffineCouplingBlock {
        len1,
        len2,
        clamp: config.clamping,
        subnet,
        global_scale,
        global_offset,
        permutation,
    })
}
