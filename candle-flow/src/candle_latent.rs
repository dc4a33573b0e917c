use crate::config::{FlowConfig, LatentSpace};

use candle_core::{DType, Device, Result, Tensor};

const LN_2PI: f64 = 1.8378770664093453;

/// Base distribution of a flow
#[derive(Clone, Debug)]
pub enum LatentDistribution {
    /// standard normal
    Gaussian { dims: usize },
    /// uniform on `[lo, hi]` in every dimension
    Uniform { dims: usize, lo: f64, hi: f64 },
    /// uniform where `uniform_mask` is 1 (shape 1 x dims), normal elsewhere
    Mixture {
        dims: usize,
        lo: f64,
        hi: f64,
        uniform_mask: Tensor,
        num_uniform: usize,
    },
}

impl LatentDistribution {
    pub fn from_config(config: &FlowConfig, device: &Device) -> Result<Self> {
        let dims = config.dims_in;
        let [lo, hi] = config.uniform_bounds;
        Ok(match config.latent_space {
            LatentSpace::Gaussian => LatentDistribution::Gaussian { dims },
            LatentSpace::Uniform => LatentDistribution::Uniform { dims, lo, hi },
            LatentSpace::Mixture => {
                let mask: Vec<f32> = (0..dims)
                    .map(|j| {
                        if config.uniform_channels.contains(&j) {
                            1.0
                        } else {
                            0.0
                        }
                    })
                    .collect();
                let num_uniform = mask.iter().filter(|&&m| m > 0.0).count();
                LatentDistribution::Mixture {
                    dims,
                    lo,
                    hi,
                    uniform_mask: Tensor::from_vec(mask, (1, dims), device)?,
                    num_uniform,
                }
            }
        })
    }

    pub fn dims(&self) -> usize {
        match self {
            LatentDistribution::Gaussian { dims }
            | LatentDistribution::Uniform { dims, .. }
            | LatentDistribution::Mixture { dims, .. } => *dims,
        }
    }

    /// `n` latent samples (n x dims)
    pub fn sample(&self, n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
        let z = match self {
            LatentDistribution::Gaussian { dims } => Tensor::randn(0f32, 1f32, (n, *dims), device),
            LatentDistribution::Uniform { dims, lo, hi } => {
                Tensor::rand(*lo as f32, *hi as f32, (n, *dims), device)
            }
            LatentDistribution::Mixture {
                dims,
                lo,
                hi,
                uniform_mask,
                ..
            } => {
                let z_gauss = Tensor::randn(0f32, 1f32, (n, *dims), device)?;
                let z_unif = Tensor::rand(*lo as f32, *hi as f32, (n, *dims), device)?;
                let gauss_mask = uniform_mask.affine(-1.0, 1.0)?;
                z_gauss
                    .broadcast_mul(&gauss_mask)?
                    .add(&z_unif.broadcast_mul(uniform_mask)?)
            }
        }?;
        z.to_dtype(dtype)
    }

    /// log density of each row of `z` (n x dims) -> (n)
    pub fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        let n = z.dim(0)?;
        match self {
            LatentDistribution::Gaussian { .. } => gaussian_log_density(z)?.sum(1),
            LatentDistribution::Uniform { dims, lo, hi } => {
                let lp = -(*dims as f64) * (hi - lo).ln();
                Tensor::ones(n, z.dtype(), z.device())?.affine(0.0, lp)
            }
            LatentDistribution::Mixture {
                lo,
                hi,
                uniform_mask,
                num_uniform,
                ..
            } => {
                let gauss_mask = uniform_mask.to_dtype(z.dtype())?.affine(-1.0, 1.0)?;
                let lp_gauss = gaussian_log_density(z)?.broadcast_mul(&gauss_mask)?.sum(1)?;
                lp_gauss - (*num_uniform as f64) * (hi - lo).ln()
            }
        }
    }
}

/// elementwise -z²/2 - log(2π)/2
fn gaussian_log_density(z: &Tensor) -> Result<Tensor> {
    z.sqr()?.affine(-0.5, -0.5 * LN_2PI)
}

/// standard normal log density summed over the last axis, (n x d) -> (n)
pub fn standard_normal_log_prob(z: &Tensor) -> Result<Tensor> {
    gaussian_log_density(z)?.sum(z.rank() - 1)
}
