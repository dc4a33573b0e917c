use crate::config::PermutationType;

use candle_core::{Device, Result, Tensor};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Fixed orthogonal mixing `x -> x Wᵀ`; |det W| = 1
#[derive(Clone, Debug)]
pub struct Permutation {
    w: Option<Tensor>,
    w_inv: Option<Tensor>,
}

/// Haar-distributed orthogonal matrix via QR of a Gaussian matrix
fn random_orthogonal(dim: usize, rng: &mut StdRng) -> DMatrix<f64> {
    let a = DMatrix::<f64>::from_fn(dim, dim, |_, _| rng.sample(StandardNormal));
    let qr = a.qr();
    let mut q = qr.q();
    let r = qr.r();
    for j in 0..dim {
        if r[(j, j)] < 0.0 {
            q.column_mut(j).neg_mut();
        }
    }
    q
}

fn random_permutation_matrix(dim: usize, rng: &mut StdRng) -> DMatrix<f64> {
    let mut perm: Vec<usize> = (0..dim).collect();
    perm.shuffle(rng);
    let mut w = DMatrix::<f64>::zeros(dim, dim);
    for (i, &j) in perm.iter().enumerate() {
        w[(i, j)] = 1.0;
    }
    w
}

fn to_tensor(mat: &DMatrix<f64>, device: &Device) -> Result<Tensor> {
    let (nrow, ncol) = mat.shape();
    let data: Vec<f32> = (0..nrow)
        .flat_map(|i| (0..ncol).map(move |j| (i, j)))
        .map(|(i, j)| mat[(i, j)] as f32)
        .collect();
    Tensor::from_vec(data, (nrow, ncol), device)
}

impl Permutation {
    /// Same `seed` gives the same matrix, so a rebuilt model can take
    /// back its checkpoint.
    pub fn new(kind: PermutationType, dim: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let w = match kind {
            PermutationType::Identity => return Ok(Self { w: None, w_inv: None }),
            PermutationType::Hard => random_permutation_matrix(dim, &mut rng),
            PermutationType::Soft => random_orthogonal(dim, &mut rng),
        };
        let w_inv = w.transpose();
        Ok(Self {
            w: Some(to_tensor(&w, device)?),
            w_inv: Some(to_tensor(&w_inv, device)?),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self.w.as_ref() {
            Some(w) => x.matmul(&w.to_dtype(x.dtype())?.t()?),
            None => Ok(x.clone()),
        }
    }

    pub fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        match self.w_inv.as_ref() {
            Some(w_inv) => y.matmul(&w_inv.to_dtype(y.dtype())?.t()?),
            None => Ok(y.clone()),
        }
    }
}
