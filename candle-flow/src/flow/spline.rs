//! Monotone rational-quadratic splines (Durkan et al., 2019)
//!
//! The spline maps `[left, right]` onto `[bottom, top]` through `K`
//! bins; outside that box it is the identity with zero log-determinant.

use crate::error::FlowError;

use candle_core::{DType, Result, Tensor};
use candle_nn::ops;

pub const MIN_BIN_WIDTH: f64 = 1e-3;
pub const MIN_BIN_HEIGHT: f64 = 1e-3;
pub const MIN_DERIVATIVE: f64 = 1e-3;

/// inverse pass tolerates this much negative discriminant (rounding)
const DISCRIMINANT_TOL: f64 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplineBounds {
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
}

impl SplineBounds {
    pub fn symmetric(bound: f64) -> Self {
        Self {
            left: -bound,
            right: bound,
            bottom: -bound,
            top: bound,
        }
    }
}

/// log(1 + exp(x)) without overflow
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    x.relu()? + (x.abs()?.neg()?.exp()? + 1.0)?.log()?
}

/// knot positions (n, d, K+1) and bin sizes (n, d, K) on `[lo, hi]`
fn knots(unnormalized: &Tensor, min_bin: f64, lo: f64, hi: f64) -> Result<(Tensor, Tensor)> {
    let (n, d, k) = unnormalized.dims3()?;
    let probs = ops::softmax(unnormalized, 2)?;
    let probs = probs.affine(1.0 - min_bin * k as f64, min_bin)?;
    let cum = probs.cumsum(2)?.affine(hi - lo, lo)?;

    let edge = Tensor::ones((n, d, 1), unnormalized.dtype(), unnormalized.device())?;
    let first = edge.affine(0.0, lo)?;
    let last = edge.affine(0.0, hi)?;
    let cum = Tensor::cat(&[&first, &cum.narrow(2, 0, k - 1)?, &last], 2)?;

    let bins = (cum.narrow(2, 1, k)? - cum.narrow(2, 0, k)?)?;
    Ok((cum, bins))
}

/// bin index (n, d, 1) of each input given knots (n, d, K+1)
fn search_bins(knots: &Tensor, x: &Tensor) -> Result<Tensor> {
    let k = knots.dim(2)? - 1;
    let left_knots = knots.narrow(2, 0, k)?;
    let count = x
        .unsqueeze(2)?
        .broadcast_ge(&left_knots)?
        .to_dtype(DType::F32)?
        .sum(2)?;
    (count - 1.0)?
        .clamp(0f32, (k - 1) as f32)?
        .to_dtype(DType::U32)?
        .unsqueeze(2)
}

fn take(t: &Tensor, idx: &Tensor) -> Result<Tensor> {
    t.contiguous()?.gather(idx, 2)?.squeeze(2)
}

fn in_box(x: &Tensor, lo: f64, hi: f64) -> Result<Tensor> {
    x.ge(lo)?.to_dtype(x.dtype())?.mul(&x.le(hi)?.to_dtype(x.dtype())?)
}

///
/// Elementwise spline transform of `inputs` (n x d)
///
/// * `unnormalized_widths` - (n, d, K)
/// * `unnormalized_heights` - (n, d, K)
/// * `unnormalized_derivatives` - (n, d, K-1) interior knots
/// * `inverse` - map `[bottom, top]` back to `[left, right]`
///
/// # Returns `(outputs, logabsdet)` both (n x d)
///
pub fn unconstrained_rational_quadratic_spline(
    inputs: &Tensor,
    unnormalized_widths: &Tensor,
    unnormalized_heights: &Tensor,
    unnormalized_derivatives: &Tensor,
    bounds: &SplineBounds,
    inverse: bool,
) -> anyhow::Result<(Tensor, Tensor)> {
    let (n, d) = inputs.dims2()?;
    let dev = inputs.device();

    let (lo, hi) = if inverse {
        (bounds.bottom, bounds.top)
    } else {
        (bounds.left, bounds.right)
    };
    let inside = in_box(inputs, lo, hi)?;
    let outside = inside.affine(-1.0, 1.0)?;
    let x = inputs.clamp(lo, hi)?;

    let (cumwidths, widths) = knots(unnormalized_widths, MIN_BIN_WIDTH, bounds.left, bounds.right)?;
    let (cumheights, heights) = knots(
        unnormalized_heights,
        MIN_BIN_HEIGHT,
        bounds.bottom,
        bounds.top,
    )?;

    let boundary = Tensor::ones((n, d, 1), inputs.dtype(), dev)?;
    let interior = (softplus(unnormalized_derivatives)? + MIN_DERIVATIVE)?;
    let derivatives = Tensor::cat(&[&boundary, &interior, &boundary], 2)?;
    let k = widths.dim(2)?;

    let idx = if inverse {
        search_bins(&cumheights, &x)?
    } else {
        search_bins(&cumwidths, &x)?
    };

    let x_k = take(&cumwidths, &idx)?;
    let w_k = take(&widths, &idx)?;
    let y_k = take(&cumheights, &idx)?;
    let h_k = take(&heights, &idx)?;
    let delta = take(&(&heights / &widths)?, &idx)?;
    let d_k = take(&derivatives.narrow(2, 0, k)?, &idx)?;
    let d_k1 = take(&derivatives.narrow(2, 1, k)?, &idx)?;

    // d_k + d_{k+1} - 2 δ
    let curvature = ((&d_k + &d_k1)? - (&delta * 2.0)?)?;

    let (outputs, logabsdet) = if inverse {
        let dy = (&x - &y_k)?;
        let a = ((&h_k * (&delta - &d_k)?)? + (&dy * &curvature)?)?;
        let b = ((&h_k * &d_k)? - (&dy * &curvature)?)?;
        let c = (&delta * &dy)?.neg()?;

        let discriminant = (b.sqr()? - ((&a * &c)? * 4.0)?)?;
        let dtype = discriminant.dtype();
        let bad = (discriminant.lt(-DISCRIMINANT_TOL)?.to_dtype(dtype)?
            + discriminant.ne(&discriminant)?.to_dtype(dtype)?)?
            .mul(&inside)?
            .sum_all()?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()?;
        if bad > 0.0 {
            let min_discriminant = discriminant
                .mul(&inside)?
                .min_all()?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?;
            return Err(FlowError::SplineOutOfDomain { min_discriminant }.into());
        }
        let discriminant = discriminant.relu()?;

        let root = ((&c * 2.0)? / (b.neg()? - discriminant.sqrt()?)?)?;
        let out = ((&root * &w_k)? + &x_k)?;

        let theta_1m = (&root * root.affine(-1.0, 1.0)?)?;
        let denom = (&delta + (&curvature * &theta_1m)?)?;
        let deriv_num = (delta.sqr()?
            * ((&d_k1 * root.sqr()?)? + (&delta * &theta_1m)?.affine(2.0, 0.0)?
                + (&d_k * root.affine(-1.0, 1.0)?.sqr()?)?)?)?;
        let lad = (deriv_num.log()? - (denom.log()? * 2.0)?)?;
        (out, lad.neg()?)
    } else {
        let theta = ((&x - &x_k)? / &w_k)?;
        let theta_1m = (&theta * theta.affine(-1.0, 1.0)?)?;

        let numer = (&h_k * ((&delta * theta.sqr()?)? + (&d_k * &theta_1m)?)?)?;
        let denom = (&delta + (&curvature * &theta_1m)?)?;
        let out = (&y_k + (numer / &denom)?)?;

        let deriv_num = (delta.sqr()?
            * ((&d_k1 * theta.sqr()?)? + (&delta * &theta_1m)?.affine(2.0, 0.0)?
                + (&d_k * theta.affine(-1.0, 1.0)?.sqr()?)?)?)?;
        let lad = (deriv_num.log()? - (denom.log()? * 2.0)?)?;
        (out, lad)
    };

    let outputs = ((outputs * &inside)? + (inputs * &outside)?)?;
    let logabsdet = (logabsdet * &inside)?;
    Ok((outputs, logabsdet))
}
