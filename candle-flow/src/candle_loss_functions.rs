use crate::flow::spline::softplus;

use candle_core::{Result, Tensor};

/// KL divergence of N(μ, σ²) against the N(0, 1/λ) prior, summed
/// over all entries
///
/// 0.5 * Σ [ λ (μ² + σ²) - log σ² - 1 - log λ ]
///
/// * `mu` - posterior mean
/// * `logsig2` - posterior log variance, already clamped
/// * `prior_prec` - prior precision λ
///
pub fn gaussian_prior_kl(mu: &Tensor, logsig2: &Tensor, prior_prec: f64) -> Result<Tensor> {
    let quad = ((mu.sqr()? + logsig2.exp()?)? * prior_prec)?;
    (((quad - logsig2)? - (1.0 + prior_prec.ln()))?.sum_all()? * 0.5)
}

/// Binary cross entropy on logits, elementwise
///
/// max(z, 0) - z * y + log(1 + exp(-|z|))
///
/// * `logits` - classifier outputs z
/// * `labels` - targets y in [0, 1]
///
pub fn bce_with_logits(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    softplus(logits)? - logits.mul(labels)?
}
