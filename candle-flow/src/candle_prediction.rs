use crate::candle_bayesian::EvalMode;
use crate::candle_flow_model::FlowModel;
use crate::candle_model_traits::{BatchLossT, ClassifierModelT, GenerativeModelT};
use crate::candle_variational_linear::PosteriorDraw;
use crate::config::PredictionConfig;
use crate::error::FlowError;

use candle_core::{Shape, Tensor};
use log::{info, warn};
use std::time::Instant;

/// How the repetitions of one posterior draw were produced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawRepetitions {
    /// posterior means (or a deterministic model), sampled `n` times
    MapAndRepeated(usize),
    /// one sample under one posterior draw
    SingleDraw,
}

impl DrawRepetitions {
    pub fn count(&self) -> usize {
        match self {
            DrawRepetitions::MapAndRepeated(n) => *n,
            DrawRepetitions::SingleDraw => 1,
        }
    }
}

/// samples of one network realization, `repetitions x n x d`
pub struct PredictedDraw {
    pub repetitions: DrawRepetitions,
    pub samples: Tensor,
}

/// Unfolded test samples; draw 0 uses posterior means
pub struct Prediction {
    pub draws: Vec<PredictedDraw>,
}

impl Prediction {
    pub fn num_draws(&self) -> usize {
        self.draws.len()
    }

    /// all repetitions of all draws, `(Σ repetitions) x n x d`
    pub fn stacked(&self) -> anyhow::Result<Tensor> {
        let samples: Vec<&Tensor> = self.draws.iter().map(|d| &d.samples).collect();
        Ok(Tensor::cat(&samples, 0)?)
    }

    /// apply `f` on every `n x d` slice, keeping the layout
    pub fn map_samples<F>(self, f: F) -> anyhow::Result<Self>
    where
        F: Fn(&Tensor) -> anyhow::Result<Tensor>,
    {
        let draws = self
            .draws
            .into_iter()
            .map(|d| {
                let reps = d.samples.dim(0)?;
                let slices = (0..reps)
                    .map(|r| f(&d.samples.get(r)?))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(PredictedDraw {
                    repetitions: d.repetitions,
                    samples: Tensor::stack(&slices, 0)?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Prediction { draws })
    }
}

fn is_out_of_domain(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<FlowError>(),
        Some(FlowError::SplineOutOfDomain { .. })
    )
}

///
/// Sample with a fresh latent draw until the inverse spline succeeds.
/// Only `SplineOutOfDomain` is retried; after `max_retries` failures
/// this gives `SamplingFailed`.
///
pub fn sample_with_retry<F>(mut sample: F, max_retries: usize) -> anyhow::Result<Tensor>
where
    F: FnMut() -> anyhow::Result<Tensor>,
{
    let mut failures = 0;
    loop {
        match sample() {
            Ok(x) => return Ok(x),
            Err(err) if is_out_of_domain(&err) => {
                failures += 1;
                if failures > max_retries {
                    return Err(FlowError::SamplingFailed { attempts: failures }.into());
                }
                warn!("Batch failed ({}), repeating", err);
            }
            Err(err) => return Err(err),
        }
    }
}

/// row ranges of consecutive batches
fn batch_ranges(n: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let bs = batch_size.max(1);
    (0..n).step_by(bs).map(|lb| (lb, bs.min(n - lb))).collect()
}

/// batches stacked along rows; no batch at all gives a `0 x ...` tensor
fn cat_rows<S: Into<Shape>>(batches: &[Tensor], empty: S, like: &Tensor) -> anyhow::Result<Tensor> {
    if batches.is_empty() {
        return Ok(Tensor::zeros(empty, like.dtype(), like.device())?);
    }
    Ok(Tensor::cat(batches, 0)?)
}

/// one sample per condition row, over consecutive batches
fn sample_all<M: GenerativeModelT>(
    model: &M,
    c_nk: &Tensor,
    batch_size: usize,
    mode: EvalMode,
    max_retries: usize,
) -> anyhow::Result<Tensor> {
    let c_nk = c_nk.to_device(model.device())?;
    let batches = batch_ranges(c_nk.dim(0)?, batch_size)
        .into_iter()
        .map(|(lb, len)| {
            let c = c_nk.narrow(0, lb, len)?;
            sample_with_retry(|| model.sample(&c, mode), max_retries)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    cat_rows(&batches, (0, model.dim_obs()), &c_nk)
}

///
/// Unfold every condition row.
///
/// A deterministic model gives one draw with `n_unfoldings`
/// repetitions. A Bayesian model gives `bayesian_samples` draws: draw 0
/// with posterior means and `n_unfoldings` repetitions, every later draw
/// after a fresh `reset_random_state` with a single repetition.
///
/// * `c_nk` - conditions (n x dims_c)
/// * `batch_size` - rows per sampling call
///
pub fn predict<M: GenerativeModelT>(
    model: &mut M,
    c_nk: &Tensor,
    config: &PredictionConfig,
    batch_size: usize,
) -> anyhow::Result<Prediction> {
    let n_unfoldings = config.n_unfoldings.max(1);
    let retries = config.max_sampling_retries;

    let map_draw = {
        let t0 = Instant::now();
        let reps = (0..n_unfoldings)
            .map(|_| sample_all(&*model, c_nk, batch_size, EvalMode::Map, retries))
            .collect::<anyhow::Result<Vec<_>>>()?;
        info!(
            "Finished {} unfolding(s) with fixed weights in {:.1}s",
            n_unfoldings,
            t0.elapsed().as_secs_f32()
        );
        PredictedDraw {
            repetitions: DrawRepetitions::MapAndRepeated(n_unfoldings),
            samples: Tensor::stack(&reps, 0)?,
        }
    };
    let mut draws = vec![map_draw];

    if model.is_bayesian() {
        for i in 1..config.bayesian_samples.max(1) {
            let t0 = Instant::now();
            model.reset_random_state()?;
            let x = sample_all(&*model, c_nk, batch_size, EvalMode::Stochastic, retries)?;
            draws.push(PredictedDraw {
                repetitions: DrawRepetitions::SingleDraw,
                samples: x.unsqueeze(0)?,
            });
            info!(
                "Finished bayesian sample {} in {:.1}s",
                i,
                t0.elapsed().as_secs_f32()
            );
        }
    }
    Ok(Prediction { draws })
}

///
/// Unfold once under each of the given posterior draws, e.g. from
/// `FlowModel::generate_random_states`; the installed random state is
/// left as it is.
///
pub fn predict_with_draws(
    model: &FlowModel,
    c_nk: &Tensor,
    draws: &[PosteriorDraw],
    config: &PredictionConfig,
    batch_size: usize,
) -> anyhow::Result<Prediction> {
    let c_nk = c_nk.to_device(model.device())?;
    let ranges = batch_ranges(c_nk.dim(0)?, batch_size);
    let draws = draws
        .iter()
        .map(|draw| {
            let batches = ranges
                .iter()
                .map(|&(lb, len)| {
                    let c = c_nk.narrow(0, lb, len)?;
                    sample_with_retry(
                        || model.sample_with_draw(&c, draw),
                        config.max_sampling_retries,
                    )
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(PredictedDraw {
                repetitions: DrawRepetitions::SingleDraw,
                samples: cat_rows(&batches, (0, model.dim_obs()), &c_nk)?.unsqueeze(0)?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Prediction { draws })
}

///
/// Several samples per event for the first `max_dist_batches` batches,
/// with posterior means if the model is Bayesian.
///
/// # Returns
/// `n_sampled x dist_samples_per_event x d`, with an extra leading axis
/// of size 1 for a Bayesian model
///
pub fn predict_distribution<M: GenerativeModelT>(
    model: &M,
    c_nk: &Tensor,
    config: &PredictionConfig,
    batch_size: usize,
) -> anyhow::Result<Tensor> {
    let c_nk = c_nk.to_device(model.device())?;
    let samples_per_event = config.dist_samples_per_event.max(1);
    let batches = batch_ranges(c_nk.dim(0)?, batch_size)
        .into_iter()
        .take(config.max_dist_batches.max(1))
        .map(|(lb, len)| {
            let c = c_nk.narrow(0, lb, len)?;
            let samples = (0..samples_per_event)
                .map(|_| {
                    sample_with_retry(
                        || model.sample(&c, EvalMode::Map),
                        config.max_sampling_retries,
                    )
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Tensor::stack(&samples, 1)?)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let all = cat_rows(&batches, (0, samples_per_event, model.dim_obs()), &c_nk)?;
    if model.is_bayesian() {
        Ok(all.unsqueeze(0)?)
    } else {
        Ok(all)
    }
}

///
/// Classifier probabilities: `bayesian_samples x n x 1` for a Bayesian
/// classifier (draw 0 with posterior means), else `n x 1`
///
pub fn predict_probs<M: ClassifierModelT>(
    model: &mut M,
    c_nk: &Tensor,
    bayesian_samples: usize,
    batch_size: usize,
) -> anyhow::Result<Tensor> {
    let c_nk = c_nk.to_device(model.device())?;
    let ranges = batch_ranges(c_nk.dim(0)?, batch_size);

    let probs_all = |model: &M, mode: EvalMode| -> anyhow::Result<Tensor> {
        let batches = ranges
            .iter()
            .map(|&(lb, len)| model.probs(&c_nk.narrow(0, lb, len)?, mode))
            .collect::<anyhow::Result<Vec<_>>>()?;
        cat_rows(&batches, (0, 1), &c_nk)
    };

    if !model.is_bayesian() {
        return probs_all(&*model, EvalMode::Map);
    }
    let mut draws = vec![probs_all(&*model, EvalMode::Map)?];
    for _ in 1..bayesian_samples.max(1) {
        model.reset_random_state()?;
        draws.push(probs_all(&*model, EvalMode::Stochastic)?);
    }
    Ok(Tensor::stack(&draws, 0)?)
}
