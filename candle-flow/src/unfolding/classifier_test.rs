use super::preprocessing::{Preprocessing, Standardize};
use super::process::Split;
use crate::candle_checkpoint::CheckpointStore;
use crate::candle_classifier::Classifier;
use crate::candle_flow_inference::Trainer;
use crate::candle_loss_history::LossHistory;
use crate::candle_model_traits::BayesianModelT;
use crate::candle_prediction::predict_probs;
use crate::config::ClassifierTestConfig;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

/// round the listed columns of `x_nd` to integers
fn round_columns(x_nd: &Tensor, columns: &[usize]) -> anyhow::Result<Tensor> {
    if columns.is_empty() {
        return Ok(x_nd.clone());
    }
    let (_, d) = x_nd.dims2()?;
    if let Some(&j) = columns.iter().find(|&&j| j >= d) {
        anyhow::bail!("cannot round column {} of {}", j, d);
    }
    let cols = (0..d)
        .map(|j| {
            let col = x_nd.narrow(1, j, 1)?;
            if columns.contains(&j) {
                col.round()
            } else {
                Ok(col)
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&cols, 1)?)
}

///
/// A classifier trained to tell truth-level events (label 1) from
/// unfolded ones (label 0). Probabilities near 1/2 on held-out events
/// mean the unfolded distribution is hard to distinguish from the
/// truth.
///
/// Events are shuffled with a fixed seed, so a fresh instance built
/// from the same events sees the same train, validation and test
/// slices and can evaluate a saved checkpoint.
///
pub struct ClassifierTest {
    /// n x 1, shuffled
    label: Tensor,
    /// n x d in hard-level units, shuffled like `label`
    x_hard: Tensor,
    hard_pp: Standardize,
    trainer: Trainer<Classifier>,
    config: ClassifierTestConfig,
    bayesian_samples: usize,
}

impl ClassifierTest {
    ///
    /// * `truth` - hard-level events (n x d)
    /// * `generated` - unfolded samples (m x d)
    /// * `bayesian_samples` - probability draws of a Bayesian classifier
    /// * `model_dir` - checkpoints go to `model_dir/classifier`
    ///
    pub fn new(
        config: &ClassifierTestConfig,
        truth: &Tensor,
        generated: &Tensor,
        bayesian_samples: usize,
        device: &Device,
        model_dir: &Path,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let (n_truth, d) = truth.dims2()?;
        let (n_gen, d_gen) = generated.dims2()?;
        if d != d_gen {
            anyhow::bail!("{} truth vs. {} generated column(s)", d, d_gen);
        }

        let truth = truth.to_dtype(DType::F32)?.to_device(device)?;
        let generated = round_columns(&generated.to_dtype(DType::F32)?, &config.round_columns)?
            .to_device(device)?;
        let label = Tensor::cat(
            &[
                Tensor::ones((n_truth, 1), DType::F32, device)?,
                Tensor::zeros((n_gen, 1), DType::F32, device)?,
            ],
            0,
        )?;
        let x_hard = Tensor::cat(&[&truth, &generated], 0)?;

        let n = n_truth + n_gen;
        let mut perm: Vec<u32> = (0..n as u32).collect();
        perm.shuffle(&mut StdRng::seed_from_u64(config.seed));
        let idx = Tensor::from_vec(perm, n, device)?;
        let label = label.index_select(&idx, 0)?;
        let x_hard = x_hard.index_select(&idx, 0)?;

        let mut classifier_config = config.classifier.clone();
        classifier_config.dims_in = d;
        let mut train_config = config.train.clone();
        train_config.device = device.clone();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let classifier = Classifier::new(classifier_config, vb)?;
        let store = CheckpointStore::new(model_dir.join("classifier"))?;
        let mut trainer = Trainer::new(classifier, varmap, train_config, store)?;

        let hard_pp = Standardize::new(d, device)?;
        trainer.track("hard_pp", hard_pp.variables());

        info!(
            "Classifier test: {} truth and {} generated event(s), {} column(s)",
            n_truth, n_gen, d
        );

        Ok(Self {
            label,
            x_hard,
            hard_pp,
            trainer,
            config: config.clone(),
            bayesian_samples,
        })
    }

    pub fn trainer(&self) -> &Trainer<Classifier> {
        &self.trainer
    }

    pub fn num_events(&self) -> anyhow::Result<usize> {
        Ok(self.label.dim(0)?)
    }

    fn range(&self, split: Split) -> anyhow::Result<(usize, usize)> {
        let n = self.num_events()?;
        let [lo, hi] = match split {
            Split::Train => self.config.train_slice,
            Split::Val => self.config.val_slice,
            Split::Test => self.config.test_slice,
        };
        let lb = (n as f64 * lo) as usize;
        let ub = (n as f64 * hi) as usize;
        Ok((lb, ub - lb))
    }

    /// labels of one slice (n x 1), 1 for truth
    pub fn labels(&self, split: Split) -> anyhow::Result<Tensor> {
        let (lb, len) = self.range(split)?;
        Ok(self.label.narrow(0, lb, len)?)
    }

    fn features(&self, split: Split) -> anyhow::Result<Tensor> {
        let (lb, len) = self.range(split)?;
        Ok(self.x_hard.narrow(0, lb, len)?)
    }

    /// fit the feature normalization on the training slice, then build loaders
    pub fn init_data_loaders(&mut self) -> anyhow::Result<()> {
        let x_train = self.features(Split::Train)?;
        self.hard_pp.init_normalization(&x_train)?;
        self.trainer.init_data_loaders(
            (self.labels(Split::Train)?, self.hard_pp.forward(&x_train)?),
            (
                self.labels(Split::Val)?,
                self.hard_pp.forward(&self.features(Split::Val)?)?,
            ),
        )
    }

    pub fn train(&mut self) -> anyhow::Result<&LossHistory> {
        self.trainer.train()
    }

    pub fn load(&mut self, name: &str) -> anyhow::Result<()> {
        self.trainer.load(name)
    }

    ///
    /// Truth probabilities of the events of one slice:
    /// `bayesian_samples x n x 1` for a Bayesian classifier (draw 0 with
    /// posterior means), else `n x 1`
    ///
    pub fn predict_probs(&mut self, split: Split) -> anyhow::Result<Tensor> {
        let c_nk = self.hard_pp.forward(&self.features(split)?)?;
        let batch_size = self.trainer.config().sample_batch_size();
        let bayesian_samples = if self.trainer.model().is_bayesian() {
            self.bayesian_samples
        } else {
            1
        };
        predict_probs(
            self.trainer.model_mut(),
            &c_nk,
            bayesian_samples,
            batch_size,
        )
    }

    /// restore checkpoint `name` and classify the events of `split`
    pub fn evaluate(&mut self, name: &str, split: Split) -> anyhow::Result<Tensor> {
        self.load(name)?;
        self.predict_probs(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_only_listed_columns() -> anyhow::Result<()> {
        let x = Tensor::new(&[[0.4f32, 2.6, 1.2], [1.5, -0.7, 3.49]], &Device::Cpu)?;
        let y = round_columns(&x, &[1, 2])?.to_vec2::<f32>()?;
        assert_eq!(y, vec![vec![0.4, 3.0, 1.0], vec![1.5, -1.0, 3.0]]);
        assert!(round_columns(&x, &[3]).is_err());
        Ok(())
    }

    #[test]
    fn same_seed_gives_same_slices() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let truth = Tensor::arange(0f32, 20f32, &dev)?.reshape((10, 2))?;
        let generated = (truth.clone() + 100.0)?;
        let mut config = ClassifierTestConfig::default();
        config.classifier.internal_size = 4;

        let a = ClassifierTest::new(&config, &truth, &generated, 1, &dev, dir.path())?;
        let b = ClassifierTest::new(&config, &truth, &generated, 1, &dev, dir.path())?;
        assert_eq!(a.num_events()?, 20);
        assert_eq!(
            a.features(Split::Test)?.to_vec2::<f32>()?,
            b.features(Split::Test)?.to_vec2::<f32>()?
        );

        // labels follow their rows through the shuffle
        let label = a.label.flatten_all()?.to_vec1::<f32>()?;
        let first = a.x_hard.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        for (l, x) in label.iter().zip(first.iter()) {
            assert_eq!(*l == 1.0, *x < 100.0);
        }

        let sizes = [Split::Train, Split::Val, Split::Test]
            .iter()
            .map(|&s| Ok(a.labels(s)?.dim(0)?))
            .collect::<anyhow::Result<Vec<_>>>()?;
        assert_eq!(sizes, vec![12, 4, 4]);
        Ok(())
    }
}
