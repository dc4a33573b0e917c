//! Unfolding drivers wiring a `Process`, preprocessing and a model to
//! the trainer and the prediction routines
//!
//! * `GenerativeUnfolding` learns p(hard | reco) with a conditional flow
//! * `Omnifold` learns p(label | reco) with a classifier
//! * `ClassifierTest` checks unfolded samples against the truth

pub mod classifier_test;
pub mod preprocessing;
pub mod process;

pub use classifier_test::ClassifierTest;
pub use preprocessing::{Preprocessing, Standardize};
pub use process::{Process, ProcessData, Split, TabularProcess};

use crate::candle_checkpoint::CheckpointStore;
use crate::candle_classifier::Classifier;
use crate::candle_flow_inference::Trainer;
use crate::candle_flow_model::FlowModel;
use crate::candle_loss_history::LossHistory;
use crate::candle_model_traits::BayesianModelT;
use crate::candle_prediction::*;
use crate::config::{ClassifierTestConfig, ModelKind, PredictionConfig, RunConfig};
use crate::error::invalid_config;

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use std::path::Path;

/// rows per call when mapping predictions back through preprocessing
const PREPROCESSING_BATCH_SIZE: usize = 1000;

pub struct GenerativeUnfolding<P: Process> {
    process: P,
    hard_pp: Box<dyn Preprocessing>,
    reco_pp: Box<dyn Preprocessing>,
    trainer: Trainer<FlowModel>,
    predict_config: PredictionConfig,
    joint_normalization: bool,
}

impl<P: Process> GenerativeUnfolding<P> {
    ///
    /// * `hard_pp` - preprocessing of the unfolded (input) observables
    /// * `reco_pp` - preprocessing of the detector-level conditions
    /// * `model_dir` - checkpoint directory
    ///
    pub fn new(
        config: &RunConfig,
        process: P,
        hard_pp: Box<dyn Preprocessing>,
        reco_pp: Box<dyn Preprocessing>,
        model_dir: &Path,
    ) -> anyhow::Result<Self> {
        if config.model != ModelKind::Inn {
            return Err(invalid_config(format!(
                "generative unfolding needs an invertible network, not {:?}",
                config.model
            )));
        }
        if hard_pp.output_dim() != config.flow.dims_in || reco_pp.output_dim() != config.flow.dims_c
        {
            return Err(invalid_config(format!(
                "preprocessing gives ({}, {}) dimension(s), the flow expects ({}, {})",
                hard_pp.output_dim(),
                reco_pp.output_dim(),
                config.flow.dims_in,
                config.flow.dims_c
            )));
        }
        if config.joint_normalization && config.flow.dims_c != config.flow.dims_in {
            return Err(invalid_config(format!(
                "joint normalization needs as many reco-level ({}) as hard-level ({}) columns",
                config.flow.dims_c, config.flow.dims_in
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &config.train.device);
        let model = FlowModel::new(config.flow.clone(), vb)?;
        info!(
            "Flow: {} block(s), {} trainable parameter(s), {} variational layer(s)",
            config.flow.n_blocks,
            varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            model.num_bayesian_layers()
        );

        let store = CheckpointStore::new(model_dir)?;
        let mut trainer = Trainer::new(model, varmap, config.train.clone(), store)?;
        trainer.track("hard_pp", hard_pp.variables());
        trainer.track("reco_pp", reco_pp.variables());
        if config.train.unpaired {
            info!("Using unpaired data");
        }

        Ok(Self {
            process,
            hard_pp,
            reco_pp,
            trainer,
            predict_config: config.predict.clone(),
            joint_normalization: config.joint_normalization,
        })
    }

    pub fn trainer(&self) -> &Trainer<FlowModel> {
        &self.trainer
    }

    pub fn trainer_mut(&mut self) -> &mut Trainer<FlowModel> {
        &mut self.trainer
    }

    /// fit preprocessing on the training split, then build loaders;
    /// with joint normalization both sides share the hard-level statistics
    pub fn init_data_loaders(&mut self) -> anyhow::Result<()> {
        let train = self.process.get_data(Split::Train)?;
        let val = self.process.get_data(Split::Val)?;

        self.hard_pp.init_normalization(&train.x_hard)?;
        if self.joint_normalization {
            self.reco_pp.init_normalization(&train.x_hard)?;
        } else {
            self.reco_pp.init_normalization(&train.x_reco)?;
        }

        self.trainer.init_data_loaders(
            (
                self.hard_pp.forward(&train.x_hard)?,
                self.reco_pp.forward(&train.x_reco)?,
            ),
            (
                self.hard_pp.forward(&val.x_hard)?,
                self.reco_pp.forward(&val.x_reco)?,
            ),
        )
    }

    /// train from the current state; after `trainer_mut().init_optimizer()`
    /// and `load` this resumes a checkpoint
    pub fn train(&mut self) -> anyhow::Result<&LossHistory> {
        self.trainer.train()
    }

    pub fn load(&mut self, name: &str) -> anyhow::Result<()> {
        self.trainer.load(name)
    }

    fn test_condition(&self) -> anyhow::Result<Tensor> {
        let test = self.process.get_data(Split::Test)?;
        self.reco_pp.forward(&test.x_reco)
    }

    fn to_hard(&self, x_nd: &Tensor) -> anyhow::Result<Tensor> {
        self.hard_pp.inverse(x_nd, PREPROCESSING_BATCH_SIZE)
    }

    /// unfold the test events, samples in the hard-level space
    pub fn predict(&mut self) -> anyhow::Result<Prediction> {
        let c_nk = self.test_condition()?;
        let batch_size = self.trainer.config().sample_batch_size();
        let prediction = predict(
            self.trainer.model_mut(),
            &c_nk,
            &self.predict_config,
            batch_size,
        )?;
        prediction.map_samples(|x| self.to_hard(x))
    }

    /// unfold the test events once per replayable posterior draw
    pub fn predict_replayable(&self, n_draws: usize) -> anyhow::Result<Prediction> {
        let c_nk = self.test_condition()?;
        let model = self.trainer.model();
        let draws = model.generate_random_states(n_draws)?;
        let batch_size = self.trainer.config().sample_batch_size();
        let prediction = predict_with_draws(model, &c_nk, &draws, &self.predict_config, batch_size)?;
        prediction.map_samples(|x| self.to_hard(x))
    }

    /// several hard-level samples per test event, see `predict_distribution`
    pub fn predict_distribution(&self) -> anyhow::Result<Tensor> {
        let c_nk = self.test_condition()?;
        let batch_size = self.trainer.config().sample_batch_size();
        let samples = predict_distribution(
            self.trainer.model(),
            &c_nk,
            &self.predict_config,
            batch_size,
        )?;
        let dims = samples.dims().to_vec();
        let d = dims.last().copied().unwrap_or(0);
        let flat = samples.reshape(((), d))?;
        Ok(self.to_hard(&flat)?.reshape(dims)?)
    }

    ///
    /// Set up a classifier test of the hard-level test events against
    /// one unfolded sample of each (draw 0). Checkpoints of the
    /// classifier go to the `classifier` subdirectory.
    ///
    pub fn classifier_test(
        &mut self,
        config: &ClassifierTestConfig,
    ) -> anyhow::Result<ClassifierTest> {
        let truth = self.process.get_data(Split::Test)?.x_hard;
        let prediction = self.predict()?;
        let generated = prediction
            .draws
            .first()
            .ok_or_else(|| anyhow::anyhow!("no unfolded samples"))?
            .samples
            .get(0)?;
        ClassifierTest::new(
            config,
            &truth,
            &generated,
            self.predict_config.bayesian_samples,
            &self.trainer.config().device,
            self.trainer.store().dir(),
        )
    }
}

///
/// Classifier-based unfolding: labels are the input, detector-level
/// observables the condition
///
pub struct Omnifold<P: Process> {
    process: P,
    reco_pp: Box<dyn Preprocessing>,
    trainer: Trainer<Classifier>,
    predict_config: PredictionConfig,
}

impl<P: Process> Omnifold<P> {
    pub fn new(
        config: &RunConfig,
        process: P,
        reco_pp: Box<dyn Preprocessing>,
        model_dir: &Path,
    ) -> anyhow::Result<Self> {
        if config.model != ModelKind::Classifier {
            return Err(invalid_config(format!(
                "omnifold needs a classifier, not {:?}",
                config.model
            )));
        }
        if reco_pp.output_dim() != config.classifier.dims_in {
            return Err(invalid_config(format!(
                "preprocessing gives {} dimension(s), the classifier expects {}",
                reco_pp.output_dim(),
                config.classifier.dims_in
            )));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &config.train.device);
        let classifier = Classifier::new(config.classifier.clone(), vb)?;

        let store = CheckpointStore::new(model_dir)?;
        let mut trainer = Trainer::new(classifier, varmap, config.train.clone(), store)?;
        trainer.track("reco_pp", reco_pp.variables());

        Ok(Self {
            process,
            reco_pp,
            trainer,
            predict_config: config.predict.clone(),
        })
    }

    pub fn trainer(&self) -> &Trainer<Classifier> {
        &self.trainer
    }

    pub fn init_data_loaders(&mut self) -> anyhow::Result<()> {
        let train = self.process.get_data(Split::Train)?;
        let val = self.process.get_data(Split::Val)?;
        let (Some(train_label), Some(val_label)) = (train.label, val.label) else {
            anyhow::bail!("the process provides no labels");
        };
        self.reco_pp.init_normalization(&train.x_reco)?;
        self.trainer.init_data_loaders(
            (train_label, self.reco_pp.forward(&train.x_reco)?),
            (val_label, self.reco_pp.forward(&val.x_reco)?),
        )
    }

    pub fn train(&mut self) -> anyhow::Result<&LossHistory> {
        self.trainer.train()
    }

    pub fn load(&mut self, name: &str) -> anyhow::Result<()> {
        self.trainer.load(name)
    }

    /// label probabilities of the test events, see `predict_probs`
    pub fn predict_probs(&mut self) -> anyhow::Result<Tensor> {
        let test = self.process.get_data(Split::Test)?;
        let c_nk = self.reco_pp.forward(&test.x_reco)?;
        let batch_size = self.trainer.config().sample_batch_size();
        let bayesian_samples = if self.trainer.model().is_bayesian() {
            self.predict_config.bayesian_samples
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
}
