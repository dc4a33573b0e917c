use crate::candle_bayesian::EvalMode;
use crate::candle_checkpoint::*;
use crate::candle_data_loader::*;
use crate::candle_ema::Ema;
use crate::candle_loss_history::LossHistory;
use crate::candle_model_traits::{BatchLossT, LossTerms};
use crate::candle_optimizer::FlowOptimizer;
use crate::candle_scheduler::LrScheduler;
use crate::config::TrainConfig;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use std::time::Instant;

/// `h:mm:ss`
pub fn format_elapsed(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

///
/// Sample-weighted average of the loss terms over all minibatches of
/// `data`, without back-propagation. A Bayesian model is evaluated
/// twice: once with posterior means (terms prefixed `MAP_`), then with
/// a fresh posterior draw.
///
/// * `model` - the model; its random state is reset if Bayesian
/// * `data` - minibatches must be built already
/// * `kl_scale` - as in training, 1 / #training samples
///
pub fn dataset_loss<M: BatchLossT>(
    model: &mut M,
    data: &PairedData,
    kl_scale: f64,
    device: &Device,
) -> anyhow::Result<LossTerms> {
    fn weighted_pass<M: BatchLossT>(
        model: &M,
        data: &PairedData,
        kl_scale: f64,
        mode: EvalMode,
        prefix: &str,
        device: &Device,
        totals: &mut LossTerms,
    ) -> anyhow::Result<()> {
        let mut n_total = 0usize;
        let mut sums = LossTerms::new();
        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, device)?;
            let n = data.minibatch_size(b);
            let (_, terms) = model.batch_loss(
                &mb.input.detach(),
                &mb.condition.detach(),
                kl_scale,
                mode,
            )?;
            for (name, value) in terms {
                *sums.entry(format!("{}{}", prefix, name)).or_default() += value * n as f32;
            }
            n_total += n;
        }
        let n_total = n_total.max(1) as f32;
        for (name, value) in sums {
            totals.insert(name, value / n_total);
        }
        Ok(())
    }

    let mut totals = LossTerms::new();
    if model.is_bayesian() {
        weighted_pass(&*model, data, kl_scale, EvalMode::Map, "MAP_", device, &mut totals)?;
        model.reset_random_state()?;
        weighted_pass(&*model, data, kl_scale, EvalMode::Stochastic, "", device, &mut totals)?;
    } else {
        weighted_pass(&*model, data, kl_scale, EvalMode::Map, "", device, &mut totals)?;
    }
    Ok(totals)
}

///
/// Trains a model on paired (input, condition) data with checkpoints
/// in a `CheckpointStore`. Parameters tracked for checkpoints are the
/// model's own variables (`model`) plus whatever is added by `track`.
///
pub struct Trainer<M: BatchLossT> {
    model: M,
    varmap: VarMap,
    attributes: Vec<(String, VarMap)>,
    config: TrainConfig,
    store: CheckpointStore,

    train_data: Option<PairedData>,
    val_data: Option<PairedData>,
    n_train_samples: usize,

    optimizer: Option<FlowOptimizer>,
    scheduler: Option<LrScheduler>,
    ema: Option<Ema>,

    losses: LossHistory,
    epoch: usize,
}

impl<M: BatchLossT> Trainer<M> {
    /// * `model` - built with a `VarBuilder` over `varmap`
    pub fn new(
        model: M,
        varmap: VarMap,
        config: TrainConfig,
        store: CheckpointStore,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            attributes: vec![("model".to_string(), varmap.clone())],
            varmap,
            config,
            store,
            train_data: None,
            val_data: None,
            n_train_samples: 0,
            optimizer: None,
            scheduler: None,
            ema: None,
            losses: LossHistory::new(),
            epoch: 0,
        })
    }

    /// also save and restore `varmap` under `name`
    pub fn track(&mut self, name: &str, varmap: VarMap) {
        self.attributes.push((name.to_string(), varmap));
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn losses(&self) -> &LossHistory {
        &self.losses
    }

    pub fn optimizer(&self) -> Option<&FlowOptimizer> {
        self.optimizer.as_ref()
    }

    pub fn n_train_samples(&self) -> usize {
        self.n_train_samples
    }

    /// # Arguments
    /// * `train` - (input, condition) training rows
    /// * `val` - (input, condition) validation rows
    pub fn init_data_loaders(
        &mut self,
        train: (Tensor, Tensor),
        val: (Tensor, Tensor),
    ) -> anyhow::Result<()> {
        let mut train_data = PairedData::new(train.0, train.1)?;
        let mut val_data = PairedData::new(val.0, val.1)?;
        if train_data.num_samples() == 0 {
            anyhow::bail!("no training samples");
        }
        train_data.shuffle_minibatch(self.config.batch_size)?;
        val_data.ordered_minibatch(self.config.sample_batch_size())?;
        self.n_train_samples = train_data.num_samples();
        info!(
            "{} training / {} validation samples, {} minibatches per epoch",
            train_data.num_samples(),
            val_data.num_samples(),
            train_data.num_minibatch()
        );
        self.train_data = Some(train_data);
        self.val_data = Some(val_data);
        Ok(())
    }

    /// Optimizer, learning-rate schedule and parameter averaging;
    /// call after `init_data_loaders`
    pub fn init_optimizer(&mut self) -> anyhow::Result<()> {
        let num_minibatch = self
            .train_data
            .as_ref()
            .map(|d| d.num_minibatch())
            .ok_or_else(|| anyhow::anyhow!("data loaders not initialized"))?;

        let mut optimizer = FlowOptimizer::new(&self.varmap, &self.config)?;
        self.scheduler = LrScheduler::from_config(&self.config, num_minibatch)?;
        if let Some(sched) = self.scheduler.as_ref() {
            optimizer.set_learning_rate(sched.current_lr());
        }
        self.optimizer = Some(optimizer);

        if self.config.use_ema {
            let total = (self.config.epochs * num_minibatch) as f64;
            let start = (self.config.ema_start * total) as usize;
            self.ema = Some(Ema::new(&self.varmap, start)?);
            info!("Using EMA with start at {}", self.config.ema_start);
        }
        Ok(())
    }

    fn begin_epoch(&mut self) -> anyhow::Result<()> {
        if !self.config.unpaired {
            return Ok(());
        }
        if let Some(train_data) = self.train_data.as_mut() {
            train_data.shuffle_condition()?;
        }
        if let Some(val_data) = self.val_data.as_mut() {
            val_data.shuffle_condition()?;
            val_data.ordered_minibatch(self.config.sample_batch_size())?;
        }
        Ok(())
    }

    fn train_epoch(&mut self) -> anyhow::Result<LossTerms> {
        let device = self.config.device.clone();
        let kl_scale = 1.0 / self.n_train_samples as f64;

        let train_data = self
            .train_data
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("data loaders not initialized"))?;
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("optimizer not initialized"))?;

        train_data.shuffle_minibatch(self.config.batch_size)?;
        let num_minibatch = train_data.num_minibatch();
        let loss_scale = 1.0 / num_minibatch as f32;

        let mut epoch_terms = LossTerms::new();
        for b in 0..num_minibatch {
            let mb = train_data.minibatch_data(b, &device)?;
            let (loss, terms) =
                self.model
                    .batch_loss(&mb.input, &mb.condition, kl_scale, EvalMode::Train)?;
            optimizer.backward_step(&loss)?;

            if let Some(sched) = self.scheduler.as_mut().filter(|s| s.is_per_batch()) {
                optimizer.set_learning_rate(sched.step());
            }
            for (name, value) in terms {
                *epoch_terms.entry(name).or_default() += value * loss_scale;
            }
            if let Some(ema) = self.ema.as_mut() {
                ema.update(&self.varmap)?;
            }
        }

        if let Some(sched) = self.scheduler.as_mut().filter(|s| !s.is_per_batch()) {
            optimizer.set_learning_rate(sched.step());
        }
        Ok(epoch_terms)
    }

    /// Main training loop; returns the loss history
    pub fn train(&mut self) -> anyhow::Result<&LossHistory> {
        if self.optimizer.is_none() {
            self.init_optimizer()?;
        }
        let device = self.config.device.clone();
        let kl_scale = 1.0 / self.n_train_samples as f64;

        let pb = ProgressBar::new(self.config.epochs as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let start_time = Instant::now();
        for epoch in 0..self.config.epochs {
            self.epoch = epoch;
            self.begin_epoch()?;

            let train_terms = self.train_epoch()?;
            self.losses.push_terms("tr_", &train_terms);

            let val_data = self
                .val_data
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("data loaders not initialized"))?;
            let val_terms = dataset_loss(&mut self.model, val_data, kl_scale, &device)?;
            self.losses.push_terms("val_", &val_terms);
            self.losses.update_moving_average();

            let lr = self.optimizer.as_ref().map(|o| o.learning_rate()).unwrap_or(0.0);
            self.losses.push("lr", lr as f32);

            if self.losses.improved() {
                self.save("best")?;
            }
            if let Some(interval) = self.config.checkpoint_interval {
                if interval > 0 && (epoch + 1) % interval == 0 {
                    if self.config.checkpoint_overwrite {
                        self.save("final")?;
                    } else {
                        self.save(&format!("epoch_{}", epoch))?;
                    }
                }
            }

            pb.inc(1);
            info!(
                "Ep {}: {}, t = {}",
                epoch,
                self.losses.summary(),
                format_elapsed(start_time.elapsed().as_secs())
            );
        }
        pb.finish_and_clear();

        self.save("final")?;
        info!(
            "Training completed after {}",
            format_elapsed(start_time.elapsed().as_secs())
        );
        Ok(&self.losses)
    }

    /// Validation losses of the current parameters
    pub fn validation_loss(&mut self) -> anyhow::Result<LossTerms> {
        let device = self.config.device.clone();
        let kl_scale = 1.0 / self.n_train_samples.max(1) as f64;
        let val_data = self
            .val_data
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("data loaders not initialized"))?;
        dataset_loss(&mut self.model, val_data, kl_scale, &device)
    }

    pub fn save(&self, name: &str) -> anyhow::Result<()> {
        let scheduler_step = self.scheduler.as_ref().map(|s| s.position()).unwrap_or(0);
        let state = CheckpointState {
            optimizer: self.optimizer.as_ref().map(|o| o.state(scheduler_step)),
            losses: self.losses.clone(),
            epoch: self.epoch,
        };
        self.store.save(name, &self.checkpoint_attributes(), &state)?;
        if let Some(ema) = self.ema.as_ref() {
            ema.save(&self.store.ema_path(name))?;
        }
        Ok(())
    }

    /// tracked variables plus the optimizer moments, once there is an optimizer
    fn checkpoint_attributes(&self) -> Vec<(String, VarMap)> {
        let mut attributes = self.attributes.clone();
        if let Some(optimizer) = self.optimizer.as_ref() {
            attributes.push(("optimizer".to_string(), optimizer.moments().clone()));
        }
        attributes
    }

    ///
    /// Restore tracked parameters and loss history. When the optimizer
    /// is initialized, its moments, learning rate and step count are
    /// restored too, so training resumes where it stopped.
    ///
    pub fn load(&mut self, name: &str) -> anyhow::Result<()> {
        let state = self
            .store
            .load(name, &self.checkpoint_attributes(), &self.config.device)?;
        self.losses = state.losses;
        self.epoch = state.epoch;

        if let (Some(optimizer), Some(opt_state)) =
            (self.optimizer.as_mut(), state.optimizer.as_ref())
        {
            optimizer.restore(opt_state);
            if let Some(sched) = self.scheduler.as_mut() {
                sched.set_position(opt_state.scheduler_step);
            }
        }

        if self.config.use_ema {
            let path = self.store.ema_path(name);
            if path.exists() {
                let mut ema = match self.ema.take() {
                    Some(ema) => ema,
                    None => Ema::new(&self.varmap, 0)?,
                };
                ema.load(&path, &self.config.device)?;
                self.ema = Some(ema);
            } else {
                warn!("{} not found, no parameter averages", path.display());
            }
        }
        info!("Loaded checkpoint {} (epoch {})", name, self.epoch);
        Ok(())
    }

    /// replace the model parameters by their moving averages
    pub fn apply_ema(&self) -> anyhow::Result<()> {
        match self.ema.as_ref() {
            Some(ema) => ema.copy_to(&self.varmap),
            None => Err(anyhow::anyhow!("parameter averaging is off")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_format() {
        assert_eq!(format_elapsed(0), "0:00:00");
        assert_eq!(format_elapsed(3725), "1:02:05");
    }
}
