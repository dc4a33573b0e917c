use crate::error::invalid_config;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingType {
    #[default]
    Affine,
    RationalQuadratic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatentSpace {
    #[default]
    Gaussian,
    Uniform,
    Mixture,
}

/// fixed mixing applied after every coupling block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermutationType {
    /// random orthogonal matrix
    Soft,
    /// random permutation of the coordinates
    #[default]
    Hard,
    Identity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Elu,
    LeakyRelu,
    Tanh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Radam,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerKind {
    /// multiply by `lr_decay_factor` every `lr_decay_epochs` epochs
    Step,
    /// one cycle policy, stepped per batch
    OneCycle,
    /// cosine decay over all batches
    CosineAnnealing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// conditional invertible network
    #[default]
    Inn,
    Classifier,
}

///
/// Architecture of a conditional invertible network
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    pub dims_in: usize,
    pub dims_c: usize,

    pub n_blocks: usize,
    pub layers_per_block: usize,
    pub internal_size: usize,
    pub dropout: f32,
    pub activation: Activation,
    /// initial scale of the last subnet layer; 0 gives an identity flow
    pub last_layer_init_scale: f64,

    pub coupling_type: CouplingType,
    pub clamping: f64,
    pub global_affine_init: f64,
    pub num_bins: usize,
    pub bounds: f64,
    pub input_bound: f64,
    pub permutation: PermutationType,
    /// seed of the fixed permutation matrices
    pub seed: u64,

    pub latent_space: LatentSpace,
    pub uniform_bounds: [f64; 2],
    pub uniform_channels: Vec<usize>,

    pub bayesian: bool,
    pub bayesian_last: bool,
    pub bayesian_very_last: bool,
    pub bayesian_factor: f64,
    pub prior_prec: f64,
    pub std_init: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            dims_in: 0,
            dims_c: 0,
            n_blocks: 10,
            layers_per_block: 3,
            internal_size: 32,
            dropout: 0.0,
            activation: Activation::Relu,
            last_layer_init_scale: 0.02,
            coupling_type: CouplingType::Affine,
            clamping: 5.0,
            global_affine_init: 0.92,
            num_bins: 10,
            bounds: 10.0,
            input_bound: 1.0,
            permutation: PermutationType::Hard,
            seed: 42,
            latent_space: LatentSpace::Gaussian,
            uniform_bounds: [0.0, 1.0],
            uniform_channels: vec![],
            bayesian: false,
            bayesian_last: false,
            bayesian_very_last: false,
            bayesian_factor: 1.0,
            prior_prec: 1.0,
            std_init: -9.0,
        }
    }
}

impl FlowConfig {
    pub fn is_bayesian(&self) -> bool {
        self.bayesian || self.bayesian_very_last
    }

    /// Reject incompatible combinations before any parameter is
    /// allocated.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dims_in < 2 {
            return Err(invalid_config(format!(
                "coupling blocks need dims_in >= 2, got {}",
                self.dims_in
            )));
        }
        if self.dims_c == 0 {
            return Err(invalid_config("dims_c must be positive"));
        }
        if self.n_blocks == 0 || self.layers_per_block == 0 || self.internal_size == 0 {
            return Err(invalid_config(
                "n_blocks, layers_per_block and internal_size must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(invalid_config(format!("dropout {} not in [0, 1)", self.dropout)));
        }
        if self.global_affine_init <= 0.0 {
            return Err(invalid_config("global_affine_init must be positive"));
        }
        if self.prior_prec <= 0.0 {
            return Err(invalid_config("prior_prec must be positive"));
        }

        let [lo, hi] = self.uniform_bounds;
        if !(lo < hi) {
            return Err(invalid_config(format!(
                "uniform_bounds [{}, {}] is empty",
                lo, hi
            )));
        }

        match self.latent_space {
            LatentSpace::Mixture => {
                if let Some(&ch) = self.uniform_channels.iter().find(|&&ch| ch >= self.dims_in) {
                    return Err(invalid_config(format!(
                        "uniform channel {} out of range (dims_in = {})",
                        ch, self.dims_in
                    )));
                }
            }
            LatentSpace::Gaussian | LatentSpace::Uniform => {}
        }

        match (self.coupling_type, self.latent_space) {
            (CouplingType::Affine, LatentSpace::Uniform) => Err(invalid_config(
                "affine couplings are unbounded; use rational_quadratic with a uniform latent space",
            )),
            (CouplingType::RationalQuadratic, LatentSpace::Mixture) => Err(invalid_config(
                "rational_quadratic couplings do not support a mixture latent space",
            )),
            (CouplingType::RationalQuadratic, LatentSpace::Uniform)
                if self.permutation == PermutationType::Soft =>
            {
                Err(invalid_config(
                    "soft permutations leave the unit box; use hard or identity with a uniform latent space",
                ))
            }
            (CouplingType::RationalQuadratic, _) if self.num_bins < 2 => {
                Err(invalid_config("num_bins must be at least 2"))
            }
            _ => Ok(()),
        }
    }
}

///
/// Bayesian-capable classifier used for reweighting
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub dims_in: usize,
    pub layers: usize,
    pub internal_size: usize,
    pub dropout: f32,
    pub activation: Activation,
    pub bayesian: bool,
    pub bayesian_last: bool,
    pub bayesian_factor: f64,
    pub prior_prec: f64,
    pub std_init: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            dims_in: 0,
            layers: 3,
            internal_size: 32,
            dropout: 0.0,
            activation: Activation::Relu,
            bayesian: false,
            bayesian_last: false,
            bayesian_factor: 1.0,
            prior_prec: 1.0,
            std_init: -9.0,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dims_in == 0 || self.layers == 0 || self.internal_size == 0 {
            return Err(invalid_config(
                "classifier needs positive dims_in, layers and internal_size",
            ));
        }
        Ok(())
    }
}

///
/// Classifier test of an unfolding: truth-level test events (label 1)
/// against unfolded samples (label 0), shuffled and cut into slices
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierTestConfig {
    /// `dims_in` is taken from the hard-level observables
    pub classifier: ClassifierConfig,
    pub train: TrainConfig,
    /// `[lo, hi)` fractions of the shuffled events
    pub train_slice: [f64; 2],
    pub val_slice: [f64; 2],
    pub test_slice: [f64; 2],
    /// seed of the shuffle, so training and evaluation see the same slices
    pub seed: u64,
    /// columns of the unfolded samples rounded to integers (multiplicities)
    pub round_columns: Vec<usize>,
}

impl Default for ClassifierTestConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            train: TrainConfig::default(),
            train_slice: [0.0, 0.6],
            val_slice: [0.6, 0.8],
            test_slice: [0.8, 1.0],
            seed: 0,
            round_columns: vec![],
        }
    }
}

impl ClassifierTestConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, [lo, hi]) in [
            ("train_slice", self.train_slice),
            ("val_slice", self.val_slice),
            ("test_slice", self.test_slice),
        ] {
            if !(0.0..1.0).contains(&lo) || hi <= lo || hi > 1.0 {
                return Err(invalid_config(format!(
                    "{} [{}, {}] is not a range within [0, 1]",
                    name, lo, hi
                )));
            }
        }
        self.train.validate()
    }
}

fn default_device() -> Device {
    Device::Cpu
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// batch size for validation and sampling; falls back to `batch_size`
    pub batch_size_sample: Option<usize>,

    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub betas: [f64; 2],
    pub eps: f64,
    pub weight_decay: f64,

    pub lr_scheduler: Option<LrSchedulerKind>,
    pub lr_decay_epochs: Option<usize>,
    pub lr_decay_factor: Option<f64>,
    pub max_lr: Option<f64>,

    pub checkpoint_interval: Option<usize>,
    pub checkpoint_overwrite: bool,

    pub use_ema: bool,
    pub ema_start: f64,

    /// break the pairing of inputs and conditions every epoch
    pub unpaired: bool,

    pub verbose: bool,
    pub show_progress: bool,

    #[serde(skip, default = "default_device")]
    pub device: Device,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 1024,
            batch_size_sample: None,
            optimizer: OptimizerKind::Adam,
            lr: 2e-4,
            betas: [0.9, 0.999],
            eps: 1e-6,
            weight_decay: 0.0,
            lr_scheduler: None,
            lr_decay_epochs: None,
            lr_decay_factor: None,
            max_lr: None,
            checkpoint_interval: None,
            checkpoint_overwrite: true,
            use_ema: false,
            ema_start: 0.8,
            unpaired: false,
            verbose: false,
            show_progress: false,
            device: default_device(),
        }
    }
}

impl TrainConfig {
    pub fn sample_batch_size(&self) -> usize {
        self.batch_size_sample.unwrap_or(self.batch_size)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 || self.sample_batch_size() == 0 {
            return Err(invalid_config("batch sizes must be positive"));
        }
        if self.lr <= 0.0 {
            return Err(invalid_config("lr must be positive"));
        }
        if !(0.0..=1.0).contains(&self.ema_start) {
            return Err(invalid_config("ema_start is a fraction of all steps"));
        }
        if self.lr_scheduler == Some(LrSchedulerKind::Step)
            && (self.lr_decay_epochs.is_none() || self.lr_decay_factor.is_none())
        {
            return Err(invalid_config(
                "step scheduler needs lr_decay_epochs and lr_decay_factor",
            ));
        }
        if self.lr_decay_epochs == Some(0) || self.checkpoint_interval == Some(0) {
            return Err(invalid_config("epoch intervals must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictionConfig {
    /// number of posterior draws of a Bayesian model
    pub bayesian_samples: usize,
    /// repetitions of the MAP (or deterministic) draw
    pub n_unfoldings: usize,
    pub max_dist_batches: usize,
    pub dist_samples_per_event: usize,
    /// attempts per batch before a sampling failure is escalated
    pub max_sampling_retries: usize,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            bayesian_samples: 20,
            n_unfoldings: 1,
            max_dist_batches: 1,
            dist_samples_per_event: 5,
            max_sampling_retries: 100,
        }
    }
}

///
/// Everything a run needs, read from a single json file
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub model: ModelKind,
    pub flow: FlowConfig,
    pub classifier: ClassifierConfig,
    pub train: TrainConfig,
    pub predict: PredictionConfig,
    /// fractions of events used for training and validation; the rest is test data
    pub split: [f64; 2],
    /// fit the reco-level normalization on hard-level training events;
    /// needs `flow.dims_c == flow.dims_in`
    pub joint_normalization: bool,
    pub classifier_test: ClassifierTestConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::Inn,
            flow: FlowConfig::default(),
            classifier: ClassifierConfig::default(),
            train: TrainConfig::default(),
            predict: PredictionConfig::default(),
            split: [0.6, 0.2],
            joint_normalization: false,
            classifier_test: ClassifierTestConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: RunConfig = serde_json::from_str(&text)
            .map_err(|e| invalid_config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate_split()?;
        config.train.validate()?;
        config.classifier_test.validate()?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn validate_split(&self) -> anyhow::Result<()> {
        let [tr, val] = self.split;
        if tr <= 0.0 || val <= 0.0 || tr + val >= 1.0 {
            return Err(invalid_config(format!(
                "split [{}, {}] must leave room for all three sets",
                tr, val
            )));
        }
        Ok(())
    }
}
