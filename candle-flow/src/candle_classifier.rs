use crate::candle_aux_layers::{subnet, StackLayers, SubnetSpec};
use crate::candle_bayesian::*;
use crate::candle_loss_functions::bce_with_logits;
use crate::candle_model_traits::*;
use crate::candle_variational_linear::PosteriorDraw;
use crate::config::ClassifierConfig;

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;

///
/// Binary classifier `c -> logit p(label = 1 | c)`, optionally with
/// variational weights
///
pub struct Classifier {
    config: ClassifierConfig,
    network: StackLayers,
    bayesian_layers: BayesianLayers,
    device: Device,
}

impl Classifier {
    pub fn new(config: ClassifierConfig, vb: VarBuilder) -> anyhow::Result<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let spec = SubnetSpec {
            layers: config.layers,
            internal_size: config.internal_size,
            activation: config.activation,
            dropout: config.dropout,
            last_layer_init_scale: 1.0,
            bayesian: config.bayesian,
            bayesian_last: config.bayesian_last,
            prior_prec: config.prior_prec,
            std_init: config.std_init,
        };
        let mut bayesian_layers = BayesianLayers::new(config.bayesian);
        let network = subnet(
            config.dims_in,
            1,
            &spec,
            &mut bayesian_layers,
            vb.pp("classifier"),
        )?;
        Ok(Self {
            config,
            network,
            bayesian_layers,
            device,
        })
    }

    pub fn logits(&self, c_nk: &Tensor, mode: EvalMode) -> anyhow::Result<Tensor> {
        let (_, k) = c_nk.dims2()?;
        if k != self.config.dims_in {
            anyhow::bail!("classifier expects {} feature(s), got {}", self.config.dims_in, k);
        }
        let c_nk = mask_nan(c_nk)?;
        let realization = self.bayesian_layers.realization(mode);
        Ok(self.network.forward_t(&c_nk, realization, mode.is_train())?)
    }
}

impl BayesianModelT for Classifier {
    fn is_bayesian(&self) -> bool {
        self.bayesian_layers.is_enabled()
    }

    fn kl(&self) -> anyhow::Result<Tensor> {
        self.bayesian_layers.kl()
    }

    fn reset_random_state(&mut self) -> anyhow::Result<()> {
        self.bayesian_layers.reset_random_state()
    }

    fn sample_random_state(&mut self) -> anyhow::Result<PosteriorDraw> {
        self.bayesian_layers.sample_random_state()
    }

    fn import_random_state(&mut self, draw: PosteriorDraw) -> anyhow::Result<()> {
        self.bayesian_layers.import_random_state(draw)
    }
}

impl BatchLossT for Classifier {
    /// `x_nd` holds the labels (n x 1) in {0, 1}
    fn batch_loss(
        &self,
        x_nd: &Tensor,
        c_nk: &Tensor,
        kl_scale: f64,
        mode: EvalMode,
    ) -> anyhow::Result<(Tensor, LossTerms)> {
        let logits = self.logits(c_nk, mode)?;
        let labels = x_nd.reshape(logits.shape())?;
        let bce = bce_with_logits(&logits, &labels)?.mean_all()?;

        let mut terms = LossTerms::new();
        if self.is_bayesian() {
            let kl_loss = (self.kl()? * kl_scale)?;
            let loss = (&bce + (&kl_loss * self.config.bayesian_factor)?)?;
            terms.insert("loss".into(), scalar_f32(&loss)?);
            terms.insert("bce".into(), scalar_f32(&bce)?);
            terms.insert("kl".into(), scalar_f32(&kl_loss)?);
            Ok((loss, terms))
        } else {
            terms.insert("loss".into(), scalar_f32(&bce)?);
            Ok((bce, terms))
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl ClassifierModelT for Classifier {
    fn probs(&self, c_nk: &Tensor, mode: EvalMode) -> anyhow::Result<Tensor> {
        Ok(candle_nn::ops::sigmoid(&self.logits(c_nk, mode)?)?)
    }
}
