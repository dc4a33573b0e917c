use crate::candle_bayesian::*;
use crate::candle_latent::LatentDistribution;
use crate::candle_model_traits::*;
use crate::candle_variational_linear::{PosteriorDraw, Realization};
use crate::config::FlowConfig;
use crate::flow::CouplingBlockStack;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

///
/// Conditional invertible network: p(x | c) = p_z(f(x; c)) |det ∂f/∂x|
///
pub struct FlowModel {
    config: FlowConfig,
    transform: CouplingBlockStack,
    latent: LatentDistribution,
    bayesian_layers: BayesianLayers,
    dtype: DType,
    device: Device,
}

impl FlowModel {
    /// Build the network; parameters are created through `vb`
    pub fn new(config: FlowConfig, vb: VarBuilder) -> anyhow::Result<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let mut bayesian_layers = BayesianLayers::new(config.is_bayesian());
        let transform = CouplingBlockStack::new(&config, &mut bayesian_layers, vb)?;
        let latent = LatentDistribution::from_config(&config, &device)?;

        Ok(Self {
            config,
            transform,
            latent,
            bayesian_layers,
            dtype,
            device,
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn latent(&self) -> &LatentDistribution {
        &self.latent
    }

    pub fn num_bayesian_layers(&self) -> usize {
        self.bayesian_layers.num_layers()
    }

    fn check_shapes(&self, x_nd: Option<&Tensor>, c_nk: &Tensor) -> anyhow::Result<()> {
        let (n, k) = c_nk.dims2()?;
        if k != self.config.dims_c {
            anyhow::bail!("condition has {} column(s), expected {}", k, self.config.dims_c);
        }
        if let Some(x_nd) = x_nd {
            let (nx, d) = x_nd.dims2()?;
            if nx != n || d != self.config.dims_in {
                anyhow::bail!(
                    "input {:?} does not match condition {:?} (dims_in = {})",
                    x_nd.dims(),
                    c_nk.dims(),
                    self.config.dims_in
                );
            }
        }
        Ok(())
    }

    /// `x -> (z, log|det J|)` under an explicit weight realization
    pub fn transform_with(
        &self,
        x_nd: &Tensor,
        c_nk: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        self.check_shapes(Some(x_nd), c_nk)?;
        let c_nk = mask_nan(c_nk)?;
        self.transform.forward(x_nd, &c_nk, realization, train)
    }

    /// log p(x | c) for every row, (n)
    pub fn log_prob_with(
        &self,
        x_nd: &Tensor,
        c_nk: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<Tensor> {
        let (z_nd, logdet_n) = self.transform_with(x_nd, c_nk, realization, train)?;
        Ok((self.latent.log_prob(&z_nd)? + logdet_n)?)
    }

    pub fn log_prob(&self, x_nd: &Tensor, c_nk: &Tensor, mode: EvalMode) -> anyhow::Result<Tensor> {
        let realization = self.bayesian_layers.realization(mode);
        self.log_prob_with(x_nd, c_nk, realization, mode.is_train())
    }

    /// one sample per condition row under an explicit weight realization
    pub fn sample_with(
        &self,
        c_nk: &Tensor,
        realization: Realization,
        train: bool,
    ) -> anyhow::Result<Tensor> {
        self.check_shapes(None, c_nk)?;
        let c_nk = mask_nan(c_nk)?;
        let z_nd = self.latent.sample(c_nk.dim(0)?, self.dtype, &self.device)?;
        let (x_nd, _) = self.transform.inverse(&z_nd, &c_nk, realization, train)?;
        Ok(x_nd)
    }

    /// sample with the network fixed to `draw`, leaving the installed
    /// random state untouched
    pub fn sample_with_draw(&self, c_nk: &Tensor, draw: &PosteriorDraw) -> anyhow::Result<Tensor> {
        self.sample_with(c_nk, Realization::Draw(draw), false)
    }

    /// `n` replayable posterior draws, none of them installed
    pub fn generate_random_states(&self, n: usize) -> anyhow::Result<Vec<PosteriorDraw>> {
        self.bayesian_layers.generate_random_states(n)
    }
}

impl BayesianModelT for FlowModel {
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

impl BatchLossT for FlowModel {
    fn batch_loss(
        &self,
        x_nd: &Tensor,
        c_nk: &Tensor,
        kl_scale: f64,
        mode: EvalMode,
    ) -> anyhow::Result<(Tensor, LossTerms)> {
        let dims_in = self.config.dims_in as f64;
        let log_prob = self.log_prob(x_nd, c_nk, mode)?;
        let nll = (log_prob.mean_all()?.neg()? / dims_in)?;

        let mut terms = LossTerms::new();
        if self.is_bayesian() {
            let kl_loss = ((self.kl()? * kl_scale)? / dims_in)?;
            let loss = (&nll + (&kl_loss * self.config.bayesian_factor)?)?;
            terms.insert("loss".into(), scalar_f32(&loss)?);
            terms.insert("nll".into(), scalar_f32(&nll)?);
            terms.insert("kl".into(), scalar_f32(&kl_loss)?);
            Ok((loss, terms))
        } else {
            terms.insert("loss".into(), scalar_f32(&nll)?);
            Ok((nll, terms))
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl GenerativeModelT for FlowModel {
    fn sample(&self, c_nk: &Tensor, mode: EvalMode) -> anyhow::Result<Tensor> {
        let realization = self.bayesian_layers.realization(mode);
        self.sample_with(c_nk, realization, mode.is_train())
    }

    fn dim_obs(&self) -> usize {
        self.config.dims_in
    }

    fn dim_cond(&self) -> usize {
        self.config.dims_c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CouplingType, PermutationType};
    use crate::error::FlowError;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn small(bayesian: bool) -> FlowConfig {
        FlowConfig {
            dims_in: 3,
            dims_c: 2,
            n_blocks: 2,
            layers_per_block: 2,
            internal_size: 8,
            bayesian,
            ..Default::default()
        }
    }

    #[test]
    fn deterministic_model_refuses_bayesian_calls() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut model = FlowModel::new(small(false), vb)?;
        assert!(!model.is_bayesian());
        let err = model.sample_random_state().err();
        assert!(matches!(
            err.as_ref().and_then(|e| e.downcast_ref::<FlowError>()),
            Some(FlowError::NotBayesian)
        ));
        assert!(model.kl().is_err());
        Ok(())
    }

    #[test]
    fn loss_terms_by_kind() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (16, 3), &dev)?;
        let c = Tensor::randn(0f32, 1f32, (16, 2), &dev)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FlowModel::new(small(false), vb)?;
        let (_, terms) = model.batch_loss(&x, &c, 1.0 / 16.0, EvalMode::Train)?;
        assert_eq!(terms.keys().collect::<Vec<_>>(), vec!["loss"]);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FlowModel::new(small(true), vb)?;
        assert_eq!(model.num_bayesian_layers(), 4);
        let (loss, terms) = model.batch_loss(&x, &c, 1.0 / 16.0, EvalMode::Train)?;
        assert_eq!(terms.keys().collect::<Vec<_>>(), vec!["kl", "loss", "nll"]);
        let total = loss.to_scalar::<f32>()?;
        assert!((total - terms["nll"] - terms["kl"]).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn nan_conditions_are_masked() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FlowModel::new(small(false), vb)?;

        let x = Tensor::randn(0f32, 1f32, (2, 3), &dev)?;
        let c_nan = Tensor::new(&[[f32::NAN, 1.], [0.5, f32::NAN]], &dev)?;
        let c_zero = Tensor::new(&[[0f32, 1.], [0.5, 0.]], &dev)?;
        let a = model.log_prob(&x, &c_nan, EvalMode::Map)?;
        let b = model.log_prob(&x, &c_zero, EvalMode::Map)?;
        assert_eq!(a.to_vec1::<f32>()?, b.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn very_last_block_is_the_only_bayesian_one() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = FlowConfig {
            bayesian_very_last: true,
            coupling_type: CouplingType::RationalQuadratic,
            permutation: PermutationType::Soft,
            n_blocks: 4,
            ..small(false)
        };
        let model = FlowModel::new(config, vb)?;
        assert!(model.is_bayesian());
        assert_eq!(model.num_bayesian_layers(), 1);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_reported() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FlowModel::new(small(false), vb)?;
        let c = Tensor::zeros((4, 5), DType::F32, &dev)?;
        assert!(model.sample(&c, EvalMode::Map).is_err());
        Ok(())
    }
}
