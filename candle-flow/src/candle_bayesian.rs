use crate::candle_variational_linear::*;
use crate::error::FlowError;

use candle_core::Tensor;

/// Evaluation mode of a model, passed with every forward call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalMode {
    /// dropout on, local reparameterization in variational layers
    Train,
    /// deterministic weights (posterior means)
    Map,
    /// the installed posterior draw, or fresh noise when none is installed
    Stochastic,
}

impl EvalMode {
    pub fn is_train(&self) -> bool {
        matches!(self, EvalMode::Train)
    }
}

///
/// Every variational layer of one model, in construction order,
/// together with the posterior draw currently installed
///
#[derive(Clone, Debug)]
pub struct BayesianLayers {
    enabled: bool,
    layers: Vec<VariationalLinear>,
    random_state: Option<PosteriorDraw>,
}

impl BayesianLayers {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            layers: vec![],
            random_state: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// index the next registered layer will get
    pub fn next_index(&self) -> usize {
        self.layers.len()
    }

    /// Keep a handle on `layer`; its index must be `next_index()`
    pub fn register(&mut self, layer: &VariationalLinear) -> anyhow::Result<()> {
        if layer.index() != self.layers.len() {
            anyhow::bail!(
                "variational layer registered out of order: {} vs {}",
                layer.index(),
                self.layers.len()
            );
        }
        self.layers.push(layer.clone());
        Ok(())
    }

    fn check_enabled(&self) -> anyhow::Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(FlowError::NotBayesian.into())
        }
    }

    /// How variational weights are realized under `mode`
    pub fn realization(&self, mode: EvalMode) -> Realization<'_> {
        match mode {
            EvalMode::Train => Realization::LocalReparam,
            EvalMode::Map => Realization::Map,
            EvalMode::Stochastic => match self.random_state.as_ref() {
                Some(draw) => Realization::Draw(draw),
                None => Realization::Fresh,
            },
        }
    }

    /// sum of KL divergences over all layers
    pub fn kl(&self) -> anyhow::Result<Tensor> {
        self.check_enabled()?;
        let mut kl_layers = self.layers.iter().map(|l| l.kl());
        let mut tot = match kl_layers.next() {
            Some(kl) => kl?,
            None => anyhow::bail!("Bayesian model without variational layers"),
        };
        for kl in kl_layers {
            tot = (tot + kl?)?;
        }
        Ok(tot)
    }

    fn draw(&self) -> anyhow::Result<PosteriorDraw> {
        let noise = self
            .layers
            .iter()
            .map(|l| l.sample_noise())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(PosteriorDraw::new(noise))
    }

    /// install a new posterior draw
    pub fn reset_random_state(&mut self) -> anyhow::Result<()> {
        self.check_enabled()?;
        self.random_state = Some(self.draw()?);
        Ok(())
    }

    /// install a new posterior draw and hand back a copy for replay
    pub fn sample_random_state(&mut self) -> anyhow::Result<PosteriorDraw> {
        self.reset_random_state()?;
        self.random_state
            .clone()
            .ok_or_else(|| anyhow::anyhow!("random state missing after reset"))
    }

    /// install a previously sampled draw; layers are matched by order
    pub fn import_random_state(&mut self, draw: PosteriorDraw) -> anyhow::Result<()> {
        self.check_enabled()?;
        if draw.num_layers() != self.layers.len() {
            return Err(FlowError::RandomStateMismatch {
                expected: self.layers.len(),
                found: draw.num_layers(),
            }
            .into());
        }
        for (layer, noise) in self.layers.iter().zip(draw.layers()) {
            let (d_in, d_out) = layer.dims()?;
            if noise.weight.dims() != [d_out, d_in] || noise.bias.dims() != [d_out] {
                anyhow::bail!(
                    "noise of layer {} has shape {:?}, expected {:?}",
                    layer.index(),
                    noise.weight.dims(),
                    [d_out, d_in]
                );
            }
        }
        self.random_state = Some(draw);
        Ok(())
    }

    /// `n` independent draws without installing any of them
    pub fn generate_random_states(&self, n: usize) -> anyhow::Result<Vec<PosteriorDraw>> {
        self.check_enabled()?;
        (0..n).map(|_| self.draw()).collect()
    }

    pub fn clear_random_state(&mut self) {
        self.random_state = None;
    }

    pub fn random_state(&self) -> Option<&PosteriorDraw> {
        self.random_state.as_ref()
    }
}
