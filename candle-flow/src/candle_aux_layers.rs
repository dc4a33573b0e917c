use crate::candle_bayesian::BayesianLayers;
use crate::candle_variational_linear::*;
use crate::config::Activation;

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

impl Activation {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => x.relu(),
            Activation::Elu => x.elu(1.0),
            Activation::LeakyRelu => candle_nn::ops::leaky_relu(x, 0.01),
            Activation::Tanh => x.tanh(),
        }
    }
}

/// plain or variational linear map
#[derive(Clone, Debug)]
pub enum SubnetLayer {
    Linear(Linear),
    Variational(VariationalLinear),
}

impl SubnetLayer {
    pub fn forward_with(&self, x: &Tensor, realization: Realization) -> Result<Tensor> {
        use candle_nn::Module;
        match self {
            SubnetLayer::Linear(linear) => linear.forward(x),
            SubnetLayer::Variational(layer) => layer.forward_with(x, realization),
        }
    }
}

/// build a stack of alternating linear and activation layers; the
/// last layer has no activation. Dropout, if any, acts on the linear
/// output ahead of each activation.
#[derive(Clone, Debug)]
pub struct StackLayers {
    module_layers: Vec<SubnetLayer>,
    activation_layers: Vec<Option<Activation>>,
    dropout: Option<Dropout>,
}

impl StackLayers {
    pub fn new(dropout: f32) -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
            dropout: (dropout > 0.0).then(|| Dropout::new(dropout)),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: SubnetLayer, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: SubnetLayer) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn num_layers(&self) -> usize {
        self.module_layers.len()
    }

    /// * `realization` - how variational layers draw their weights
    /// * `train` - whether dropout is active
    pub fn forward_t(&self, input: &Tensor, realization: Realization, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward_with(&x, realization)?;
            if let Some(activation) = activation {
                if let Some(dropout) = self.dropout.as_ref() {
                    x = dropout.forward(&x, train)?;
                }
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

/// Shape and kind of a subnet
#[derive(Clone, Debug)]
pub struct SubnetSpec {
    pub layers: usize,
    pub internal_size: usize,
    pub activation: Activation,
    pub dropout: f32,
    /// scale of the initial weights of the last layer (0 = zero output)
    pub last_layer_init_scale: f64,
    pub bayesian: bool,
    /// only the last layer is variational
    pub bayesian_last: bool,
    pub prior_prec: f64,
    pub std_init: f64,
}

fn plain_linear(d_in: usize, d_out: usize, init_scale: f64, vb: VarBuilder) -> Result<Linear> {
    let bound = init_scale / (d_in as f64).sqrt();
    let init = if bound > 0.0 {
        candle_nn::Init::Uniform {
            lo: -bound,
            up: bound,
        }
    } else {
        candle_nn::init::ZERO
    };
    let weight = vb.get_with_hints((d_out, d_in), "weight", init)?;
    let bias = vb.get_with_hints(d_out, "bias", init)?;
    Ok(Linear::new(weight, Some(bias)))
}

///
/// A feed-forward network `d_in -> internal_size -> ... -> d_out`.
/// Variational layers are registered in `registry` in construction
/// order.
///
pub fn subnet(
    d_in: usize,
    d_out: usize,
    spec: &SubnetSpec,
    registry: &mut BayesianLayers,
    vb: VarBuilder,
) -> anyhow::Result<StackLayers> {
    let mut stack = StackLayers::new(spec.dropout);

    for l in 0..spec.layers {
        let is_last = l + 1 == spec.layers;
        let layer_in = if l == 0 { d_in } else { spec.internal_size };
        let layer_out = if is_last { d_out } else { spec.internal_size };
        let init_scale = if is_last {
            spec.last_layer_init_scale
        } else {
            1.0
        };
        let vb_l = vb.pp(format!("layer.{}", l));

        let variational = spec.bayesian && (!spec.bayesian_last || is_last);

        let layer = if variational {
            let index = registry.next_index();
            let layer = variational_linear(
                layer_in,
                layer_out,
                spec.prior_prec,
                spec.std_init,
                init_scale,
                index,
                vb_l,
            )?;
            registry.register(&layer)?;
            SubnetLayer::Variational(layer)
        } else {
            SubnetLayer::Linear(plain_linear(layer_in, layer_out, init_scale, vb_l)?)
        };

        if is_last {
            stack.push(layer);
        } else {
            stack.push_with_act(layer, spec.activation);
        }
    }

    Ok(stack)
}
