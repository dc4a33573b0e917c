use candle_core::{DType, Device, Tensor};
use candle_flow::candle_bayesian::{BayesianLayers, EvalMode};
use candle_flow::candle_flow_model::FlowModel;
use candle_flow::candle_model_traits::{BatchLossT, GenerativeModelT};
use candle_flow::candle_latent::standard_normal_log_prob;
use candle_flow::candle_variational_linear::Realization;
use candle_flow::config::{CouplingType, FlowConfig, PermutationType};
use candle_flow::flow::CouplingBlockStack;
use candle_nn::{VarBuilder, VarMap};

fn config(coupling_type: CouplingType) -> FlowConfig {
    FlowConfig {
        dims_in: 3,
        dims_c: 2,
        n_blocks: 4,
        layers_per_block: 2,
        internal_size: 16,
        last_layer_init_scale: 1.0,
        coupling_type,
        num_bins: 8,
        ..Default::default()
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

fn check_round_trip(
    stack: &CouplingBlockStack,
    x: &Tensor,
    c: &Tensor,
    realization: Realization,
) -> anyhow::Result<()> {
    let (z, logdet_fwd) = stack.forward(x, c, realization, false)?;
    let (x_back, logdet_inv) = stack.inverse(&z, c, realization, false)?;

    assert!(max_abs_diff(x, &x_back)? < 1e-3);
    let logdet_sum = (logdet_fwd + logdet_inv)?;
    assert!(logdet_sum.abs()?.max(0)?.to_scalar::<f32>()? < 1e-3);
    Ok(())
}

fn build(config: &FlowConfig, bayesian: bool) -> anyhow::Result<(CouplingBlockStack, BayesianLayers)> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let mut registry = BayesianLayers::new(bayesian);
    let stack = CouplingBlockStack::new(config, &mut registry, vb)?;
    Ok((stack, registry))
}

#[test]
fn affine_stack_inverts() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (stack, _) = build(&config(CouplingType::Affine), false)?;
    assert_eq!(stack.num_blocks(), 4);

    let x = Tensor::randn(0f32, 1f32, (64, 3), &dev)?;
    let c = Tensor::randn(0f32, 1f32, (64, 2), &dev)?;
    check_round_trip(&stack, &x, &c, Realization::Map)
}

#[test]
fn spline_stack_inverts() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (stack, _) = build(&config(CouplingType::RationalQuadratic), false)?;

    let x = Tensor::randn(0f32, 1f32, (64, 3), &dev)?;
    let c = Tensor::randn(0f32, 1f32, (64, 2), &dev)?;
    check_round_trip(&stack, &x, &c, Realization::Map)
}

#[test]
fn bayesian_stack_inverts_under_one_draw() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let cfg = FlowConfig {
        bayesian: true,
        std_init: -2.0,
        ..config(CouplingType::Affine)
    };
    let (stack, registry) = build(&cfg, true)?;
    assert!(registry.num_layers() > 0);

    let draws = registry.generate_random_states(2)?;
    let x = Tensor::randn(0f32, 1f32, (32, 3), &dev)?;
    let c = Tensor::randn(0f32, 1f32, (32, 2), &dev)?;
    for draw in draws.iter() {
        check_round_trip(&stack, &x, &c, Realization::Draw(draw))?;
    }

    // different draws give different maps
    let (z0, _) = stack.forward(&x, &c, Realization::Draw(&draws[0]), false)?;
    let (z1, _) = stack.forward(&x, &c, Realization::Draw(&draws[1]), false)?;
    assert!(max_abs_diff(&z0, &z1)? > 1e-4);
    Ok(())
}

#[test]
fn zero_subnets_give_identity_flow() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    for permutation in [PermutationType::Soft, PermutationType::Hard] {
        let cfg = FlowConfig {
            last_layer_init_scale: 0.0,
            global_affine_init: 1.0,
            permutation,
            ..config(CouplingType::Affine)
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FlowModel::new(cfg, vb)?;

        let x = Tensor::randn(0f32, 1f32, (16, 3), &dev)?;
        let c = Tensor::randn(0f32, 1f32, (16, 2), &dev)?;
        let log_p = model.log_prob(&x, &c, EvalMode::Map)?;
        let expected = standard_normal_log_prob(&x)?;
        assert!(max_abs_diff(&log_p, &expected)? < 1e-4);
    }
    Ok(())
}

#[test]
fn double_precision_flows() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    for coupling_type in [CouplingType::Affine, CouplingType::RationalQuadratic] {
        let cfg = FlowConfig {
            bayesian: true,
            std_init: -4.0,
            ..config(coupling_type)
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &dev);
        let model = FlowModel::new(cfg, vb)?;

        let x = Tensor::randn(0f64, 1f64, (16, 3), &dev)?;
        let c = Tensor::randn(0f64, 1f64, (16, 2), &dev)?;
        let log_p = model.log_prob(&x, &c, EvalMode::Map)?;
        assert_eq!(log_p.dtype(), DType::F64);
        assert!(log_p.to_vec1::<f64>()?.iter().all(|v| v.is_finite()));

        let (_, terms) = model.batch_loss(&x, &c, 1.0 / 16.0, EvalMode::Train)?;
        assert!(terms["loss"].is_finite());

        let samples = model.sample(&c, EvalMode::Stochastic)?;
        assert_eq!(samples.dtype(), DType::F64);
        assert_eq!(samples.dims(), &[16, 3]);
    }
    Ok(())
}
