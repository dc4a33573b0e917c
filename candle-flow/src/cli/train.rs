use super::{load_data, DataArgs};
use crate::config::{ModelKind, RunConfig};
use crate::unfolding::*;

use clap::Args;
use log::info;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(long, help = "Override the number of epochs")]
    pub epochs: Option<usize>,
}

pub fn run(args: &TrainArgs) -> anyhow::Result<()> {
    if args.data.hard.is_none()
        && RunConfig::from_json_file(&args.data.config)?.model == ModelKind::Inn
    {
        anyhow::bail!("training a flow needs --hard");
    }
    let loaded = load_data(&args.data)?;
    let mut config = loaded.config;
    if let Some(epochs) = args.epochs {
        config.train.epochs = epochs;
    }
    let device = config.train.device.clone();

    std::fs::create_dir_all(&args.data.out)?;
    config.to_json_file(args.data.out.join("run.json"))?;

    let process = TabularProcess::new(loaded.x_hard, loaded.x_reco, config.split)?;
    info!("{} events", process.num_events()?);

    let losses = match config.model {
        ModelKind::Inn => {
            let hard_pp = Box::new(Standardize::new(config.flow.dims_in, &device)?);
            let reco_pp = Box::new(Standardize::new(config.flow.dims_c, &device)?);
            let mut unfolding =
                GenerativeUnfolding::new(&config, process, hard_pp, reco_pp, &args.data.out)?;
            unfolding.init_data_loaders()?;
            unfolding.train()?.clone()
        }
        ModelKind::Classifier => {
            let label = loaded
                .label
                .ok_or_else(|| anyhow::anyhow!("classifier training needs --label"))?;
            let process = process.with_label(label)?;
            let reco_pp = Box::new(Standardize::new(config.classifier.dims_in, &device)?);
            let mut omnifold = Omnifold::new(&config, process, reco_pp, &args.data.out)?;
            omnifold.init_data_loaders()?;
            omnifold.train()?.clone()
        }
    };

    if let Some(best) = losses.best_val_loss() {
        info!("Best validation loss {:.5}", best);
    }
    info!("Checkpoints in {}", args.data.out.display());
    Ok(())
}
