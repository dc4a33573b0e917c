pub mod io;
pub mod predict;
pub mod train;

use crate::config::{ModelKind, RunConfig};

use candle_core::{DType, Device, Tensor};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;

pub use predict::PredictArgs;
pub use train::TrainArgs;

#[derive(Parser)]
#[command(name = "candle-flow")]
#[command(about = "Conditional invertible networks for unfolding")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train an unfolding model
    Train(TrainArgs),
    /// Unfold test events with a trained model
    Predict(PredictArgs),
}

/// Input files and run settings shared by all commands
#[derive(Args, Debug)]
pub struct DataArgs {
    #[arg(short, long, help = "Run configuration (json)")]
    pub config: PathBuf,

    #[arg(
        long,
        help = "Hard-level observables, one event per row; required to train a flow"
    )]
    pub hard: Option<PathBuf>,

    #[arg(long, help = "Detector-level observables, one event per row")]
    pub reco: PathBuf,

    #[arg(long, help = "Class labels (0/1), one per row; classifier runs only")]
    pub label: Option<PathBuf>,

    #[arg(short, long, help = "Checkpoint directory")]
    pub out: PathBuf,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

pub(crate) fn pick_device(gpu: bool) -> Device {
    let device = if gpu {
        #[cfg(feature = "metal")]
        {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        }
        #[cfg(all(feature = "cuda", not(feature = "metal")))]
        {
            Device::new_cuda(0).unwrap_or(Device::Cpu)
        }
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        {
            Device::Cpu
        }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);
    device
}

pub(crate) struct LoadedData {
    pub config: RunConfig,
    pub x_hard: Tensor,
    pub x_reco: Tensor,
    pub label: Option<Tensor>,
}

///
/// Read the configuration and data files; model dimensions are taken
/// from the data. Without `--hard` the hard-level block is a zero
/// placeholder whose width comes from `flow.dims_in` of the
/// configuration (e.g. the `run.json` written by training).
///
pub(crate) fn load_data(args: &DataArgs) -> anyhow::Result<LoadedData> {
    let mut config = RunConfig::from_json_file(&args.config)?;
    let device = pick_device(args.gpu);
    config.train.device = device.clone();
    config.train.verbose = config.train.verbose || args.verbose;

    let x_reco = io::read_matrix(&args.reco, &device)?;
    let x_hard = match args.hard.as_ref() {
        Some(path) => io::read_matrix(path, &device)?,
        None => {
            let dims_hard = match config.model {
                ModelKind::Inn if config.flow.dims_in == 0 => {
                    anyhow::bail!("without --hard the configuration must set flow.dims_in")
                }
                ModelKind::Inn => config.flow.dims_in,
                ModelKind::Classifier => config.flow.dims_in.max(1),
            };
            Tensor::zeros((x_reco.dim(0)?, dims_hard), DType::F32, &device)?
        }
    };
    let label = match args.label.as_ref() {
        Some(path) => Some(io::read_matrix(path, &device)?),
        None => None,
    };

    config.flow.dims_in = x_hard.dim(1)?;
    config.flow.dims_c = x_reco.dim(1)?;
    config.classifier.dims_in = x_reco.dim(1)?;

    Ok(LoadedData {
        config,
        x_hard,
        x_reco,
        label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predict_runs_without_hard_level_data() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("run.json");
        let mut config = RunConfig::default();
        config.flow.dims_in = 3;
        config.to_json_file(&config_path)?;
        let reco_path = dir.path().join("reco.tsv");
        std::fs::write(&reco_path, "0.5\t1\n2\t-1\n0\t0\n1\t1\n")?;

        let cli = Cli::try_parse_from([
            "candle-flow",
            "predict",
            "--config",
            config_path.to_str().unwrap_or_default(),
            "--reco",
            reco_path.to_str().unwrap_or_default(),
            "--out",
            dir.path().to_str().unwrap_or_default(),
            "-p",
            "unfolded",
        ])?;
        let Commands::Predict(args) = cli.command else {
            anyhow::bail!("parsed the wrong subcommand");
        };
        assert!(args.data.hard.is_none());

        let loaded = load_data(&args.data)?;
        assert_eq!(loaded.x_hard.dims(), &[4, 3]);
        assert_eq!(loaded.config.flow.dims_in, 3);
        assert_eq!(loaded.config.flow.dims_c, 2);
        Ok(())
    }

    #[test]
    fn flow_without_hard_width_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("run.json");
        RunConfig::default().to_json_file(&config_path)?;
        let reco_path = dir.path().join("reco.tsv");
        std::fs::write(&reco_path, "0.5\t1\n")?;

        let args = DataArgs {
            config: config_path,
            hard: None,
            reco: reco_path,
            label: None,
            out: dir.path().to_path_buf(),
            gpu: false,
            verbose: false,
        };
        assert!(load_data(&args).is_err());
        Ok(())
    }
}
