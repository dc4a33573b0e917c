use super::io::write_matrix;
use super::{load_data, DataArgs};
use crate::candle_prediction::DrawRepetitions;
use crate::config::ModelKind;
use crate::unfolding::*;

use candle_core::Tensor;
use clap::Args;
use log::info;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(long, default_value = "best", help = "Checkpoint name")]
    pub checkpoint: String,

    #[arg(long, help = "Use parameter averages stored with the checkpoint")]
    pub ema: bool,

    #[arg(long, help = "Also write several samples per event for the first batches")]
    pub distribution: bool,

    #[arg(
        long,
        help = "Also train a classifier telling truth from unfolded test events (needs --hard)"
    )]
    pub classifier_test: bool,

    #[arg(
        short = 'p',
        long,
        help = "Output prefix (creates {prefix}.unfolded.{r}.tsv.gz, etc.)"
    )]
    pub prefix: PathBuf,
}

/// `draws x n x 1` probabilities as one column per posterior draw
fn draws_as_columns(probs: Tensor) -> anyhow::Result<Tensor> {
    if probs.rank() == 3 {
        Ok(probs.squeeze(2)?.t()?)
    } else {
        Ok(probs)
    }
}

fn output_path(prefix: &std::path::Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", prefix.to_string_lossy(), suffix))
}

pub fn run(args: &PredictArgs) -> anyhow::Result<()> {
    if args.classifier_test && args.data.hard.is_none() {
        anyhow::bail!("the classifier test needs --hard");
    }
    let loaded = load_data(&args.data)?;
    let config = loaded.config;
    let device = config.train.device.clone();
    let process = TabularProcess::new(loaded.x_hard, loaded.x_reco, config.split)?;

    match config.model {
        ModelKind::Inn => {
            let hard_pp = Box::new(Standardize::new(config.flow.dims_in, &device)?);
            let reco_pp = Box::new(Standardize::new(config.flow.dims_c, &device)?);
            let mut unfolding =
                GenerativeUnfolding::new(&config, process, hard_pp, reco_pp, &args.data.out)?;
            unfolding.load(&args.checkpoint)?;
            if args.ema {
                unfolding.trainer().apply_ema()?;
            }

            let prediction = unfolding.predict()?;
            let mut r = 0;
            for (i, draw) in prediction.draws.iter().enumerate() {
                let tag = match draw.repetitions {
                    DrawRepetitions::MapAndRepeated(n) => format!("fixed weights x {}", n),
                    DrawRepetitions::SingleDraw => "posterior draw".to_string(),
                };
                info!("draw {}: {}", i, tag);
                for rep in 0..draw.repetitions.count() {
                    let path = output_path(&args.prefix, &format!("unfolded.{}.tsv.gz", r));
                    write_matrix(&draw.samples.get(rep)?, &path)?;
                    r += 1;
                }
            }
            info!("Wrote {} unfolded sample set(s)", r);

            if args.distribution {
                let samples = unfolding.predict_distribution()?;
                let d = samples.dims().last().copied().unwrap_or(0);
                let path = output_path(&args.prefix, "distribution.tsv.gz");
                write_matrix(&samples.reshape(((), d))?, &path)?;
                info!("Wrote per-event samples {:?} to {}", samples.dims(), path.display());
            }

            if args.classifier_test {
                let mut classifier_test = unfolding.classifier_test(&config.classifier_test)?;
                classifier_test.init_data_loaders()?;
                classifier_test.train()?;
                let probs = draws_as_columns(classifier_test.predict_probs(Split::Test)?)?;
                // label, then one probability column per draw
                let table = Tensor::cat(&[&classifier_test.labels(Split::Test)?, &probs], 1)?;
                let path = output_path(&args.prefix, "classifier_test.tsv.gz");
                write_matrix(&table, &path)?;
                info!("Wrote classifier test {:?} to {}", table.dims(), path.display());
            }
        }
        ModelKind::Classifier => {
            let process = match loaded.label {
                Some(label) => process.with_label(label)?,
                None => process,
            };
            let reco_pp = Box::new(Standardize::new(config.classifier.dims_in, &device)?);
            let mut omnifold = Omnifold::new(&config, process, reco_pp, &args.data.out)?;
            omnifold.load(&args.checkpoint)?;
            if args.ema {
                omnifold.trainer().apply_ema()?;
            }

            let probs = draws_as_columns(omnifold.predict_probs()?)?;
            let path = output_path(&args.prefix, "probs.tsv.gz");
            write_matrix(&probs, &path)?;
            info!("Wrote probabilities {:?} to {}", probs.dims(), path.display());
        }
    }
    Ok(())
}
