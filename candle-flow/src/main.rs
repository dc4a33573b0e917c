use anyhow::Result;
use candle_flow::cli::{predict, train, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => {
            train::run(args)?;
        }
        Commands::Predict(args) => {
            predict::run(args)?;
        }
    }

    Ok(())
}
