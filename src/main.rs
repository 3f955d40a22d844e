use clap::Parser;
use forecast_pipeline::cli::{Cli, Commands};
use tracing::error;

mod main_runtime;

use main_runtime::{init_logging, load_config, run_migrations, run_pipeline, run_replay, run_resolution};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config_dir)?;
    init_logging(&config.logging);

    let result = match &cli.command {
        Commands::Run(args) => run_pipeline(&config, args).await,
        Commands::Replay(args) => run_replay(&config, args).await,
        Commands::Resolve(args) => run_resolution(&config, args).await,
        Commands::Migrate => run_migrations(&config).await,
    };

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}
