pub mod cli;
pub mod cmd;
pub mod config;
pub mod configure;
pub mod device;
pub mod error;
pub mod fetch;
pub mod install;
pub mod luks;
pub mod mkfs;
pub mod mount;
pub mod partition;
pub mod pipeline;
pub mod poll;
pub mod state;
pub mod validate;

use anyhow::Result;
use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use crate::{config::InstallConfig, pipeline::Pipeline, state::PipelineState};

pub async fn run() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Cli::parse();

    let config = match &args.config {
        Some(path) => InstallConfig::load(path).await?,
        None => InstallConfig::default(),
    };

    match args.command {
        cli::Command::Run(run_options) => {
            Pipeline::new(config, run_options).run().await?;
        }
        cli::Command::Reset(_) => {
            let state_file = config.state_file();
            if PipelineState::reset(&state_file).await? {
                tracing::info!(file = %state_file.display(), "pipeline state cleared");
            } else {
                tracing::info!("no pipeline state to clear");
            }
        }
    }

    Ok(())
}
