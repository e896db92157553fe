use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edge_vision_agent::agent::{write_crash_report, Agent};
use edge_vision_agent::AgentConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the data directory from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let mut config = match AgentConfig::load(&args.config)
        .with_context(|| format!("loading config from {:?}", args.config))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = Some(data_dir);
    }
    let level = args.log_level.unwrap_or_else(|| config.log_level.clone());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "edge-vision-agent starting"
    );

    let state_dir = config.state_dir();
    match Agent::new(config).run().await {
        Ok(code) => {
            info!(code, "exit");
            ExitCode::from(code as u8)
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal error");
            write_crash_report(&state_dir, &format!("{e:#}"));
            ExitCode::from(1)
        }
    }
}
