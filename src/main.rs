//! CLI entry point for grabia.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error};

mod app;
mod cli;

use app::config::{FileConfig, load_config};
use app::exit::ProcessExit;
use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // The config file may set verbosity, so it is read before tracing starts.
    let loaded = load_config(cli.config.as_deref());
    let verbosity = loaded.as_ref().ok().and_then(|cfg| cfg.verbosity);
    init_tracing(&log_level(cli.quiet, cli.verbose, verbosity));

    match run(&cli, loaded).await {
        Ok(exit) => exit.into(),
        Err(err) => {
            error!("{err:#}");
            ProcessExit::Failure.into()
        }
    }
}

async fn run(cli: &Cli, loaded: Result<FileConfig>) -> Result<ProcessExit> {
    let file_config = loaded?;
    debug!(?cli, "CLI arguments parsed");
    app::run(cli, &file_config).await
}

/// Priority: `RUST_LOG` (applied in [`init_tracing`]) > quiet flag > verbose
/// flag > config verbosity > info.
fn log_level(quiet: bool, verbose: u8, config: Option<app::config::VerbositySetting>) -> String {
    if quiet {
        return "error".to_string();
    }
    match verbose {
        0 => config.map_or("info", |v| v.level()).to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
