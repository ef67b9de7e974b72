//! deploykit CLI
//!
//! Runs remote commands, verifies deployments and cleans them up again

mod cli;
mod commands;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::Result;
use deploykit_core::{Config, ConfigError, LogOptions, logging};
use tracing::warn;

use crate::cli::{Cli, Commands};

/// Exit status after Ctrl-C, as shells report SIGINT
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // list and cleanup work without a usable config; exec and verify do not
    let (config, config_error) = match load_config(cli.config.as_deref()) {
        Ok(config) => (config, None),
        Err(e) if matches!(cli.command, Commands::List(_) | Commands::Cleanup(_)) => {
            (Config::default(), Some(e))
        }
        Err(e) => return Err(e.into()),
    };

    let mut log_options =
        LogOptions::from_config(&config, cli.log_level.as_deref(), cli.log_format);
    if matches!(cli.command, Commands::Verify(_)) {
        log_options = log_options.with_log_file(&config.testing.log_file);
    }
    let guard = logging::init(&log_options)?;

    if let Some(e) = config_error {
        warn!(error = %e, "could not load config, using defaults");
    }

    // The command runs on its own task so Ctrl-C is seen even while it
    // waits on a confirmation prompt
    let work = tokio::spawn(commands::dispatch(cli.command, config));

    tokio::select! {
        joined = work => {
            let code = joined??;
            if let Some(path) = guard.log_file() {
                println!("Log file: {}", path.display());
            }
            drop(guard);
            Ok(code)
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted by user");
            drop(guard);
            std::process::exit(EXIT_INTERRUPTED);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
}
