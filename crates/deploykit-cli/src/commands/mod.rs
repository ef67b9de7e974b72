//! Subcommand implementations

mod cleanup;
mod exec;
mod list;
mod verify;

use std::process::ExitCode;

use color_eyre::Result;
use deploykit_core::Config;

use crate::cli::Commands;

pub async fn dispatch(command: Commands, config: Config) -> Result<ExitCode> {
    match command {
        Commands::Exec(args) => exec::run(args, &config).await,
        Commands::Verify(args) => verify::run(args, &config).await,
        Commands::List(args) => list::run(args, &config),
        Commands::Cleanup(args) => cleanup::run(args, &config).await,
    }
}

fn exit_status(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
