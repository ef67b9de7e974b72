use std::process::ExitCode;

use color_eyre::Result;
use deploykit_core::{CleanupOptions, Config, StdinConfirm, Terraform, cleanup, provider_env};
use tracing::warn;

use super::exit_status;
use crate::cli::CleanupArgs;

pub async fn run(args: CleanupArgs, config: &Config) -> Result<ExitCode> {
    // Credentials are only needed for destroy; a state file that does not
    // load is reported by the cleanup itself
    let env = match deploykit_state::load(&args.state_file) {
        Ok(state) if args.destroy_terraform => provider_env(&state.provider, &config.terraform)
            .unwrap_or_else(|e| {
                warn!(error = %e, "continuing without provider credentials");
                Vec::new()
            }),
        _ => Vec::new(),
    };
    let terraform = Terraform::new(env);

    let options = CleanupOptions {
        destroy_terraform: args.destroy_terraform,
        auto_approve: args.auto_approve,
    };
    let report = cleanup(&args.state_file, &terraform, options, &StdinConfirm).await;

    println!();
    if !report.warnings.is_empty() {
        println!("Needs attention:");
        for warning in &report.warnings {
            println!("  - {warning}");
        }
        println!();
    }
    if report.success {
        println!("Cleanup completed successfully");
    } else {
        println!("Cleanup completed with warnings or errors");
        if !report.state_file_deleted {
            println!("State file kept: {}", args.state_file.display());
        }
    }

    Ok(exit_status(report.success))
}
