use std::process::ExitCode;

use color_eyre::Result;
use deploykit_core::Config;
use deploykit_state::{DeploymentState, TestStatus};

use crate::cli::ListArgs;

pub fn run(args: ListArgs, config: &Config) -> Result<ExitCode> {
    let dir = args
        .state_dir
        .unwrap_or_else(|| config.testing.state_dir.clone());
    let deployments = deploykit_state::list_all(&dir)?;

    if deployments.is_empty() {
        println!("No active test deployments found.");
        println!();
        println!(
            "Searched in: {}",
            std::path::absolute(&dir).unwrap_or(dir).display()
        );
        println!("State files have pattern: .test-state-*.yaml");
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    println!("Active Test Deployments:");
    println!();

    let header = format!(
        "{:<35} {:<20} {:<12} {:<10} Cleanup Command",
        "Deployment ID", "Timestamp", "Provider", "Status"
    );
    println!("{header}");
    println!("{}", "─".repeat(header.chars().count()));

    for deployment in &deployments {
        println!("{}", row(deployment, &dir));
    }

    println!();
    println!("Total: {} deployment(s)", deployments.len());
    println!();
    println!("To clean up a deployment:");
    println!("  deploykit cleanup --state-file <state file> [--destroy-terraform]");
    println!();

    Ok(ExitCode::SUCCESS)
}

fn row(deployment: &DeploymentState, dir: &std::path::Path) -> String {
    let state_file = deployment
        .source_file
        .as_deref()
        .map_or_else(|| "unknown".to_string(), |name| dir.join(name).display().to_string());

    format!(
        "{:<35} {:<20} {:<12} {:<10} deploykit cleanup --state-file {}",
        truncate(&deployment.deployment_id, 34),
        deployment.timestamp.format("%Y-%m-%d %H:%M:%S"),
        truncate(&deployment.provider, 11),
        status_label(deployment.test_results.status),
        state_file
    )
}

fn status_label(status: TestStatus) -> String {
    match status {
        TestStatus::Success => format!("✓ {status}"),
        TestStatus::Failed => format!("✗ {status}"),
        _ => format!("  {status}"),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
