use std::process::ExitCode;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::bail;
use deploykit_core::{
    Config, Gcloud, InstanceOutcome, ServerTypes, SshExecutorFactory, Terraform, VerifyOptions,
    VerifyOutcome, VerifyRun, extract_provider_variant, provider_env,
};
use tracing::{error, info};

use super::exit_status;
use crate::cli::VerifyArgs;

pub async fn run(args: VerifyArgs, config: &Config) -> Result<ExitCode> {
    if !args.terraform_dir.is_dir() {
        bail!(
            "terraform directory not found: {}",
            args.terraform_dir.display()
        );
    }

    let (provider, variant) = extract_provider_variant(&args.terraform_dir);
    info!(
        %provider,
        %variant,
        deploy = args.deploy,
        cleanup_on_success = args.cleanup_on_success,
        "cloud-init verification"
    );

    let env = provider_env(&provider, &config.terraform)?;
    let gcloud = Gcloud::new(env.clone());
    let terraform = Terraform::new(env);
    let executors = SshExecutorFactory::new(config.ssh.clone());
    let server_types = ServerTypes::load_or_default(&config.testing.server_types_file)?;
    let deploy = args.deploy;
    let options = VerifyOptions {
        terraform_dir: args.terraform_dir,
        deploy,
        cleanup_on_success: args.cleanup_on_success,
        var_file: args.var_file,
        state_dir: config.testing.state_dir.clone(),
        init_wait: Duration::from_secs(config.testing.init_wait_seconds),
        server_types,
        gcp_project: config
            .terraform
            .gcp
            .as_ref()
            .and_then(|gcp| gcp.project.clone()),
    };

    let run = VerifyRun::new(&terraform, &executors, options).with_mig_lister(&gcloud);
    match run.execute().await {
        Ok(outcome) => {
            print_summary(&outcome);
            Ok(exit_status(outcome.success))
        }
        Err(e) => {
            error!(error = %e, "verification run stopped");
            if let Some(state_file) = e.state_file() {
                eprintln!();
                eprintln!("To clean up this deployment:");
                eprintln!(
                    "  deploykit cleanup --state-file {}{}",
                    state_file.display(),
                    if deploy { " --destroy-terraform" } else { "" }
                );
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_summary(outcome: &VerifyOutcome) {
    println!();
    println!("{:<20} {:<32} Result", "Instance", "Host");
    println!("{}", "─".repeat(72));
    for instance in &outcome.instances {
        println!(
            "{:<20} {:<32} {}",
            instance.instance.role,
            host_label(instance),
            result_label(instance)
        );
    }

    let passed = outcome.instances.iter().filter(|i| i.passed()).count();
    println!();
    println!(
        "Total: {}  Passed: {}  Failed: {}  Duration: {:.1}s",
        outcome.instances.len(),
        passed,
        outcome.instances.len() - passed,
        outcome.duration.as_secs_f64()
    );
    println!("State file: {}", outcome.state_file.display());

    if let Some(cleanup) = &outcome.cleanup {
        if cleanup.success {
            println!("Cleanup: done");
        } else {
            println!("Cleanup: incomplete, state file kept");
        }
    }
    println!();
}

fn host_label(instance: &InstanceOutcome) -> String {
    match &instance.instance.jump_host {
        Some(jump) => format!("{} (via {jump})", instance.instance.host),
        None => instance.instance.host.clone(),
    }
}

fn result_label(instance: &InstanceOutcome) -> String {
    match &instance.result {
        Ok(report) => {
            let mark = if report.success { '✓' } else { '✗' };
            let online = report.online_services().count();
            let units = if report.units.is_empty() {
                String::new()
            } else {
                let active = report.active_units().count();
                format!(", {active}/{} units active", report.units.len())
            };
            format!("{mark} {online}/{} services online{units}", report.services.len())
        }
        Err(e) => format!("✗ {e}"),
    }
}
