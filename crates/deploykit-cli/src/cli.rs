use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use deploykit_core::LogFormat;

#[derive(Parser)]
#[command(name = "deploykit")]
#[command(about = "Deploy, verify and clean up cloud test deployments", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: $DEPLOYKIT_CONFIG, ./config.yaml, then the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (e.g. debug, info, warn)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Override console log format: pretty, json or compact
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one command on a remote host
    Exec(ExecArgs),
    /// Verify a deployment, optionally applying terraform first
    Verify(VerifyArgs),
    /// List recorded deployments
    List(ListArgs),
    /// Clean up a recorded deployment
    Cleanup(CleanupArgs),
}

#[derive(Args)]
pub struct ExecArgs {
    /// Host to run the command on
    #[arg(long, required_unless_present = "ssh_command", conflicts_with = "ssh_command")]
    pub host: Option<String>,

    /// Relay through this host
    #[arg(long, requires = "host")]
    pub jump_host: Option<String>,

    /// Take host, user, key and jump host from an `ssh ...` command line
    #[arg(long)]
    pub ssh_command: Option<String>,

    /// Command timeout in seconds (default: ssh.timeout)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Command to run, after `--`
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct VerifyArgs {
    /// Terraform directory, e.g. ./gcp/provision-vm-mig
    #[arg(long)]
    pub terraform_dir: PathBuf,

    /// Run terraform apply before verifying
    #[arg(long)]
    pub deploy: bool,

    /// Destroy the deployment when every instance passed (only with --deploy)
    #[arg(long, requires = "deploy")]
    pub cleanup_on_success: bool,

    /// Terraform variables file passed to apply
    #[arg(long)]
    pub var_file: Option<PathBuf>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Directory to search for state files (default: testing.state_dir)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// State file to clean up (.test-state-*.yaml)
    #[arg(long)]
    pub state_file: PathBuf,

    /// Also run terraform destroy
    #[arg(long)]
    pub destroy_terraform: bool,

    /// Destroy without asking, even for infrastructure deploykit did not apply
    #[arg(long)]
    pub auto_approve: bool,
}
