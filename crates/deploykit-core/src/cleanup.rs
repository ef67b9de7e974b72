//! Deployment cleanup
//!
//! Cleanup is partial: DNS records and API resources have no remover yet and
//! are only reported. The state file is deleted only when every requested
//! action succeeded, so an incomplete cleanup can be re-run against the same
//! file.

use std::path::Path;

use async_trait::async_trait;
use deploykit_state::{ArtifactCategory, DeploymentState};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{Instrument, error, info, warn};

use crate::logging::deployment_span;
use crate::terraform::Provisioner;

/// What a cleanup run may do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Run `terraform destroy` in the recorded directory
    pub destroy_terraform: bool,
    /// Destroy without asking, even for infrastructure this tool did not apply
    pub auto_approve: bool,
}

/// Asks the operator a yes/no question
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Prompts on stdout and reads the answer from stdin; only `y`/`yes` agree
///
/// Reads through tokio's stdin, which does the blocking read off the runtime
/// workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        ask(BufReader::new(tokio::io::stdin()), &mut stdout, prompt).await
    }
}

/// Write `prompt`, read one line; end of input or an I/O error is a no
async fn ask<R, W>(mut reader: R, writer: &mut W, prompt: &str) -> bool
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let question = format!("{prompt} [y/N]: ");
    if writer.write_all(question.as_bytes()).await.is_err() {
        return false;
    }
    let _ = writer.flush().await;

    let mut answer = String::new();
    match reader.read_line(&mut answer).await {
        Ok(0) | Err(_) => false,
        Ok(_) => is_yes(&answer),
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Outcome of [`cleanup`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Every requested action succeeded
    pub success: bool,
    pub state_file_deleted: bool,
    /// Things the operator has to look at or do by hand
    pub warnings: Vec<String>,
}

impl CleanupReport {
    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.warnings.push(message);
        self.success = false;
    }
}

/// Clean up the deployment recorded in `state_file`
///
/// `provisioner` must already carry the provider credentials.
pub async fn cleanup(
    state_file: &Path,
    provisioner: &dyn Provisioner,
    options: CleanupOptions,
    confirm: &dyn Confirm,
) -> CleanupReport {
    let mut report = CleanupReport {
        success: true,
        ..CleanupReport::default()
    };

    let state = match deploykit_state::load(state_file) {
        Ok(state) => state,
        Err(e) => {
            report.fail(format!("failed to load state file: {e}"));
            return report;
        }
    };

    let span = deployment_span(&state.deployment_id);
    finish(state_file, &state, provisioner, options, confirm, report)
        .instrument(span)
        .await
}

async fn finish(
    state_file: &Path,
    state: &DeploymentState,
    provisioner: &dyn Provisioner,
    options: CleanupOptions,
    confirm: &dyn Confirm,
    mut report: CleanupReport,
) -> CleanupReport {
    info!(
        state_file = %state_file.display(),
        provider = %state.provider,
        variant = %state.variant,
        timestamp = %state.timestamp,
        "loaded deployment state"
    );

    report_unremovable(state, &mut report);

    if options.destroy_terraform {
        destroy(state, provisioner, options, confirm, &mut report).await;
    }

    if report.success {
        info!(state_file = %state_file.display(), "deleting state file");
        if deploykit_state::delete(state_file) {
            report.state_file_deleted = true;
        } else {
            report.fail(format!(
                "failed to delete state file {}",
                state_file.display()
            ));
        }
    }

    if report.success {
        info!("cleanup completed successfully");
    } else {
        warn!("cleanup completed with warnings or errors");
    }
    report
}

fn report_unremovable(state: &DeploymentState, report: &mut CleanupReport) {
    for category in [ArtifactCategory::DnsRecords, ArtifactCategory::ApiResources] {
        let entries = state.artifacts.list(category);
        if entries.is_empty() {
            continue;
        }
        for entry in entries {
            info!(%category, artifact = %serde_json::Value::Object(entry.clone()), "would remove");
        }
        report.warn(format!(
            "{category}: {} not removed automatically, delete manually if needed",
            entries.len()
        ));
    }

    let certificates = state.artifacts.list(ArtifactCategory::TlsCertificates);
    if !certificates.is_empty() {
        info!(
            count = certificates.len(),
            "TLS certificates expire on their own (90 days), no action needed"
        );
    }
}

async fn destroy(
    state: &DeploymentState,
    provisioner: &dyn Provisioner,
    options: CleanupOptions,
    confirm: &dyn Confirm,
    report: &mut CleanupReport,
) {
    if state.terraform_dir.as_os_str().is_empty() {
        report.fail("no terraform_dir in state file");
        return;
    }
    let dir = state.terraform_dir.as_path();

    let mut auto_approve = options.auto_approve;
    if !state.terraform.applied_by_script && !auto_approve {
        warn!(
            dir = %dir.display(),
            "terraform was not applied by deploykit"
        );
        if !confirm.confirm("Continue with terraform destroy?").await {
            report.fail("terraform destroy skipped: not confirmed");
            return;
        }
        auto_approve = true;
    }

    info!(dir = %dir.display(), "running terraform destroy");
    if let Err(e) = provisioner.destroy(dir, None, auto_approve).await {
        report.fail(format!("terraform destroy failed: {e}"));
    }
}
