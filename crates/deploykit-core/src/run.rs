//! End-to-end verification run
//!
//! Creates a deployment state, optionally applies terraform, discovers the
//! instances from terraform outputs and verifies each one in turn. The state
//! file is saved whenever the run stops, so the deployment can always be
//! cleaned up afterwards.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deploykit_exec::{RemoteExecutor, SshExecutor};
use deploykit_state::{DeploymentState, StateError, TestStatus};
use tracing::{Instrument, error, info, warn};

use crate::cleanup::{CleanupOptions, CleanupReport, Confirm, cleanup};
use crate::config::SshConfig;
use crate::discovery::{Instance, discover_mig_members, identify_instances, mig_groups};
use crate::error::{MigError, RunError, VerifyError};
use crate::logging::{deployment_span, host_span};
use crate::mig::MigLister;
use crate::server_types::ServerTypes;
use crate::terraform::{Provisioner, extract_provider_variant};
use crate::verify::{InstanceReport, verify_instance};

/// Step recorded after apply
pub const STEP_APPLY: &str = "terraform_apply";
/// Step recorded after reading outputs
pub const STEP_OUTPUTS: &str = "get_outputs";
/// Step recorded after instance discovery
pub const STEP_IDENTIFY: &str = "identify_instances";
/// Step recorded after verifying instances
pub const STEP_VERIFY: &str = "cloud_init_verification";

/// Builds the executor used to reach an instance
pub trait ExecutorFactory: Send + Sync {
    fn executor_for(&self, instance: &Instance) -> Arc<dyn RemoteExecutor>;
}

/// SSH executors built from the shared SSH settings
#[derive(Debug, Clone)]
pub struct SshExecutorFactory {
    ssh: SshConfig,
}

impl SshExecutorFactory {
    #[must_use]
    pub fn new(ssh: SshConfig) -> Self {
        Self { ssh }
    }
}

impl ExecutorFactory for SshExecutorFactory {
    fn executor_for(&self, instance: &Instance) -> Arc<dyn RemoteExecutor> {
        Arc::new(
            SshExecutor::new(self.ssh.target(&instance.host))
                .with_jump_host(instance.jump_host.clone()),
        )
    }
}

/// What a verification run does
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub terraform_dir: PathBuf,
    /// Run `terraform apply` first
    pub deploy: bool,
    /// Destroy the deployment when every instance passed (only if deployed)
    pub cleanup_on_success: bool,
    pub var_file: Option<PathBuf>,
    /// Directory the state file is written to
    pub state_dir: PathBuf,
    /// Pause between apply and the first check
    pub init_wait: Duration,
    /// Services each server type must run
    pub server_types: ServerTypes,
    /// Project for managed instance group listing when the outputs name none
    pub gcp_project: Option<String>,
}

impl VerifyOptions {
    /// Verify an existing deployment in `terraform_dir`
    pub fn new(terraform_dir: impl Into<PathBuf>) -> Self {
        Self {
            terraform_dir: terraform_dir.into(),
            deploy: false,
            cleanup_on_success: false,
            var_file: None,
            state_dir: PathBuf::from("."),
            init_wait: Duration::from_secs(30),
            server_types: ServerTypes::default(),
            gcp_project: None,
        }
    }
}

/// Verification result for one instance
#[derive(Debug)]
pub struct InstanceOutcome {
    pub instance: Instance,
    pub result: Result<InstanceReport, VerifyError>,
}

impl InstanceOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.result.as_ref().is_ok_and(|r| r.success)
    }
}

/// Result of a run that got as far as verifying instances
#[derive(Debug)]
pub struct VerifyOutcome {
    pub state: DeploymentState,
    pub state_file: PathBuf,
    pub instances: Vec<InstanceOutcome>,
    /// Every instance passed
    pub success: bool,
    /// Present when cleanup ran
    pub cleanup: Option<CleanupReport>,
    pub duration: Duration,
}

/// One verification run
pub struct VerifyRun<'a> {
    provisioner: &'a dyn Provisioner,
    executors: &'a dyn ExecutorFactory,
    migs: Option<&'a dyn MigLister>,
    options: VerifyOptions,
}

/// Never agrees; unattended cleanup only destroys what this run applied
struct Unattended;

#[async_trait]
impl Confirm for Unattended {
    async fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

impl<'a> VerifyRun<'a> {
    pub fn new(
        provisioner: &'a dyn Provisioner,
        executors: &'a dyn ExecutorFactory,
        options: VerifyOptions,
    ) -> Self {
        Self {
            provisioner,
            executors,
            migs: None,
            options,
        }
    }

    /// List GCP managed instance group members with `lister`
    #[must_use]
    pub fn with_mig_lister(mut self, lister: &'a dyn MigLister) -> Self {
        self.migs = Some(lister);
        self
    }

    /// Run every phase
    ///
    /// # Errors
    /// Returns `RunError` if the run stopped before verification. Failed
    /// instances are not an error; see [`VerifyOutcome::success`].
    pub async fn execute(&self) -> Result<VerifyOutcome, RunError> {
        let started = Instant::now();
        let (provider, variant) = extract_provider_variant(&self.options.terraform_dir);
        let state = DeploymentState::create(
            &self.options.terraform_dir,
            &provider,
            &variant,
            self.options.deploy,
        );

        info!(
            %provider,
            %variant,
            dir = %self.options.terraform_dir.display(),
            "starting verification run"
        );

        let span = deployment_span(&state.deployment_id);
        self.phases(state, started).instrument(span).await
    }

    async fn phases(
        &self,
        mut state: DeploymentState,
        started: Instant,
    ) -> Result<VerifyOutcome, RunError> {
        let dir = self.options.terraform_dir.as_path();

        if self.options.deploy {
            info!("running terraform apply");
            if let Err(source) = self
                .provisioner
                .apply(dir, self.options.var_file.as_deref(), true)
                .await
            {
                error!(error = %source, "terraform apply failed");
                let state_file = self.record_failure(&mut state, STEP_APPLY)?;
                return Err(RunError::Apply { source, state_file });
            }

            info!(
                seconds = self.options.init_wait.as_secs(),
                "waiting for instances to initialize"
            );
            tokio::time::sleep(self.options.init_wait).await;
        }

        let outputs = match self.provisioner.outputs(dir).await {
            Ok(outputs) => outputs,
            Err(source) => {
                error!(error = %source, "failed to get terraform outputs");
                let state_file = self.record_failure(&mut state, STEP_OUTPUTS)?;
                return Err(RunError::Outputs { source, state_file });
            }
        };
        info!(count = outputs.len(), "retrieved terraform outputs");
        state.record_outputs(outputs);

        let mut instances = identify_instances(&state.terraform.outputs);
        if state.provider == "gcp" {
            let members = self.mig_members(&state, &instances).await;
            match members {
                Ok(members) => instances.extend(members),
                Err(source) => {
                    error!(error = %source, "failed to list managed instance group members");
                    let state_file = self.record_failure(&mut state, STEP_IDENTIFY)?;
                    return Err(RunError::Discovery { source, state_file });
                }
            }
        }
        if instances.is_empty() {
            error!("no instances found in terraform outputs");
            let state_file = self.record_failure(&mut state, STEP_IDENTIFY)?;
            return Err(RunError::NoInstances { state_file });
        }
        info!(count = instances.len(), "found instances to verify");

        let mut outcomes = Vec::with_capacity(instances.len());
        for instance in instances {
            let outcome = self.verify(instance, &state.provider).await;
            outcomes.push(outcome);
        }

        let success = outcomes.iter().all(InstanceOutcome::passed);
        let duration = started.elapsed();
        let status = if success {
            TestStatus::Success
        } else {
            TestStatus::Failed
        };
        state.update_test_results(status, Some(STEP_VERIFY), Some(duration.as_secs_f64()));

        let state_file = deploykit_state::save_in(&state, &self.options.state_dir)?;

        let passed = outcomes.iter().filter(|o| o.passed()).count();
        info!(
            total = outcomes.len(),
            passed,
            failed = outcomes.len() - passed,
            duration_secs = duration.as_secs_f64(),
            state_file = %state_file.display(),
            "verification finished"
        );

        let cleanup = if success && self.options.deploy && self.options.cleanup_on_success {
            info!("tests passed, cleaning up as requested");
            let options = CleanupOptions {
                destroy_terraform: true,
                auto_approve: true,
            };
            Some(cleanup(&state_file, self.provisioner, options, &Unattended).await)
        } else {
            if success {
                info!("deployment left running");
            } else {
                warn!("tests failed, deployment left running for debugging");
            }
            info!(
                "to clean up later: deploykit cleanup --state-file {}{}",
                state_file.display(),
                if self.options.deploy {
                    " --destroy-terraform"
                } else {
                    ""
                }
            );
            None
        };

        Ok(VerifyOutcome {
            state,
            state_file,
            instances: outcomes,
            success,
            cleanup,
            duration,
        })
    }

    async fn mig_members(
        &self,
        state: &DeploymentState,
        known: &[Instance],
    ) -> Result<Vec<Instance>, MigError> {
        let Some(lister) = self.migs else {
            if !mig_groups(&state.terraform.outputs).is_empty() {
                warn!("managed instance groups in outputs but no lister, members not verified");
            }
            return Ok(Vec::new());
        };

        discover_mig_members(
            lister,
            &state.terraform.outputs,
            self.options.gcp_project.as_deref(),
            known,
        )
        .await
    }

    async fn verify(&self, instance: Instance, provider: &str) -> InstanceOutcome {
        let span = host_span(&instance.role, &instance.host);
        let executor = self.executors.executor_for(&instance);

        let result = async {
            match &instance.jump_host {
                Some(jump) => info!(jump_host = %jump, "testing instance via jump host"),
                None => info!("testing instance"),
            }

            let expected = self.options.server_types.expectations(&instance.role, provider);
            let result =
                verify_instance(executor.as_ref(), &instance.role, provider, &expected).await;
            match &result {
                Ok(report) if report.success => info!("all checks passed"),
                Ok(_) => warn!("verification failed: no services online"),
                Err(e) => error!(error = %e, "verification failed"),
            }
            result
        }
        .instrument(span)
        .await;

        InstanceOutcome { instance, result }
    }

    fn record_failure(
        &self,
        state: &mut DeploymentState,
        step: &str,
    ) -> Result<PathBuf, StateError> {
        state.update_test_results(TestStatus::Failed, Some(step), None);
        let path = deploykit_state::save_in(state, &self.options.state_dir)?;
        info!(state_file = %path.display(), "state file saved");
        Ok(path)
    }
}
