//! deploykit-core: Orchestration around the executor and state tracker
//!
//! Configuration, logging setup, the terraform and gcloud wrappers, instance
//! discovery and verification, the cleanup workflow and the end-to-end
//! verification run.

pub mod cleanup;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod logging;
pub mod mig;
pub mod run;
pub mod server_types;
pub mod terraform;
pub mod verify;

pub use cleanup::{CleanupOptions, CleanupReport, Confirm, StdinConfirm, cleanup};
pub use config::{Config, SshConfig, TerraformConfig, TestingConfig};
pub use discovery::{
    Instance, MigGroup, discover_mig_members, gcp_project, identify_instances, mig_groups,
};
pub use domain::{extract_base_domain, extract_subdomain};
pub use error::{ConfigError, LoggingError, MigError, RunError, TerraformError, VerifyError};
pub use logging::{LogFormat, LogGuard, LogOptions};
pub use mig::{Gcloud, MigLister, MigMember};
pub use run::{
    ExecutorFactory, InstanceOutcome, SshExecutorFactory, VerifyOptions, VerifyOutcome, VerifyRun,
};
pub use server_types::{ServerType, ServerTypes, StartupCheck};
pub use terraform::{Provisioner, Terraform, extract_provider_variant, provider_env};
pub use verify::{
    InstanceReport, ServiceExpectations, ServiceStatus, UnitStatus, verify_instance,
    verify_services, verify_startup, verify_startup_check, verify_systemd_services,
};
