//! deploykit-state: Durable per-deployment state files
//!
//! Tracks what a test run created (terraform outputs, DNS records,
//! certificates, API resources, credentials) and how far it got, so a later
//! cleanup can find and tear it down.

pub mod error;
pub mod state;
pub mod store;

pub use error::StateError;
pub use state::{
    ArtifactCategory, ArtifactData, Artifacts, DeploymentState, TerraformRecord, TestResults,
    TestStatus,
};
pub use store::{delete, list_all, load, save, save_in, state_file_name};
