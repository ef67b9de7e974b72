//! Deployment state record

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::StateError;

/// One artifact descriptor, e.g. `{name: gcp, type: A, value: 203.0.113.7}`
pub type ArtifactData = serde_json::Map<String, Value>;

/// Kinds of external resources a run can create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    DnsRecords,
    TlsCertificates,
    ApiResources,
    /// Flat mapping, merged instead of appended
    Credentials,
}

impl ArtifactCategory {
    pub const ALL: [ArtifactCategory; 4] = [
        ArtifactCategory::DnsRecords,
        ArtifactCategory::TlsCertificates,
        ArtifactCategory::ApiResources,
        ArtifactCategory::Credentials,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactCategory::DnsRecords => "dns_records",
            ArtifactCategory::TlsCertificates => "tls_certificates",
            ArtifactCategory::ApiResources => "api_resources",
            ArtifactCategory::Credentials => "credentials",
        }
    }
}

impl fmt::Display for ArtifactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactCategory {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| StateError::UnknownCategory(s.to_string()))
    }
}

/// Outcome of the test run recorded in the state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Partial,
}

impl TestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Success => "success",
            TestStatus::Failed => "failed",
            TestStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TestStatus::Pending),
            "success" => Ok(TestStatus::Success),
            "failed" => Ok(TestStatus::Failed),
            "partial" => Ok(TestStatus::Partial),
            _ => Err(StateError::UnknownStatus(s.to_string())),
        }
    }
}

/// What terraform did for this deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerraformRecord {
    /// `apply` was run by our own workflow (and so may be destroyed by it)
    #[serde(default)]
    pub applied_by_script: bool,
    /// Flattened `terraform output` values
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Resources created during the run, by category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default)]
    pub dns_records: Vec<ArtifactData>,
    #[serde(default)]
    pub tls_certificates: Vec<ArtifactData>,
    #[serde(default)]
    pub api_resources: Vec<ArtifactData>,
    #[serde(default)]
    pub credentials: ArtifactData,
}

impl Artifacts {
    /// Entries of a list category; empty for `credentials`
    #[must_use]
    pub fn list(&self, category: ArtifactCategory) -> &[ArtifactData] {
        match category {
            ArtifactCategory::DnsRecords => &self.dns_records,
            ArtifactCategory::TlsCertificates => &self.tls_certificates,
            ArtifactCategory::ApiResources => &self.api_resources,
            ArtifactCategory::Credentials => &[],
        }
    }

    fn list_mut(&mut self, category: ArtifactCategory) -> Option<&mut Vec<ArtifactData>> {
        match category {
            ArtifactCategory::DnsRecords => Some(&mut self.dns_records),
            ArtifactCategory::TlsCertificates => Some(&mut self.tls_certificates),
            ArtifactCategory::ApiResources => Some(&mut self.api_resources),
            ArtifactCategory::Credentials => None,
        }
    }

    /// No artifacts of any category
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dns_records.is_empty()
            && self.tls_certificates.is_empty()
            && self.api_resources.is_empty()
            && self.credentials.is_empty()
    }
}

/// Progress of the verification run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    #[serde(default)]
    pub status: TestStatus,
    /// Completed step names, in completion order, without duplicates
    #[serde(default)]
    pub steps_completed: Vec<String>,
    #[serde(default)]
    pub duration_seconds: f64,
}

/// Durable record of one deployment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    /// `<provider>-<variant>-<YYYYMMDD-HHMMSS>`
    pub deployment_id: String,
    pub timestamp: NaiveDateTime,
    /// Empty when the file did not record one
    #[serde(default)]
    pub terraform_dir: PathBuf,
    pub provider: String,
    pub variant: String,
    #[serde(default)]
    pub terraform: TerraformRecord,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub test_results: TestResults,
    /// File name this state was listed from; never written out
    #[serde(skip)]
    pub source_file: Option<String>,
}

impl DeploymentState {
    /// Start a new state stamped with the current local time
    ///
    /// Nothing is written to disk.
    pub fn create(
        terraform_dir: impl AsRef<Path>,
        provider: &str,
        variant: &str,
        applied_by_script: bool,
    ) -> Self {
        let now = Local::now().naive_local();
        let timestamp = now.with_nanosecond(0).unwrap_or(now);
        Self::create_at(terraform_dir, provider, variant, applied_by_script, timestamp)
    }

    /// Same as [`DeploymentState::create`] with an explicit timestamp
    pub fn create_at(
        terraform_dir: impl AsRef<Path>,
        provider: &str,
        variant: &str,
        applied_by_script: bool,
        timestamp: NaiveDateTime,
    ) -> Self {
        let dir = terraform_dir.as_ref();
        let terraform_dir = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());

        Self {
            deployment_id: deployment_id(provider, variant, timestamp),
            timestamp,
            terraform_dir,
            provider: provider.to_string(),
            variant: variant.to_string(),
            terraform: TerraformRecord {
                applied_by_script,
                outputs: BTreeMap::new(),
            },
            artifacts: Artifacts::default(),
            test_results: TestResults::default(),
            source_file: None,
        }
    }

    /// Record an artifact
    ///
    /// `credentials` entries are merged key by key (last write wins); every
    /// other category appends, keeping order and duplicates.
    pub fn add_artifact(&mut self, category: ArtifactCategory, data: ArtifactData) {
        match self.artifacts.list_mut(category) {
            Some(list) => list.push(data),
            None => self.artifacts.credentials.extend(data),
        }
        debug!(category = %category, "added artifact to state");
    }

    /// Set the status, optionally marking a step done and the duration
    ///
    /// A step already present is not added again.
    pub fn update_test_results(
        &mut self,
        status: TestStatus,
        step: Option<&str>,
        duration: Option<f64>,
    ) {
        let results = &mut self.test_results;
        results.status = status;

        if let Some(step) = step
            && !results.steps_completed.iter().any(|s| s == step)
        {
            results.steps_completed.push(step.to_string());
        }

        if let Some(duration) = duration {
            results.duration_seconds = duration;
        }
    }

    /// Replace the stored terraform outputs
    pub fn record_outputs(&mut self, outputs: BTreeMap<String, Value>) {
        self.terraform.outputs = outputs;
    }
}

fn deployment_id(provider: &str, variant: &str, timestamp: NaiveDateTime) -> String {
    format!("{provider}-{variant}-{}", timestamp.format("%Y%m%d-%H%M%S"))
}
