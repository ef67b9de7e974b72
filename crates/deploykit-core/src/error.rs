//! Core error types for deploykit-core

use std::path::PathBuf;
use std::time::Duration;

use deploykit_exec::ExecError;
use deploykit_state::StateError;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file does not exist
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Configuration file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Content is not valid YAML for the configuration schema
    #[error("invalid YAML in {}: {message}", path.display())]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// A `${VAR}` placeholder names an unset environment variable
    #[error("environment variable {var} is not set (line {line})")]
    MissingEnv {
        /// Variable name
        var: String,
        /// 1-based line of the placeholder
        line: usize,
    },
}

/// Errors that can occur while setting up logging
#[derive(Error, Debug)]
pub enum LoggingError {
    /// Log file could not be created
    #[error("failed to open log file {}: {source}", path.display())]
    LogFile {
        /// Log file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber was already installed
    #[error("failed to install log subscriber: {0}")]
    Init(String),
}

/// Errors that can occur while driving terraform
#[derive(Error, Debug)]
pub enum TerraformError {
    /// Working directory does not exist
    #[error("terraform directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// The terraform binary could not be started
    #[error("terraform command not found, is terraform installed?")]
    NotInstalled,

    /// Provider credentials missing from configuration
    #[error("{provider} credentials not found in config: {message}")]
    MissingCredentials {
        /// Provider name
        provider: String,
        /// What is missing
        message: String,
    },

    /// terraform exited non-zero
    #[error("terraform {command} failed with exit code {code}")]
    CommandFailed {
        /// Subcommand (`apply`, `destroy`, `output`)
        command: String,
        /// Exit code, -1 if killed by a signal
        code: i32,
    },

    /// terraform did not finish in time
    #[error("terraform {command} timed out after {timeout:?}")]
    Timeout {
        /// Subcommand
        command: String,
        /// Limit that was exceeded
        timeout: Duration,
    },

    /// `terraform output -json` was not valid JSON
    #[error("failed to parse terraform output JSON: {0}")]
    InvalidOutput(String),

    /// Process I/O failed
    #[error("terraform I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while listing managed instance group members
#[derive(Error, Debug)]
pub enum MigError {
    /// The gcloud binary could not be started
    #[error("gcloud command not found, is the Google Cloud SDK installed?")]
    NotInstalled,

    /// No project id in the outputs or the configuration
    #[error("no GCP project id for managed instance group {mig}")]
    NoProject {
        /// Group that needed the project
        mig: String,
    },

    /// gcloud exited non-zero
    #[error("gcloud failed with exit code {code}: {stderr}")]
    CommandFailed {
        /// Exit code, -1 if killed by a signal
        code: i32,
        /// Trimmed stderr
        stderr: String,
    },

    /// gcloud did not finish in time
    #[error("gcloud timed out after {0:?}")]
    Timeout(Duration),

    /// Instance list was not the expected JSON
    #[error("failed to parse gcloud instance list: {0}")]
    InvalidOutput(String),

    /// Process I/O failed
    #[error("gcloud I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while verifying an instance
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Provisioning scripts did not complete
    #[error("{role}: {message}")]
    Startup {
        /// Instance role
        role: String,
        /// Failure description
        message: String,
    },

    /// Process manager reported missing or unusable services
    #[error("{role}: {message}")]
    Services {
        /// Instance role
        role: String,
        /// Failure description
        message: String,
    },

    /// Remote command could not be run
    #[error("{role}: {source}")]
    Exec {
        /// Instance role
        role: String,
        /// Executor error
        #[source]
        source: ExecError,
    },
}

impl VerifyError {
    pub(crate) fn exec(role: &str, source: ExecError) -> Self {
        VerifyError::Exec {
            role: role.to_string(),
            source,
        }
    }

    /// Role of the instance that failed
    #[must_use]
    pub fn role(&self) -> &str {
        match self {
            VerifyError::Startup { role, .. }
            | VerifyError::Services { role, .. }
            | VerifyError::Exec { role, .. } => role,
        }
    }
}

/// Errors that abort a verification run
///
/// Each variant that carries `state_file` was recorded in the state before
/// returning, so the deployment can still be cleaned up.
#[derive(Error, Debug)]
pub enum RunError {
    /// terraform apply failed
    #[error("terraform apply failed: {source}")]
    Apply {
        #[source]
        source: TerraformError,
        /// Saved state file
        state_file: PathBuf,
    },

    /// terraform outputs could not be read
    #[error("failed to get terraform outputs: {source}")]
    Outputs {
        #[source]
        source: TerraformError,
        /// Saved state file
        state_file: PathBuf,
    },

    /// Managed instance group members could not be listed
    #[error("failed to list managed instance group members: {source}")]
    Discovery {
        #[source]
        source: MigError,
        /// Saved state file
        state_file: PathBuf,
    },

    /// Outputs did not name any instance
    #[error("no instances found in terraform outputs")]
    NoInstances {
        /// Saved state file
        state_file: PathBuf,
    },

    /// State file could not be written
    #[error(transparent)]
    State(#[from] StateError),
}

impl RunError {
    /// State file saved before the run stopped, if any
    #[must_use]
    pub fn state_file(&self) -> Option<&PathBuf> {
        match self {
            RunError::Apply { state_file, .. }
            | RunError::Outputs { state_file, .. }
            | RunError::Discovery { state_file, .. }
            | RunError::NoInstances { state_file } => Some(state_file),
            RunError::State(_) => None,
        }
    }
}
