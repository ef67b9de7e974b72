//! Configuration loading and types
//!
//! The configuration is a single YAML file. `${VAR_NAME}` placeholders are
//! replaced from the environment before parsing, except on comment lines, so
//! secrets can stay out of the file.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use deploykit_exec::SshTarget;
use deploykit_exec::keys::expand_key_path;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::logging::LogFormat;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "DEPLOYKIT_CONFIG";

/// Configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

static ENV_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("Invalid regex pattern"));

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings shared by every host
    #[serde(default)]
    pub ssh: SshConfig,
    /// Test run settings
    #[serde(default)]
    pub testing: TestingConfig,
    /// Provider credentials handed to terraform
    #[serde(default)]
    pub terraform: TerraformConfig,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SSH settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port of the jump host for relayed targets
    #[serde(default = "default_port")]
    pub jump_port: u16,
    /// Command timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Connect and authenticate timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Verify host keys against `~/.ssh/known_hosts`
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            key_path: default_key_path(),
            port: default_port(),
            jump_port: default_port(),
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            strict_host_key_checking: false,
        }
    }
}

impl SshConfig {
    /// Connection target for `host` using these settings
    #[must_use]
    pub fn target(&self, host: &str) -> SshTarget {
        SshTarget::new(host, &self.user, &self.key_path)
            .with_port(self.port)
            .with_jump_port(self.jump_port)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_strict_host_key_checking(self.strict_host_key_checking)
    }
}

fn default_user() -> String {
    "jambonz".to_string()
}

fn default_key_path() -> PathBuf {
    PathBuf::from("~/.ssh/id_rsa")
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    30
}

/// Verification run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// Where state files are written and listed
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Pause after `terraform apply` before the first check
    #[serde(default = "default_init_wait")]
    pub init_wait_seconds: u64,
    /// Expected services per server type, see [`crate::ServerTypes`]
    #[serde(default = "default_server_types_file")]
    pub server_types_file: PathBuf,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            state_dir: default_state_dir(),
            init_wait_seconds: default_init_wait(),
            server_types_file: default_server_types_file(),
        }
    }
}

fn default_log_file() -> PathBuf {
    PathBuf::from("./test-cloud-init.log")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_init_wait() -> u64 {
    30
}

fn default_server_types_file() -> PathBuf {
    PathBuf::from("./server_types.yaml")
}

/// Per-provider credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerraformConfig {
    #[serde(default)]
    pub exoscale: Option<ExoscaleCredentials>,
    #[serde(default)]
    pub azure: Option<AzureCredentials>,
    #[serde(default)]
    pub gcp: Option<GcpCredentials>,
    #[serde(default)]
    pub aws: Option<AwsCredentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExoscaleCredentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AzureCredentials {
    pub subscription_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcpCredentials {
    pub credentials_file: Option<String>,
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
}

/// Log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if the file is missing, references an unset environment
    /// variable, or is not valid YAML
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = expand_key_path(path);
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let config = Self::parse(&content, &path, |name| std::env::var(name).ok())?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load from the usual locations or use defaults
    ///
    /// Checks `DEPLOYKIT_CONFIG`, then `./config.yaml`, then
    /// `<config dir>/deploykit/config.yaml`.
    ///
    /// # Errors
    /// Returns error if a file is found but cannot be loaded
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let paths = [
            Some(PathBuf::from(DEFAULT_CONFIG_FILE)),
            dirs::config_dir().map(|p| p.join("deploykit").join(DEFAULT_CONFIG_FILE)),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        warn!("no config file found, using defaults");
        Ok(Config::default())
    }

    /// Parse configuration text, resolving placeholders through `lookup`
    ///
    /// `source` only labels errors.
    ///
    /// # Errors
    /// See [`Config::load`]
    pub fn parse<F>(content: &str, source: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = substitute_env_vars(content, lookup)?;

        if is_blank_document(&content) {
            return Ok(Config::default());
        }

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: source.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Replace `${VAR}` placeholders on every non-comment line
///
/// # Errors
/// Returns `ConfigError::MissingEnv` for the first unset variable
pub fn substitute_env_vars<F>(content: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut lines = Vec::new();

    for (index, line) in content.lines().enumerate() {
        if line.trim_start().starts_with('#') {
            lines.push(line.to_string());
            continue;
        }

        let mut missing = None;
        let replaced = ENV_PLACEHOLDER.replace_all(line, |caps: &Captures<'_>| {
            let name = &caps[1];
            lookup(name).unwrap_or_else(|| {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            })
        });

        if let Some(var) = missing {
            return Err(ConfigError::MissingEnv {
                var,
                line: index + 1,
            });
        }
        lines.push(replaced.into_owned());
    }

    Ok(lines.join("\n"))
}

fn is_blank_document(content: &str) -> bool {
    content.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "---"
    })
}
