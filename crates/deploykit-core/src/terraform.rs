//! terraform wrapper
//!
//! Runs `terraform apply`, `terraform destroy` and `terraform output -json` as
//! subprocesses. Provider credentials are passed to the subprocess only; the
//! environment of this process is never changed.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::TerraformConfig;
use crate::error::TerraformError;

/// Limit for `apply` and `destroy`
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Limit for `output -json`
pub const OUTPUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Providers recognised in terraform directory paths
pub const KNOWN_PROVIDERS: [&str; 4] = ["exoscale", "azure", "gcp", "aws"];

/// Infrastructure provisioning used by workflows
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create or update infrastructure in `dir`
    async fn apply(
        &self,
        dir: &Path,
        var_file: Option<&Path>,
        auto_approve: bool,
    ) -> Result<(), TerraformError>;

    /// Tear down infrastructure in `dir`
    async fn destroy(
        &self,
        dir: &Path,
        var_file: Option<&Path>,
        auto_approve: bool,
    ) -> Result<(), TerraformError>;

    /// Output values of `dir`, unwrapped to name → value
    async fn outputs(&self, dir: &Path) -> Result<BTreeMap<String, Value>, TerraformError>;
}

/// Environment variables carrying `provider` credentials
///
/// # Errors
/// Returns `TerraformError::MissingCredentials` if exoscale is missing its
/// key or secret. Other providers take whatever is configured.
pub fn provider_env(
    provider: &str,
    config: &TerraformConfig,
) -> Result<Vec<(String, String)>, TerraformError> {
    let mut env = Vec::new();
    let mut push = |name: &str, value: &Option<String>| {
        if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
            env.push((name.to_string(), value.clone()));
        }
    };

    match provider {
        "exoscale" => {
            let creds = config.exoscale.clone().unwrap_or_default();
            let complete = [&creds.api_key, &creds.api_secret]
                .iter()
                .all(|v| v.as_deref().is_some_and(|s| !s.is_empty()));
            if !complete {
                return Err(TerraformError::MissingCredentials {
                    provider: provider.to_string(),
                    message: "set terraform.exoscale.api_key and terraform.exoscale.api_secret"
                        .to_string(),
                });
            }
            push("EXOSCALE_API_KEY", &creds.api_key);
            push("EXOSCALE_API_SECRET", &creds.api_secret);
        }
        "azure" => {
            let creds = config.azure.clone().unwrap_or_default();
            push("ARM_SUBSCRIPTION_ID", &creds.subscription_id);
            push("ARM_TENANT_ID", &creds.tenant_id);
            push("ARM_CLIENT_ID", &creds.client_id);
            push("ARM_CLIENT_SECRET", &creds.client_secret);
        }
        "gcp" => {
            let creds = config.gcp.clone().unwrap_or_default();
            push("GOOGLE_APPLICATION_CREDENTIALS", &creds.credentials_file);
            push("GCP_PROJECT", &creds.project);
        }
        "aws" => {
            let creds = config.aws.clone().unwrap_or_default();
            push("AWS_ACCESS_KEY_ID", &creds.access_key_id);
            push("AWS_SECRET_ACCESS_KEY", &creds.secret_access_key);
            push("AWS_REGION", &creds.region);
        }
        other => {
            warn!(provider = %other, "unknown provider, no credentials set");
        }
    }

    debug!(provider, count = env.len(), "prepared terraform environment");
    Ok(env)
}

/// Split a terraform directory path into `(provider, variant)`
///
/// `./exoscale/provision-vm-medium` gives `("exoscale", "provision-vm-medium")`.
/// Without a known provider component the last two components are used.
#[must_use]
pub fn extract_provider_variant(dir: &Path) -> (String, String) {
    let path = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if let Some(index) = parts
        .iter()
        .position(|p| KNOWN_PROVIDERS.contains(&p.as_str()))
        && let Some(variant) = parts.get(index + 1)
    {
        return (parts[index].clone(), variant.clone());
    }

    match parts.as_slice() {
        [.., provider, variant] => (provider.clone(), variant.clone()),
        [variant] => ("unknown".to_string(), variant.clone()),
        [] => ("unknown".to_string(), "unknown".to_string()),
    }
}

/// terraform CLI driver
#[derive(Debug, Clone)]
pub struct Terraform {
    binary: PathBuf,
    env: Vec<(String, String)>,
    run_timeout: Duration,
    output_timeout: Duration,
}

impl Terraform {
    /// Driver passing `env` to every subprocess
    #[must_use]
    pub fn new(env: Vec<(String, String)>) -> Self {
        Self {
            binary: PathBuf::from("terraform"),
            env,
            run_timeout: RUN_TIMEOUT,
            output_timeout: OUTPUT_TIMEOUT,
        }
    }

    /// Use a different terraform executable
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Override both timeouts
    #[must_use]
    pub fn with_timeouts(mut self, run: Duration, output: Duration) -> Self {
        self.run_timeout = run;
        self.output_timeout = output;
        self
    }

    fn command(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(e: std::io::Error) -> TerraformError {
        if e.kind() == std::io::ErrorKind::NotFound {
            TerraformError::NotInstalled
        } else {
            TerraformError::Io(e)
        }
    }

    /// Run `apply`/`destroy`, logging merged output line by line
    async fn run_streaming(
        &self,
        subcommand: &str,
        dir: &Path,
        var_file: Option<&Path>,
        auto_approve: bool,
    ) -> Result<(), TerraformError> {
        let dir = resolve_dir(dir)?;

        let mut args = vec![subcommand.to_string()];
        if let Some(var_file) = var_file {
            args.push("-var-file".to_string());
            args.push(var_file.display().to_string());
        }
        if auto_approve {
            args.push("-auto-approve".to_string());
        }

        info!(dir = %dir.display(), "running: terraform {}", args.join(" "));

        let mut child = self
            .command(&dir)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Self::spawn_error)?;

        let status = match timeout(self.run_timeout, stream_output(&mut child)).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                error!(command = subcommand, "terraform timed out");
                return Err(TerraformError::Timeout {
                    command: subcommand.to_string(),
                    timeout: self.run_timeout,
                });
            }
        };

        if !status.success() {
            return Err(TerraformError::CommandFailed {
                command: subcommand.to_string(),
                code: status.code().unwrap_or(-1),
            });
        }

        info!("terraform {subcommand} completed successfully");
        Ok(())
    }
}

#[async_trait]
impl Provisioner for Terraform {
    async fn apply(
        &self,
        dir: &Path,
        var_file: Option<&Path>,
        auto_approve: bool,
    ) -> Result<(), TerraformError> {
        self.run_streaming("apply", dir, var_file, auto_approve)
            .await
    }

    async fn destroy(
        &self,
        dir: &Path,
        var_file: Option<&Path>,
        auto_approve: bool,
    ) -> Result<(), TerraformError> {
        self.run_streaming("destroy", dir, var_file, auto_approve)
            .await
    }

    async fn outputs(&self, dir: &Path) -> Result<BTreeMap<String, Value>, TerraformError> {
        let dir = resolve_dir(dir)?;
        debug!(dir = %dir.display(), "reading terraform outputs");

        let output = self
            .command(&dir)
            .args(["output", "-json"])
            .stdin(Stdio::null())
            .output();

        let output = timeout(self.output_timeout, output)
            .await
            .map_err(|_| TerraformError::Timeout {
                command: "output".to_string(),
                timeout: self.output_timeout,
            })?
            .map_err(Self::spawn_error)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                error!(stderr = %stderr.trim(), "terraform output failed");
            }
            return Err(TerraformError::CommandFailed {
                command: "output".to_string(),
                code: output.status.code().unwrap_or(-1),
            });
        }

        let outputs = parse_outputs(&output.stdout)?;
        debug!(count = outputs.len(), "retrieved terraform outputs");
        Ok(outputs)
    }
}

fn resolve_dir(dir: &Path) -> Result<PathBuf, TerraformError> {
    if !dir.is_dir() {
        return Err(TerraformError::DirectoryNotFound(dir.to_path_buf()));
    }
    Ok(std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf()))
}

async fn stream_output(child: &mut Child) -> Result<std::process::ExitStatus, TerraformError> {
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(line) => log_line(&line),
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line {
                Some(line) => log_line(&line),
                None => stderr = None,
            },
        }
    }

    Ok(child.wait().await?)
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn log_line(line: &str) {
    let line = line.trim_end();
    if !line.is_empty() {
        info!("  {line}");
    }
}

/// Unwrap `{"name": {"value": ..., "type": ...}}` into `{"name": ...}`
///
/// # Errors
/// Returns `TerraformError::InvalidOutput` if `raw` is not a JSON object
pub fn parse_outputs(raw: &[u8]) -> Result<BTreeMap<String, Value>, TerraformError> {
    let parsed: serde_json::Map<String, Value> =
        serde_json::from_slice(raw).map_err(|e| TerraformError::InvalidOutput(e.to_string()))?;

    Ok(parsed
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::Object(mut wrapper) if wrapper.contains_key("value") => {
                    wrapper.remove("value").unwrap_or(Value::Null)
                }
                other => other,
            };
            (name, value)
        })
        .collect())
}
