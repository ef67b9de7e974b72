//! Managed instance group members on GCP
//!
//! Feature servers and recording servers on GCP can run in managed instance
//! groups. terraform only knows the group, so the members and their private
//! addresses are listed with `gcloud compute instances list`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::error::MigError;

/// Limit for one `gcloud compute instances list`
pub const LIST_TIMEOUT: Duration = Duration::from_secs(60);

/// One running member of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigMember {
    pub name: String,
    /// Address on the first network interface
    pub private_ip: Option<String>,
}

/// Lists instances whose name matches a gcloud filter
#[async_trait]
pub trait MigLister: Send + Sync {
    /// Instances in `project` matching `name_filter`, e.g. `name~-fs-`
    async fn list_instances(
        &self,
        project: &str,
        name_filter: &str,
    ) -> Result<Vec<MigMember>, MigError>;
}

/// gcloud CLI driver
#[derive(Debug, Clone)]
pub struct Gcloud {
    binary: PathBuf,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl Gcloud {
    /// Driver passing `env` to every subprocess
    #[must_use]
    pub fn new(env: Vec<(String, String)>) -> Self {
        Self {
            binary: PathBuf::from("gcloud"),
            env,
            timeout: LIST_TIMEOUT,
        }
    }

    /// Use a different gcloud executable
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MigLister for Gcloud {
    async fn list_instances(
        &self,
        project: &str,
        name_filter: &str,
    ) -> Result<Vec<MigMember>, MigError> {
        debug!(project, filter = name_filter, "listing instances with gcloud");

        let output = Command::new(&self.binary)
            .args([
                "compute",
                "instances",
                "list",
                &format!("--filter={name_filter}"),
                "--format=json(name,networkInterfaces[0].networkIP)",
                &format!("--project={project}"),
            ])
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, output)
            .await
            .map_err(|_| MigError::Timeout(self.timeout))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MigError::NotInstalled
                } else {
                    MigError::Io(e)
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(stderr = %stderr, "gcloud instance list failed");
            return Err(MigError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let members = parse_instance_list(&output.stdout)?;
        debug!(count = members.len(), "listed instances");
        Ok(members)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedInstance {
    name: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP", default)]
    network_ip: Option<String>,
}

/// Parse `gcloud ... --format=json(name,networkInterfaces[0].networkIP)`
///
/// # Errors
/// `MigError::InvalidOutput` if `raw` is not a JSON instance list
pub fn parse_instance_list(raw: &[u8]) -> Result<Vec<MigMember>, MigError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let listed: Vec<ListedInstance> =
        serde_json::from_slice(raw).map_err(|e| MigError::InvalidOutput(e.to_string()))?;

    Ok(listed
        .into_iter()
        .map(|instance| MigMember {
            private_ip: instance
                .network_interfaces
                .into_iter()
                .next()
                .and_then(|nic| nic.network_ip)
                .filter(|ip| !ip.is_empty()),
            name: instance.name,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance_list() {
        let raw = br#"[
            {"name": "jambonz-fs-abcd", "networkInterfaces": [{"networkIP": "10.0.1.5"}]},
            {"name": "jambonz-fs-efgh", "networkInterfaces": []}
        ]"#;

        let members = parse_instance_list(raw).unwrap();

        assert_eq!(
            members,
            vec![
                MigMember {
                    name: "jambonz-fs-abcd".to_string(),
                    private_ip: Some("10.0.1.5".to_string()),
                },
                MigMember {
                    name: "jambonz-fs-efgh".to_string(),
                    private_ip: None,
                },
            ]
        );
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_instance_list(b"\n").unwrap().is_empty());
        assert!(parse_instance_list(b"[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_non_list() {
        assert!(matches!(
            parse_instance_list(b"ERROR: (gcloud) not authorized"),
            Err(MigError::InvalidOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let gcloud = Gcloud::new(Vec::new()).with_binary("/nonexistent/bin/gcloud");

        let err = gcloud
            .list_instances("my-project", "name~-fs-")
            .await
            .unwrap_err();
        assert!(matches!(err, MigError::NotInstalled));
    }
}
