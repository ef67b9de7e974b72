//! Instance discovery from terraform outputs
//!
//! Outputs differ between providers and variants, so several shapes are
//! recognised:
//! 1. `ssh_commands`: role → ready-made `ssh ...` command line
//! 2. individual address outputs for web/monitoring, SBC and feature server
//!    instances. Feature servers have private addresses and are reached
//!    through the first SBC.
//!
//! On GCP, feature and recording servers may instead run in managed instance
//! groups named by `feature_server_mig_name` / `recording_mig_name`. Their
//! members are listed through a [`MigLister`] and reached through the
//! web/monitoring host.

use std::collections::BTreeMap;

use deploykit_exec::parse_ssh_command;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::MigError;
use crate::mig::MigLister;

const WEB_MONITORING_KEYS: [&str; 3] = ["web_monitoring_public_ip", "web_ip", "monitoring_ip"];
const SBC_KEYS: [&str; 2] = ["sbc_public_ips", "sbc_ips"];
const FEATURE_SERVER_KEYS: [&str; 2] = ["feature_server_private_ips", "feature_ips"];

/// `(output, role, gcloud name filter)` per kind of group
const MIG_OUTPUTS: [(&str, &str, &str); 2] = [
    ("feature_server_mig_name", "feature-server", "name~-fs-"),
    ("recording_mig_name", "recording", "name~-recording-"),
];

/// Value terraform outputs for a group that was not created
const MIG_NOT_DEPLOYED: &str = "Not deployed";

/// One host to verify
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    /// e.g. `web-monitoring`, `sbc-0`, `feature-server-1`
    pub role: String,
    pub host: String,
    pub jump_host: Option<String>,
}

impl Instance {
    fn new(role: impl Into<String>, host: impl Into<String>, jump_host: Option<String>) -> Self {
        Self {
            role: role.into(),
            host: host.into(),
            jump_host,
        }
    }
}

/// Instances named by terraform outputs, in verification order
#[must_use]
pub fn identify_instances(outputs: &BTreeMap<String, Value>) -> Vec<Instance> {
    let mut instances = from_ssh_commands(outputs);
    if !instances.is_empty() {
        debug!(count = instances.len(), "found instances via ssh_commands output");
        return instances;
    }

    if let Some(host) = first_output(outputs, &WEB_MONITORING_KEYS).and_then(first_address) {
        instances.push(Instance::new("web-monitoring", host, None));
    }

    let sbcs = first_output(outputs, &SBC_KEYS).map(addresses).unwrap_or_default();
    let jump_host = sbcs.first().cloned();
    for (i, host) in sbcs.into_iter().enumerate() {
        instances.push(Instance::new(format!("sbc-{i}"), host, None));
    }

    let feature_servers = first_output(outputs, &FEATURE_SERVER_KEYS)
        .map(addresses)
        .unwrap_or_default();
    if !feature_servers.is_empty() && jump_host.is_none() {
        warn!("feature servers found without an SBC to relay through");
    }
    for (i, host) in feature_servers.into_iter().enumerate() {
        instances.push(Instance::new(
            format!("feature-server-{i}"),
            host,
            jump_host.clone(),
        ));
    }

    debug!(count = instances.len(), "found instances via address outputs");
    instances
}

/// A managed instance group named by terraform outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigGroup {
    pub name: String,
    /// Role prefix for the members, e.g. `feature-server`
    pub role: &'static str,
    /// gcloud filter matching the members
    pub name_filter: &'static str,
}

/// Groups named by terraform outputs, skipping ones that were not deployed
#[must_use]
pub fn mig_groups(outputs: &BTreeMap<String, Value>) -> Vec<MigGroup> {
    MIG_OUTPUTS
        .iter()
        .filter_map(|&(key, role, name_filter)| {
            let name = outputs.get(key)?.as_str()?.trim();
            if name.is_empty() || name == MIG_NOT_DEPLOYED {
                return None;
            }
            Some(MigGroup {
                name: name.to_string(),
                role,
                name_filter,
            })
        })
        .collect()
}

/// GCP project id from `project_id`, else from the service account domain
#[must_use]
pub fn gcp_project(outputs: &BTreeMap<String, Value>) -> Option<String> {
    if let Some(project) = outputs
        .get("project_id")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
    {
        return Some(project.to_string());
    }

    // name@<project>.iam.gserviceaccount.com
    let email = outputs.get("service_account_email")?.as_str()?;
    let (_, domain) = email.split_once('@')?;
    domain
        .split('.')
        .next()
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// List the members of every group in `outputs` as instances
///
/// Members are relayed through the web/monitoring host, or the first
/// directly reachable instance when there is none. Indices continue after
/// instances of the same role already in `known`. Members without a private
/// address are skipped.
///
/// # Errors
/// `MigError::NoProject` if neither the outputs nor `default_project` name a
/// project, otherwise whatever the lister returns
pub async fn discover_mig_members(
    lister: &dyn MigLister,
    outputs: &BTreeMap<String, Value>,
    default_project: Option<&str>,
    known: &[Instance],
) -> Result<Vec<Instance>, MigError> {
    let groups = mig_groups(outputs);
    if groups.is_empty() {
        return Ok(Vec::new());
    }

    let jump_host = known
        .iter()
        .find(|i| i.role == "web-monitoring")
        .or_else(|| known.iter().find(|i| i.jump_host.is_none()))
        .map(|i| i.host.clone());
    if jump_host.is_none() {
        warn!("managed instance groups found without a host to relay through");
    }

    let mut members = Vec::new();
    for group in groups {
        let project = gcp_project(outputs)
            .or_else(|| default_project.map(str::to_string))
            .ok_or_else(|| MigError::NoProject {
                mig: group.name.clone(),
            })?;

        let listed = lister.list_instances(&project, group.name_filter).await?;
        if listed.is_empty() {
            warn!(mig = %group.name, "managed instance group has no running members");
        }

        let taken = known
            .iter()
            .filter(|i| i.role.starts_with(group.role))
            .count();
        let mut index = taken;
        for member in listed {
            let Some(ip) = member.private_ip else {
                warn!(mig = %group.name, member = %member.name, "member has no private address");
                continue;
            };
            members.push(Instance::new(
                format!("{}-{index}", group.role),
                ip,
                jump_host.clone(),
            ));
            index += 1;
        }
        info!(mig = %group.name, count = index - taken, "found managed instance group members");
    }

    Ok(members)
}

fn from_ssh_commands(outputs: &BTreeMap<String, Value>) -> Vec<Instance> {
    let Some(Value::Object(commands)) = outputs.get("ssh_commands") else {
        return Vec::new();
    };

    commands
        .iter()
        .filter_map(|(role, command)| {
            let Some(command) = command.as_str() else {
                warn!(role = %role, "ssh_commands entry is not a string");
                return None;
            };
            let parsed = parse_ssh_command(command);
            match parsed.host {
                Some(host) => Some(Instance::new(role.clone(), host, parsed.jump_host)),
                None => {
                    warn!(role = %role, command, "no host in ssh command");
                    None
                }
            }
        })
        .collect()
}

fn first_output<'a>(outputs: &'a BTreeMap<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| outputs.get(*key))
}

/// A single address, or every string in a list
fn addresses(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn first_address(value: &Value) -> Option<String> {
    addresses(value).into_iter().next()
}
