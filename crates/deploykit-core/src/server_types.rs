//! Expected services per server type
//!
//! Read from a YAML file of this shape:
//!
//! ```yaml
//! server_types:
//!   sbc:
//!     systemd_services: [drachtio, rtpengine]
//!     pm2_processes: [sbc-inbound, sbc-outbound]
//! optional_services:
//!   systemd: [telegraf]
//!   pm2: []
//! service_checks:
//!   startup_scripts:
//!     aws:
//!       command: sudo cloud-init status
//!       success_indicator: "status: done"
//! ```
//!
//! Instance roles carry an index (`sbc-0`, `feature-server-2`); the index is
//! dropped when looking up the server type.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::verify::ServiceExpectations;

/// Contents of a server types file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTypes {
    /// Server type name → services it must run
    #[serde(default)]
    pub server_types: BTreeMap<String, ServerType>,
    /// Services allowed to be missing or down on any server type
    #[serde(default)]
    pub optional_services: OptionalServices,
    #[serde(default)]
    pub service_checks: ServiceChecks,
}

/// Services one kind of server runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerType {
    #[serde(default)]
    pub description: Option<String>,
    /// Units that must report `active`
    #[serde(default)]
    pub systemd_services: Vec<String>,
    /// PM2 processes that must be `online`
    #[serde(default)]
    pub pm2_processes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalServices {
    #[serde(default)]
    pub systemd: Vec<String>,
    #[serde(default)]
    pub pm2: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceChecks {
    /// Provider → command replacing the built-in startup check
    #[serde(default)]
    pub startup_scripts: BTreeMap<String, StartupCheck>,
}

/// A startup check passes when `command` exits 0 and prints
/// `success_indicator`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupCheck {
    pub command: String,
    pub success_indicator: String,
}

impl ServerTypes {
    /// Load from `path`
    ///
    /// # Errors
    /// `ConfigError::NotFound` if the file is missing, `Read` or `Parse` if it
    /// cannot be loaded
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let types = Self::parse(&content, path)?;
        debug!(
            path = %path.display(),
            server_types = types.server_types.len(),
            "loaded server types"
        );
        Ok(types)
    }

    /// Load from `path`, or check nothing beyond the defaults if it is missing
    ///
    /// # Errors
    /// Same as [`ServerTypes::load`] except for a missing file
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(path)) => {
                warn!(
                    path = %path.display(),
                    "server types file not found, only default checks will run"
                );
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Parse server types YAML; `source` only labels errors
    ///
    /// # Errors
    /// `ConfigError::Parse` if the content does not match the schema
    pub fn parse(content: &str, source: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: source.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Server type for an instance role, with or without an index suffix
    #[must_use]
    pub fn server_type(&self, role: &str) -> Option<&ServerType> {
        self.server_types
            .get(role)
            .or_else(|| self.server_types.get(base_role(role)))
    }

    /// Everything to check on an instance with `role` at `provider`
    #[must_use]
    pub fn expectations(&self, role: &str, provider: &str) -> ServiceExpectations {
        let server_type = self.server_type(role).cloned().unwrap_or_default();
        let startup = self
            .service_checks
            .startup_scripts
            .get(&provider.to_lowercase())
            .cloned();

        ServiceExpectations {
            systemd: server_type.systemd_services,
            pm2: server_type.pm2_processes,
            optional_systemd: self.optional_services.systemd.clone(),
            optional_pm2: self.optional_services.pm2.clone(),
            startup,
        }
    }
}

/// `feature-server-1` → `feature-server`; roles without an index unchanged
fn base_role(role: &str) -> &str {
    match role.rsplit_once('-') {
        Some((base, index))
            if !base.is_empty() && !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => role,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_TYPES: &str = "\
server_types:
  web-monitoring:
    description: Portal and monitoring
    systemd_services: [nginx, grafana-server]
    pm2_processes: [api-server, webapp]
  sbc:
    systemd_services: [drachtio, rtpengine]
    pm2_processes: [sbc-inbound, sbc-outbound]
  feature-server:
    pm2_processes: [jambonz-feature-server]
optional_services:
  systemd: [telegraf]
  pm2: [sbc-call-router]
service_checks:
  startup_scripts:
    aws:
      command: sudo cloud-init status
      success_indicator: \"status: done\"
";

    fn server_types() -> ServerTypes {
        ServerTypes::parse(SERVER_TYPES, Path::new("server_types.yaml")).unwrap()
    }

    #[test]
    fn test_base_role() {
        assert_eq!(base_role("sbc-0"), "sbc");
        assert_eq!(base_role("feature-server-12"), "feature-server");
        assert_eq!(base_role("web-monitoring"), "web-monitoring");
        assert_eq!(base_role("recording"), "recording");
        assert_eq!(base_role("-3"), "-3");
    }

    #[test]
    fn test_expectations_for_indexed_role() {
        let expected = server_types().expectations("sbc-1", "exoscale");

        assert_eq!(expected.systemd, ["drachtio", "rtpengine"]);
        assert_eq!(expected.pm2, ["sbc-inbound", "sbc-outbound"]);
        assert_eq!(expected.optional_systemd, ["telegraf"]);
        assert_eq!(expected.optional_pm2, ["sbc-call-router"]);
        assert!(expected.startup.is_none());
    }

    #[test]
    fn test_exact_role_name_wins() {
        let types = server_types();
        let web = types.server_type("web-monitoring").unwrap();
        assert_eq!(web.description.as_deref(), Some("Portal and monitoring"));
    }

    #[test]
    fn test_startup_check_by_provider() {
        let expected = server_types().expectations("feature-server-0", "AWS");

        assert!(expected.systemd.is_empty());
        assert_eq!(expected.pm2, ["jambonz-feature-server"]);
        assert_eq!(
            expected.startup,
            Some(StartupCheck {
                command: "sudo cloud-init status".to_string(),
                success_indicator: "status: done".to_string(),
            })
        );
    }

    #[test]
    fn test_unknown_role_checks_nothing_specific() {
        let expected = server_types().expectations("recording-0", "gcp");
        assert!(expected.systemd.is_empty());
        assert!(expected.pm2.is_empty());
        assert_eq!(expected.optional_systemd, ["telegraf"]);
    }

    #[test]
    fn test_parse_empty_and_invalid() {
        let source = Path::new("server_types.yaml");
        assert_eq!(ServerTypes::parse("", source).unwrap(), ServerTypes::default());

        let err = ServerTypes::parse("server_types: [sbc]", source).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_types.yaml");

        assert!(matches!(
            ServerTypes::load(&path).unwrap_err(),
            ConfigError::NotFound(_)
        ));
        assert_eq!(
            ServerTypes::load_or_default(&path).unwrap(),
            ServerTypes::default()
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_types.yaml");
        std::fs::write(&path, SERVER_TYPES).unwrap();

        assert_eq!(ServerTypes::load(&path).unwrap(), server_types());
    }
}
