//! Instance verification
//!
//! Checks that an instance finished its first-boot provisioning and that its
//! systemd units and PM2-managed services are up. All checks run through a
//! [`RemoteExecutor`], one command at a time.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use deploykit_exec::{CommandResult, RemoteExecutor};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::VerifyError;
use crate::server_types::StartupCheck;

/// Markers in the google-startup-scripts journal meaning the scripts finished
pub const GCP_COMPLETION_MARKERS: [&str; 3] = [
    "Finished running startup scripts",
    "Finished google-startup-scripts.service",
    "setup complete",
];

const GCP_JOURNAL: &str = "sudo journalctl -u google-startup-scripts.service --no-pager | tail -10";
const GCP_IS_ACTIVE: &str = "sudo systemctl is-active google-startup-scripts.service";
const CLOUD_INIT_STATUS: &str = "cloud-init status --wait";
const CLOUD_INIT_LOG: &str = "tail -n 50 /var/log/cloud-init-output.log";
const PM2_JSON: &str = "pm2 jlist";
const PM2_TABLE: &str = "pm2 list";

/// `cloud-init status --wait` blocks until cloud-init is done
const CLOUD_INIT_WAIT: Duration = Duration::from_secs(300);
const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const UNIT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

const COMMAND_NOT_FOUND: i32 = 127;

static LOG_ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ERROR|CRITICAL|Failed to|Traceback \(most recent call last\)")
        .expect("Invalid regex pattern")
});

/// Unit names end up in a shell command line
static UNIT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9@._:-]+$").expect("Invalid regex pattern"));

/// What an instance must run, beyond finishing first-boot provisioning
///
/// With no systemd units and no PM2 processes listed, an instance passes when
/// any PM2 process is online.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceExpectations {
    /// Units that must be `active`
    pub systemd: Vec<String>,
    /// PM2 processes that must be `online`
    pub pm2: Vec<String>,
    /// Units allowed to be inactive
    pub optional_systemd: Vec<String>,
    /// PM2 processes allowed to be missing or offline
    pub optional_pm2: Vec<String>,
    /// Replaces the built-in startup check
    pub startup: Option<StartupCheck>,
}

impl ServiceExpectations {
    fn is_unspecified(&self) -> bool {
        self.systemd.is_empty() && self.pm2.is_empty()
    }

    /// Hosts that only list systemd units may not have PM2 installed
    fn checks_pm2(&self) -> bool {
        !self.pm2.is_empty() || self.systemd.is_empty()
    }
}

/// One PM2 process as reported by the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    /// PM2 status, `online` when running
    pub status: String,
    pub uptime: String,
    pub restarts: String,
    pub cpu: String,
    pub memory: String,
}

impl ServiceStatus {
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

/// State of one systemd unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub name: String,
    /// Output of `systemctl is-active`, e.g. `active`, `failed`, `inactive`
    pub state: String,
}

impl UnitStatus {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }
}

/// Result of [`verify_instance`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceReport {
    pub host: String,
    pub role: String,
    /// First-boot provisioning finished
    pub startup_ok: bool,
    pub units: Vec<UnitStatus>,
    pub services: Vec<ServiceStatus>,
    /// Every required check passed; without expectations, at least one
    /// service is online
    pub success: bool,
}

impl InstanceReport {
    /// Services that are online
    pub fn online_services(&self) -> impl Iterator<Item = &ServiceStatus> {
        self.services.iter().filter(|s| s.is_online())
    }

    /// Units that are active
    pub fn active_units(&self) -> impl Iterator<Item = &UnitStatus> {
        self.units.iter().filter(|u| u.is_active())
    }
}

/// Verify provisioning and services on one instance
///
/// # Errors
/// Returns the first failing check. A report with `success == false` means
/// every check ran, nothing specific was expected and no service is online.
#[instrument(skip(executor, expected), fields(host = %executor.host()))]
pub async fn verify_instance(
    executor: &dyn RemoteExecutor,
    role: &str,
    provider: &str,
    expected: &ServiceExpectations,
) -> Result<InstanceReport, VerifyError> {
    let message = match &expected.startup {
        Some(check) => verify_startup_check(executor, role, check).await?,
        None => verify_startup(executor, role, provider).await?,
    };
    debug!(%message, "startup verified");

    let units =
        verify_systemd_services(executor, role, &expected.systemd, &expected.optional_systemd)
            .await?;

    let services = if expected.checks_pm2() {
        verify_services(executor, role, &expected.pm2, &expected.optional_pm2).await?
    } else {
        debug!(role, "no PM2 processes expected, skipping PM2");
        Vec::new()
    };

    let success = !expected.is_unspecified() || services.iter().any(ServiceStatus::is_online);

    Ok(InstanceReport {
        host: executor.host().to_string(),
        role: role.to_string(),
        startup_ok: true,
        units,
        services,
        success,
    })
}

/// Verify first-boot provisioning finished
///
/// GCP images run google-startup-scripts; every other provider runs
/// cloud-init. Returns a short description of how completion was confirmed.
///
/// # Errors
/// `VerifyError::Startup` if provisioning did not finish,
/// `VerifyError::Exec` if the check itself could not run
pub async fn verify_startup(
    executor: &dyn RemoteExecutor,
    role: &str,
    provider: &str,
) -> Result<String, VerifyError> {
    debug!(role, provider, "verifying startup");

    if provider.eq_ignore_ascii_case("gcp") {
        verify_gcp_startup(executor, role).await
    } else {
        verify_cloud_init(executor, role).await
    }
}

async fn verify_gcp_startup(
    executor: &dyn RemoteExecutor,
    role: &str,
) -> Result<String, VerifyError> {
    let journal = run(executor, role, GCP_JOURNAL).await?;

    if GCP_COMPLETION_MARKERS
        .iter()
        .any(|marker| journal.stdout.contains(marker))
    {
        return Ok(completed(role, "GCP startup scripts completed successfully"));
    }

    if journal.stdout.to_lowercase().contains("failed") || !journal.success() {
        return Err(startup_error(
            role,
            "GCP startup scripts may have failed. Check logs.",
        ));
    }

    let status = run(executor, role, GCP_IS_ACTIVE).await?;
    let state = status.stdout.to_lowercase();
    if state.contains("inactive") || state.contains("dead") {
        return Ok(completed(
            role,
            "GCP startup scripts completed (service inactive)",
        ));
    }

    Err(startup_error(role, "GCP startup scripts status unclear"))
}

async fn verify_cloud_init(
    executor: &dyn RemoteExecutor,
    role: &str,
) -> Result<String, VerifyError> {
    match executor
        .run_with_timeout(CLOUD_INIT_STATUS, CLOUD_INIT_WAIT)
        .await
    {
        Ok(result) if result.exit_code == COMMAND_NOT_FOUND => {
            debug!(role, "cloud-init command not available, checking log");
        }
        Ok(result) => {
            if !result.stdout.to_lowercase().contains("status: done") && !result.success() {
                return Err(startup_error(
                    role,
                    &format!("cloud-init not complete. Status: {}", result.stdout.trim()),
                ));
            }
            return Ok(completed(role, "cloud-init completed successfully"));
        }
        Err(e) => {
            warn!(role, error = %e, "cloud-init status command failed, checking log");
        }
    }

    let log = run(executor, role, CLOUD_INIT_LOG).await?;
    if !log.stdout.contains("Cloud-init v.") || !log.stdout.to_lowercase().contains("finished") {
        return Err(startup_error(role, "cloud-init log does not show completion"));
    }

    let errors: Vec<&str> = LOG_ERROR_PATTERN
        .find_iter(&log.stdout)
        .map(|m| m.as_str())
        .collect();
    if !errors.is_empty() {
        warn!(role, ?errors, "found potential errors in cloud-init log");
    }

    Ok(completed(role, "cloud-init completed successfully"))
}

/// Run a configured startup check
///
/// # Errors
/// `VerifyError::Startup` unless the command exits 0 and prints the success
/// indicator, `VerifyError::Exec` if it could not run
pub async fn verify_startup_check(
    executor: &dyn RemoteExecutor,
    role: &str,
    check: &StartupCheck,
) -> Result<String, VerifyError> {
    debug!(role, command = %check.command, "running configured startup check");

    let result = executor
        .run_with_timeout(&check.command, STARTUP_CHECK_TIMEOUT)
        .await
        .map_err(|e| VerifyError::exec(role, e))?;

    if result.success() && result.stdout.contains(&check.success_indicator) {
        Ok(completed(role, "startup script completed"))
    } else {
        Err(startup_error(role, "startup script not complete or failed"))
    }
}

/// Check that every listed unit is `active`
///
/// Units in `optional` may be in any state; they are still reported.
///
/// # Errors
/// `VerifyError::Services` naming every required unit that is not active,
/// `VerifyError::Exec` if a required unit could not be queried
pub async fn verify_systemd_services(
    executor: &dyn RemoteExecutor,
    role: &str,
    expected: &[String],
    optional: &[String],
) -> Result<Vec<UnitStatus>, VerifyError> {
    if expected.is_empty() {
        return Ok(Vec::new());
    }
    debug!(role, count = expected.len(), "checking systemd units");

    let mut units = Vec::with_capacity(expected.len());
    let mut inactive = Vec::new();

    for name in expected {
        let is_optional = optional.contains(name);
        if !UNIT_NAME.is_match(name) {
            return Err(VerifyError::Services {
                role: role.to_string(),
                message: format!("invalid systemd unit name: {name:?}"),
            });
        }

        let command = format!("systemctl is-active {name}");
        let state = match executor.run_with_timeout(&command, UNIT_CHECK_TIMEOUT).await {
            Ok(result) => result.stdout.trim().to_string(),
            Err(e) if is_optional => {
                warn!(role, unit = %name, error = %e, "could not query optional unit");
                "unknown".to_string()
            }
            Err(e) => return Err(VerifyError::exec(role, e)),
        };

        let unit = UnitStatus {
            name: name.clone(),
            state,
        };
        if !unit.is_active() {
            if is_optional {
                warn!(role, unit = %name, state = %unit.state, "optional unit not active");
            } else {
                inactive.push(name.as_str());
            }
        }
        units.push(unit);
    }

    if !inactive.is_empty() {
        return Err(VerifyError::Services {
            role: role.to_string(),
            message: format!("inactive services: {}", inactive.join(", ")),
        });
    }

    let active = units.iter().filter(|u| u.is_active()).count();
    info!(role, "{active}/{} systemd units active", units.len());
    Ok(units)
}

/// List PM2 services and check the expected ones are online
///
/// No services at all is reported as an empty list, not an error, as long as
/// nothing required is missing.
///
/// # Errors
/// `VerifyError::Services` if PM2 cannot be queried or a required service is
/// missing or not online, `VerifyError::Exec` if the command could not run
pub async fn verify_services(
    executor: &dyn RemoteExecutor,
    role: &str,
    expected: &[String],
    optional: &[String],
) -> Result<Vec<ServiceStatus>, VerifyError> {
    debug!(role, "checking PM2 services");

    let json = run(executor, role, PM2_JSON).await?;
    let services = if json.success() {
        parse_pm2_json(&json.stdout, Utc::now().timestamp_millis())
            .unwrap_or_else(|| parse_pm2_table(&json.stdout))
    } else {
        let table = run(executor, role, PM2_TABLE).await?;
        if !table.success() {
            return Err(VerifyError::Services {
                role: role.to_string(),
                message: format!("PM2 command failed: {}", table.stderr.trim()),
            });
        }
        parse_pm2_table(&table.stdout)
    };

    let mut missing = Vec::new();
    let mut offline = Vec::new();
    for name in expected {
        let is_optional = optional.contains(name);
        match services.iter().find(|s| &s.name == name) {
            None if is_optional => warn!(role, service = %name, "optional service missing"),
            None => missing.push(name.as_str()),
            Some(s) if s.is_online() => {}
            Some(s) if is_optional => {
                warn!(role, service = %name, status = %s.status, "optional service not online");
            }
            Some(_) => offline.push(name.as_str()),
        }
    }
    if !missing.is_empty() {
        return Err(VerifyError::Services {
            role: role.to_string(),
            message: format!("missing expected services: {}", missing.join(", ")),
        });
    }
    if !offline.is_empty() {
        return Err(VerifyError::Services {
            role: role.to_string(),
            message: format!("offline services: {}", offline.join(", ")),
        });
    }

    if services.is_empty() {
        warn!(role, "no PM2 services found");
        return Ok(services);
    }

    let (online, stopped): (Vec<&ServiceStatus>, Vec<&ServiceStatus>) =
        services.iter().partition(|s| s.is_online());
    if !online.is_empty() {
        info!(role, services = %names(&online), "{} services online", online.len());
    }
    if !stopped.is_empty() {
        warn!(role, services = %names(&stopped), "{} services not online", stopped.len());
    }

    Ok(services)
}

async fn run(
    executor: &dyn RemoteExecutor,
    role: &str,
    command: &str,
) -> Result<CommandResult, VerifyError> {
    executor
        .run(command)
        .await
        .map_err(|e| VerifyError::exec(role, e))
}

fn completed(role: &str, message: &str) -> String {
    info!(role, "{message}");
    message.to_string()
}

fn startup_error(role: &str, message: &str) -> VerifyError {
    VerifyError::Startup {
        role: role.to_string(),
        message: message.to_string(),
    }
}

fn names(services: &[&ServiceStatus]) -> String {
    services
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Process {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pm2_env: Pm2Env,
    #[serde(default)]
    monit: Pm2Monit,
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Env {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    pm_uptime: Option<i64>,
    #[serde(default)]
    restart_time: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Monit {
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    memory: Option<u64>,
}

/// Parse `pm2 jlist`; `None` if the output is not a JSON process list
fn parse_pm2_json(output: &str, now_ms: i64) -> Option<Vec<ServiceStatus>> {
    let processes: Vec<Pm2Process> = serde_json::from_str(output.trim()).ok()?;

    Some(
        processes
            .into_iter()
            .map(|p| ServiceStatus {
                name: p.name.unwrap_or_else(|| "unknown".to_string()),
                status: p.pm2_env.status.unwrap_or_else(|| "unknown".to_string()),
                uptime: format_uptime(p.pm2_env.pm_uptime.unwrap_or(0), now_ms),
                restarts: p.pm2_env.restart_time.unwrap_or(0).to_string(),
                cpu: format!("{}%", p.monit.cpu.unwrap_or(0.0)),
                memory: format_memory(p.monit.memory.unwrap_or(0)),
            })
            .collect(),
    )
}

/// Parse the box-drawing table printed by `pm2 list`
///
/// Columns are located from the header row when there is one; otherwise the
/// cells are taken as name, status, uptime, restarts, cpu, memory.
fn parse_pm2_table(output: &str) -> Vec<ServiceStatus> {
    let mut columns = TableColumns::positional();
    let mut services = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() || ['┌', '├', '└'].iter().any(|c| line.contains(*c)) {
            continue;
        }
        if !line.contains('│') {
            continue;
        }

        let cells: Vec<&str> = line
            .split('│')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();

        if let Some(header) = TableColumns::from_header(&cells) {
            columns = header;
            continue;
        }
        if cells.len() < 2 {
            continue;
        }

        let cell = |index: Option<usize>| {
            index
                .and_then(|i| cells.get(i))
                .map_or_else(|| "N/A".to_string(), |c| (*c).to_string())
        };
        services.push(ServiceStatus {
            name: cell(Some(columns.name)),
            status: cell(Some(columns.status)),
            uptime: cell(columns.uptime),
            restarts: cell(columns.restarts),
            cpu: cell(columns.cpu),
            memory: cell(columns.memory),
        });
    }

    services
}

struct TableColumns {
    name: usize,
    status: usize,
    uptime: Option<usize>,
    restarts: Option<usize>,
    cpu: Option<usize>,
    memory: Option<usize>,
}

impl TableColumns {
    fn positional() -> Self {
        Self {
            name: 0,
            status: 1,
            uptime: Some(2),
            restarts: Some(3),
            cpu: Some(4),
            memory: Some(5),
        }
    }

    fn from_header(cells: &[&str]) -> Option<Self> {
        let find = |names: &[&str]| {
            cells
                .iter()
                .position(|c| names.iter().any(|n| c.eq_ignore_ascii_case(n)))
        };

        Some(Self {
            name: find(&["name", "app name"])?,
            status: find(&["status"])?,
            uptime: find(&["uptime"]),
            restarts: find(&["↺", "restart", "restarts"]),
            cpu: find(&["cpu"]),
            memory: find(&["mem", "memory"]),
        })
    }
}

fn format_uptime(started_ms: i64, now_ms: i64) -> String {
    if started_ms == 0 {
        return "N/A".to_string();
    }

    let secs = (now_ms - started_ms).max(0) / 1000;
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d {}h", s / 86_400, (s % 86_400) / 3600),
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        0 => "N/A".to_string(),
        b if b < KB => format!("{b}B"),
        b if b < MB => format!("{:.1}KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.1}MB", b as f64 / MB as f64),
        b => format!("{:.1}GB", b as f64 / GB as f64),
    }
}
