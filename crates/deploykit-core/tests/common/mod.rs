//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deploykit_core::{
    Confirm, ExecutorFactory, Instance, MigError, MigLister, MigMember, Provisioner,
    TerraformError,
};
use deploykit_exec::{CommandResult, ExecError, RemoteExecutor};
use serde_json::Value;

pub const GCP_JOURNAL: &str =
    "sudo journalctl -u google-startup-scripts.service --no-pager | tail -10";
pub const GCP_FINISHED: &str =
    "Jan 01 12:00:00 vm google_metadata_script_runner[812]: Finished running startup scripts.";

pub fn ok(stdout: &str) -> Result<CommandResult, ExecError> {
    exit(0, stdout, "")
}

pub fn exit(code: i32, stdout: &str, stderr: &str) -> Result<CommandResult, ExecError> {
    Ok(CommandResult {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code: code,
        duration: Duration::from_millis(1),
    })
}

/// Answers commands from a fixed script; unknown commands exit 127
pub struct ScriptedExecutor {
    host: String,
    responses: HashMap<String, Result<CommandResult, ExecError>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, command: &str, response: Result<CommandResult, ExecError>) -> Self {
        self.responses.insert(command.to_string(), response);
        self
    }

    /// Provisioning finished (cloud-init and GCP) and one PM2 service online
    pub fn healthy(host: &str) -> Self {
        Self::new(host)
            .on("cloud-init status --wait", ok("status: done\n"))
            .on(GCP_JOURNAL, ok(GCP_FINISHED))
            .on(
                "pm2 jlist",
                ok(r#"[{"name": "jambonz-sbc-sip", "pm2_env": {"status": "online"}}]"#),
            )
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.calls.lock().unwrap().push(cmd.to_string());
        self.responses
            .get(cmd)
            .cloned()
            .unwrap_or_else(|| exit(127, "", "sh: command not found"))
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run(cmd).await
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn executor_type(&self) -> &'static str {
        "scripted"
    }
}

/// Hands out a prepared executor per host, healthy for unknown hosts
#[derive(Default)]
pub struct ScriptedFactory {
    executors: HashMap<String, Arc<ScriptedExecutor>>,
    requested: Mutex<Vec<Instance>>,
}

impl ScriptedFactory {
    pub fn with(mut self, executor: ScriptedExecutor) -> Self {
        self.executors
            .insert(executor.host.clone(), Arc::new(executor));
        self
    }

    pub fn requested(&self) -> Vec<Instance> {
        self.requested.lock().unwrap().clone()
    }
}

impl ExecutorFactory for ScriptedFactory {
    fn executor_for(&self, instance: &Instance) -> Arc<dyn RemoteExecutor> {
        self.requested.lock().unwrap().push(instance.clone());
        match self.executors.get(&instance.host) {
            Some(executor) => Arc::clone(executor) as Arc<dyn RemoteExecutor>,
            None => Arc::new(ScriptedExecutor::healthy(&instance.host)),
        }
    }
}

/// Records terraform calls instead of running terraform
#[derive(Default)]
pub struct MockProvisioner {
    pub outputs: BTreeMap<String, Value>,
    pub fail_apply: bool,
    pub fail_outputs: bool,
    pub fail_destroy: bool,
    calls: Mutex<Vec<(String, PathBuf, bool)>>,
}

impl MockProvisioner {
    pub fn with_outputs(outputs: Value) -> Self {
        Self {
            outputs: serde_json::from_value(outputs).unwrap(),
            ..Self::default()
        }
    }

    pub fn failing_apply() -> Self {
        Self {
            fail_apply: true,
            ..Self::default()
        }
    }

    pub fn failing_outputs() -> Self {
        Self {
            fail_outputs: true,
            ..Self::default()
        }
    }

    pub fn failing_destroy() -> Self {
        Self {
            fail_destroy: true,
            ..Self::default()
        }
    }

    /// `(subcommand, dir, auto_approve)` per call, in order
    pub fn calls(&self) -> Vec<(String, PathBuf, bool)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, command: &str, dir: &Path, auto_approve: bool) {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), dir.to_path_buf(), auto_approve));
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn apply(
        &self,
        dir: &Path,
        _var_file: Option<&Path>,
        auto_approve: bool,
    ) -> Result<(), TerraformError> {
        self.record("apply", dir, auto_approve);
        if self.fail_apply {
            return Err(TerraformError::CommandFailed {
                command: "apply".to_string(),
                code: 1,
            });
        }
        Ok(())
    }

    async fn destroy(
        &self,
        dir: &Path,
        _var_file: Option<&Path>,
        auto_approve: bool,
    ) -> Result<(), TerraformError> {
        self.record("destroy", dir, auto_approve);
        if self.fail_destroy {
            return Err(TerraformError::CommandFailed {
                command: "destroy".to_string(),
                code: 1,
            });
        }
        Ok(())
    }

    async fn outputs(&self, dir: &Path) -> Result<BTreeMap<String, Value>, TerraformError> {
        self.record("output", dir, false);
        if self.fail_outputs {
            return Err(TerraformError::InvalidOutput("expected value".to_string()));
        }
        Ok(self.outputs.clone())
    }
}

/// Lists prepared group members per name filter instead of calling gcloud
#[derive(Default)]
pub struct MockMigLister {
    members: HashMap<String, Vec<MigMember>>,
    fail: bool,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockMigLister {
    /// `(name, private_ip)` pairs returned for `name_filter`
    pub fn with(mut self, name_filter: &str, members: &[(&str, Option<&str>)]) -> Self {
        let members = members
            .iter()
            .map(|(name, ip)| MigMember {
                name: (*name).to_string(),
                private_ip: ip.map(str::to_string),
            })
            .collect();
        self.members.insert(name_filter.to_string(), members);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// `(project, name_filter)` per call, in order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MigLister for MockMigLister {
    async fn list_instances(
        &self,
        project: &str,
        name_filter: &str,
    ) -> Result<Vec<MigMember>, MigError> {
        self.calls
            .lock()
            .unwrap()
            .push((project.to_string(), name_filter.to_string()));
        if self.fail {
            return Err(MigError::CommandFailed {
                code: 1,
                stderr: "ERROR: (gcloud.compute.instances.list) permission denied".to_string(),
            });
        }
        Ok(self.members.get(name_filter).cloned().unwrap_or_default())
    }
}

/// Gives a fixed answer and counts how often it was asked
pub struct Answer {
    yes: bool,
    asked: Mutex<usize>,
}

impl Answer {
    pub fn yes() -> Self {
        Self {
            yes: true,
            asked: Mutex::new(0),
        }
    }

    pub fn no() -> Self {
        Self {
            yes: false,
            asked: Mutex::new(0),
        }
    }

    pub fn times_asked(&self) -> usize {
        *self.asked.lock().unwrap()
    }
}

#[async_trait]
impl Confirm for Answer {
    async fn confirm(&self, _prompt: &str) -> bool {
        *self.asked.lock().unwrap() += 1;
        self.yes
    }
}
