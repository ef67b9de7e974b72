//! Result and target types for command execution

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of a command execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Exit status code (0 for success, -1 if the remote never reported one)
    pub exit_code: i32,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// The `(stdout, stderr, exit_code)` triple
    #[must_use]
    pub fn into_parts(self) -> (String, String, i32) {
        (self.stdout, self.stderr, self.exit_code)
    }
}

/// How to reach and authenticate to one host
///
/// Built fresh for every call; nothing caches a target or its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port of the jump host, when one is used (default 22)
    #[serde(default = "default_port")]
    pub jump_port: u16,
    /// Username
    pub user: String,
    /// Path to the private key
    pub key_path: PathBuf,
    /// Upper bound on command execution
    pub timeout: Duration,
    /// Upper bound on connect plus authentication
    pub connect_timeout: Duration,
    /// Only accept host keys already present in `~/.ssh/known_hosts`
    pub strict_host_key_checking: bool,
}

fn default_port() -> u16 {
    22
}

impl SshTarget {
    /// Create a target with the default port and timeouts
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            jump_port: default_port(),
            user: user.into(),
            key_path: key_path.into(),
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            strict_host_key_checking: false,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the port the jump host listens on
    #[must_use]
    pub fn with_jump_port(mut self, port: u16) -> Self {
        self.jump_port = port;
        self
    }

    /// Set command timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Require known host keys
    #[must_use]
    pub fn with_strict_host_key_checking(mut self, strict: bool) -> Self {
        self.strict_host_key_checking = strict;
        self
    }

    /// Same credentials, different host
    #[must_use]
    pub fn for_host(&self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..self.clone()
        }
    }
}
