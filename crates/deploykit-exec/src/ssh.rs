//! SSH command execution using russh crate
//!
//! One call opens one connection, runs one command and closes the connection
//! again. Targets that are not reachable from the caller can be relayed
//! through a single jump host: the jump session (on `jump_port`) opens a
//! `direct-tcpip` channel to `(host, port)` and a second SSH session is
//! layered on top of it.
//!
//! # Security notes
//!
//! * With `strict_host_key_checking` off, any host key is accepted
//!   (trust-on-first-use without the "remember" part). This is only meant for
//!   short-lived disposable test infrastructure; turn it on for anything else.
//! * The command string is handed verbatim to the remote user's shell. Nothing
//!   is quoted or escaped here. Callers interpolating untrusted values into a
//!   command must quote them themselves; new call sites should prefer fixed
//!   command strings with no interpolated input.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key::{self, HashAlg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, check_known_hosts};
use russh::{ChannelMsg, Disconnect, client};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::load_private_key;
use crate::result::{CommandResult, SshTarget};
use crate::traits::RemoteExecutor;

/// Command used by [`test_connectivity`]
pub const CONNECTIVITY_COMMAND: &str = "echo 'SSH connectivity test'";

const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// SSH client handler for russh
///
/// Applies the host-key policy of the target it was created for.
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    port: u16,
    strict: bool,
}

impl SshClientHandler {
    fn new(host: &str, port: u16, strict: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            strict,
        }
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);

        if !self.strict {
            debug!(
                host = %self.host,
                fingerprint = %fingerprint,
                "accepting host key without verification"
            );
            return Ok(true);
        }

        match check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, fingerprint = %fingerprint, "host key not in known_hosts");
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "host key verification failed");
                Ok(false)
            }
        }
    }
}

type Session = client::Handle<SshClientHandler>;

/// Run one command on one host, optionally through a jump host
///
/// `timeout_override` replaces `target.timeout` for this call. The jump hop
/// uses the same user and key as the target hop but its own port,
/// `target.jump_port`. The relay asks the jump host for `(target.host,
/// target.port)`, so `port` always names the target's SSH port.
///
/// `command` is handed to the remote login shell verbatim. Nothing is quoted
/// or escaped here; callers interpolating untrusted values must quote them
/// themselves.
///
/// # Errors
/// `ExecError::Credential` if the key cannot be loaded, otherwise one of the
/// connection-class errors. No retries are attempted.
#[instrument(skip(target, command), fields(host = %target.host, jump_host = jump_host.unwrap_or("-")))]
pub async fn run_command(
    target: &SshTarget,
    command: &str,
    timeout_override: Option<Duration>,
    jump_host: Option<&str>,
) -> Result<CommandResult, ExecError> {
    let key = load_private_key(&target.key_path)?;
    let command_timeout = timeout_override.unwrap_or(target.timeout);

    let result = match jump_host {
        None => {
            debug!(host = %target.host, "connecting directly");
            let session = connect_direct(target, &target.host, target.port, key).await?;
            let result = execute(&session, &target.host, command, command_timeout).await;
            close(session, &target.host).await;
            result
        }
        Some(jump) => {
            debug!(host = %target.host, jump_host = %jump, "connecting via jump host");
            let outer = connect_direct(target, jump, target.jump_port, Arc::clone(&key)).await?;
            let inner = match connect_via(&outer, target, jump, key).await {
                Ok(inner) => inner,
                Err(e) => {
                    close(outer, jump).await;
                    return Err(e);
                }
            };
            let result = execute(&inner, &target.host, command, command_timeout).await;
            close(inner, &target.host).await;
            close(outer, jump).await;
            result
        }
    };

    if let Ok(res) = &result {
        debug!(host = %target.host, exit_code = res.exit_code, "command executed");
    }
    result
}

/// Check that a host answers a trivial command
///
/// Connection failures are returned as errors, so "could not reach" stays
/// distinguishable from "reached, but the test command exited non-zero".
///
/// # Errors
/// Propagates every `ExecError` from [`run_command`]
pub async fn test_connectivity(
    target: &SshTarget,
    jump_host: Option<&str>,
) -> Result<bool, ExecError> {
    let result = run_command(target, CONNECTIVITY_COMMAND, Some(CONNECTIVITY_TIMEOUT), jump_host)
        .await?;
    Ok(result.success())
}

/// Connect and authenticate over TCP
async fn connect_direct(
    target: &SshTarget,
    host: &str,
    port: u16,
    key: Arc<PrivateKey>,
) -> Result<Session, ExecError> {
    let establish = async {
        info!(host = %host, port, user = %target.user, "connecting to SSH");

        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler::new(host, port, target.strict_host_key_checking);

        let mut session = client::connect(config, (host, port), handler)
            .await
            .map_err(|e| map_connect_error(host, e))?;

        authenticate(&mut session, &target.user, host, key).await?;
        Ok::<_, ExecError>(session)
    };

    timeout(target.connect_timeout, establish)
        .await
        .map_err(|_| ExecError::Timeout {
            host: host.to_string(),
            timeout: target.connect_timeout,
        })?
}

/// Layer a second session over a `direct-tcpip` channel of the jump session
async fn connect_via(
    jump: &Session,
    target: &SshTarget,
    jump_host: &str,
    key: Arc<PrivateKey>,
) -> Result<Session, ExecError> {
    let establish = async {
        let channel = jump
            .channel_open_direct_tcpip(
                target.host.clone(),
                u32::from(target.port),
                "127.0.0.1",
                22,
            )
            .await
            .map_err(|e| {
                ExecError::connection(
                    &target.host,
                    format!("relay through {jump_host} failed: {e}"),
                )
            })?;

        let config = Arc::new(client::Config::default());
        let handler =
            SshClientHandler::new(&target.host, target.port, target.strict_host_key_checking);

        let mut session = client::connect_stream(config, channel.into_stream(), handler)
            .await
            .map_err(|e| map_connect_error(&target.host, e))?;

        authenticate(&mut session, &target.user, &target.host, key).await?;
        Ok::<_, ExecError>(session)
    };

    timeout(target.connect_timeout, establish)
        .await
        .map_err(|_| ExecError::Timeout {
            host: target.host.clone(),
            timeout: target.connect_timeout,
        })?
}

async fn authenticate(
    session: &mut Session,
    user: &str,
    host: &str,
    key: Arc<PrivateKey>,
) -> Result<(), ExecError> {
    let hash_alg = session
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();

    let auth_res = session
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
        .await
        .map_err(|e| ExecError::connection(host, e))?;

    if !auth_res.success() {
        return Err(ExecError::AuthenticationFailed {
            user: user.to_string(),
            host: host.to_string(),
        });
    }

    info!(host = %host, "SSH connected and authenticated");
    Ok(())
}

fn map_connect_error(host: &str, err: russh::Error) -> ExecError {
    match err {
        russh::Error::UnknownKey => ExecError::HostKeyRejected {
            host: host.to_string(),
        },
        other => ExecError::connection(host, other),
    }
}

/// Execute command and collect its output, bounded by `limit`
async fn execute(
    session: &Session,
    host: &str,
    cmd: &str,
    limit: Duration,
) -> Result<CommandResult, ExecError> {
    let start = Instant::now();

    match timeout(limit, execute_remote(session, host, cmd)).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                host = %host,
                timeout = ?limit,
                elapsed = ?start.elapsed(),
                "command timed out"
            );
            Err(ExecError::Timeout {
                host: host.to_string(),
                timeout: limit,
            })
        }
    }
}

async fn execute_remote(
    session: &Session,
    host: &str,
    cmd: &str,
) -> Result<CommandResult, ExecError> {
    debug!(command = %cmd, "executing remote command");

    let start = Instant::now();

    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| ExecError::channel(host, e))?;

    channel
        .exec(true, cmd)
        .await
        .map_err(|e| ExecError::channel(host, e))?;

    let mut exit_code = None;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    // Exit status may arrive after EOF, so read until the channel closes.
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(exit_status.cast_signed());
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    let duration = start.elapsed();
    let exit_code = exit_code.unwrap_or_else(|| {
        warn!(host = %host, "channel closed without exit status");
        -1
    });

    debug!(
        command = %cmd,
        exit_code,
        duration = ?duration,
        "remote command completed"
    );

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        duration,
    })
}

async fn close(session: Session, host: &str) {
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(host = %host, error = %e, "error while disconnecting");
    } else {
        debug!(host = %host, "SSH disconnected");
    }
}

/// SSH command executor bound to one target
///
/// Holds no connection; every `run` connects, executes and disconnects.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    target: SshTarget,
    jump_host: Option<String>,
}

impl SshExecutor {
    /// Create an executor reaching `target` directly
    #[must_use]
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            jump_host: None,
        }
    }

    /// Relay through `jump_host`
    #[must_use]
    pub fn with_jump_host(mut self, jump_host: Option<String>) -> Self {
        self.jump_host = jump_host;
        self
    }

    /// Get target
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Get jump host, if any
    pub fn jump_host(&self) -> Option<&str> {
        self.jump_host.as_deref()
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        run_command(&self.target, cmd, None, self.jump_host.as_deref()).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        run_command(
            &self.target,
            cmd,
            Some(timeout_duration),
            self.jump_host.as_deref(),
        )
        .await
    }

    fn host(&self) -> &str {
        &self.target.host
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}
