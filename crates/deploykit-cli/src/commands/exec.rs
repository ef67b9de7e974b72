use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use deploykit_core::Config;
use deploykit_exec::{SshTarget, parse_ssh_command, run_command};
use tracing::{debug, info};

use crate::cli::ExecArgs;

pub async fn run(args: ExecArgs, config: &Config) -> Result<ExitCode> {
    let command = args.command.join(" ");
    let (target, jump_host) = resolve_target(&args, config)?;

    info!(
        host = %target.host,
        user = %target.user,
        jump_host = jump_host.as_deref().unwrap_or("-"),
        %command,
        "running remote command"
    );

    let result = run_command(
        &target,
        &command,
        args.timeout.map(Duration::from_secs),
        jump_host.as_deref(),
    )
    .await?;

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    debug!(
        exit_code = result.exit_code,
        duration_ms = result.duration.as_millis(),
        "remote command finished"
    );

    Ok(ExitCode::from(remote_exit_code(result.exit_code)))
}

/// Target and jump host from `--host`/`--jump-host` or `--ssh-command`
///
/// Values found in the ssh command line override the configured user and key.
fn resolve_target(args: &ExecArgs, config: &Config) -> Result<(SshTarget, Option<String>)> {
    let Some(ssh_command) = &args.ssh_command else {
        let host = args
            .host
            .as_deref()
            .ok_or_else(|| eyre!("either --host or --ssh-command is required"))?;
        return Ok((config.ssh.target(host), args.jump_host.clone()));
    };

    let parsed = parse_ssh_command(ssh_command);
    let host = parsed
        .host
        .ok_or_else(|| eyre!("no host found in ssh command: {ssh_command}"))?;

    let mut target = config.ssh.target(&host);
    if let Some(user) = parsed.user {
        target.user = user;
    }
    if let Some(key_path) = parsed.key_path {
        target.key_path = PathBuf::from(key_path);
    }
    Ok((target, parsed.jump_host))
}

/// Pass the remote exit status through; -1 (no status) and out-of-range
/// values become a plain failure
fn remote_exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(host: Option<&str>, jump: Option<&str>, ssh_command: Option<&str>) -> ExecArgs {
        ExecArgs {
            host: host.map(str::to_string),
            jump_host: jump.map(str::to_string),
            ssh_command: ssh_command.map(str::to_string),
            timeout: None,
            command: vec!["uptime".to_string()],
        }
    }

    #[test]
    fn test_resolve_from_host() {
        let config = Config::default();
        let (target, jump) =
            resolve_target(&args(Some("10.0.1.5"), Some("203.0.113.20"), None), &config).unwrap();

        assert_eq!(target.host, "10.0.1.5");
        assert_eq!(target.user, "jambonz");
        assert_eq!(jump.as_deref(), Some("203.0.113.20"));
    }

    #[test]
    fn test_resolve_from_ssh_command() {
        let config = Config::default();
        let command = "ssh -i /keys/deploy -J admin@203.0.113.20 admin@10.0.1.5";
        let (target, jump) = resolve_target(&args(None, None, Some(command)), &config).unwrap();

        assert_eq!(target.host, "10.0.1.5");
        assert_eq!(target.user, "admin");
        assert_eq!(target.key_path, PathBuf::from("/keys/deploy"));
        assert_eq!(jump.as_deref(), Some("203.0.113.20"));
    }

    #[test]
    fn test_resolve_ssh_command_without_host() {
        let config = Config::default();
        assert!(resolve_target(&args(None, None, Some("ssh -i key")), &config).is_err());
    }

    #[test]
    fn test_remote_exit_code() {
        assert_eq!(remote_exit_code(0), 0);
        assert_eq!(remote_exit_code(3), 3);
        assert_eq!(remote_exit_code(-1), 1);
        assert_eq!(remote_exit_code(300), 1);
    }
}
