//! Parsing of pre-formatted `ssh ...` invocations
//!
//! Infrastructure outputs hand out ready-made commands such as
//! `ssh -i ~/.ssh/key -J jambonz@203.0.113.7 jambonz@10.0.1.5`.

use serde::{Deserialize, Serialize};

/// Fields recovered from an ssh invocation; `None` means "use the default"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSshCommand {
    pub user: Option<String>,
    pub host: Option<String>,
    pub key_path: Option<String>,
    pub jump_host: Option<String>,
}

/// Parse an ssh invocation, never failing
///
/// Only `-i <key>`, `-J [user@]jump` and the final `[user@]host` token are
/// recognised. The program name, flags and flag values are never taken for
/// the destination.
#[must_use]
pub fn parse_ssh_command(ssh_cmd: &str) -> ParsedSshCommand {
    let parts: Vec<&str> = ssh_cmd.split_whitespace().collect();
    let mut parsed = ParsedSshCommand::default();

    let key_idx = flag_value_index(&parts, "-i");
    if let Some(idx) = key_idx {
        parsed.key_path = Some(parts[idx].to_string());
    }

    let jump_idx = flag_value_index(&parts, "-J");
    if let Some(idx) = jump_idx {
        let jump_spec = parts[idx];
        let jump = match jump_spec.split_once('@') {
            Some((_, host)) => host,
            None => jump_spec,
        };
        if !jump.is_empty() {
            parsed.jump_host = Some(jump.to_string());
        }
    }

    if parts.len() >= 2 {
        let last = parts.len() - 1;
        let target = parts[last];
        let is_flag_value = key_idx == Some(last) || jump_idx == Some(last);

        if !is_flag_value && !target.starts_with('-') {
            match target.split_once('@') {
                Some((user, host)) => {
                    if !user.is_empty() {
                        parsed.user = Some(user.to_string());
                    }
                    if !host.is_empty() {
                        parsed.host = Some(host.to_string());
                    }
                }
                None => parsed.host = Some(target.to_string()),
            }
        }
    }

    parsed
}

/// Index of the token following the first occurrence of `flag`
fn flag_value_index(parts: &[&str], flag: &str) -> Option<usize> {
    let idx = parts.iter().position(|p| *p == flag)?;
    (idx + 1 < parts.len()).then_some(idx + 1)
}
