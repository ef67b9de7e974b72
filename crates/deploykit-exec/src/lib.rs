//! deploykit-exec: Remote command execution over SSH
//!
//! Runs one command on one host per call, directly or relayed through a
//! single jump host, and hands back stdout, stderr and the exit code.

pub mod error;
pub mod keys;
pub mod parse;
pub mod result;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use parse::{ParsedSshCommand, parse_ssh_command};
pub use result::{CommandResult, SshTarget};
pub use ssh::{SshExecutor, run_command, test_connectivity};
pub use traits::RemoteExecutor;
