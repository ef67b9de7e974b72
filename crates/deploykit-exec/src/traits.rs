//! Remote executor trait

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::CommandResult;

/// Something that runs shell commands on one host
///
/// Higher-level checks are written against this trait so they can be driven
/// by a test double instead of a live SSH server.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run with the executor's default timeout
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Run with an explicit timeout
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Host commands run on
    fn host(&self) -> &str;

    /// Short name for logs
    fn executor_type(&self) -> &'static str;
}
