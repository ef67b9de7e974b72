//! Error types for deploykit-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during remote execution
///
/// Every variant belongs to exactly one of two classes: credential errors
/// (the local key could not be used) and connection errors (anything that went
/// wrong talking to the remote side). Nothing here is retried internally.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Private key missing, unreadable or unparseable
    #[error("SSH key error: {0}")]
    Credential(String),

    /// Remote host rejected the key
    #[error("authentication failed for {user}@{host}")]
    AuthenticationFailed {
        /// User that was offered
        user: String,
        /// Host that rejected it
        host: String,
    },

    /// Host key unknown or changed while strict checking is on
    #[error("host key for {host} not trusted")]
    HostKeyRejected {
        /// Host whose key was rejected
        host: String,
    },

    /// Transport or protocol failure while connecting
    #[error("SSH error connecting to {host}: {message}")]
    ConnectionFailed {
        /// Host being connected to
        host: String,
        /// Underlying cause
        message: String,
    },

    /// Connect or command exceeded its time budget
    #[error("operation on {host} timed out after {timeout:?}")]
    Timeout {
        /// Host the operation ran against
        host: String,
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Channel could not be opened or the command could not be started
    #[error("failed to execute command on {host}: {message}")]
    ChannelFailed {
        /// Host the channel belonged to
        host: String,
        /// Underlying cause
        message: String,
    },
}

impl ExecError {
    /// Whether the failure was caused by the local credential
    #[must_use]
    pub fn is_credential_error(&self) -> bool {
        matches!(self, ExecError::Credential(_))
    }

    /// Whether the failure happened while talking to the remote side
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        !self.is_credential_error()
    }

    /// Check if a caller-side retry could plausibly succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed { .. } | ExecError::Timeout { .. }
        )
    }

    pub(crate) fn connection(host: &str, err: impl std::fmt::Display) -> Self {
        ExecError::ConnectionFailed {
            host: host.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn channel(host: &str, err: impl std::fmt::Display) -> Self {
        ExecError::ChannelFailed {
            host: host.to_string(),
            message: err.to_string(),
        }
    }
}
