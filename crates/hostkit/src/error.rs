//! Error types for remote execution.
//!
//! Errors are categorized so the retry logic can tell a network blip from a
//! command that genuinely failed. A command that ran and exited non-zero is
//! not an error at this layer; it is reported through
//! [`ExecutionResult`](crate::ExecutionResult).

use crate::types::InstanceId;
use thiserror::Error;

/// Categories of execution errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No transport can reach the instance
    Connectivity,
    /// Network blip or timeout while a command was in flight (retryable)
    Transient,
    /// The caller cancelled the operation
    Cancelled,
    /// The remote side rejected the request (bad credentials, malformed call)
    Rejected,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this error category is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Connectivity => "No viable transport",
            Self::Transient => "Transient network failure",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Request rejected",
            Self::Other => "Unexpected error",
        }
    }
}

/// Errors that can occur while talking to a remote instance.
#[derive(Debug, Error)]
pub enum Error {
    /// Neither SSH nor the remote-command service can be used
    #[error("no viable transport for {instance}: ssh unavailable ({ssh_reason}); remote command unavailable ({remote_command_reason})")]
    Connectivity {
        /// Instance that could not be reached
        instance: InstanceId,
        /// Why SSH was ruled out
        ssh_reason: String,
        /// Why the remote-command service was ruled out
        remote_command_reason: String,
    },

    /// The instance is not known to the registry
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    /// Connection reset, refused, dropped, or similar
    #[error("transient failure: {message}")]
    Transient {
        /// Details from the transport
        message: String,
    },

    /// The deadline passed before the command completed
    #[error("timed out after {seconds}s")]
    Timeout {
        /// Seconds waited
        seconds: u64,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The remote-command service rejected or failed the request
    #[error("remote command service error: {message}")]
    Service {
        /// Details from the service
        message: String,
    },

    /// IO error while spawning or talking to a local helper process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Connectivity { .. } | Error::UnknownInstance(_) => ErrorCategory::Connectivity,
            Error::Transient { .. } | Error::Timeout { .. } => ErrorCategory::Transient,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::Service { .. } => ErrorCategory::Rejected,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Classify the stderr of an `ssh` invocation that exited with 255.
    ///
    /// Exit status 255 is reserved by OpenSSH for its own failures; any other
    /// status belongs to the remote command and is not an error.
    pub fn from_ssh_failure(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();

        if lower.contains("connection reset")
            || lower.contains("connection refused")
            || lower.contains("connection closed")
            || lower.contains("connection timed out")
            || lower.contains("timed out")
            || lower.contains("broken pipe")
            || lower.contains("no route to host")
            || lower.contains("network is unreachable")
            || lower.contains("could not resolve")
            || lower.contains("control socket")
        {
            return Error::Transient {
                message: stderr.trim().to_string(),
            };
        }

        if lower.contains("permission denied") || lower.contains("host key verification failed")
        {
            return Error::Service {
                message: stderr.trim().to_string(),
            };
        }

        // Unknown ssh failures are treated as transient: the command never ran
        Error::Transient {
            message: stderr.trim().to_string(),
        }
    }
}

/// Result type for remote execution.
pub type Result<T> = std::result::Result<T, Error>;
