//! Transport abstraction for remote execution.
//!
//! [`RemoteExecutor`] is the instance-addressed contract callers program
//! against. A [`Transport`] is one concrete way of reaching one instance;
//! the [`Executor`](crate::Executor) picks a transport per instance and
//! forwards to it.

pub mod remote_command;
pub mod ssh;

use crate::cancel::Deadline;
use crate::error::Result;
use crate::types::{ExecutionResult, InstanceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Uniform command execution against managed instances.
///
/// Implementations must be usable from several worker threads at once.
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on the instance with administrative privileges.
    ///
    /// A non-zero exit status is returned as a normal result. Errors are
    /// reserved for transport failures, cancellation and timeouts.
    fn execute(
        &self,
        instance: &InstanceId,
        command: &str,
        deadline: &Deadline,
    ) -> Result<ExecutionResult>;

    /// Write `contents` to `remote_path`, replacing any existing file.
    fn copy_file(
        &self,
        instance: &InstanceId,
        contents: &[u8],
        remote_path: &str,
        deadline: &Deadline,
    ) -> Result<()>;
}

impl<T: RemoteExecutor + ?Sized> RemoteExecutor for Arc<T> {
    fn execute(
        &self,
        instance: &InstanceId,
        command: &str,
        deadline: &Deadline,
    ) -> Result<ExecutionResult> {
        (**self).execute(instance, command, deadline)
    }

    fn copy_file(
        &self,
        instance: &InstanceId,
        contents: &[u8],
        remote_path: &str,
        deadline: &Deadline,
    ) -> Result<()> {
        (**self).copy_file(instance, contents, remote_path, deadline)
    }
}

/// Which mechanism a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// System `ssh` client with key authentication
    Ssh,
    /// Cloud provider remote-command service
    RemoteCommand,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh => write!(f, "ssh"),
            Self::RemoteCommand => write!(f, "remote-command"),
        }
    }
}

/// A connection to a single instance.
pub trait Transport: Send + Sync {
    /// The mechanism behind this transport.
    fn kind(&self) -> TransportKind;

    /// Run a command, forwarding output lines to `observer` as they arrive.
    fn run(
        &self,
        command: &str,
        deadline: &Deadline,
        observer: &dyn OutputObserver,
    ) -> Result<ExecutionResult>;

    /// Replace `remote_path` with `contents`.
    fn write_file(&self, contents: &[u8], remote_path: &str, deadline: &Deadline) -> Result<()>;
}

/// Output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Receives command output incrementally.
pub trait OutputObserver: Send + Sync {
    /// Called once per line, without the trailing newline.
    fn on_line(&self, stream: OutputStream, line: &str);
}

/// Observer that discards output.
pub struct NoObserver;

impl OutputObserver for NoObserver {
    fn on_line(&self, _stream: OutputStream, _line: &str) {}
}

/// Observer that forwards output to the `log` facade at trace level.
pub struct LogObserver;

impl OutputObserver for LogObserver {
    fn on_line(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => log::trace!("remote stdout: {line}"),
            OutputStream::Stderr => log::trace!("remote stderr: {line}"),
        }
    }
}
