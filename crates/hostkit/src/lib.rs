//! # hostkit
//!
//! Uniform command execution on remote Linux instances.
//!
//! This crate provides:
//! - A [`RemoteExecutor`] contract: run a command, copy a file
//! - An SSH transport built on the system `ssh` client with connection reuse
//! - A transport over a cloud remote-command service (`aws ssm`)
//! - Per-instance transport selection, cached in the [`Executor`]
//! - Retry with jittered exponential backoff for transient failures
//! - Deadlines and cancellation honoured while waiting on remote commands
//!
//! ## Example
//!
//! ```no_run
//! use hostkit::{
//!     CancelToken, ConnectivityFacts, Deadline, Executor, ExecutorOptions, InstanceId,
//!     RemoteExecutor, RetryConfig, Retrying, StaticRegistry,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let mut registry = StaticRegistry::new();
//! registry.insert("ws-1", ConnectivityFacts {
//!     address: Some("203.0.113.7".into()),
//!     key_path: Some("~/.ssh/workstation".into()),
//!     ..Default::default()
//! });
//!
//! let executor = Executor::new(Arc::new(registry), ExecutorOptions::default());
//! let executor = Retrying::new(executor, RetryConfig::default());
//!
//! let deadline = Deadline::after(Duration::from_secs(60), &CancelToken::new());
//! let result = executor.execute(&InstanceId::new("ws-1"), "uname -r", &deadline).unwrap();
//! println!("{}", result.stdout);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cancel;
pub mod error;
pub mod registry;
pub mod retry;
pub mod shell;
pub mod types;

pub use backend::{
    LogObserver, NoObserver, OutputObserver, OutputStream, RemoteExecutor, Transport, TransportKind,
};
pub use cancel::{CancelToken, Deadline};
pub use error::{Error, ErrorCategory, Result};
pub use registry::{InstanceRegistry, StaticRegistry};
pub use retry::Retrying;
pub use types::{ConnectivityFacts, ExecutionResult, InstanceId, RetryConfig};

use backend::remote_command::{AwsCliCommandService, CommandService, RemoteCommandTransport};
use backend::ssh::{SshOptions, SshTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Checks whether a TCP endpoint accepts connections.
pub trait ReachabilityProbe: Send + Sync {
    /// `Ok` if `host:port` accepted a connection within `timeout`,
    /// otherwise a short reason.
    fn probe(&self, host: &str, port: u16, timeout: Duration) -> std::result::Result<(), String>;
}

/// Probe that opens (and immediately closes) a TCP connection.
pub struct TcpProbe;

impl ReachabilityProbe for TcpProbe {
    fn probe(&self, host: &str, port: u16, timeout: Duration) -> std::result::Result<(), String> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| format!("cannot resolve {host}: {e}"))?;

        let mut last_err = format!("{host} resolved to no addresses");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last_err = format!("{addr} unreachable: {e}"),
            }
        }
        Err(last_err)
    }
}

/// Options for transport selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// SSH client options
    pub ssh: SshOptions,
    /// Login user when the registry does not name one
    pub default_ssh_user: String,
    /// Timeout of the TCP reachability probe
    #[serde(with = "types::duration_millis")]
    pub probe_timeout: Duration,
    /// Status polling interval for the remote-command service
    #[serde(with = "types::duration_millis")]
    pub poll_interval: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            ssh: SshOptions::default(),
            default_ssh_user: "ubuntu".to_string(),
            probe_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Instance-addressed executor that picks a transport per instance.
///
/// Selection runs on first use of an instance and the chosen transport is
/// cached: SSH when the instance has a reachable address and a usable key,
/// otherwise the remote-command service when its agent is present.
pub struct Executor {
    registry: Arc<dyn InstanceRegistry>,
    options: ExecutorOptions,
    probe: Box<dyn ReachabilityProbe>,
    command_service: Arc<dyn CommandService>,
    observer: Arc<dyn OutputObserver>,
    transports: Mutex<HashMap<InstanceId, Arc<dyn Transport>>>,
}

impl Executor {
    /// Create an executor with the TCP probe and the `aws` CLI service.
    pub fn new(registry: Arc<dyn InstanceRegistry>, options: ExecutorOptions) -> Self {
        Self {
            registry,
            options,
            probe: Box::new(TcpProbe),
            command_service: Arc::new(AwsCliCommandService::new()),
            observer: Arc::new(LogObserver),
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the reachability probe.
    pub fn with_probe(mut self, probe: Box<dyn ReachabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the remote-command service client.
    pub fn with_command_service(mut self, service: Arc<dyn CommandService>) -> Self {
        self.command_service = service;
        self
    }

    /// Replace the observer receiving streamed output.
    pub fn with_observer(mut self, observer: Arc<dyn OutputObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Which transport serves `instance`, selecting one if needed.
    pub fn transport_kind(&self, instance: &InstanceId) -> Result<TransportKind> {
        Ok(self.transport(instance)?.kind())
    }

    /// Forget the cached transport so the next call re-runs selection.
    pub fn invalidate(&self, instance: &InstanceId) {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance);
    }

    fn transport(&self, instance: &InstanceId) -> Result<Arc<dyn Transport>> {
        if let Some(t) = self
            .transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance)
        {
            return Ok(Arc::clone(t));
        }

        let transport = self.select(instance)?;
        log::info!("Using {} transport for {}", transport.kind(), instance);
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance.clone(), Arc::clone(&transport));
        Ok(transport)
    }

    fn select(&self, instance: &InstanceId) -> Result<Arc<dyn Transport>> {
        let facts = self
            .registry
            .facts(instance)
            .ok_or_else(|| Error::UnknownInstance(instance.clone()))?;

        let ssh_reason = match self.ssh_transport(&facts) {
            Ok(t) => return Ok(Arc::new(t)),
            Err(reason) => reason,
        };
        log::debug!("{instance}: ssh ruled out: {ssh_reason}");

        let remote_command_reason = match (&facts.cloud_instance_id, facts.remote_command_agent) {
            (Some(target), true) => {
                let transport =
                    RemoteCommandTransport::new(Arc::clone(&self.command_service), target.clone())
                        .with_poll_interval(self.options.poll_interval);
                return Ok(Arc::new(transport));
            }
            (None, true) => "no provider instance id".to_string(),
            (_, false) => "agent not present".to_string(),
        };

        Err(Error::Connectivity {
            instance: instance.clone(),
            ssh_reason,
            remote_command_reason,
        })
    }

    fn ssh_transport(&self, facts: &ConnectivityFacts) -> std::result::Result<SshTransport, String> {
        let address = facts.address.as_deref().ok_or("no address")?;
        let key = facts.key_path.as_deref().ok_or("no key path")?;
        let key = resolve_key_path(key)?;
        let port = facts.ssh_port.unwrap_or(22);

        self.probe
            .probe(address, port, self.options.probe_timeout)?;

        let user = facts
            .ssh_user
            .clone()
            .unwrap_or_else(|| self.options.default_ssh_user.clone());
        SshTransport::new(address, port, user, key, self.options.ssh.clone())
            .map_err(|e| format!("cannot prepare control directory: {e}"))
    }
}

/// Expand `~` and environment variables in a key path and check it exists.
fn resolve_key_path(path: &Path) -> std::result::Result<PathBuf, String> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw).map_err(|e| format!("cannot expand {raw}: {e}"))?;
    let resolved = PathBuf::from(expanded.as_ref());
    if resolved.is_file() {
        Ok(resolved)
    } else {
        Err(format!("key {} not found", resolved.display()))
    }
}

impl RemoteExecutor for Executor {
    fn execute(
        &self,
        instance: &InstanceId,
        command: &str,
        deadline: &Deadline,
    ) -> Result<ExecutionResult> {
        self.transport(instance)?
            .run(command, deadline, self.observer.as_ref())
    }

    fn copy_file(
        &self,
        instance: &InstanceId,
        contents: &[u8],
        remote_path: &str,
        deadline: &Deadline,
    ) -> Result<()> {
        self.transport(instance)?
            .write_file(contents, remote_path, deadline)
    }
}
