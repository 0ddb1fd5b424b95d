//! Transport over a cloud remote-command service.
//!
//! The service accepts a shell command, runs it asynchronously through an
//! agent on the instance, and exposes status and output for polling. Output
//! may come back in several chunks; they are reassembled by index.

use crate::backend::{OutputObserver, OutputStream, Transport, TransportKind};
use crate::cancel::Deadline;
use crate::error::{Error, Result};
use crate::shell;
use crate::types::ExecutionResult;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on the base64 payload sent per command when copying files.
const COPY_CHUNK_BYTES: usize = 16 * 1024;

/// Bytes of each stream returned per output chunk. Both streams base64
/// encoded stay under the 24,000 characters the service returns inline.
pub const OUTPUT_SLICE_BYTES: usize = 8 * 1024;

/// Where spooled command output lives on the instance.
const SPOOL_DIR: &str = "/var/tmp/hostkit";

/// Polls of a chunk read before giving up.
const READ_POLLS: u32 = 120;

/// Status of a submitted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// Accepted but not started
    Pending,
    /// Running on the instance
    InProgress,
    /// Finished; the exit code may still be non-zero
    Finished {
        /// Exit code of the remote shell
        exit_code: i32,
    },
    /// Cancelled on the service side
    Cancelled,
    /// The service gave up waiting
    TimedOut,
    /// The service could not deliver the command
    Undeliverable {
        /// Reason from the service
        reason: String,
    },
}

impl CommandStatus {
    /// Whether polling can stop.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One piece of command output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChunk {
    /// Position of this chunk in the full output
    pub index: u32,
    /// Standard output fragment
    pub stdout: Vec<u8>,
    /// Standard error fragment
    pub stderr: Vec<u8>,
}

/// Client for a remote-command service.
pub trait CommandService: Send + Sync {
    /// Submit `command`; returns the service's command id.
    fn send(&self, target: &str, command: &str, timeout: Duration) -> Result<String>;

    /// Current status of a submitted command.
    fn poll(&self, target: &str, command_id: &str) -> Result<CommandStatus>;

    /// Fetch output chunk `index`, or `None` once past the last chunk.
    fn fetch_output(&self, target: &str, command_id: &str, index: u32)
    -> Result<Option<OutputChunk>>;

    /// Ask the service to stop a command. Best effort.
    fn cancel(&self, _target: &str, _command_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Remote-command connection to one instance.
pub struct RemoteCommandTransport {
    service: Arc<dyn CommandService>,
    target: String,
    poll_interval: Duration,
}

impl RemoteCommandTransport {
    /// Create a transport addressing `target` (the provider's instance id).
    pub fn new(service: Arc<dyn CommandService>, target: impl Into<String>) -> Self {
        Self {
            service,
            target: target.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Set how often command status is polled.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn wait_for(&self, command_id: &str, deadline: &Deadline) -> Result<CommandStatus> {
        loop {
            if let Err(e) = deadline.check() {
                if let Err(cancel_err) = self.service.cancel(&self.target, command_id) {
                    log::debug!("failed to cancel {command_id}: {cancel_err}");
                }
                return Err(e);
            }
            let status = self.service.poll(&self.target, command_id)?;
            if status.is_terminal() {
                return Ok(status);
            }
            deadline.sleep(self.poll_interval)?;
        }
    }

    fn collect_output(&self, command_id: &str) -> Result<(String, String)> {
        let mut chunks = BTreeMap::new();
        let mut index = 0;
        while let Some(chunk) = self.service.fetch_output(&self.target, command_id, index)? {
            chunks.insert(chunk.index, chunk);
            index += 1;
        }

        // Chunks are byte slices; a character may straddle two of them
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        for chunk in chunks.into_values() {
            stdout.extend_from_slice(&chunk.stdout);
            stderr.extend_from_slice(&chunk.stderr);
        }
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    fn run_checked(&self, command: &str, deadline: &Deadline) -> Result<()> {
        let result = self.run(command, deadline, &super::NoObserver)?;
        if !result.success() {
            return Err(Error::Service {
                message: format!(
                    "command failed (exit {}): {}",
                    result.exit_code,
                    result.stderr.trim()
                ),
            });
        }
        Ok(())
    }
}

impl Transport for RemoteCommandTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RemoteCommand
    }

    fn run(
        &self,
        command: &str,
        deadline: &Deadline,
        observer: &dyn OutputObserver,
    ) -> Result<ExecutionResult> {
        deadline.check()?;
        let started = Instant::now();
        let timeout = deadline.remaining().unwrap_or(Duration::from_secs(3600));

        log::debug!("remote-command {}: {}", self.target, command);
        let command_id = self.service.send(&self.target, command, timeout)?;

        let exit_code = match self.wait_for(&command_id, deadline)? {
            CommandStatus::Finished { exit_code } => exit_code,
            CommandStatus::TimedOut => {
                return Err(Error::Timeout {
                    seconds: started.elapsed().as_secs(),
                });
            }
            CommandStatus::Cancelled => {
                return Err(Error::Service {
                    message: format!("command {command_id} was cancelled by the service"),
                });
            }
            CommandStatus::Undeliverable { reason } => {
                return Err(Error::Service { message: reason });
            }
            status @ (CommandStatus::Pending | CommandStatus::InProgress) => {
                return Err(Error::Service {
                    message: format!("command {command_id} stopped in state {status:?}"),
                });
            }
        };

        let (stdout, stderr) = self.collect_output(&command_id)?;
        for line in stdout.lines() {
            observer.on_line(OutputStream::Stdout, line);
        }
        for line in stderr.lines() {
            observer.on_line(OutputStream::Stderr, line);
        }

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }

    fn write_file(&self, contents: &[u8], remote_path: &str, deadline: &Deadline) -> Result<()> {
        let encoded = STANDARD.encode(contents);
        let staging = format!("{remote_path}.b64");
        let staging_q = shell::quote(&staging);

        self.run_checked(
            &format!(
                "mkdir -p \"$(dirname {})\" && : > {staging_q}",
                shell::quote(remote_path)
            ),
            deadline,
        )?;

        // Base64 output is ASCII, so byte-based chunking never splits a char
        for chunk in encoded.as_bytes().chunks(COPY_CHUNK_BYTES) {
            let piece = String::from_utf8_lossy(chunk);
            self.run_checked(&format!("printf '%s' '{piece}' >> {staging_q}"), deadline)?;
        }

        self.run_checked(
            &format!(
                "base64 -d {staging_q} > {tmp} && mv -f {tmp} {path} && rm -f {staging_q}",
                tmp = shell::quote(&format!("{remote_path}.tmp")),
                path = shell::quote(remote_path),
            ),
            deadline,
        )
    }
}

/// [`CommandService`] backed by the `aws ssm` command line client.
///
/// The service truncates inline output, so every command writes its streams
/// to spool files on the instance and [`CommandService::fetch_output`] reads
/// them back in [`OUTPUT_SLICE_BYTES`] slices.
#[derive(Debug, Clone, Default)]
pub struct AwsCliCommandService {
    region: Option<String>,
    profile: Option<String>,
    // command id -> spool path prefix
    spools: Arc<Mutex<HashMap<String, String>>>,
}

impl AwsCliCommandService {
    /// Create a client using the CLI's default region and profile.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Use a named credentials profile.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    fn aws(&self, args: &[&str]) -> Result<serde_json::Value> {
        let mut cmd = Command::new("aws");
        cmd.args(args).args(["--output", "json"]);
        if let Some(region) = &self.region {
            cmd.args(["--region", region]);
        }
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile]);
        }

        let output = cmd.output()?;
        if !output.status.success() {
            return Err(classify_cli_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

impl CommandService for AwsCliCommandService {
    fn send(&self, target: &str, command: &str, timeout: Duration) -> Result<String> {
        let token: u64 = rand::thread_rng().r#gen();
        let spool = format!("{SPOOL_DIR}/{token:016x}");
        let command_id = self.send_raw(target, &spool_command(command, &spool), timeout)?;
        self.spools_guard().insert(command_id.clone(), spool);
        Ok(command_id)
    }

    fn poll(&self, target: &str, command_id: &str) -> Result<CommandStatus> {
        match self.invocation(target, command_id) {
            Ok(invocation) => Ok(parse_invocation_status(&invocation)),
            // The invocation is not visible for a short while after sending
            Err(Error::Service { message }) if message.contains("InvocationDoesNotExist") => {
                Ok(CommandStatus::Pending)
            }
            Err(e) => Err(e),
        }
    }

    fn fetch_output(
        &self,
        target: &str,
        command_id: &str,
        index: u32,
    ) -> Result<Option<OutputChunk>> {
        let spool = self.spools_guard().get(command_id).cloned();
        let Some(spool) = spool else {
            return self.inline_output(target, command_id, index);
        };

        let invocation = self.run_and_wait(target, &slice_command(&spool, index))?;
        match parse_invocation_status(&invocation) {
            CommandStatus::Finished { exit_code: 0 } => {}
            status => {
                return Err(Error::Service {
                    message: format!("reading output of {command_id} failed: {status:?}"),
                });
            }
        }
        let (stdout, stderr) =
            parse_slice(invocation["StandardOutputContent"].as_str().unwrap_or_default())?;
        if stdout.is_empty() && stderr.is_empty() {
            self.spools_guard().remove(command_id);
            let cleanup = format!("rm -f {spool}.out {spool}.err");
            if let Err(e) = self.send_raw(target, &cleanup, Duration::from_secs(30)) {
                log::debug!("failed to remove spool {spool}: {e}");
            }
            return Ok(None);
        }
        Ok(Some(OutputChunk {
            index,
            stdout,
            stderr,
        }))
    }

    fn cancel(&self, target: &str, command_id: &str) -> Result<()> {
        self.spools_guard().remove(command_id);
        self.aws(&[
            "ssm",
            "cancel-command",
            "--command-id",
            command_id,
            "--instance-ids",
            target,
        ])?;
        Ok(())
    }
}

impl AwsCliCommandService {
    fn spools_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.spools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_raw(&self, target: &str, command: &str, timeout: Duration) -> Result<String> {
        let parameters = serde_json::json!({ "commands": [command] }).to_string();
        // The service rejects execution timeouts under 30 seconds
        let timeout = timeout.as_secs().max(30).to_string();

        let response = self.aws(&[
            "ssm",
            "send-command",
            "--instance-ids",
            target,
            "--document-name",
            "AWS-RunShellScript",
            "--parameters",
            &parameters,
            "--timeout-seconds",
            &timeout,
        ])?;

        response["Command"]["CommandId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Service {
                message: "send-command response has no CommandId".to_string(),
            })
    }

    /// Send an unspooled command and wait for it to finish.
    fn run_and_wait(&self, target: &str, command: &str) -> Result<serde_json::Value> {
        let command_id = self.send_raw(target, command, Duration::from_secs(60))?;
        for _ in 0..READ_POLLS {
            thread::sleep(Duration::from_millis(500));
            let invocation = match self.invocation(target, &command_id) {
                Ok(invocation) => invocation,
                Err(Error::Service { message }) if message.contains("InvocationDoesNotExist") => {
                    continue;
                }
                Err(e) => return Err(e),
            };
            if parse_invocation_status(&invocation).is_terminal() {
                return Ok(invocation);
            }
        }
        Err(Error::Timeout {
            seconds: u64::from(READ_POLLS) / 2,
        })
    }

    /// Output of a command sent without a spool, in one (possibly
    /// truncated) piece.
    fn inline_output(
        &self,
        target: &str,
        command_id: &str,
        index: u32,
    ) -> Result<Option<OutputChunk>> {
        if index > 0 {
            return Ok(None);
        }
        let invocation = self.invocation(target, command_id)?;
        let field = |name: &str| invocation[name].as_str().unwrap_or_default().as_bytes().to_vec();
        Ok(Some(OutputChunk {
            index,
            stdout: field("StandardOutputContent"),
            stderr: field("StandardErrorContent"),
        }))
    }

    fn invocation(&self, target: &str, command_id: &str) -> Result<serde_json::Value> {
        self.aws(&[
            "ssm",
            "get-command-invocation",
            "--command-id",
            command_id,
            "--instance-id",
            target,
        ])
    }
}

/// Run `command` with its streams redirected to `<spool>.out` and `<spool>.err`.
fn spool_command(command: &str, spool: &str) -> String {
    format!(
        "mkdir -p {SPOOL_DIR} && sh -c {} > {spool}.out 2> {spool}.err",
        shell::quote(command)
    )
}

/// Print slice `index` of both spool files as two base64 lines.
fn slice_command(spool: &str, index: u32) -> String {
    let offset = index as usize * OUTPUT_SLICE_BYTES + 1;
    format!(
        "for s in out err; do tail -c +{offset} {spool}.$s 2>/dev/null | head -c {OUTPUT_SLICE_BYTES} | base64 | tr -d '\\n'; echo; done"
    )
}

/// Decode the two base64 lines printed by [`slice_command`].
fn parse_slice(stdout: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut lines = stdout.lines().map(str::trim);
    let mut decode = |stream: &str| -> Result<Vec<u8>> {
        let line = lines.next().unwrap_or_default();
        STANDARD.decode(line).map_err(|e| Error::Service {
            message: format!("spooled {stream} is not base64: {e}"),
        })
    };
    let out = decode("stdout")?;
    let err = decode("stderr")?;
    Ok((out, err))
}

fn parse_invocation_status(invocation: &serde_json::Value) -> CommandStatus {
    let status = invocation["Status"].as_str().unwrap_or("Pending");
    let exit_code = invocation["ResponseCode"].as_i64().unwrap_or(-1) as i32;

    match status {
        "Pending" | "Delayed" => CommandStatus::Pending,
        "InProgress" | "Cancelling" => CommandStatus::InProgress,
        "Success" | "Failed" => CommandStatus::Finished { exit_code },
        "Cancelled" => CommandStatus::Cancelled,
        "TimedOut" => CommandStatus::TimedOut,
        other => CommandStatus::Undeliverable {
            reason: invocation["StatusDetails"]
                .as_str()
                .unwrap_or(other)
                .to_string(),
        },
    }
}

fn classify_cli_failure(stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if lower.contains("throttl")
        || lower.contains("could not connect")
        || lower.contains("connection reset")
        || lower.contains("read timeout")
        || lower.contains("service unavailable")
    {
        Error::Transient { message }
    } else {
        Error::Service { message }
    }
}
