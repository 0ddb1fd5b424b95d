//! SSH transport using the system `ssh` client.
//!
//! Connections are multiplexed through an OpenSSH control socket, so every
//! command after the first one to the same host reuses an established
//! session instead of paying for a new handshake.

use crate::backend::{OutputObserver, OutputStream, Transport, TransportKind};
use crate::cancel::Deadline;
use crate::error::{Error, Result};
use crate::shell;
use crate::types::ExecutionResult;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Exit status OpenSSH reserves for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Options shared by every SSH transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    /// Path to the `ssh` executable
    pub program: String,
    /// Directory holding the control sockets
    pub control_dir: PathBuf,
    /// How long an idle master connection stays up, in seconds
    pub control_persist_secs: u64,
    /// TCP connect timeout, in seconds
    pub connect_timeout_secs: u64,
    /// Value of `StrictHostKeyChecking`
    pub strict_host_key_checking: String,
    /// Alternate known-hosts file
    pub known_hosts_file: Option<PathBuf>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            control_dir: std::env::temp_dir().join("hostkit-ssh"),
            control_persist_secs: 120,
            connect_timeout_secs: 10,
            strict_host_key_checking: "accept-new".to_string(),
            known_hosts_file: None,
        }
    }
}

/// SSH connection to one instance.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    port: u16,
    user: String,
    key_path: PathBuf,
    options: SshOptions,
}

impl SshTransport {
    /// Create a transport for `user@host:port` authenticating with `key_path`.
    ///
    /// Creates the control socket directory if needed.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        key_path: PathBuf,
        options: SshOptions,
    ) -> Result<Self> {
        std::fs::create_dir_all(&options.control_dir)?;
        Ok(Self {
            host: host.into(),
            port,
            user: user.into(),
            key_path,
            options,
        })
    }

    /// Login user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Arguments passed to `ssh` before the remote command.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                self.options.strict_host_key_checking
            ),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPersist={}s", self.options.control_persist_secs),
            "-o".to_string(),
            // %C is a hash of the connection parameters, which keeps the
            // socket path under the unix socket length limit.
            format!("ControlPath={}/%C", self.options.control_dir.display()),
        ];
        if let Some(known_hosts) = &self.options.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        args.push(format!("{}@{}", self.user, self.host));
        args.push("--".to_string());
        args
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.options.program);
        cmd.args(self.base_args());
        cmd.arg(shell::elevate(script, &self.user));
        cmd
    }

    fn run_script(
        &self,
        script: &str,
        stdin: Option<&[u8]>,
        deadline: &Deadline,
        observer: &dyn OutputObserver,
    ) -> Result<ExecutionResult> {
        deadline.check()?;
        log::debug!("ssh {}@{}: {}", self.user, self.host, script);

        let result = run_process(self.command(script), stdin, deadline, observer)?;
        if result.exit_code == SSH_FAILURE_STATUS {
            return Err(Error::from_ssh_failure(&result.stderr));
        }
        Ok(result)
    }
}

impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn run(
        &self,
        command: &str,
        deadline: &Deadline,
        observer: &dyn OutputObserver,
    ) -> Result<ExecutionResult> {
        self.run_script(command, None, deadline, observer)
    }

    fn write_file(&self, contents: &[u8], remote_path: &str, deadline: &Deadline) -> Result<()> {
        let suffix: u32 = rand::thread_rng().r#gen();
        let tmp = format!("{remote_path}.tmp.{suffix:08x}");
        let script = format!(
            "mkdir -p \"$(dirname {path})\" && cat > {tmp} && mv -f {tmp} {path}",
            path = shell::quote(remote_path),
            tmp = shell::quote(&tmp),
        );

        let result = self.run_script(&script, Some(contents), deadline, &super::NoObserver)?;
        if !result.success() {
            return Err(Error::Service {
                message: format!(
                    "writing {remote_path} failed (exit {}): {}",
                    result.exit_code,
                    result.stderr.trim()
                ),
            });
        }
        Ok(())
    }
}

/// Spawn `cmd`, stream its output to `observer`, and wait for it while
/// honouring `deadline`.
///
/// The process is killed when the deadline expires or is cancelled.
pub(crate) fn run_process(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    deadline: &Deadline,
    observer: &dyn OutputObserver,
) -> Result<ExecutionResult> {
    let started = Instant::now();
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    let (status, stdout, stderr) = thread::scope(|scope| {
        if let (Some(mut pipe), Some(bytes)) = (child_stdin, stdin) {
            scope.spawn(move || {
                // Dropping the pipe afterwards signals EOF to the remote side
                if let Err(e) = pipe.write_all(bytes) {
                    log::debug!("failed to write stdin: {e}");
                }
            });
        }
        let out = scope.spawn(move || read_lines(child_stdout, OutputStream::Stdout, observer));
        let err = scope.spawn(move || read_lines(child_stderr, OutputStream::Stderr, observer));

        let status = wait_with_deadline(&mut child, deadline);
        let stdout = out.join().unwrap_or_default();
        let stderr = err.join().unwrap_or_default();
        (status, stdout, stderr)
    });

    let status = status?;
    Ok(ExecutionResult {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        duration: started.elapsed(),
    })
}

fn read_lines<R: Read>(
    pipe: Option<R>,
    stream: OutputStream,
    observer: &dyn OutputObserver,
) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };

    // Not necessarily UTF-8. Read to EOF so the child never sees SIGPIPE.
    let mut reader = BufReader::new(pipe);
    let mut collected = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let had_newline = buf.last() == Some(&b'\n');
                if had_newline {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                observer.on_line(stream, &line);
                collected.push_str(&line);
                if had_newline {
                    collected.push('\n');
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("stopped reading {stream:?}: {e}");
                break;
            }
        }
    }
    collected
}

fn wait_with_deadline(child: &mut Child, deadline: &Deadline) -> Result<ExitStatus> {
    let poll = Duration::from_millis(20);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Err(e) = deadline.check() {
            log::debug!("killing local process: {e}");
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use std::sync::Mutex;

    fn transport(user: &str) -> SshTransport {
        let dir = tempfile::tempdir().unwrap();
        let options = SshOptions {
            control_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        SshTransport::new("10.0.0.4", 2222, user, PathBuf::from("/keys/id"), options).unwrap()
    }

    #[test]
    fn test_base_args_enable_multiplexing() {
        let args = transport("ubuntu").base_args();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&"ControlPersist=120s".to_string()));
        assert!(args.iter().any(|a| a.starts_with("ControlPath=") && a.ends_with("/%C")));
        assert!(args.contains(&"2222".to_string()));
        assert_eq!(args[args.len() - 2], "ubuntu@10.0.0.4");
        assert_eq!(args[args.len() - 1], "--");
    }

    #[test]
    fn test_non_root_commands_use_sudo() {
        let cmd = transport("ubuntu").command("id -u");
        let last = cmd.get_args().last().unwrap().to_string_lossy().to_string();
        assert_eq!(last, "sudo -n sh -c 'id -u'");

        let cmd = transport("root").command("id -u");
        let last = cmd.get_args().last().unwrap().to_string_lossy().to_string();
        assert_eq!(last, "sh -c 'id -u'");
    }

    struct Collect(Mutex<Vec<(OutputStream, String)>>);

    impl OutputObserver for Collect {
        fn on_line(&self, stream: OutputStream, line: &str) {
            self.0.lock().unwrap().push((stream, line.to_string()));
        }
    }

    #[test]
    fn test_run_process_streams_lines() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo one; echo two; echo oops >&2; exit 3");
        let observer = Collect(Mutex::new(Vec::new()));
        let deadline = Deadline::after(Duration::from_secs(10), &CancelToken::new());

        let result = run_process(cmd, None, &deadline, &observer).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "one\ntwo\n");
        assert_eq!(result.stderr, "oops\n");

        let lines = observer.0.lock().unwrap();
        assert!(lines.contains(&(OutputStream::Stdout, "one".to_string())));
        assert!(lines.contains(&(OutputStream::Stderr, "oops".to_string())));
    }

    #[test]
    fn test_run_process_survives_invalid_utf8() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(
            "printf 'caf\\351\\n'; i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done; echo DONE",
        );
        let observer = Collect(Mutex::new(Vec::new()));
        let deadline = Deadline::after(Duration::from_secs(30), &CancelToken::new());

        let result = run_process(cmd, None, &deadline, &observer).unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.starts_with("caf\u{FFFD}\n"));
        assert!(result.stdout.ends_with("line 19999\nDONE\n"));
        assert_eq!(observer.0.lock().unwrap().len(), 20_002);
    }

    #[test]
    fn test_run_process_feeds_stdin() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("cat");
        let deadline = Deadline::after(Duration::from_secs(10), &CancelToken::new());

        let result = run_process(cmd, Some(b"payload\n"), &deadline, &super::super::NoObserver)
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "payload\n");
    }

    #[test]
    fn test_run_process_kills_on_deadline() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 30");
        let deadline = Deadline::after(Duration::from_millis(100), &CancelToken::new());
        let started = Instant::now();

        let err = run_process(cmd, None, &deadline, &super::super::NoObserver).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
