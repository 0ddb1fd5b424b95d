//! Core types for remote execution.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Identifier of a managed instance, as known to the instance registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create a new instance identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Result of running one command on a remote instance.
///
/// A non-zero `exit_code` is a normal result, not an error: the caller
/// decides what a failing command means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit status reported by the remote shell
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Wall-clock time spent, including transport overhead
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Build a successful result with the given stdout (handy for mocks).
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Build a failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }
}

/// Connectivity facts for an instance, supplied by the instance registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityFacts {
    /// Public or private address reachable over SSH
    #[serde(default)]
    pub address: Option<String>,
    /// SSH port (defaults to 22)
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Login user for SSH
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Path to the private key (tilde is expanded)
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Whether the cloud remote-command agent is installed and registered
    #[serde(default)]
    pub remote_command_agent: bool,
    /// Provider-side instance identifier used by the remote-command service
    #[serde(default)]
    pub cloud_instance_id: Option<String>,
}

/// Configuration for retry logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the first attempt
    pub max_retries: u32,
    /// Base delay between retries
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Fraction of the delay applied as random jitter (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_retries: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Total number of attempts, including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `attempt` (0-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Delay before retry number `attempt` with random jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt).as_secs_f64();
        if self.jitter <= 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
