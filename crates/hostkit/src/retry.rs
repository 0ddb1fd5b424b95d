//! Retry logic with jittered exponential backoff for transient errors.

use crate::backend::RemoteExecutor;
use crate::cancel::Deadline;
use crate::error::{Error, Result};
use crate::types::{ExecutionResult, InstanceId, RetryConfig};
use std::time::Duration;

/// Callback trait for retry progress notifications.
pub trait RetryCallback: Send + Sync {
    /// Called when an operation is being retried.
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Time until the next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _max_attempts: u32, _error: &Error, _delay: Duration) {}
}

/// Callback that logs retry information at warn level.
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration) {
        log::warn!(
            "Attempt {}/{} failed: {}. Retrying in {:.1}s...",
            attempt,
            max_attempts,
            error,
            delay.as_secs_f64()
        );
    }
}

/// Execute an operation with retry logic.
///
/// Retries the operation while it returns a retryable error, sleeping with
/// jittered exponential backoff between attempts. The sleep wakes early if
/// the deadline is cancelled or expires, in which case that error wins.
///
/// # Returns
/// The result of the operation, or the last error if all attempts failed.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    deadline: &Deadline,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = config.max_attempts();
    let mut attempt = 0;

    loop {
        deadline.check()?;

        let err = match operation() {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt + 1 >= max_attempts {
            return Err(err);
        }

        let delay = config.jittered_delay(attempt);
        if let Some(cb) = callback {
            cb.on_retry(attempt + 1, max_attempts, &err, delay);
        }
        deadline.sleep(delay)?;
        attempt += 1;
    }
}

/// Executor wrapper that retries transient transport failures.
///
/// Only errors are retried. A command that ran and exited non-zero comes
/// back as an `Ok` result and is returned as-is.
pub struct Retrying<E> {
    inner: E,
    config: RetryConfig,
    callback: Box<dyn RetryCallback>,
}

impl<E: RemoteExecutor> Retrying<E> {
    /// Wrap `inner`, logging each retry.
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            callback: Box::new(LogCallback),
        }
    }

    /// Replace the retry callback.
    pub fn with_callback(mut self, callback: Box<dyn RetryCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// The wrapped executor.
    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: RemoteExecutor> RemoteExecutor for Retrying<E> {
    fn execute(
        &self,
        instance: &InstanceId,
        command: &str,
        deadline: &Deadline,
    ) -> Result<ExecutionResult> {
        with_retry(&self.config, deadline, Some(self.callback.as_ref()), || {
            self.inner.execute(instance, command, deadline)
        })
    }

    fn copy_file(
        &self,
        instance: &InstanceId,
        contents: &[u8],
        remote_path: &str,
        deadline: &Deadline,
    ) -> Result<()> {
        with_retry(&self.config, deadline, Some(self.callback.as_ref()), || {
            self.inner.copy_file(instance, contents, remote_path, deadline)
        })
    }
}
