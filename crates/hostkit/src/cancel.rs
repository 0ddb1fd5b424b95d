//! Cancellation tokens and deadlines.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Shared cancellation flag.
///
/// Clones observe the same flag, so a front end can keep one clone and hand
/// another to the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A point in time after which an operation should give up, plus the
/// caller's cancellation token.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<Instant>,
    started: Instant,
    token: CancelToken,
}

impl Deadline {
    /// Deadline `timeout` from now, observing `token`.
    pub fn after(timeout: Duration, token: &CancelToken) -> Self {
        let now = Instant::now();
        Self {
            at: Some(now + timeout),
            started: now,
            token: token.clone(),
        }
    }

    /// No time limit; only the token can stop the operation.
    pub fn unbounded(token: &CancelToken) -> Self {
        Self {
            at: None,
            started: Instant::now(),
            token: token.clone(),
        }
    }

    /// The cancellation token this deadline observes.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Fail with `Cancelled` or `Timeout` if the operation should stop.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_expired() {
            return Err(Error::Timeout {
                seconds: self.started.elapsed().as_secs(),
            });
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on cancellation or expiry.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let step = Duration::from_millis(50);
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(step.min(until - now));
        }
    }
}
