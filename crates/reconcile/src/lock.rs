//! Per-instance mutual exclusion.
//!
//! [`InstanceLocks`] is a keyed lease table: taking the lease for one
//! instance never waits on another. A second request for a held instance
//! fails at once instead of queueing.

use crate::error::{Error, Result};
use hostkit::InstanceId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Table of instances with an apply or rollback in flight.
#[derive(Debug, Clone, Default)]
pub struct InstanceLocks {
    held: Arc<Mutex<HashSet<InstanceId>>>,
}

impl InstanceLocks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `instance`, failing with [`Error::Concurrency`]
    /// if someone else holds it.
    pub fn try_lock(&self, instance: &InstanceId) -> Result<InstanceGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(instance.clone()) {
            log::debug!("Lease for {instance} is already held");
            return Err(Error::Concurrency {
                instance: instance.clone(),
            });
        }
        log::trace!("Took lease for {instance}");
        Ok(InstanceGuard {
            held: Arc::clone(&self.held),
            instance: instance.clone(),
        })
    }

    /// Whether `instance` is currently leased.
    pub fn is_locked(&self, instance: &InstanceId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(instance)
    }
}

/// Lease on one instance, released on drop.
#[derive(Debug)]
pub struct InstanceGuard {
    held: Arc<Mutex<HashSet<InstanceId>>>,
    instance: InstanceId,
}

impl InstanceGuard {
    /// The leased instance.
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.instance);
        log::trace!("Released lease for {}", self.instance);
    }
}
