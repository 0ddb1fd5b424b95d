//! Command implementations. Each prints its structured result as JSON on
//! stdout and a short summary on stderr.

pub mod apply;
pub mod inspect;
pub mod rollback;

use crate::config::Config;
use anyhow::{Context as _, Result};
use hostkit::{Executor, Retrying};
use reconcile::{Engine, FsBlobStore, Ledger};
use serde::Serialize;
use std::sync::Arc;

/// Build an engine over the configured instances and state directory.
pub fn engine(config: &Config) -> Result<Engine> {
    let state_dir = config.state_dir()?;
    let ledger = Ledger::open(state_dir.join("ledger"))
        .with_context(|| format!("Could not open ledger under {}", state_dir.display()))?;
    let blobs = FsBlobStore::open(state_dir.join("blobs"))
        .with_context(|| format!("Could not open blob store under {}", state_dir.display()))?;

    let executor = Executor::new(Arc::new(config.registry()), config.executor.clone())
        .with_command_service(Arc::new(config.command_service()));
    let executor = Retrying::new(executor, config.retry.clone());

    Ok(
        Engine::new(Arc::new(executor), Arc::new(blobs), Arc::new(ledger))
            .with_config(config.engine_config()),
    )
}

/// Write `value` to stdout as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// JSON shape of a failed operation.
#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
}

impl From<&reconcile::Error> for ErrorReport {
    fn from(err: &reconcile::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
