//! # reconcile
//!
//! Converges running research workstations toward declarative templates.
//!
//! A template names packages (per package manager), systemd services and
//! user accounts. Applying one to an instance:
//!
//! 1. **Inspects** the instance over a [`hostkit::RemoteExecutor`]
//! 2. **Diffs** the observed state against the template, detecting conflicts
//! 3. **Checkpoints** the pre-change state and every file the plan touches
//! 4. **Plans** and **executes** the minimal ordered set of commands
//! 5. **Records** a layer in the per-instance [`Ledger`]
//!
//! A failed or cancelled apply rolls back to its checkpoint. Any earlier
//! checkpoint can be rolled back to explicitly with [`Engine::rollback`].
//!
//! ## Example
//!
//! ```no_run
//! use hostkit::{CancelToken, Executor, ExecutorOptions, InstanceId, StaticRegistry};
//! use reconcile::{
//!     ApplyOptions, Engine, Ledger, LogProgress, ManagerKind, MemoryBlobStore, PackageSource,
//!     PackageSpec, Template,
//! };
//! use std::sync::Arc;
//!
//! let executor = Executor::new(Arc::new(StaticRegistry::new()), ExecutorOptions::default());
//! let engine = Engine::new(
//!     Arc::new(executor),
//!     Arc::new(MemoryBlobStore::new()),
//!     Arc::new(Ledger::in_memory()),
//! );
//!
//! let mut template = Template::new("cuda-ml", "1.0");
//! template.packages.insert(
//!     PackageSource::Manager(ManagerKind::Conda),
//!     vec![PackageSpec::new("pytorch"), PackageSpec::new("cudatoolkit")],
//! );
//!
//! let result = engine
//!     .apply(
//!         &InstanceId::new("ws-1"),
//!         &template,
//!         &ApplyOptions::default(),
//!         &CancelToken::new(),
//!         &LogProgress,
//!     )
//!     .unwrap();
//! println!("{}", result.diff.summary());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod checkpoint;
pub mod diff;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod ledger;
pub mod lock;
pub mod manager;
pub mod plan;
pub mod pool;
pub mod progress;
pub mod types;
pub mod version;

#[cfg(test)]
pub(crate) mod sim;

pub use blob::{BlobRef, BlobStore, FsBlobStore, MemoryBlobStore};
pub use checkpoint::{
    Checkpoint, CheckpointManager, FileBackup, RollbackOptions, RollbackReport, RollbackStatus,
};
pub use diff::{DiffOptions, PackageChange, StateDiff, UserChange};
pub use engine::{ApplyOptions, ApplyRequest, ApplyResult, Engine, EngineConfig};
pub use error::{Error, Result};
pub use inspect::{Inspection, InspectionWarning};
pub use ledger::{InstanceHistory, Layer, LayerOutcome, LayerStatus, Ledger};
pub use lock::{InstanceGuard, InstanceLocks};
pub use plan::{Plan, Step, StepAction, StepClass, StepOutcome};
pub use pool::WorkerPool;
pub use progress::{LogProgress, NoProgress, ProgressEvent, ProgressSink, RecordingProgress, Stage};
pub use types::{
    Conflict, ConflictKind, InstanceState, ManagerKind, PackageRecord, PackageRef, PackageSource,
    PackageSpec, ServiceConfig, ServiceRecord, Severity, Template, UnitState, UserConfig,
    UserRecord,
};
pub use version::{Version, VersionConstraint};
