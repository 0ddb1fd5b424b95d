//! Error types for reconciliation.
//!
//! Transport failures from `hostkit` are folded into [`Error::Connectivity`]
//! and [`Error::TransientExecution`] so callers see one taxonomy.

use crate::types::{Conflict, ManagerKind};
use hostkit::{ErrorCategory, InstanceId};
use thiserror::Error;

/// Errors that can occur while inspecting, applying or rolling back.
#[derive(Debug, Error)]
pub enum Error {
    /// No viable transport to the instance
    #[error("connectivity error: {message}")]
    Connectivity {
        /// Details, including why each transport was ruled out
        message: String,
    },

    /// A network blip outlasted the retry budget
    #[error("transient execution error: {message}")]
    TransientExecution {
        /// Details from the transport
        message: String,
    },

    /// A package manager reported failure
    #[error("{manager} failed (exit {exit_code}): {stderr}")]
    PackageManager {
        /// Manager that failed
        manager: ManagerKind,
        /// Exit code of the batch invocation
        exit_code: i32,
        /// Trimmed stderr
        stderr: String,
    },

    /// Blocking conflicts were found and the apply was not forced
    #[error("blocked by {} conflict(s): {}", .conflicts.len(), join(.conflicts))]
    Conflict {
        /// The blocking conflicts
        conflicts: Vec<Conflict>,
    },

    /// Post-rollback verification found residual differences
    #[error("state drift after rollback: {}", .discrepancies.join("; "))]
    StateDrift {
        /// One line per difference
        discrepancies: Vec<String>,
    },

    /// Another apply or rollback holds the instance
    #[error("an operation is already in progress for instance {instance}")]
    Concurrency {
        /// Locked instance
        instance: InstanceId,
    },

    /// No checkpoint with this id exists
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// The checkpoint belongs to another instance
    #[error("checkpoint {checkpoint} belongs to instance {owner}, not {instance}")]
    ForeignCheckpoint {
        /// Requested checkpoint
        checkpoint: String,
        /// Instance that owns it
        owner: InstanceId,
        /// Instance the rollback targeted
        instance: InstanceId,
    },

    /// A non-package plan step exited non-zero
    #[error("step {index} ({description}) failed with exit {exit_code}: {stderr}")]
    StepFailed {
        /// Position in the plan
        index: usize,
        /// Step description
        description: String,
        /// Exit code
        exit_code: i32,
        /// Trimmed stderr
        stderr: String,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Automatic recovery failed; the instance needs a human
    #[error("instance {instance} is in an unknown state, manual intervention required: {reason}")]
    ManualInterventionRequired {
        /// Affected instance
        instance: InstanceId,
        /// What went wrong
        reason: String,
    },

    /// The template failed validation
    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    /// Backup blob storage failed
    #[error("blob store error: {0}")]
    Blob(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Short machine-readable label for ledger entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connectivity { .. } => "connectivity",
            Error::TransientExecution { .. } => "transient_execution",
            Error::PackageManager { .. } => "package_manager",
            Error::Conflict { .. } => "conflict",
            Error::StateDrift { .. } => "state_drift",
            Error::Concurrency { .. } => "concurrency",
            Error::CheckpointNotFound(_) => "checkpoint_not_found",
            Error::ForeignCheckpoint { .. } => "foreign_checkpoint",
            Error::StepFailed { .. } => "step_failed",
            Error::Cancelled => "cancelled",
            Error::ManualInterventionRequired { .. } => "manual_intervention_required",
            Error::InvalidTemplate(_) => "invalid_template",
            Error::Blob(_) => "blob",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    /// Whether the instance could not be reached at all.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Error::Connectivity { .. } | Error::TransientExecution { .. }
        )
    }

    /// Render as `kind: message` for the audit trail.
    pub fn to_record(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<hostkit::Error> for Error {
    fn from(err: hostkit::Error) -> Self {
        match err.category() {
            ErrorCategory::Cancelled => Error::Cancelled,
            ErrorCategory::Transient => Error::TransientExecution {
                message: err.to_string(),
            },
            ErrorCategory::Connectivity | ErrorCategory::Rejected | ErrorCategory::Other => {
                Error::Connectivity {
                    message: err.to_string(),
                }
            }
        }
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConflictKind;

    #[test]
    fn test_from_hostkit_error() {
        let err: Error = hostkit::Error::Transient {
            message: "connection reset".into(),
        }
        .into();
        assert!(matches!(err, Error::TransientExecution { .. }));
        assert!(err.is_transport_failure());

        let err: Error = hostkit::Error::Cancelled.into();
        assert!(matches!(err, Error::Cancelled));

        let err: Error = hostkit::Error::UnknownInstance(InstanceId::new("x")).into();
        assert!(matches!(err, Error::Connectivity { .. }));
    }

    #[test]
    fn test_conflict_message_lists_conflicts() {
        let err = Error::Conflict {
            conflicts: vec![Conflict::new(
                ConflictKind::PortCollision,
                "port 8888 is used by notebook",
            )],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 conflict"));
        assert!(msg.contains("port_collision: port 8888 is used by notebook"));
    }

    #[test]
    fn test_to_record() {
        let err = Error::PackageManager {
            manager: ManagerKind::Apt,
            exit_code: 100,
            stderr: "E: Unable to locate package foo".into(),
        };
        assert_eq!(
            err.to_record(),
            "package_manager: apt failed (exit 100): E: Unable to locate package foo"
        );
    }
}
