//! Progress reporting for long-running operations.
//!
//! The engine reports through a [`ProgressSink`] so front ends can render
//! however they like. Events are plain serializable data.

use hostkit::InstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Apply and rollback state machine stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Reading current state
    Inspecting,
    /// Comparing against the template
    Diffing,
    /// Dry run finished; diff returned
    Reported,
    /// Backing up state before mutation
    Checkpointing,
    /// Building the step list
    Planning,
    /// Running steps
    Executing,
    /// Undoing changes
    RollingBack,
    /// Writing the ledger entry
    Recording,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inspecting => "inspecting",
            Self::Diffing => "diffing",
            Self::Reported => "reported",
            Self::Checkpointing => "checkpointing",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::RollingBack => "rolling_back",
            Self::Recording => "recording",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Something worth telling a front end about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The operation entered a new stage
    Stage {
        /// Target instance
        instance: InstanceId,
        /// Stage entered
        stage: Stage,
    },
    /// A plan step is about to run
    StepStarted {
        /// Position in the plan
        index: usize,
        /// Number of steps
        total: usize,
        /// Step description
        description: String,
    },
    /// A plan step finished
    StepFinished {
        /// Position in the plan
        index: usize,
        /// Whether it succeeded
        success: bool,
    },
    /// A non-fatal problem
    Warning {
        /// What happened
        message: String,
    },
}

/// Receiver of progress events.
///
/// Called from worker threads; implementations must be thread-safe.
pub trait ProgressSink: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &ProgressEvent);
}

/// Sink that drops everything.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Sink that writes events to the `log` facade.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Stage { instance, stage } => log::info!("[{instance}] {stage}"),
            ProgressEvent::StepStarted {
                index,
                total,
                description,
            } => log::info!("  [{}/{total}] {description}", index + 1),
            ProgressEvent::StepFinished { index, success } => {
                if !success {
                    log::warn!("  step {} failed", index + 1);
                }
            }
            ProgressEvent::Warning { message } => log::warn!("{message}"),
        }
    }
}

/// Sink that keeps every event, for tests and audit output.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stages entered so far, in order.
    pub fn stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Stage { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingProgress::new();
        let instance = InstanceId::new("ws-1");
        for stage in [Stage::Inspecting, Stage::Diffing, Stage::Reported] {
            sink.on_event(&ProgressEvent::Stage {
                instance: instance.clone(),
                stage,
            });
        }
        sink.on_event(&ProgressEvent::Warning {
            message: "x".into(),
        });
        assert_eq!(
            sink.stages(),
            vec![Stage::Inspecting, Stage::Diffing, Stage::Reported]
        );
        assert_eq!(sink.events().len(), 4);
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_string(&ProgressEvent::StepFinished {
            index: 2,
            success: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"step_finished","index":2,"success":true}"#);
    }
}
