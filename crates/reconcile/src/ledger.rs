//! Per-instance layer history and checkpoint store.
//!
//! History is append-only: a rollback adds `rolled_back` marker entries and
//! never rewrites earlier ones. With a state directory each instance's
//! history lives in its own pretty-printed JSON file.

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::types::{Conflict, ManagerKind};
use chrono::{DateTime, Utc};
use hostkit::InstanceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Whether a layer is still in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    /// Changes are in place
    Applied,
    /// Changes were undone
    RolledBack,
}

/// How an apply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerOutcome {
    /// Every step succeeded
    Completed,
    /// Some steps failed but the apply continued
    CompletedWithWarnings,
    /// A step failed and the apply stopped
    Failed,
    /// Blocking conflicts; nothing was executed
    Refused,
}

/// One applied template, or a marker that one was rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Template name
    pub template_name: String,
    /// Template version
    #[serde(default)]
    pub template_version: String,
    /// When the entry was recorded
    pub applied_at: DateTime<Utc>,
    /// Manager that did most of the package work
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager_used: Option<ManagerKind>,
    /// Checkpoint taken before the apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// Applied or rolled back
    pub status: LayerStatus,
    /// How the apply ended
    pub outcome: LayerOutcome,
    /// Conflicts found by the diff
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// Every error met, recovered or not
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Everything recorded for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHistory {
    /// The instance
    pub instance_id: InstanceId,
    /// Layers in recording order
    #[serde(default)]
    pub layers: Vec<Layer>,
    /// Checkpoints in creation order
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Set when automatic recovery failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_unknown: Option<String>,
}

impl InstanceHistory {
    fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            layers: Vec::new(),
            checkpoints: Vec::new(),
            state_unknown: None,
        }
    }

    /// Whether a rolled-back entry exists for the layer behind `checkpoint_id`.
    pub fn is_rolled_back(&self, checkpoint_id: &str) -> bool {
        self.layers.iter().any(|l| {
            l.status == LayerStatus::RolledBack && l.checkpoint_id.as_deref() == Some(checkpoint_id)
        })
    }
}

/// Thread-safe ledger, optionally backed by a directory.
#[derive(Debug)]
pub struct Ledger {
    dir: Option<PathBuf>,
    histories: Mutex<HashMap<InstanceId, InstanceHistory>>,
}

impl Ledger {
    /// Ledger that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Ledger persisted under `dir`, loading any existing histories.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut histories = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let history: InstanceHistory = serde_json::from_str(&content)?;
            histories.insert(history.instance_id.clone(), history);
        }
        log::debug!(
            "Loaded {} instance histories from {}",
            histories.len(),
            dir.display()
        );

        Ok(Self {
            dir: Some(dir),
            histories: Mutex::new(histories),
        })
    }

    /// Directory backing this ledger, if any.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn read<T>(&self, instance: &InstanceId, f: impl FnOnce(&InstanceHistory) -> T) -> Option<T> {
        let histories = self.histories.lock().unwrap_or_else(PoisonError::into_inner);
        histories.get(instance).map(f)
    }

    /// Apply `f` to the instance's history and persist the result.
    ///
    /// The map lock covers only the in-memory change; the file write happens
    /// after it is released. Writers for one instance are serialised by the
    /// instance lock.
    fn update(&self, instance: &InstanceId, f: impl FnOnce(&mut InstanceHistory)) -> Result<()> {
        let snapshot = {
            let mut histories = self.histories.lock().unwrap_or_else(PoisonError::into_inner);
            let history = histories
                .entry(instance.clone())
                .or_insert_with(|| InstanceHistory::new(instance.clone()));
            f(history);
            history.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, history: &InstanceHistory) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", file_stem(&history.instance_id)));
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(history)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        log::debug!("Saved history to {}", path.display());
        Ok(())
    }

    /// Record a layer.
    pub fn append_layer(&self, instance: &InstanceId, layer: Layer) -> Result<()> {
        log::info!(
            "[{instance}] recording layer {} ({:?}, {:?})",
            layer.template_name,
            layer.status,
            layer.outcome
        );
        self.update(instance, |h| h.layers.push(layer))
    }

    /// Store a checkpoint.
    pub fn add_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        let instance = checkpoint.instance_id.clone();
        self.update(&instance, |h| h.checkpoints.push(checkpoint))
    }

    /// Add a `rolled_back` marker for every live layer recorded at or after
    /// `checkpoint` was taken. Returns how many were marked.
    pub fn mark_rolled_back(
        &self,
        instance: &InstanceId,
        checkpoint: &Checkpoint,
        errors: &[String],
    ) -> Result<usize> {
        let mut marked = 0;
        self.update(instance, |h| {
            let markers: Vec<Layer> = h
                .layers
                .iter()
                .filter(|l| l.status == LayerStatus::Applied && l.outcome != LayerOutcome::Refused)
                .filter(|l| {
                    l.applied_at >= checkpoint.created_at
                        || l.checkpoint_id.as_deref() == Some(checkpoint.id.as_str())
                })
                .filter(|l| {
                    l.checkpoint_id
                        .as_deref()
                        .is_some_and(|id| !h.is_rolled_back(id))
                })
                .map(|l| Layer {
                    applied_at: Utc::now(),
                    status: LayerStatus::RolledBack,
                    errors: errors.to_vec(),
                    ..l.clone()
                })
                .collect();
            marked = markers.len();
            h.layers.extend(markers);
        })?;
        Ok(marked)
    }

    /// Every layer recorded for `instance`, oldest first.
    pub fn layers(&self, instance: &InstanceId) -> Vec<Layer> {
        self.read(instance, |h| h.layers.clone()).unwrap_or_default()
    }

    /// Every checkpoint for `instance`, oldest first.
    pub fn checkpoints(&self, instance: &InstanceId) -> Vec<Checkpoint> {
        self.read(instance, |h| h.checkpoints.clone())
            .unwrap_or_default()
    }

    /// The most recent checkpoint for `instance`.
    pub fn latest_checkpoint(&self, instance: &InstanceId) -> Option<Checkpoint> {
        self.read(instance, |h| h.checkpoints.last().cloned())
            .flatten()
    }

    /// Look a checkpoint up by id across every instance.
    pub fn find_checkpoint(&self, checkpoint_id: &str) -> Option<Checkpoint> {
        let histories = self.histories.lock().unwrap_or_else(PoisonError::into_inner);
        histories
            .values()
            .flat_map(|h| &h.checkpoints)
            .find(|c| c.id == checkpoint_id)
            .cloned()
    }

    /// Flag `instance` as needing a human.
    pub fn mark_state_unknown(&self, instance: &InstanceId, reason: &str) -> Result<()> {
        log::error!("[{instance}] state unknown: {reason}");
        self.update(instance, |h| h.state_unknown = Some(reason.to_string()))
    }

    /// Clear the state-unknown flag.
    pub fn clear_state_unknown(&self, instance: &InstanceId) -> Result<()> {
        if self.state_unknown(instance).is_none() {
            return Ok(());
        }
        self.update(instance, |h| h.state_unknown = None)
    }

    /// Why `instance` needs a human, if it does.
    pub fn state_unknown(&self, instance: &InstanceId) -> Option<String> {
        self.read(instance, |h| h.state_unknown.clone()).flatten()
    }

    /// Full history of `instance`.
    pub fn history(&self, instance: &InstanceId) -> Option<InstanceHistory> {
        self.read(instance, Clone::clone)
    }
}

/// File name for an instance id, keeping only portable characters.
fn file_stem(instance: &InstanceId) -> String {
    instance
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
