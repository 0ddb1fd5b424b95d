//! The incremental apply engine.
//!
//! [`Engine::apply`] walks one request through
//! `Inspecting → Diffing → Checkpointing → Planning → Executing → Recording`,
//! falling into `RollingBack` when a step fails or the caller cancels.
//! Every state change is reported to the [`ProgressSink`].

use crate::blob::BlobStore;
use crate::checkpoint::{CheckpointManager, RollbackOptions, RollbackReport};
use crate::diff::{self, DiffOptions, StateDiff};
use crate::error::{Error, Result};
use crate::inspect::{self, Inspection};
use crate::ledger::{Layer, LayerOutcome, LayerStatus, Ledger};
use crate::lock::InstanceLocks;
use crate::plan::{self, Plan, StepOutcome};
use crate::pool::WorkerPool;
use crate::progress::{ProgressEvent, ProgressSink, Stage};
use crate::types::{Conflict, InstanceState, ManagerKind, PackageSource, Template};
use chrono::Utc;
use hostkit::{CancelToken, Deadline, InstanceId, RemoteExecutor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Timeouts used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deadline for one plan step
    pub command_timeout: Duration,
    /// Deadline for a whole inspection
    pub inspect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(1800),
            inspect_timeout: Duration::from_secs(120),
        }
    }
}

/// Options for one apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOptions {
    /// Manager for `system` packages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager_preference: Option<ManagerKind>,
    /// Stop after the diff
    #[serde(default)]
    pub dry_run: bool,
    /// Proceed despite blocking conflicts and allow downgrades
    #[serde(default)]
    pub force: bool,
    /// Keep going after a failed step instead of rolling back
    #[serde(default)]
    pub continue_on_error: bool,
    /// Delete home directories if an automatic rollback removes users
    #[serde(default)]
    pub delete_home_on_rollback: bool,
}

impl ApplyOptions {
    fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            force: self.force,
            package_manager_preference: self.package_manager_preference,
        }
    }
}

/// What an apply did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Target instance
    pub instance_id: InstanceId,
    /// Applied template
    pub template_name: String,
    /// Computed difference
    pub diff: StateDiff,
    /// Executed plan; absent for dry runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Steps that ran successfully
    #[serde(default)]
    pub execution_results: Vec<StepOutcome>,
    /// Checkpoint taken before execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// State after the apply (before it, for dry runs)
    pub state: InstanceState,
    /// Inspection warnings, advisory conflicts and recovered failures
    #[serde(default)]
    pub warnings: Vec<String>,
    /// How the apply ended
    pub outcome: LayerOutcome,
}

/// One request for [`Engine::apply_many`].
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Target instance
    pub instance: InstanceId,
    /// Template to apply
    pub template: Template,
    /// Options
    pub options: ApplyOptions,
}

/// Reconciles instances against templates.
///
/// Cheap to share: every collaborator is behind an `Arc`, and the instance
/// lock table is shared by clones.
#[derive(Clone)]
pub struct Engine {
    executor: Arc<dyn RemoteExecutor>,
    blobs: Arc<dyn BlobStore>,
    ledger: Arc<Ledger>,
    locks: InstanceLocks,
    config: EngineConfig,
}

impl Engine {
    /// Engine over the given executor, blob store and ledger.
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            executor,
            blobs,
            ledger,
            locks: InstanceLocks::new(),
            config: EngineConfig::default(),
        }
    }

    /// Replace the timeouts.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The instance lock table.
    pub fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    fn checkpoints(&self) -> CheckpointManager<'_> {
        CheckpointManager::new(self.executor.as_ref(), self.blobs.as_ref(), &self.ledger)
            .with_timeouts(self.config.command_timeout, self.config.inspect_timeout)
    }

    /// Inspect `instance`. Read-only; takes no lock.
    pub fn inspect(&self, instance: &InstanceId, token: &CancelToken) -> Result<Inspection> {
        let deadline = Deadline::after(self.config.inspect_timeout, token);
        inspect::inspect(self.executor.as_ref(), instance, &deadline)
    }

    /// Inspect and diff without changing anything. Takes no lock.
    pub fn diff(
        &self,
        instance: &InstanceId,
        template: &Template,
        options: &DiffOptions,
        token: &CancelToken,
    ) -> Result<StateDiff> {
        template.validate()?;
        let inspection = self.inspect(instance, token)?;
        Ok(diff::diff(&inspection.state, template, options))
    }

    /// Every layer recorded for `instance`, oldest first.
    pub fn layer_history(&self, instance: &InstanceId) -> Vec<Layer> {
        self.ledger.layers(instance)
    }

    /// Apply `template` to `instance`.
    pub fn apply(
        &self,
        instance: &InstanceId,
        template: &Template,
        options: &ApplyOptions,
        token: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<ApplyResult> {
        template.validate()?;
        let stage = |stage: Stage| {
            progress.on_event(&ProgressEvent::Stage {
                instance: instance.clone(),
                stage,
            });
        };

        if options.dry_run {
            return self.dry_run(instance, template, options, token, &stage);
        }

        let _lease = self.locks.try_lock(instance)?;
        if let Some(reason) = self.ledger.state_unknown(instance) {
            stage(Stage::Failed);
            return Err(Error::ManualInterventionRequired {
                instance: instance.clone(),
                reason,
            });
        }

        let mut layer = Layer {
            template_name: template.name.clone(),
            template_version: template.version.clone(),
            applied_at: Utc::now(),
            package_manager_used: None,
            checkpoint_id: None,
            status: LayerStatus::Applied,
            outcome: LayerOutcome::Failed,
            conflicts: Vec::new(),
            errors: Vec::new(),
        };

        stage(Stage::Inspecting);
        let inspection = match self.inspect(instance, token) {
            Ok(inspection) => inspection,
            Err(e) => return self.fail_before_checkpoint(instance, layer, e, &stage),
        };
        let mut warnings: Vec<String> = inspection
            .warnings
            .iter()
            .map(|w| format!("{}: {}", w.probe, w.message))
            .collect();

        stage(Stage::Diffing);
        let diff_options = options.diff_options();
        let diff = diff::diff(&inspection.state, template, &diff_options);
        layer.conflicts.clone_from(&diff.conflicts);
        layer.package_manager_used = manager_used(&inspection.state, template, &diff, &diff_options);
        warnings.extend(
            diff.conflicts
                .iter()
                .filter(|c| !c.is_blocking() || options.force)
                .map(Conflict::to_string),
        );

        let blocking = diff.blocking_conflicts();
        if !blocking.is_empty() && !options.force {
            log::warn!(
                "[{instance}] refusing {}: {} blocking conflict(s)",
                template.name,
                blocking.len()
            );
            let err = Error::Conflict {
                conflicts: blocking,
            };
            layer.outcome = LayerOutcome::Refused;
            layer.errors.push(err.to_record());
            self.ledger.append_layer(instance, layer)?;
            stage(Stage::Failed);
            return Err(err);
        }

        stage(Stage::Checkpointing);
        let checkpoint_deadline = Deadline::after(self.config.inspect_timeout, token);
        let checkpoint = match self.checkpoints().create(
            instance,
            &template.name,
            inspection.state.clone(),
            &plan::touched_paths(&diff),
            &checkpoint_deadline,
        ) {
            Ok(checkpoint) => checkpoint,
            Err(e) => return self.fail_before_checkpoint(instance, layer, e, &stage),
        };
        layer.checkpoint_id = Some(checkpoint.id.clone());

        stage(Stage::Planning);
        let plan = plan::build(&diff);
        log::info!(
            "[{instance}] applying {}: {} ({} steps)",
            template.name,
            diff.summary(),
            plan.len()
        );

        stage(Stage::Executing);
        let mut execution_results = Vec::new();
        let mut failure = None;
        let total = plan.len();
        for (index, step) in plan.steps.iter().enumerate() {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                progress.on_event(&ProgressEvent::StepStarted {
                    index,
                    total,
                    description: step.description.clone(),
                });
                let deadline = Deadline::after(self.config.command_timeout, token);
                let result =
                    plan::execute_step(self.executor.as_ref(), instance, index, step, &deadline);
                progress.on_event(&ProgressEvent::StepFinished {
                    index,
                    success: result.is_ok(),
                });
                result
            };

            match result {
                Ok(outcome) => execution_results.push(outcome),
                Err(e) => {
                    log::warn!("[{instance}] {}: {e}", step.description);
                    layer.errors.push(e.to_record());
                    let recoverable = options.continue_on_error
                        && !e.is_transport_failure()
                        && !matches!(e, Error::Cancelled);
                    if recoverable {
                        progress.on_event(&ProgressEvent::Warning {
                            message: format!("{instance}: {e}"),
                        });
                        warnings.push(e.to_string());
                        continue;
                    }
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            return self.recover(instance, &checkpoint.id, layer, err, options, progress, &stage);
        }

        stage(Stage::Recording);
        let state = match self.inspect(instance, token) {
            Ok(after) => after.state,
            Err(e) => {
                warnings.push(format!("could not re-inspect after apply: {e}"));
                inspection.state
            }
        };
        layer.outcome = if layer.errors.is_empty() {
            LayerOutcome::Completed
        } else {
            LayerOutcome::CompletedWithWarnings
        };
        layer.applied_at = Utc::now();
        let outcome = layer.outcome;
        self.ledger.append_layer(instance, layer)?;
        stage(Stage::Completed);

        Ok(ApplyResult {
            instance_id: instance.clone(),
            template_name: template.name.clone(),
            diff,
            plan: Some(plan),
            execution_results,
            checkpoint_id: Some(checkpoint.id),
            state,
            warnings,
            outcome,
        })
    }

    fn dry_run(
        &self,
        instance: &InstanceId,
        template: &Template,
        options: &ApplyOptions,
        token: &CancelToken,
        stage: &dyn Fn(Stage),
    ) -> Result<ApplyResult> {
        stage(Stage::Inspecting);
        let inspection = self.inspect(instance, token).inspect_err(|_| stage(Stage::Failed))?;
        stage(Stage::Diffing);
        let diff = diff::diff(&inspection.state, template, &options.diff_options());
        stage(Stage::Reported);

        let warnings = inspection
            .warnings
            .iter()
            .map(|w| format!("{}: {}", w.probe, w.message))
            .collect();
        Ok(ApplyResult {
            instance_id: instance.clone(),
            template_name: template.name.clone(),
            diff,
            plan: None,
            execution_results: Vec::new(),
            checkpoint_id: None,
            state: inspection.state,
            warnings,
            outcome: LayerOutcome::Completed,
        })
    }

    /// Record a layer for an apply that failed before anything changed.
    fn fail_before_checkpoint(
        &self,
        instance: &InstanceId,
        mut layer: Layer,
        err: Error,
        stage: &dyn Fn(Stage),
    ) -> Result<ApplyResult> {
        layer.errors.push(err.to_record());
        layer.applied_at = Utc::now();
        self.ledger.append_layer(instance, layer)?;
        stage(Stage::Failed);
        Err(err)
    }

    /// Roll back after a failed or cancelled apply and record the layer.
    #[allow(clippy::too_many_arguments)]
    fn recover(
        &self,
        instance: &InstanceId,
        checkpoint_id: &str,
        mut layer: Layer,
        err: Error,
        options: &ApplyOptions,
        progress: &dyn ProgressSink,
        stage: &dyn Fn(Stage),
    ) -> Result<ApplyResult> {
        stage(Stage::RollingBack);
        // The caller's token may be the reason we are here
        let token = CancelToken::new();
        let rollback_options = RollbackOptions {
            delete_home: options.delete_home_on_rollback,
        };
        let rollback =
            self.checkpoints()
                .rollback(instance, checkpoint_id, rollback_options, &token, progress);
        layer.outcome = LayerOutcome::Failed;
        layer.applied_at = Utc::now();

        match rollback {
            Ok(report) => {
                layer.status = LayerStatus::RolledBack;
                layer.errors.extend(report.errors);
                if !report.discrepancies.is_empty() {
                    layer.errors.push(
                        Error::StateDrift {
                            discrepancies: report.discrepancies,
                        }
                        .to_record(),
                    );
                }
                self.ledger.append_layer(instance, layer)?;
                stage(Stage::Failed);
                Err(err)
            }
            Err(rollback_err) => {
                let reason = format!("apply failed ({err}); rollback failed ({rollback_err})");
                layer.errors.push(rollback_err.to_record());
                self.ledger.append_layer(instance, layer)?;
                self.ledger.mark_state_unknown(instance, &reason)?;
                stage(Stage::Failed);
                Err(Error::ManualInterventionRequired {
                    instance: instance.clone(),
                    reason,
                })
            }
        }
    }

    /// Roll `instance` back to `checkpoint_id`.
    pub fn rollback(
        &self,
        instance: &InstanceId,
        checkpoint_id: &str,
        options: RollbackOptions,
        token: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<RollbackReport> {
        let _lease = self.locks.try_lock(instance)?;
        let stage = |stage: Stage| {
            progress.on_event(&ProgressEvent::Stage {
                instance: instance.clone(),
                stage,
            });
        };

        stage(Stage::RollingBack);
        match self
            .checkpoints()
            .rollback(instance, checkpoint_id, options, token, progress)
        {
            Ok(report) => {
                stage(Stage::Completed);
                Ok(report)
            }
            Err(e) if e.is_transport_failure() || matches!(e, Error::Cancelled) => {
                let reason = format!("rollback to {checkpoint_id} did not finish: {e}");
                self.ledger.mark_state_unknown(instance, &reason)?;
                stage(Stage::Failed);
                Err(Error::ManualInterventionRequired {
                    instance: instance.clone(),
                    reason,
                })
            }
            Err(e) => {
                stage(Stage::Failed);
                Err(e)
            }
        }
    }

    /// Run one apply per request on `pool`, returning results in request
    /// order. Requests for the same instance contend for its lock like any
    /// other concurrent callers.
    pub fn apply_many(
        &self,
        pool: &WorkerPool,
        requests: Vec<ApplyRequest>,
        token: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Vec<Result<ApplyResult>> {
        pool.run_all(requests, |request| {
            self.apply(
                &request.instance,
                &request.template,
                &request.options,
                token,
                progress,
            )
        })
    }
}

/// The manager recorded on the layer: the resolved `system` manager when
/// the template has system packages, otherwise the first manager with work.
fn manager_used(
    state: &InstanceState,
    template: &Template,
    diff: &StateDiff,
    options: &DiffOptions,
) -> Option<ManagerKind> {
    if template.packages.contains_key(&PackageSource::System) {
        if let Some(kind) = diff::resolve_system_manager(state, template, options) {
            return Some(kind);
        }
    }
    diff.managers_used().first().copied().or_else(|| {
        template.packages.keys().find_map(|source| match source {
            PackageSource::Manager(kind) => Some(*kind),
            PackageSource::System => None,
        })
    })
}
