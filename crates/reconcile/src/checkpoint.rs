//! Checkpoints and rollback.
//!
//! A [`Checkpoint`] is taken immediately before an apply mutates anything.
//! It holds the inspected state plus a backup of every unit file the plan
//! is about to write or delete. Rollback inspects the instance again,
//! builds a reverse plan from the difference, runs it, and verifies the
//! result against the saved snapshot. The login environment is recorded too,
//! so verification also reports toolchain variables that changed.

use crate::blob::{BlobRef, BlobStore};
use crate::error::{Error, Result};
use crate::inspect::inspect;
use crate::ledger::Ledger;
use crate::manager::PackageTarget;
use crate::plan::{
    self, Plan, ServiceSteps, StepOutcome, create_user_step, delete_user_step, modify_user_step,
    package_steps,
};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::types::{InstanceState, ManagerKind, UnitState, UserConfig, unit_path};
use crate::version::Version;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use hostkit::{CancelToken, Deadline, InstanceId, RemoteExecutor, shell};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Exit status the backup read uses for "no such file".
const MISSING_FILE_EXIT: i32 = 100;

/// Environment variables recorded with every checkpoint.
pub const TRACKED_ENV_VARS: [&str; 8] = [
    "PATH",
    "LD_LIBRARY_PATH",
    "PYTHONPATH",
    "CONDA_DEFAULT_ENV",
    "VIRTUAL_ENV",
    "JAVA_HOME",
    "GOPATH",
    "SPACK_ROOT",
];

/// Backup of one file the plan touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackup {
    /// Absolute path on the instance
    pub path: String,
    /// Whether the file existed at checkpoint time
    pub existed: bool,
    /// BLAKE3 of the contents, when it existed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Where the contents are stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<BlobRef>,
}

/// Immutable snapshot taken before an apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `ck-` plus 16 hex characters
    pub id: String,
    /// Owning instance
    pub instance_id: InstanceId,
    /// Template about to be applied
    pub template_name: String,
    /// When it was taken
    pub created_at: DateTime<Utc>,
    /// State before the apply
    pub saved_state: InstanceState,
    /// Files the apply was going to touch
    #[serde(default)]
    pub config_backups: Vec<FileBackup>,
    /// Tracked login-shell variables that were set
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Previous checkpoint of the same instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
}

/// Deterministic checkpoint id for `instance` at `at`.
pub fn checkpoint_id(instance: &InstanceId, at: DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(instance.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(at.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
    let hex = hasher.finalize().to_hex();
    format!("ck-{}", &hex[..16])
}

/// Rollback knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOptions {
    /// Remove home directories of users deleted by the rollback
    #[serde(default)]
    pub delete_home: bool,
}

/// How close the rollback got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// The instance matches the checkpoint
    Restored,
    /// Some steps failed or differences remain
    RestoredWithWarnings,
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Target checkpoint
    pub checkpoint_id: String,
    /// Overall result
    pub status: RollbackStatus,
    /// The reverse plan
    pub plan: Plan,
    /// Steps that ran successfully
    pub execution_results: Vec<StepOutcome>,
    /// Residual differences, one per line
    pub discrepancies: Vec<String>,
    /// Step failures, rendered
    pub errors: Vec<String>,
    /// State after the rollback
    pub state: InstanceState,
}

/// Creates checkpoints and rolls back to them.
pub struct CheckpointManager<'a> {
    executor: &'a dyn RemoteExecutor,
    blobs: &'a dyn BlobStore,
    ledger: &'a Ledger,
    command_timeout: Duration,
    inspect_timeout: Duration,
}

impl<'a> CheckpointManager<'a> {
    /// Manager over the given collaborators with ten-minute step timeouts.
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        blobs: &'a dyn BlobStore,
        ledger: &'a Ledger,
    ) -> Self {
        Self {
            executor,
            blobs,
            ledger,
            command_timeout: Duration::from_secs(600),
            inspect_timeout: Duration::from_secs(120),
        }
    }

    /// Override the per-step and inspection timeouts.
    pub fn with_timeouts(mut self, command: Duration, inspect: Duration) -> Self {
        self.command_timeout = command;
        self.inspect_timeout = inspect;
        self
    }

    /// Take a checkpoint of `saved_state`, backing up every file in `paths`.
    ///
    /// The checkpoint is in the ledger when this returns.
    pub fn create(
        &self,
        instance: &InstanceId,
        template_name: &str,
        saved_state: InstanceState,
        paths: &[String],
        deadline: &Deadline,
    ) -> Result<Checkpoint> {
        let config_backups = paths
            .iter()
            .map(|path| self.backup(instance, path, deadline))
            .collect::<Result<Vec<_>>>()?;
        let environment = capture_environment(self.executor, instance, deadline)?;

        let created_at = Utc::now();
        let checkpoint = Checkpoint {
            id: checkpoint_id(instance, created_at),
            instance_id: instance.clone(),
            template_name: template_name.to_string(),
            created_at,
            saved_state,
            config_backups,
            environment,
            parent_checkpoint_id: self.ledger.latest_checkpoint(instance).map(|c| c.id),
        };
        self.ledger.add_checkpoint(checkpoint.clone())?;
        log::info!(
            "[{instance}] checkpoint {} ({} file backups)",
            checkpoint.id,
            checkpoint.config_backups.len()
        );
        Ok(checkpoint)
    }

    fn backup(&self, instance: &InstanceId, path: &str, deadline: &Deadline) -> Result<FileBackup> {
        let quoted = shell::quote(path);
        let command =
            format!("if [ -e {quoted} ]; then base64 < {quoted}; else exit {MISSING_FILE_EXIT}; fi");
        let result = self.executor.execute(instance, &command, deadline)?;

        if result.exit_code == MISSING_FILE_EXIT {
            return Ok(FileBackup {
                path: path.to_string(),
                existed: false,
                content_hash: None,
                blob_ref: None,
            });
        }
        if !result.success() {
            return Err(Error::StepFailed {
                index: 0,
                description: format!("back up {path}"),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }

        let encoded: String = result.stdout.split_whitespace().collect();
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Blob(format!("backup of {path} is not base64: {e}")))?;
        let blob = self.blobs.put(&bytes)?;
        log::debug!("Backed up {path} ({} bytes) as {blob}", bytes.len());
        Ok(FileBackup {
            path: path.to_string(),
            existed: true,
            content_hash: Some(blob.as_str().to_string()),
            blob_ref: Some(blob),
        })
    }

    /// Look `checkpoint_id` up and check that it belongs to `instance`.
    pub fn load(&self, instance: &InstanceId, checkpoint_id: &str) -> Result<Checkpoint> {
        let checkpoint = self
            .ledger
            .find_checkpoint(checkpoint_id)
            .ok_or_else(|| Error::CheckpointNotFound(checkpoint_id.to_string()))?;
        if checkpoint.instance_id != *instance {
            return Err(Error::ForeignCheckpoint {
                checkpoint: checkpoint_id.to_string(),
                owner: checkpoint.instance_id,
                instance: instance.clone(),
            });
        }
        Ok(checkpoint)
    }

    /// Return `instance` to the state saved in `checkpoint_id`.
    ///
    /// Failing steps are recorded and skipped. A transport failure or
    /// cancellation stops the rollback and is returned as an error; the
    /// caller decides whether that leaves the instance in an unknown state.
    pub fn rollback(
        &self,
        instance: &InstanceId,
        checkpoint_id: &str,
        options: RollbackOptions,
        token: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<RollbackReport> {
        let checkpoint = self.load(instance, checkpoint_id)?;
        log::info!("[{instance}] rolling back to {checkpoint_id}");

        let inspect_deadline = Deadline::after(self.inspect_timeout, token);
        let current = inspect(self.executor, instance, &inspect_deadline)?.state;

        let mut backups = HashMap::new();
        for backup in &checkpoint.config_backups {
            if let Some(blob) = &backup.blob_ref {
                let bytes = self.blobs.get(blob)?;
                let contents = String::from_utf8(bytes)
                    .map_err(|_| Error::Blob(format!("backup of {} is not UTF-8", backup.path)))?;
                backups.insert(backup.path.clone(), contents);
            }
        }

        let plan = reverse_plan(&current, &checkpoint, &backups, options);
        let total = plan.len();
        let mut execution_results = Vec::new();
        let mut errors = Vec::new();
        for (index, step) in plan.steps.iter().enumerate() {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            progress.on_event(&ProgressEvent::StepStarted {
                index,
                total,
                description: step.description.clone(),
            });
            let deadline = Deadline::after(self.command_timeout, token);
            match plan::execute_step(self.executor, instance, index, step, &deadline) {
                Ok(outcome) => {
                    progress.on_event(&ProgressEvent::StepFinished { index, success: true });
                    execution_results.push(outcome);
                }
                Err(e) if e.is_transport_failure() || matches!(e, Error::Cancelled) => {
                    progress.on_event(&ProgressEvent::StepFinished { index, success: false });
                    return Err(e);
                }
                Err(e) => {
                    progress.on_event(&ProgressEvent::StepFinished { index, success: false });
                    log::warn!("[{instance}] rollback step failed: {e}");
                    errors.push(e.to_record());
                }
            }
        }

        let verify_deadline = Deadline::after(self.inspect_timeout, token);
        let state = inspect(self.executor, instance, &verify_deadline)?.state;
        let mut discrepancies = verify(&checkpoint.saved_state, &state);
        if !checkpoint.environment.is_empty() {
            let environment = capture_environment(self.executor, instance, &verify_deadline)?;
            discrepancies.extend(verify_environment(&checkpoint.environment, &environment));
        }
        for line in &discrepancies {
            progress.on_event(&ProgressEvent::Warning {
                message: format!("{instance}: {line}"),
            });
        }

        let mut recorded = errors.clone();
        if !discrepancies.is_empty() {
            recorded.push(
                Error::StateDrift {
                    discrepancies: discrepancies.clone(),
                }
                .to_record(),
            );
        }
        self.ledger.mark_rolled_back(instance, &checkpoint, &recorded)?;
        self.ledger.clear_state_unknown(instance)?;

        let status = if errors.is_empty() && discrepancies.is_empty() {
            RollbackStatus::Restored
        } else {
            RollbackStatus::RestoredWithWarnings
        };
        log::info!("[{instance}] rollback to {checkpoint_id}: {status:?}");
        Ok(RollbackReport {
            checkpoint_id: checkpoint.id,
            status,
            plan,
            execution_results,
            discrepancies,
            errors,
            state,
        })
    }
}

/// Read the tracked variables from a root login shell.
///
/// A failing `env` is logged and gives an empty map; transport errors are
/// returned.
pub fn capture_environment(
    executor: &dyn RemoteExecutor,
    instance: &InstanceId,
    deadline: &Deadline,
) -> Result<BTreeMap<String, String>> {
    let result = executor.execute(instance, "sh -lc env", deadline)?;
    if !result.success() {
        log::warn!(
            "[{instance}] could not read the environment (exit {}): {}",
            result.exit_code,
            result.stderr.trim()
        );
        return Ok(BTreeMap::new());
    }
    Ok(parse_environment(&result.stdout))
}

/// Tracked `NAME=value` pairs from `env` output. Empty values are dropped.
pub fn parse_environment(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(name, value)| TRACKED_ENV_VARS.contains(name) && !value.is_empty())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Differences between two environment captures, one line per variable.
pub fn verify_environment(
    saved: &BTreeMap<String, String>,
    observed: &BTreeMap<String, String>,
) -> Vec<String> {
    let names: BTreeSet<&String> = saved.keys().chain(observed.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| match (saved.get(name), observed.get(name)) {
            (Some(then), Some(now)) if then != now => {
                Some(format!("environment {name} is {now}, expected {then}"))
            }
            (Some(then), None) => Some(format!("environment {name} is unset, expected {then}")),
            (None, Some(now)) => Some(format!("environment {name} is {now}, expected it unset")),
            _ => None,
        })
        .collect()
}

/// Steps that take `current` back to the checkpoint's saved state:
/// services, then packages, then users.
pub fn reverse_plan(
    current: &InstanceState,
    checkpoint: &Checkpoint,
    backups: &HashMap<String, String>,
    options: RollbackOptions,
) -> Plan {
    let mut plan = reverse_services(current, checkpoint, backups).into_plan();
    plan.extend(reverse_packages(current, &checkpoint.saved_state));
    plan.extend(reverse_users(current, &checkpoint.saved_state, options));
    plan
}

fn reverse_services(
    current: &InstanceState,
    checkpoint: &Checkpoint,
    backups: &HashMap<String, String>,
) -> ServiceSteps {
    let saved = &checkpoint.saved_state;
    let mut steps = ServiceSteps::default();
    let names: BTreeSet<&str> = current
        .services
        .iter()
        .chain(&saved.services)
        .map(|s| s.name.as_str())
        .collect();

    for name in names {
        let now = current.service(name);
        let then = saved.service(name);
        let path = unit_path(name);
        let restored = backups.get(&path);

        let Some(then) = then else {
            // Created since the checkpoint
            if let Some(now) = now {
                if now.unit_state != UnitState::Inactive {
                    steps.stop.push(name.to_string());
                }
                if now.enabled {
                    steps.disable.push(name.to_string());
                }
            }
            steps.remove.push(name.to_string());
            continue;
        };

        let rewritten = now.is_none_or(|n| n.content_hash != then.content_hash);
        if rewritten {
            match restored {
                Some(contents) => steps.write.push((name.to_string(), contents.clone())),
                // Nothing to restore from; leave the file and fix runtime state
                None => log::warn!("No backup of {path}; keeping the current unit file"),
            }
        }
        let enabled_now = now.is_some_and(|n| n.enabled) && !rewritten;
        let active_now = now.is_some_and(|n| n.unit_state == UnitState::Active) && !rewritten;

        if then.enabled && !enabled_now {
            steps.enable.push(name.to_string());
        } else if !then.enabled && now.is_some_and(|n| n.enabled) {
            steps.disable.push(name.to_string());
        }
        if then.unit_state == UnitState::Active && !active_now {
            steps.start.push(name.to_string());
        } else if then.unit_state != UnitState::Active
            && now.is_some_and(|n| n.unit_state == UnitState::Active)
        {
            steps.stop.push(name.to_string());
        }
    }
    steps
}

fn reverse_packages(current: &InstanceState, saved: &InstanceState) -> Plan {
    let mut plan = Plan::default();
    for kind in ManagerKind::ALL {
        let versions = |state: &InstanceState| -> BTreeMap<String, String> {
            state
                .packages
                .iter()
                .filter(|p| p.manager == kind)
                .map(|p| (p.name.clone(), p.version.clone()))
                .collect()
        };
        let now = versions(current);
        let then = versions(saved);
        if now == then {
            continue;
        }
        if !current.has_manager(kind) {
            log::warn!("{kind} is gone; cannot restore its packages");
            continue;
        }

        let mut install = Vec::new();
        let mut downgrade = Vec::new();
        for (name, version) in &then {
            match now.get(name) {
                None => install.push(PackageTarget::pinned(name.clone(), version)),
                Some(installed) if installed == version => {}
                Some(installed) => {
                    let lower = match (Version::parse(version), Version::parse(installed)) {
                        (Ok(want), Ok(have)) => want < have,
                        _ => false,
                    };
                    let target = PackageTarget::pinned(name.clone(), version);
                    if lower {
                        downgrade.push(target);
                    } else {
                        install.push(target);
                    }
                }
            }
        }
        let remove: Vec<String> = now
            .keys()
            .filter(|name| !then.contains_key(*name))
            .cloned()
            .collect();

        plan.extend(package_steps(kind, &install, &[], &downgrade, &remove));
    }
    plan
}

fn reverse_users(current: &InstanceState, saved: &InstanceState, options: RollbackOptions) -> Plan {
    let mut plan = Plan::default();
    for user in &current.users {
        if saved.user(&user.name).is_none() {
            plan.push(delete_user_step(&user.name, options.delete_home));
        }
    }
    for then in &saved.users {
        match current.user(&then.name) {
            None => plan.push(create_user_step(
                &UserConfig {
                    name: then.name.clone(),
                    groups: then.groups.clone(),
                    shell: Some(then.shell.clone()),
                },
                Some(then.uid),
            )),
            Some(now) if now.groups != then.groups || now.shell != then.shell => {
                plan.push(modify_user_step(&then.name, &then.groups, Some(&then.shell)));
            }
            Some(_) => {}
        }
    }
    plan
}

/// Differences between the saved and observed state on packages, the
/// enabled-service set and users.
pub fn verify(saved: &InstanceState, observed: &InstanceState) -> Vec<String> {
    let mut out = Vec::new();

    let packages = |state: &InstanceState| -> BTreeMap<(ManagerKind, String), String> {
        state
            .packages
            .iter()
            .map(|p| ((p.manager, p.name.clone()), p.version.clone()))
            .collect()
    };
    let want = packages(saved);
    let have = packages(observed);
    for ((kind, name), version) in &want {
        match have.get(&(*kind, name.clone())) {
            None => out.push(format!("package {kind}/{name} {version} is missing")),
            Some(found) if found != version => {
                out.push(format!("package {kind}/{name} is {found}, expected {version}"));
            }
            Some(_) => {}
        }
    }
    for ((kind, name), version) in &have {
        if !want.contains_key(&(*kind, name.clone())) {
            out.push(format!("package {kind}/{name} {version} should not be installed"));
        }
    }

    let enabled = |state: &InstanceState| -> BTreeSet<String> {
        state
            .services
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.name.clone())
            .collect()
    };
    let want = enabled(saved);
    let have = enabled(observed);
    for name in want.difference(&have) {
        out.push(format!("service {name} is not enabled"));
    }
    for name in have.difference(&want) {
        out.push(format!("service {name} should not be enabled"));
    }

    for then in &saved.users {
        match observed.user(&then.name) {
            None => out.push(format!("user {} is missing", then.name)),
            Some(now) => {
                if now.groups != then.groups {
                    out.push(format!(
                        "user {} groups are [{}], expected [{}]",
                        then.name,
                        now.groups.join(","),
                        then.groups.join(",")
                    ));
                }
                if now.shell != then.shell {
                    out.push(format!(
                        "user {} shell is {}, expected {}",
                        then.name, now.shell, then.shell
                    ));
                }
            }
        }
    }
    for now in &observed.users {
        if saved.user(&now.name).is_none() {
            out.push(format!("user {} should not exist", now.name));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::plan::StepClass;
    use crate::sim::SimMachine;
    use crate::types::{PackageRecord, ServiceRecord, UserRecord};

    fn pkg(manager: ManagerKind, name: &str, version: &str) -> PackageRecord {
        PackageRecord {
            name: name.into(),
            version: version.into(),
            manager,
            source: String::new(),
        }
    }

    fn user(name: &str, uid: u32, groups: &[&str]) -> UserRecord {
        UserRecord {
            name: name.into(),
            uid,
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
            shell: "/bin/bash".into(),
        }
    }

    fn service(name: &str, hash: &str, enabled: bool, state: UnitState) -> ServiceRecord {
        ServiceRecord {
            name: name.into(),
            unit_state: state,
            port: None,
            enabled,
            content_hash: Some(hash.into()),
        }
    }

    fn checkpoint_of(saved: InstanceState) -> Checkpoint {
        Checkpoint {
            id: "ck-0000000000000000".into(),
            instance_id: InstanceId::new("ws-1"),
            template_name: "t".into(),
            created_at: Utc::now(),
            saved_state: saved,
            config_backups: Vec::new(),
            environment: BTreeMap::new(),
            parent_checkpoint_id: None,
        }
    }

    fn state() -> InstanceState {
        let mut s = InstanceState::empty();
        s.managers.insert(ManagerKind::Conda);
        s
    }

    #[test]
    fn test_checkpoint_id_is_deterministic() {
        let at = Utc::now();
        let a = checkpoint_id(&InstanceId::new("ws-1"), at);
        assert_eq!(a, checkpoint_id(&InstanceId::new("ws-1"), at));
        assert_ne!(a, checkpoint_id(&InstanceId::new("ws-2"), at));
        assert!(a.starts_with("ck-"));
        assert_eq!(a.len(), 19);
    }

    #[test]
    fn test_reverse_plan_runs_services_packages_users() {
        let saved = state();
        let mut current = state();
        current
            .packages
            .push(pkg(ManagerKind::Conda, "jupyterlab", "4.1.2"));
        current
            .services
            .push(service("jupyter", "h1", true, UnitState::Active));
        current.users.push(user("jupyter", 1001, &[]));

        let plan = reverse_plan(
            &current,
            &checkpoint_of(saved),
            &HashMap::new(),
            RollbackOptions::default(),
        );
        assert_eq!(
            plan.class_sequence(),
            vec![StepClass::Services, StepClass::Packages, StepClass::Users]
        );
        let commands: Vec<&str> = plan.steps.iter().filter_map(|s| s.command()).collect();
        assert!(commands.contains(&"systemctl stop strata-jupyter.service"));
        assert!(commands.contains(&"rm -f /etc/systemd/system/strata-jupyter.service"));
        assert!(commands.contains(&"conda remove -y -q jupyterlab"));
        assert_eq!(commands.last(), Some(&"userdel jupyter"));
    }

    #[test]
    fn test_reverse_plan_pins_changed_packages() {
        let mut saved = state();
        saved.packages.push(pkg(ManagerKind::Conda, "numpy", "1.24.4"));
        saved.packages.push(pkg(ManagerKind::Conda, "scipy", "1.11.0"));
        let mut current = state();
        current.packages.push(pkg(ManagerKind::Conda, "numpy", "1.26.4"));

        let plan = reverse_plan(
            &current,
            &checkpoint_of(saved),
            &HashMap::new(),
            RollbackOptions::default(),
        );
        let commands: Vec<&str> = plan.steps.iter().filter_map(|s| s.command()).collect();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("scipy=1.11.0"), "{}", commands[0]);
        assert!(commands[1].contains("numpy=1.24.4"), "{}", commands[1]);
        assert!(plan.steps[1].description.starts_with("downgrade"));
    }

    #[test]
    fn test_reverse_plan_restores_changed_unit_from_backup() {
        let mut saved = state();
        saved
            .services
            .push(service("notebook", "old", true, UnitState::Active));
        let mut current = state();
        current
            .services
            .push(service("notebook", "new", true, UnitState::Active));
        let backups = HashMap::from([(unit_path("notebook"), "[Service]\nold\n".to_string())]);

        let plan = reverse_plan(
            &current,
            &checkpoint_of(saved),
            &backups,
            RollbackOptions::default(),
        );
        let descriptions: Vec<&str> = plan.steps.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec![
                "write unit strata-notebook.service",
                "reload systemd",
                "enable notebook",
                "restart notebook"
            ]
        );
    }

    #[test]
    fn test_reverse_plan_recreates_deleted_user_with_uid() {
        let mut saved = state();
        saved.users.push(user("alice", 1005, &["research"]));
        let plan = reverse_plan(
            &state(),
            &checkpoint_of(saved),
            &HashMap::new(),
            RollbackOptions { delete_home: true },
        );
        let command = plan.steps[0].command().unwrap();
        assert!(command.contains("-u 1005"), "{command}");
        assert!(command.contains("-G research"), "{command}");
    }

    #[test]
    fn test_verify_reports_each_difference() {
        let mut saved = state();
        saved.packages.push(pkg(ManagerKind::Conda, "numpy", "1.24.4"));
        saved.users.push(user("jupyter", 1001, &["users"]));
        let mut observed = state();
        observed.packages.push(pkg(ManagerKind::Conda, "numpy", "1.26.4"));
        observed
            .services
            .push(service("x", "h", true, UnitState::Active));

        let lines = verify(&saved, &observed);
        assert_eq!(lines.len(), 3, "{lines:?}");
        assert!(lines[0].contains("numpy is 1.26.4, expected 1.24.4"));
        assert!(lines[1].contains("service x should not be enabled"));
        assert!(lines[2].contains("user jupyter is missing"));
        assert!(verify(&saved, &saved).is_empty());
    }

    #[test]
    fn test_create_backs_up_existing_and_missing_files() {
        let sim = SimMachine::ubuntu();
        sim.put_file("/etc/systemd/system/strata-a.service", b"[Service]\nExecStart=/bin/a\n");
        let blobs = MemoryBlobStore::new();
        let ledger = Ledger::in_memory();
        let manager = CheckpointManager::new(&sim, &blobs, &ledger);
        let instance = InstanceId::new("ws-1");
        let deadline = Deadline::unbounded(&CancelToken::new());

        let paths = vec![
            "/etc/systemd/system/strata-a.service".to_string(),
            "/etc/systemd/system/strata-b.service".to_string(),
        ];
        let ck = manager
            .create(&instance, "t", InstanceState::empty(), &paths, &deadline)
            .unwrap();
        assert!(ck.config_backups[0].existed);
        assert!(!ck.config_backups[1].existed);
        let blob = ck.config_backups[0].blob_ref.as_ref().unwrap();
        assert_eq!(blobs.get(blob).unwrap(), b"[Service]\nExecStart=/bin/a\n");
        assert_eq!(ledger.latest_checkpoint(&instance).unwrap().id, ck.id);

        let second = manager
            .create(&instance, "t2", InstanceState::empty(), &[], &deadline)
            .unwrap();
        assert_eq!(second.parent_checkpoint_id.as_deref(), Some(ck.id.as_str()));
    }

    #[test]
    fn test_parse_environment_keeps_tracked_variables() {
        let env = parse_environment(
            "HOME=/root\nPATH=/opt/conda/bin:/usr/bin\nLD_LIBRARY_PATH=\nCONDA_DEFAULT_ENV=base\nGREETING=a=b\n",
        );
        assert_eq!(env.len(), 2);
        assert_eq!(env["PATH"], "/opt/conda/bin:/usr/bin");
        assert_eq!(env["CONDA_DEFAULT_ENV"], "base");
    }

    #[test]
    fn test_verify_environment_reports_each_variable() {
        let saved = BTreeMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("SPACK_ROOT".to_string(), "/opt/spack".to_string()),
        ]);
        let observed = BTreeMap::from([
            ("PATH".to_string(), "/opt/conda/bin:/usr/bin".to_string()),
            ("CONDA_DEFAULT_ENV".to_string(), "base".to_string()),
        ]);
        assert_eq!(
            verify_environment(&saved, &observed),
            vec![
                "environment CONDA_DEFAULT_ENV is base, expected it unset",
                "environment PATH is /opt/conda/bin:/usr/bin, expected /usr/bin",
                "environment SPACK_ROOT is unset, expected /opt/spack",
            ]
        );
        assert!(verify_environment(&saved, &saved).is_empty());
    }

    #[test]
    fn test_rollback_reports_environment_drift() {
        let sim = SimMachine::ubuntu();
        let blobs = MemoryBlobStore::new();
        let ledger = Ledger::in_memory();
        let manager = CheckpointManager::new(&sim, &blobs, &ledger);
        let instance = InstanceId::new("ws-1");
        let token = CancelToken::new();
        let deadline = Deadline::unbounded(&token);

        let saved = inspect(&sim, &instance, &deadline).unwrap().state;
        let ck = manager.create(&instance, "t", saved, &[], &deadline).unwrap();
        assert!(ck.environment["PATH"].ends_with("/bin"));
        assert!(!ck.environment.contains_key("HOME"));

        sim.set_env("CONDA_DEFAULT_ENV", "ml");
        let report = manager
            .rollback(&instance, &ck.id, RollbackOptions::default(), &token, &crate::progress::NoProgress)
            .unwrap();
        assert_eq!(report.status, RollbackStatus::RestoredWithWarnings);
        assert_eq!(
            report.discrepancies,
            vec!["environment CONDA_DEFAULT_ENV is ml, expected it unset"]
        );
    }

    #[test]
    fn test_load_rejects_foreign_and_unknown_checkpoints() {
        let sim = SimMachine::ubuntu();
        let blobs = MemoryBlobStore::new();
        let ledger = Ledger::in_memory();
        let manager = CheckpointManager::new(&sim, &blobs, &ledger);
        let deadline = Deadline::unbounded(&CancelToken::new());
        let ck = manager
            .create(&InstanceId::new("ws-1"), "t", InstanceState::empty(), &[], &deadline)
            .unwrap();

        assert!(matches!(
            manager.load(&InstanceId::new("ws-2"), &ck.id),
            Err(Error::ForeignCheckpoint { .. })
        ));
        assert!(matches!(
            manager.load(&InstanceId::new("ws-1"), "ck-missing"),
            Err(Error::CheckpointNotFound(_))
        ));
    }
}
