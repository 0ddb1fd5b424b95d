//! Ordered execution plans.
//!
//! A [`Plan`] is a list of [`Step`]s, each one shell command or one file
//! write. Apply plans always run users, then packages, then services;
//! rollback plans built by the checkpoint manager run the reverse.

use crate::diff::{PackageChange, StateDiff};
use crate::error::{Error, Result};
use crate::manager::{self, PackageTarget};
use crate::types::{
    DEFAULT_SHELL, HASH_HEADER, ManagerKind, PORT_HEADER, ServiceConfig, UserConfig, unit_name,
    unit_path,
};
use hostkit::{Deadline, ExecutionResult, InstanceId, RemoteExecutor, shell};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepClass {
    /// Account changes
    Users,
    /// Package manager invocations
    Packages,
    /// systemd units
    Services,
}

impl fmt::Display for StepClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Users => write!(f, "users"),
            Self::Packages => write!(f, "packages"),
            Self::Services => write!(f, "services"),
        }
    }
}

/// What a step does on the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Run a shell command
    Run {
        /// The command
        command: String,
    },
    /// Replace a file
    WriteFile {
        /// Absolute path
        path: String,
        /// New contents
        contents: String,
    },
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Phase
    pub class: StepClass,
    /// Human description
    pub description: String,
    /// The work itself
    pub action: StepAction,
    /// Manager behind a package step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerKind>,
}

impl Step {
    fn run(class: StepClass, description: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            class,
            description: description.into(),
            action: StepAction::Run {
                command: command.into(),
            },
            manager: None,
        }
    }

    fn write(description: impl Into<String>, path: String, contents: String) -> Self {
        Self {
            class: StepClass::Services,
            description: description.into(),
            action: StepAction::WriteFile { path, contents },
            manager: None,
        }
    }

    /// The command this step runs, if it is a command.
    pub fn command(&self) -> Option<&str> {
        match &self.action {
            StepAction::Run { command } => Some(command),
            StepAction::WriteFile { .. } => None,
        }
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Steps in execution order
    pub steps: Vec<Step>,
}

impl Plan {
    /// Whether the plan does nothing.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Step classes in execution order, with repeats collapsed.
    pub fn class_sequence(&self) -> Vec<StepClass> {
        let mut classes: Vec<StepClass> = self.steps.iter().map(|s| s.class).collect();
        classes.dedup();
        classes
    }

    pub(crate) fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub(crate) fn extend(&mut self, other: Plan) {
        self.steps.extend(other.steps);
    }
}

/// Result of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Position in the plan
    pub index: usize,
    /// Step description
    pub description: String,
    /// What the instance reported
    pub result: ExecutionResult,
}

// ============================================================================
// Plan construction
// ============================================================================

/// Build the apply plan for `diff`: users, then packages, then services.
pub fn build(diff: &StateDiff) -> Plan {
    let mut plan = Plan::default();

    for user in &diff.users_to_create {
        plan.push(create_user_step(user, None));
    }
    for change in &diff.users_to_modify {
        plan.push(modify_user_step(
            &change.desired.name,
            &change.desired.groups,
            change.desired.shell.as_deref(),
        ));
    }
    for name in &diff.users_to_delete {
        plan.push(delete_user_step(name, false));
    }

    for kind in ManagerKind::ALL {
        let mine = |changes: &[PackageChange]| -> Vec<PackageTarget> {
            changes
                .iter()
                .filter(|c| c.manager == kind)
                .map(|c| PackageTarget {
                    name: c.name.clone(),
                    constraint: c.constraint.clone(),
                })
                .collect()
        };
        plan.extend(package_steps(
            kind,
            &mine(&diff.packages_to_install),
            &mine(&diff.packages_to_upgrade),
            &mine(&diff.packages_to_downgrade),
            &diff
                .packages_to_remove
                .iter()
                .filter(|c| c.manager == kind)
                .map(|c| c.name.clone())
                .collect::<Vec<_>>(),
        ));
    }

    let mut services = ServiceSteps::default();
    services.stop.clone_from(&diff.services_to_stop);
    services.disable.clone_from(&diff.services_to_disable);
    services.remove.clone_from(&diff.services_to_remove);
    services.write = diff
        .services_to_configure
        .iter()
        .map(|svc| (svc.name.clone(), render_unit(svc)))
        .collect();
    services.enable.clone_from(&diff.services_to_enable);
    services.start.clone_from(&diff.services_to_start);
    plan.extend(services.into_plan());

    plan
}

/// Unit files the plan for `diff` writes or deletes.
pub fn touched_paths(diff: &StateDiff) -> Vec<String> {
    let mut paths: Vec<String> = diff
        .services_to_configure
        .iter()
        .map(|s| unit_path(&s.name))
        .chain(diff.services_to_remove.iter().map(|s| unit_path(s)))
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

/// The unit file written for `service`, with the engine's header lines and
/// a `User=` line when the service has a run-as user.
pub fn render_unit(service: &ServiceConfig) -> String {
    let mut out = String::new();
    if let Some(port) = service.port {
        out.push_str(&format!("{PORT_HEADER} {port}\n"));
    }
    out.push_str(&format!("{HASH_HEADER} {}\n", service.content_hash()));

    let definition = service.unit_definition.trim_end();
    let has_user = definition
        .lines()
        .any(|l| l.trim_start().starts_with("User="));
    match service.user.as_deref().filter(|_| !has_user) {
        Some(user) if definition.lines().any(|l| l.trim() == "[Service]") => {
            for line in definition.lines() {
                out.push_str(line);
                out.push('\n');
                if line.trim() == "[Service]" {
                    out.push_str(&format!("User={user}\n"));
                }
            }
        }
        Some(user) => {
            out.push_str(definition);
            out.push_str(&format!("\n[Service]\nUser={user}\n"));
        }
        None => {
            out.push_str(definition);
            out.push('\n');
        }
    }
    out
}

/// `useradd` step, creating supplementary groups first.
pub(crate) fn create_user_step(user: &UserConfig, uid: Option<u32>) -> Step {
    let mut parts: Vec<String> = user
        .groups
        .iter()
        .map(|g| format!("groupadd -f {}", shell::quote(g)))
        .collect();
    let mut useradd = vec!["useradd".to_string(), "-m".to_string()];
    useradd.push("-s".to_string());
    useradd.push(user.shell.clone().unwrap_or_else(|| DEFAULT_SHELL.to_string()));
    if !user.groups.is_empty() {
        useradd.push("-G".to_string());
        useradd.push(user.groups.join(","));
    }
    if let Some(uid) = uid {
        useradd.push("-u".to_string());
        useradd.push(uid.to_string());
    }
    useradd.push(user.name.clone());
    parts.push(shell::join(&useradd));

    Step::run(
        StepClass::Users,
        format!("create user {}", user.name),
        parts.join(" && "),
    )
}

/// `usermod` step setting the supplementary groups and, if given, the shell.
pub(crate) fn modify_user_step(name: &str, groups: &[String], shell_path: Option<&str>) -> Step {
    let mut parts: Vec<String> = groups
        .iter()
        .map(|g| format!("groupadd -f {}", shell::quote(g)))
        .collect();
    let mut usermod = vec!["usermod".to_string()];
    if let Some(shell_path) = shell_path {
        usermod.push("-s".to_string());
        usermod.push(shell_path.to_string());
    }
    usermod.push("-G".to_string());
    usermod.push(groups.join(","));
    usermod.push(name.to_string());
    parts.push(shell::join(&usermod));

    Step::run(
        StepClass::Users,
        format!("modify user {name}"),
        parts.join(" && "),
    )
}

/// `userdel` step; the home directory is kept unless `delete_home`.
pub(crate) fn delete_user_step(name: &str, delete_home: bool) -> Step {
    let command = if delete_home {
        format!("userdel -r {}", shell::quote(name))
    } else {
        format!("userdel {}", shell::quote(name))
    };
    Step::run(StepClass::Users, format!("delete user {name}"), command)
}

fn package_list(targets: &[PackageTarget]) -> String {
    targets
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One step per non-empty batch: install, upgrade, downgrade, remove.
pub(crate) fn package_steps(
    kind: ManagerKind,
    install: &[PackageTarget],
    upgrade: &[PackageTarget],
    downgrade: &[PackageTarget],
    remove: &[String],
) -> Plan {
    let m = manager::manager(kind);
    let mut plan = Plan::default();
    let mut add = |verb: &str, count: usize, names: String, command: String| {
        plan.push(Step {
            class: StepClass::Packages,
            description: format!("{verb} {count} {kind} package(s): {names}"),
            action: StepAction::Run { command },
            manager: Some(kind),
        });
    };

    if !install.is_empty() {
        add("install", install.len(), package_list(install), m.install_command(install));
    }
    if !upgrade.is_empty() {
        add("upgrade", upgrade.len(), package_list(upgrade), m.upgrade_command(upgrade));
    }
    if !downgrade.is_empty() {
        add(
            "downgrade",
            downgrade.len(),
            package_list(downgrade),
            m.downgrade_command(downgrade),
        );
    }
    if !remove.is_empty() {
        add("remove", remove.len(), remove.join(", "), m.remove_command(remove));
    }
    plan
}

/// Service work grouped by phase; [`ServiceSteps::into_plan`] orders it.
#[derive(Debug, Default)]
pub(crate) struct ServiceSteps {
    pub stop: Vec<String>,
    pub disable: Vec<String>,
    pub remove: Vec<String>,
    /// (service, unit file contents)
    pub write: Vec<(String, String)>,
    pub enable: Vec<String>,
    pub start: Vec<String>,
}

impl ServiceSteps {
    /// Stop, disable, remove, write, reload, enable, start.
    pub fn into_plan(self) -> Plan {
        let mut plan = Plan::default();
        let systemctl = |verb: &str, name: &str| {
            Step::run(
                StepClass::Services,
                format!("{verb} {name}"),
                format!("systemctl {verb} {}", shell::quote(&unit_name(name))),
            )
        };

        for name in &self.stop {
            plan.push(systemctl("stop", name));
        }
        for name in &self.disable {
            plan.push(systemctl("disable", name));
        }
        for name in &self.remove {
            plan.push(Step::run(
                StepClass::Services,
                format!("remove unit {}", unit_name(name)),
                format!("rm -f {}", shell::quote(&unit_path(name))),
            ));
        }
        let reload = !self.remove.is_empty() || !self.write.is_empty();
        for (name, contents) in self.write {
            plan.push(Step::write(
                format!("write unit {}", unit_name(&name)),
                unit_path(&name),
                contents,
            ));
        }
        if reload {
            plan.push(Step::run(
                StepClass::Services,
                "reload systemd",
                "systemctl daemon-reload",
            ));
        }
        for name in &self.enable {
            plan.push(systemctl("enable", name));
        }
        for name in &self.start {
            plan.push(systemctl("restart", name));
        }
        plan
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Run one step and turn a non-zero exit into the matching error.
///
/// Package steps fail with [`Error::PackageManager`], everything else with
/// [`Error::StepFailed`]. Transport failures pass through unchanged.
pub fn execute_step(
    executor: &dyn RemoteExecutor,
    instance: &InstanceId,
    index: usize,
    step: &Step,
    deadline: &Deadline,
) -> Result<StepOutcome> {
    log::debug!("[{instance}] step {index}: {}", step.description);
    let result = match &step.action {
        StepAction::Run { command } => executor.execute(instance, command, deadline)?,
        StepAction::WriteFile { path, contents } => {
            executor.copy_file(instance, contents.as_bytes(), path, deadline)?;
            ExecutionResult::ok("")
        }
    };

    if !result.success() {
        let stderr = result.stderr.trim().to_string();
        return Err(match step.manager {
            Some(manager) if step.class == StepClass::Packages => Error::PackageManager {
                manager,
                exit_code: result.exit_code,
                stderr,
            },
            _ => Error::StepFailed {
                index,
                description: step.description.clone(),
                exit_code: result.exit_code,
                stderr,
            },
        });
    }

    Ok(StepOutcome {
        index,
        description: step.description.clone(),
        result,
    })
}
