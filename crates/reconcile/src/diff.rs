//! Difference between an instance's current state and a template.
//!
//! [`diff`] is pure: the same snapshot and template always give the same
//! [`StateDiff`], with every collection sorted.

use crate::types::{
    Conflict, ConflictKind, InstanceState, ManagerKind, PackageSource, ServiceConfig, Template,
    UnitState, UserConfig,
};
use crate::version::{Direction, Version, VersionConstraint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Options that change how a diff treats conflicts and `system` packages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOptions {
    /// Plan downgrades instead of blocking them
    #[serde(default)]
    pub force: bool,
    /// Manager for `system` packages, overriding the template's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager_preference: Option<ManagerKind>,
}

/// One package operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageChange {
    /// Manager that performs it
    pub manager: ManagerKind,
    /// Package name
    pub name: String,
    /// Version installed now, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<String>,
    /// Constraint the package must end up satisfying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
}

/// A user whose groups or shell change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChange {
    /// Desired account settings
    pub desired: UserConfig,
    /// Groups the account has now
    pub current_groups: Vec<String>,
    /// Shell the account has now
    pub current_shell: String,
}

/// Everything that has to change to reach the template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Packages not installed yet
    pub packages_to_install: Vec<PackageChange>,
    /// Packages installed below the constraint
    pub packages_to_upgrade: Vec<PackageChange>,
    /// Packages installed above the constraint (forced only)
    pub packages_to_downgrade: Vec<PackageChange>,
    /// Packages explicitly removed by the template
    pub packages_to_remove: Vec<PackageChange>,
    /// Services whose unit file is written
    pub services_to_configure: Vec<ServiceConfig>,
    /// Services (re)started
    pub services_to_start: Vec<String>,
    /// Services stopped
    pub services_to_stop: Vec<String>,
    /// Services enabled
    pub services_to_enable: Vec<String>,
    /// Services disabled
    pub services_to_disable: Vec<String>,
    /// Services whose unit file is deleted
    pub services_to_remove: Vec<String>,
    /// Accounts created
    pub users_to_create: Vec<UserConfig>,
    /// Accounts whose groups or shell change
    pub users_to_modify: Vec<UserChange>,
    /// Accounts deleted
    pub users_to_delete: Vec<String>,
    /// Ports the template uses that nothing listens on yet. Informational:
    /// reaching the instance on them is a network rule, not a step.
    #[serde(default)]
    pub ports_to_open: Vec<u16>,
    /// Detected incompatibilities
    pub conflicts: Vec<Conflict>,
}

impl StateDiff {
    /// Whether any operation is needed.
    pub fn has_changes(&self) -> bool {
        !(self.packages_to_install.is_empty()
            && self.packages_to_upgrade.is_empty()
            && self.packages_to_downgrade.is_empty()
            && self.packages_to_remove.is_empty()
            && self.services_to_configure.is_empty()
            && self.services_to_start.is_empty()
            && self.services_to_stop.is_empty()
            && self.services_to_enable.is_empty()
            && self.services_to_disable.is_empty()
            && self.services_to_remove.is_empty()
            && self.users_to_create.is_empty()
            && self.users_to_modify.is_empty()
            && self.users_to_delete.is_empty())
    }

    /// No operations and no conflicts.
    pub fn is_empty(&self) -> bool {
        !self.has_changes() && self.conflicts.is_empty()
    }

    /// Conflicts that stop an unforced apply.
    pub fn blocking_conflicts(&self) -> Vec<Conflict> {
        self.conflicts
            .iter()
            .filter(|c| c.is_blocking())
            .cloned()
            .collect()
    }

    /// Managers that have package work to do, in plan order.
    pub fn managers_used(&self) -> Vec<ManagerKind> {
        let used: BTreeSet<ManagerKind> = self
            .packages_to_install
            .iter()
            .chain(&self.packages_to_upgrade)
            .chain(&self.packages_to_downgrade)
            .chain(&self.packages_to_remove)
            .map(|p| p.manager)
            .collect();
        ManagerKind::ALL
            .into_iter()
            .filter(|m| used.contains(m))
            .collect()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let counts = [
            (self.packages_to_install.len(), "to install"),
            (self.packages_to_upgrade.len(), "to upgrade"),
            (self.packages_to_downgrade.len(), "to downgrade"),
            (self.packages_to_remove.len(), "to remove"),
            (self.services_to_configure.len(), "services to configure"),
            (self.services_to_remove.len(), "services to remove"),
            (self.users_to_create.len(), "users to create"),
            (self.users_to_modify.len(), "users to modify"),
            (self.users_to_delete.len(), "users to delete"),
            (self.ports_to_open.len(), "ports to open"),
            (self.conflicts.len(), "conflicts"),
        ];
        let parts: Vec<String> = counts
            .iter()
            .filter(|(n, _)| *n > 0)
            .map(|(n, label)| format!("{n} {label}"))
            .collect();
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Resolve the manager behind the `system` package key.
pub fn resolve_system_manager(
    current: &InstanceState,
    desired: &Template,
    options: &DiffOptions,
) -> Option<ManagerKind> {
    options
        .package_manager_preference
        .or(desired.package_manager)
        .or_else(|| {
            ManagerKind::NATIVE
                .into_iter()
                .find(|m| current.has_manager(*m))
        })
}

/// Compute what has to change for `current` to match `desired`.
pub fn diff(current: &InstanceState, desired: &Template, options: &DiffOptions) -> StateDiff {
    let mut out = StateDiff::default();
    let mut conflicts: BTreeSet<Conflict> = BTreeSet::new();

    diff_packages(current, desired, options, &mut out, &mut conflicts);
    diff_services(current, desired, &mut out, &mut conflicts);
    diff_users(current, desired, &mut out, &mut conflicts);
    out.ports_to_open = ports_to_open(current, desired);

    out.packages_to_install.sort();
    out.packages_to_upgrade.sort();
    out.packages_to_downgrade.sort();
    out.packages_to_remove.sort();
    out.services_to_configure.sort_by(|a, b| a.name.cmp(&b.name));
    out.services_to_start.sort();
    out.services_to_stop.sort();
    out.services_to_enable.sort();
    out.services_to_disable.sort();
    out.services_to_remove.sort();
    out.users_to_create.sort_by(|a, b| a.name.cmp(&b.name));
    out.users_to_modify
        .sort_by(|a, b| a.desired.name.cmp(&b.desired.name));
    out.users_to_delete.sort();
    out.conflicts = conflicts.into_iter().collect();
    out
}

fn diff_packages(
    current: &InstanceState,
    desired: &Template,
    options: &DiffOptions,
    out: &mut StateDiff,
    conflicts: &mut BTreeSet<Conflict>,
) {
    let mut seen: BTreeSet<(ManagerKind, &str)> = BTreeSet::new();

    for (source, specs) in &desired.packages {
        if specs.is_empty() {
            continue;
        }
        let manager = match source {
            PackageSource::Manager(m) => *m,
            PackageSource::System => {
                if let Some(m) = resolve_system_manager(current, desired, options) {
                    m
                } else {
                    conflicts.insert(Conflict::new(
                        ConflictKind::ManagerUnavailable,
                        "no native package manager (apt or dnf) found for system packages",
                    ));
                    continue;
                }
            }
        };
        if !current.has_manager(manager) {
            conflicts.insert(Conflict::new(
                ConflictKind::ManagerUnavailable,
                format!("template needs {manager} but it is not installed on the instance"),
            ));
            continue;
        }

        for spec in specs {
            if !seen.insert((manager, spec.name.as_str())) {
                continue;
            }
            let change = PackageChange {
                manager,
                name: spec.name.clone(),
                installed: None,
                constraint: spec.version_constraint.clone(),
            };

            let Some(installed) = current.package(manager, &spec.name) else {
                for other in current
                    .packages_named(&spec.name)
                    .filter(|p| p.manager != manager)
                {
                    conflicts.insert(Conflict::new(
                        ConflictKind::ManagerOwnershipCollision,
                        format!(
                            "{} is already installed by {} ({}); template wants it from {manager}",
                            spec.name, other.manager, other.version
                        ),
                    ));
                }
                out.packages_to_install.push(change);
                continue;
            };

            let change = PackageChange {
                installed: Some(installed.version.clone()),
                ..change
            };
            let constraint = spec
                .version_constraint
                .as_deref()
                .and_then(|c| VersionConstraint::parse(c).ok())
                .unwrap_or(VersionConstraint::Any);
            let direction = match Version::parse(&installed.version) {
                Ok(version) => constraint.direction(&version),
                // Cannot compare; only an unconstrained request is satisfied
                Err(_) if constraint == VersionConstraint::Any => None,
                Err(_) => Some(Direction::Upgrade),
            };

            match direction {
                None => {}
                Some(Direction::Upgrade) => out.packages_to_upgrade.push(change),
                Some(Direction::Downgrade) if options.force => {
                    out.packages_to_downgrade.push(change);
                }
                Some(Direction::Downgrade) => {
                    conflicts.insert(Conflict::new(
                        ConflictKind::VersionDowngradeBlocked,
                        format!(
                            "{manager} {}: installed {} is newer than {}",
                            spec.name,
                            installed.version,
                            change.constraint.as_deref().unwrap_or("*")
                        ),
                    ));
                }
            }
        }
    }

    for removal in &desired.remove_packages {
        if let Some(installed) = current.package(removal.manager, &removal.name) {
            if seen.contains(&(removal.manager, removal.name.as_str())) {
                continue;
            }
            out.packages_to_remove.push(PackageChange {
                manager: removal.manager,
                name: removal.name.clone(),
                installed: Some(installed.version.clone()),
                constraint: None,
            });
        }
    }
}

fn diff_services(
    current: &InstanceState,
    desired: &Template,
    out: &mut StateDiff,
    conflicts: &mut BTreeSet<Conflict>,
) {
    let desired_names: BTreeSet<&str> = desired.services.iter().map(|s| s.name.as_str()).collect();
    // port -> desired service that claimed it first
    let mut claimed: BTreeMap<u16, &str> = BTreeMap::new();

    for svc in &desired.services {
        let hash = svc.content_hash();
        match current.service(&svc.name) {
            None => {
                out.services_to_configure.push(svc.clone());
                out.services_to_enable.push(svc.name.clone());
                out.services_to_start.push(svc.name.clone());
            }
            Some(rec) if rec.content_hash.as_deref() != Some(hash.as_str()) => {
                out.services_to_configure.push(svc.clone());
                if !rec.enabled {
                    out.services_to_enable.push(svc.name.clone());
                }
                out.services_to_start.push(svc.name.clone());
            }
            Some(rec) => {
                if !rec.enabled {
                    out.services_to_enable.push(svc.name.clone());
                }
                if rec.unit_state != UnitState::Active {
                    out.services_to_start.push(svc.name.clone());
                }
            }
        }

        let Some(port) = svc.port else {
            continue;
        };
        if let Some(first) = claimed.insert(port, svc.name.as_str()) {
            conflicts.insert(Conflict::new(
                ConflictKind::PortCollision,
                format!("services {first} and {} both want port {port}", svc.name),
            ));
            claimed.insert(port, first);
            continue;
        }
        if let Some(conflict) = port_owner_conflict(current, &desired_names, &svc.name, port) {
            conflicts.insert(conflict);
        }
    }

    for name in &desired.remove_services {
        if desired_names.contains(name.as_str()) {
            continue;
        }
        let Some(rec) = current.service(name) else {
            continue;
        };
        if rec.unit_state == UnitState::Active {
            out.services_to_stop.push(name.clone());
        }
        if rec.enabled {
            out.services_to_disable.push(name.clone());
        }
        out.services_to_remove.push(name.clone());
    }
}

/// Conflict when `port` belongs to something other than `service` itself.
fn port_owner_conflict(
    current: &InstanceState,
    desired_names: &BTreeSet<&str>,
    service: &str,
    port: u16,
) -> Option<Conflict> {
    if let Some(other) = current
        .services
        .iter()
        .find(|s| s.port == Some(port) && s.name != service)
    {
        // A template service moving to another port frees this one
        if !desired_names.contains(other.name.as_str()) {
            return Some(Conflict::new(
                ConflictKind::PortCollision,
                format!(
                    "port {port} wanted by service {service} is used by managed service {}",
                    other.name
                ),
            ));
        }
    }

    let own = current
        .service(service)
        .is_some_and(|s| s.port == Some(port));
    let managed_elsewhere = current.services.iter().any(|s| s.port == Some(port));
    if current.open_ports.contains(&port) && !own && !managed_elsewhere {
        return Some(Conflict::new(
            ConflictKind::PortCollision,
            format!("port {port} wanted by service {service} is already listening on the instance"),
        ));
    }
    None
}

/// Service ports and declared ports with no listener, sorted.
///
/// Declared ports never conflict: `ports = [22]` on a host where sshd
/// already listens simply has nothing to open.
fn ports_to_open(current: &InstanceState, desired: &Template) -> Vec<u16> {
    let wanted: BTreeSet<u16> = desired
        .services
        .iter()
        .filter_map(|s| s.port)
        .chain(desired.ports.iter().copied())
        .collect();
    wanted
        .into_iter()
        .filter(|port| !current.open_ports.contains(port))
        .collect()
}

fn diff_users(
    current: &InstanceState,
    desired: &Template,
    out: &mut StateDiff,
    conflicts: &mut BTreeSet<Conflict>,
) {
    let desired_names: BTreeSet<&str> = desired.users.iter().map(|u| u.name.as_str()).collect();

    for user in &desired.users {
        let Some(rec) = current.user(&user.name) else {
            out.users_to_create.push(user.clone());
            continue;
        };

        let wanted: BTreeSet<&str> = user.groups.iter().map(String::as_str).collect();
        let have: BTreeSet<&str> = rec.groups.iter().map(String::as_str).collect();
        let groups_differ = wanted != have;
        let shell_differs = user.shell.as_ref().is_some_and(|s| *s != rec.shell);
        if !groups_differ && !shell_differs {
            continue;
        }

        let mut changes = Vec::new();
        if groups_differ {
            changes.push(format!(
                "groups [{}] -> [{}]",
                rec.groups.join(","),
                wanted.iter().copied().collect::<Vec<_>>().join(",")
            ));
        }
        if let Some(shell) = user.shell.as_ref().filter(|_| shell_differs) {
            changes.push(format!("shell {} -> {shell}", rec.shell));
        }
        conflicts.insert(Conflict::new(
            ConflictKind::UserMembershipChange,
            format!("user {}: {}", user.name, changes.join("; ")),
        ));
        out.users_to_modify.push(UserChange {
            desired: user.clone(),
            current_groups: rec.groups.clone(),
            current_shell: rec.shell.clone(),
        });
    }

    for name in &desired.remove_users {
        if !desired_names.contains(name.as_str()) && current.user(name).is_some() {
            out.users_to_delete.push(name.clone());
        }
    }
}
