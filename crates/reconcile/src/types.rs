//! Core data model: templates, instance snapshots, conflicts.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Prefix of every systemd unit this engine manages.
pub const SERVICE_PREFIX: &str = "strata-";

/// Directory holding managed unit files.
pub const UNIT_DIR: &str = "/etc/systemd/system";

/// Unit file header recording the service port.
pub const PORT_HEADER: &str = "# strata-port:";

/// Unit file header recording the service content hash.
pub const HASH_HEADER: &str = "# strata-content-hash:";

// ============================================================================
// Package managers
// ============================================================================

/// A package manager the engine knows how to drive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ManagerKind {
    /// Debian/Ubuntu apt + dpkg
    Apt,
    /// Fedora/RHEL dnf + rpm
    Dnf,
    /// Conda (base environment)
    Conda,
    /// Python pip
    Pip,
    /// Spack
    Spack,
}

impl ManagerKind {
    /// Every supported manager, in plan order.
    pub const ALL: [ManagerKind; 5] = [
        ManagerKind::Apt,
        ManagerKind::Dnf,
        ManagerKind::Conda,
        ManagerKind::Pip,
        ManagerKind::Spack,
    ];

    /// Native OS managers, in the order they are tried for `system` packages.
    pub const NATIVE: [ManagerKind; 2] = [ManagerKind::Apt, ManagerKind::Dnf];

    /// Lowercase name as used in templates.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::Conda => "conda",
            Self::Pip => "pip",
            Self::Spack => "spack",
        }
    }
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "apt" => Ok(Self::Apt),
            "dnf" => Ok(Self::Dnf),
            "conda" => Ok(Self::Conda),
            "pip" => Ok(Self::Pip),
            "spack" => Ok(Self::Spack),
            other => Err(Error::InvalidTemplate(format!(
                "unknown package manager: {other}"
            ))),
        }
    }
}

/// Key of a template's package map: a concrete manager or the generic
/// `system` key resolved at diff time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PackageSource {
    /// Packages for this manager
    Manager(ManagerKind),
    /// Packages for whichever native manager the instance uses
    System,
}

impl TryFrom<String> for PackageSource {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        if s.eq_ignore_ascii_case("system") {
            Ok(Self::System)
        } else {
            s.parse().map(Self::Manager)
        }
    }
}

impl From<PackageSource> for String {
    fn from(source: PackageSource) -> Self {
        source.to_string()
    }
}

impl fmt::Display for PackageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manager(m) => m.fmt(f),
            Self::System => f.write_str("system"),
        }
    }
}

// ============================================================================
// Template (desired state)
// ============================================================================

/// A package requested by a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Package name as the manager knows it
    pub name: String,
    /// Version constraint (`1.2.3`, `>=1.2`, `1.2.*`, ...); absent means any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
}

impl PackageSpec {
    /// Package with no version constraint.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_constraint: None,
        }
    }

    /// Package with a version constraint.
    pub fn with_constraint(name: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_constraint: Some(constraint.into()),
        }
    }
}

/// A package identified by manager and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    /// Owning manager
    pub manager: ManagerKind,
    /// Package name
    pub name: String,
}

/// A service the template wants configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Short name; the unit is `strata-<name>.service`
    pub name: String,
    /// Body of the systemd unit file
    pub unit_definition: String,
    /// Port the service listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// User the service runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ServiceConfig {
    /// Full systemd unit name.
    pub fn unit_name(&self) -> String {
        unit_name(&self.name)
    }

    /// BLAKE3 hash over the unit definition, port and run-as user.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.unit_definition.as_bytes());
        hasher.update(b"\0");
        if let Some(port) = self.port {
            hasher.update(port.to_string().as_bytes());
        }
        hasher.update(b"\0");
        if let Some(user) = &self.user {
            hasher.update(user.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Full unit name for a managed service short name.
pub fn unit_name(service: &str) -> String {
    format!("{SERVICE_PREFIX}{service}.service")
}

/// Path of the unit file for a managed service short name.
pub fn unit_path(service: &str) -> String {
    format!("{UNIT_DIR}/{}", unit_name(service))
}

/// A user account the template wants present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Login name
    pub name: String,
    /// Supplementary groups
    #[serde(default)]
    pub groups: Vec<String>,
    /// Login shell; defaults to `/bin/bash` on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// Shell given to users created without an explicit one.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Fully resolved desired state for an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Template name
    pub name: String,
    /// Template version
    #[serde(default)]
    pub version: String,
    /// Default manager for `system` packages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<ManagerKind>,
    /// Requested packages per manager
    #[serde(default)]
    pub packages: BTreeMap<PackageSource, Vec<PackageSpec>>,
    /// Managed services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// Users
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Ports the template expects to be reachable on
    #[serde(default)]
    pub ports: BTreeSet<u16>,
    /// Packages to remove explicitly
    #[serde(default)]
    pub remove_packages: Vec<PackageRef>,
    /// Managed services to remove explicitly (short names)
    #[serde(default)]
    pub remove_services: Vec<String>,
    /// Users to remove explicitly
    #[serde(default)]
    pub remove_users: Vec<String>,
}

impl Template {
    /// Create an empty template.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Check that every name can be interpolated into a shell command and
    /// that ports and service names are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidTemplate("template name is empty".into()));
        }

        for (source, specs) in &self.packages {
            for spec in specs {
                check_package_name(&spec.name)
                    .map_err(|e| invalid(format!("{source} package {:?}: {e}", spec.name)))?;
                if let Some(constraint) = &spec.version_constraint {
                    crate::version::VersionConstraint::parse(constraint).map_err(|e| {
                        invalid(format!("{source} package {}: {e}", spec.name))
                    })?;
                }
            }
        }
        for pkg in &self.remove_packages {
            check_package_name(&pkg.name)
                .map_err(|e| invalid(format!("removal {:?}: {e}", pkg.name)))?;
        }

        let mut seen = BTreeSet::new();
        for service in &self.services {
            check_identifier(&service.name)
                .map_err(|e| invalid(format!("service {:?}: {e}", service.name)))?;
            if !seen.insert(service.name.as_str()) {
                return Err(invalid(format!("duplicate service {:?}", service.name)));
            }
            if service.port == Some(0) {
                return Err(invalid(format!("service {}: port 0", service.name)));
            }
            if let Some(user) = &service.user {
                check_user_name(user)
                    .map_err(|e| invalid(format!("service {} user: {e}", service.name)))?;
            }
        }
        for name in &self.remove_services {
            check_identifier(name).map_err(|e| invalid(format!("removal {name:?}: {e}")))?;
        }

        for user in &self.users {
            check_user_name(&user.name)
                .map_err(|e| invalid(format!("user {:?}: {e}", user.name)))?;
            for group in &user.groups {
                check_user_name(group)
                    .map_err(|e| invalid(format!("user {} group {group:?}: {e}", user.name)))?;
            }
            if let Some(shell) = &user.shell {
                if !shell.starts_with('/') || !shell.chars().all(is_path_char) {
                    return Err(invalid(format!("user {} shell {shell:?}", user.name)));
                }
            }
        }
        for name in &self.remove_users {
            check_user_name(name).map_err(|e| invalid(format!("removal {name:?}: {e}")))?;
        }

        if self.ports.contains(&0) {
            return Err(invalid("port 0 declared".to_string()));
        }

        Ok(())
    }

    /// Number of requested packages across all managers.
    pub fn package_count(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidTemplate(message)
}

fn check_package_name(name: &str) -> std::result::Result<(), &'static str> {
    let first_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok {
        return Err("must start with a letter or digit");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
    {
        return Err("contains characters outside [A-Za-z0-9._+-]");
    }
    Ok(())
}

fn check_identifier(name: &str) -> std::result::Result<(), &'static str> {
    let first_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok {
        return Err("must start with a letter or digit");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("contains characters outside [A-Za-z0-9._-]");
    }
    Ok(())
}

fn check_user_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() || name.len() > 32 {
        return Err("must be 1-32 characters");
    }
    let first_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if !first_ok {
        return Err("must start with a lowercase letter or underscore");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
    {
        return Err("contains characters outside [a-z0-9_-]");
    }
    Ok(())
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-')
}

// ============================================================================
// Instance state (observed)
// ============================================================================

/// An installed package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Package name
    pub name: String,
    /// Installed version
    pub version: String,
    /// Owning manager
    pub manager: ManagerKind,
    /// Channel, repository or index it came from, when known
    #[serde(default)]
    pub source: String,
}

/// Runtime state of a systemd unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Running
    Active,
    /// Stopped
    Inactive,
    /// Exited with an error
    Failed,
}

/// A managed service found on the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Short name (unit name without prefix and suffix)
    pub name: String,
    /// Runtime state
    pub unit_state: UnitState,
    /// Port recorded in the unit header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Whether the unit is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Content hash recorded in the unit header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// A regular (uid >= 1000) user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Login name
    pub name: String,
    /// Numeric user id
    pub uid: u32,
    /// Supplementary groups, sorted
    #[serde(default)]
    pub groups: Vec<String>,
    /// Login shell
    #[serde(default)]
    pub shell: String,
}

/// Point-in-time snapshot of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Installed packages
    #[serde(default)]
    pub packages: Vec<PackageRecord>,
    /// Managed services
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
    /// Regular users
    #[serde(default)]
    pub users: Vec<UserRecord>,
    /// Listening TCP ports
    #[serde(default)]
    pub open_ports: BTreeSet<u16>,
    /// Managers whose presence probe succeeded
    #[serde(default)]
    pub managers: BTreeSet<ManagerKind>,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

impl InstanceState {
    /// Empty snapshot taken now.
    pub fn empty() -> Self {
        Self {
            packages: Vec::new(),
            services: Vec::new(),
            users: Vec::new(),
            open_ports: BTreeSet::new(),
            managers: BTreeSet::new(),
            captured_at: Utc::now(),
        }
    }

    /// Sort every collection so equal machines give equal snapshots.
    pub fn normalize(&mut self) {
        self.packages
            .sort_by(|a, b| (a.manager, &a.name).cmp(&(b.manager, &b.name)));
        self.services.sort_by(|a, b| a.name.cmp(&b.name));
        self.users.sort_by(|a, b| a.name.cmp(&b.name));
        for user in &mut self.users {
            user.groups.sort();
            user.groups.dedup();
        }
    }

    /// Installed package owned by `manager`.
    pub fn package(&self, manager: ManagerKind, name: &str) -> Option<&PackageRecord> {
        self.packages
            .iter()
            .find(|p| p.manager == manager && p.name == name)
    }

    /// Every installed package called `name`, whichever manager owns it.
    pub fn packages_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PackageRecord> {
        self.packages.iter().filter(move |p| p.name == name)
    }

    /// Managed service by short name.
    pub fn service(&self, name: &str) -> Option<&ServiceRecord> {
        self.services.iter().find(|s| s.name == name)
    }

    /// User by login name.
    pub fn user(&self, name: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Whether `manager` is present on the instance.
    pub fn has_manager(&self, manager: ManagerKind) -> bool {
        self.managers.contains(&manager)
    }
}

// ============================================================================
// Conflicts
// ============================================================================

/// Kind of incompatibility between desired and current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two services want the same port, or the port is taken
    PortCollision,
    /// The package name is already owned by a different manager
    ManagerOwnershipCollision,
    /// The desired version is lower than the installed one
    VersionDowngradeBlocked,
    /// The template needs a manager the instance does not have
    ManagerUnavailable,
    /// An existing user's groups or shell will change
    UserMembershipChange,
}

impl ConflictKind {
    /// Default severity of this kind.
    pub fn severity(&self) -> Severity {
        match self {
            Self::UserMembershipChange => Severity::Advisory,
            _ => Severity::Blocking,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PortCollision => "port_collision",
            Self::ManagerOwnershipCollision => "manager_ownership_collision",
            Self::VersionDowngradeBlocked => "version_downgrade_blocked",
            Self::ManagerUnavailable => "manager_unavailable",
            Self::UserMembershipChange => "user_membership_change",
        };
        f.write_str(s)
    }
}

/// Whether a conflict stops an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Apply is refused unless forced
    Blocking,
    /// Reported only
    Advisory,
}

/// A detected incompatibility.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Conflict {
    /// What kind of conflict
    pub kind: ConflictKind,
    /// Human-readable detail
    pub detail: String,
    /// Blocking or advisory
    pub severity: Severity,
}

impl Conflict {
    /// Conflict with the kind's default severity.
    pub fn new(kind: ConflictKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            severity: kind.severity(),
        }
    }

    /// Whether this conflict blocks an unforced apply.
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jupyter_service() -> ServiceConfig {
        ServiceConfig {
            name: "jupyter".into(),
            unit_definition: "[Service]\nExecStart=/opt/conda/bin/jupyter lab\n".into(),
            port: Some(8888),
            user: Some("jupyter".into()),
        }
    }

    #[test]
    fn test_package_source_keys() {
        let json = r#"{"name":"t","packages":{"conda":[{"name":"jupyterlab"}],"system":[{"name":"git"}]}}"#;
        let template: Template = serde_json::from_str(json).unwrap();
        assert!(template.packages.contains_key(&PackageSource::Manager(ManagerKind::Conda)));
        assert!(template.packages.contains_key(&PackageSource::System));

        let back = serde_json::to_string(&template).unwrap();
        assert!(back.contains("\"system\""));
    }

    #[test]
    fn test_unknown_manager_rejected() {
        let json = r#"{"name":"t","packages":{"brew":[{"name":"git"}]}}"#;
        assert!(serde_json::from_str::<Template>(json).is_err());
    }

    #[test]
    fn test_content_hash_covers_port_and_user() {
        let base = jupyter_service();
        let mut other_port = base.clone();
        other_port.port = Some(8889);
        let mut other_user = base.clone();
        other_user.user = None;

        assert_eq!(base.content_hash(), jupyter_service().content_hash());
        assert_ne!(base.content_hash(), other_port.content_hash());
        assert_ne!(base.content_hash(), other_user.content_hash());
    }

    #[test]
    fn test_unit_paths() {
        assert_eq!(jupyter_service().unit_name(), "strata-jupyter.service");
        assert_eq!(
            unit_path("jupyter"),
            "/etc/systemd/system/strata-jupyter.service"
        );
    }

    #[test]
    fn test_validate_accepts_reasonable_template() {
        let mut template = Template::new("jupyter-lab", "1.0");
        template.packages.insert(
            PackageSource::Manager(ManagerKind::Conda),
            vec![PackageSpec::with_constraint("jupyterlab", ">=4.0")],
        );
        template.services.push(jupyter_service());
        template.users.push(UserConfig {
            name: "jupyter".into(),
            groups: vec!["users".into()],
            shell: Some("/bin/bash".into()),
        });
        assert!(template.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shell_metacharacters() {
        let mut template = Template::new("bad", "1");
        template.packages.insert(
            PackageSource::System,
            vec![PackageSpec::new("git; rm -rf /")],
        );
        assert!(matches!(template.validate(), Err(Error::InvalidTemplate(_))));

        let mut template = Template::new("bad", "1");
        template.users.push(UserConfig {
            name: "$(id)".into(),
            groups: vec![],
            shell: None,
        });
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_services() {
        let mut template = Template::new("dup", "1");
        template.services.push(jupyter_service());
        template.services.push(jupyter_service());
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_constraint() {
        let mut template = Template::new("t", "1");
        template.packages.insert(
            PackageSource::Manager(ManagerKind::Pip),
            vec![PackageSpec::with_constraint("numpy", ">>1")],
        );
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_conflict_severity_defaults() {
        assert!(Conflict::new(ConflictKind::PortCollision, "x").is_blocking());
        assert!(!Conflict::new(ConflictKind::UserMembershipChange, "x").is_blocking());
    }

    #[test]
    fn test_normalize_sorts() {
        let mut state = InstanceState::empty();
        state.packages.push(PackageRecord {
            name: "b".into(),
            version: "1".into(),
            manager: ManagerKind::Pip,
            source: String::new(),
        });
        state.packages.push(PackageRecord {
            name: "a".into(),
            version: "1".into(),
            manager: ManagerKind::Pip,
            source: String::new(),
        });
        state.users.push(UserRecord {
            name: "u".into(),
            uid: 1000,
            groups: vec!["z".into(), "a".into(), "a".into()],
            shell: "/bin/sh".into(),
        });
        state.normalize();
        assert_eq!(state.packages[0].name, "a");
        assert_eq!(state.users[0].groups, vec!["a", "z"]);
    }
}
