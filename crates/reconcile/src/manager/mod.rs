//! Package-manager capability set.
//!
//! Each supported manager implements [`PackageManager`]: how to detect it,
//! how to list what it installed, and how to build one batched command per
//! operation. The engine never branches on manager names; adding a manager
//! means adding an implementation and registering it in [`manager`].

mod apt;
mod conda;
mod dnf;
mod pip;
mod spack;

pub use apt::Apt;
pub use conda::Conda;
pub use dnf::Dnf;
pub use pip::Pip;
pub use spack::Spack;

use crate::types::{ManagerKind, PackageRecord};
use crate::version::VersionConstraint;
use hostkit::shell;

/// A package to act on, with the version it should end up at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageTarget {
    /// Package name
    pub name: String,
    /// Version constraint, if any
    pub constraint: Option<String>,
}

impl PackageTarget {
    /// Target with no version constraint.
    pub fn latest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: None,
        }
    }

    /// Target pinned to an exact version.
    pub fn pinned(name: impl Into<String>, version: &str) -> Self {
        Self {
            name: name.into(),
            constraint: Some(format!("=={version}")),
        }
    }

    /// The exact version the constraint pins, if any.
    pub fn pin(&self) -> Option<String> {
        self.parsed()
            .and_then(|c| c.pinned().map(str::to_string))
    }

    /// The constraint parsed, ignoring unparsable or empty constraints.
    pub fn parsed(&self) -> Option<VersionConstraint> {
        self.constraint
            .as_deref()
            .and_then(|c| VersionConstraint::parse(c).ok())
            .filter(|c| *c != VersionConstraint::Any)
    }
}

/// Everything the engine needs from a package manager.
pub trait PackageManager: Send + Sync {
    /// Which manager this is.
    fn kind(&self) -> ManagerKind;

    /// Command that exits zero when the manager is installed.
    fn probe_command(&self) -> String;

    /// Command listing installed packages in a format [`Self::parse_installed`]
    /// understands.
    fn list_command(&self) -> String;

    /// Parse the output of [`Self::list_command`].
    ///
    /// Returns the packages that parsed and a message for each line or
    /// document that did not.
    fn parse_installed(&self, output: &str) -> (Vec<PackageRecord>, Vec<String>);

    /// One command installing every target.
    fn install_command(&self, targets: &[PackageTarget]) -> String;

    /// One command upgrading every target.
    fn upgrade_command(&self, targets: &[PackageTarget]) -> String {
        self.install_command(targets)
    }

    /// One command downgrading every target without touching dependents.
    ///
    /// A downgrade that would cascade into other packages must fail rather
    /// than silently change them.
    fn downgrade_command(&self, targets: &[PackageTarget]) -> String;

    /// One command removing every named package.
    fn remove_command(&self, names: &[String]) -> String;
}

static APT: Apt = Apt;
static DNF: Dnf = Dnf;
static CONDA: Conda = Conda;
static PIP: Pip = Pip;
static SPACK: Spack = Spack;

/// The implementation for `kind`.
pub fn manager(kind: ManagerKind) -> &'static dyn PackageManager {
    match kind {
        ManagerKind::Apt => &APT,
        ManagerKind::Dnf => &DNF,
        ManagerKind::Conda => &CONDA,
        ManagerKind::Pip => &PIP,
        ManagerKind::Spack => &SPACK,
    }
}

/// Every registered manager.
pub fn all() -> impl Iterator<Item = &'static dyn PackageManager> {
    ManagerKind::ALL.into_iter().map(manager)
}

/// `command -v <binary>` presence probe.
pub(crate) fn probe_binary(binary: &str) -> String {
    format!("command -v {} >/dev/null 2>&1", shell::quote(binary))
}

/// Render `targets` with a per-manager argument builder and quote them.
pub(crate) fn render_targets<F>(targets: &[PackageTarget], render: F) -> String
where
    F: Fn(&PackageTarget) -> String,
{
    shell::join(targets.iter().map(render))
}

/// Quote and join bare package names.
pub(crate) fn render_names(names: &[String]) -> String {
    shell::join(names)
}
