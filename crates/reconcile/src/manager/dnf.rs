//! Fedora/RHEL packages via dnf and rpm.

use super::{PackageManager, PackageTarget, probe_binary, render_names, render_targets};
use crate::types::{ManagerKind, PackageRecord};

/// The dnf package manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dnf;

fn target_arg(t: &PackageTarget) -> String {
    match t.pin() {
        Some(version) => format!("{}-{version}", t.name),
        None => t.name.clone(),
    }
}

impl PackageManager for Dnf {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Dnf
    }

    fn probe_command(&self) -> String {
        probe_binary("dnf")
    }

    fn list_command(&self) -> String {
        r"rpm -qa --qf '%{NAME}\t%{EPOCHNUM}:%{VERSION}-%{RELEASE}\t%{ARCH}\n'".to_string()
    }

    fn parse_installed(&self, output: &str) -> (Vec<PackageRecord>, Vec<String>) {
        let mut packages = Vec::new();
        let mut warnings = Vec::new();

        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            let [name, evr, arch] = fields.as_slice() else {
                warnings.push(format!("unrecognised rpm line: {line:?}"));
                continue;
            };
            // Imported signing keys show up as packages
            if *name == "gpg-pubkey" {
                continue;
            }
            let version = evr.strip_prefix("0:").unwrap_or(evr);
            packages.push(PackageRecord {
                name: (*name).to_string(),
                version: version.to_string(),
                manager: ManagerKind::Dnf,
                source: (*arch).to_string(),
            });
        }

        (packages, warnings)
    }

    fn install_command(&self, targets: &[PackageTarget]) -> String {
        format!("dnf install -y -q {}", render_targets(targets, target_arg))
    }

    fn upgrade_command(&self, targets: &[PackageTarget]) -> String {
        format!("dnf upgrade -y -q {}", render_targets(targets, target_arg))
    }

    fn downgrade_command(&self, targets: &[PackageTarget]) -> String {
        // Without --allowerasing dnf refuses to touch dependents
        format!("dnf downgrade -y -q {}", render_targets(targets, target_arg))
    }

    fn remove_command(&self, names: &[String]) -> String {
        format!("dnf remove -y -q {}", render_names(names))
    }
}
