//! Debian/Ubuntu packages via apt-get and dpkg-query.

use super::{PackageManager, PackageTarget, probe_binary, render_names, render_targets};
use crate::types::{ManagerKind, PackageRecord};

const ENV: &str = "DEBIAN_FRONTEND=noninteractive";

/// The apt package manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct Apt;

fn target_arg(t: &PackageTarget) -> String {
    match t.pin() {
        Some(version) => format!("{}={version}", t.name),
        None => t.name.clone(),
    }
}

impl PackageManager for Apt {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Apt
    }

    fn probe_command(&self) -> String {
        probe_binary("apt-get")
    }

    fn list_command(&self) -> String {
        r"dpkg-query -W -f='${db:Status-Abbrev}\t${Package}\t${Version}\n'".to_string()
    }

    fn parse_installed(&self, output: &str) -> (Vec<PackageRecord>, Vec<String>) {
        let mut packages = Vec::new();
        let mut warnings = Vec::new();

        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            let [status, name, version] = fields.as_slice() else {
                warnings.push(format!("unrecognised dpkg-query line: {line:?}"));
                continue;
            };
            // Only fully installed packages; rc = removed with config left
            if !status.starts_with("ii") {
                continue;
            }
            packages.push(PackageRecord {
                name: (*name).to_string(),
                version: (*version).to_string(),
                manager: ManagerKind::Apt,
                source: "dpkg".to_string(),
            });
        }

        (packages, warnings)
    }

    fn install_command(&self, targets: &[PackageTarget]) -> String {
        format!(
            "apt-get update -qq && {ENV} apt-get install -y -q {}",
            render_targets(targets, target_arg)
        )
    }

    fn upgrade_command(&self, targets: &[PackageTarget]) -> String {
        format!(
            "apt-get update -qq && {ENV} apt-get install -y -q --only-upgrade {}",
            render_targets(targets, target_arg)
        )
    }

    fn downgrade_command(&self, targets: &[PackageTarget]) -> String {
        format!(
            "{ENV} apt-get install -y -q --allow-downgrades --no-remove {}",
            render_targets(targets, target_arg)
        )
    }

    fn remove_command(&self, names: &[String]) -> String {
        format!("{ENV} apt-get remove -y -q {}", render_names(names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dpkg_query() {
        let output = "ii \tpython3\t3.10.6-1~22.04\nrc \told-lib\t1.0\nii \tpython3-pip\t22.0.2+dfsg-1\n";
        let (packages, warnings) = Apt.parse_installed(output);
        assert!(warnings.is_empty());
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "python3");
        assert_eq!(packages[0].version, "3.10.6-1~22.04");
        assert_eq!(packages[1].name, "python3-pip");
    }

    #[test]
    fn test_parse_reports_garbage() {
        let (packages, warnings) = Apt.parse_installed("not a dpkg line\n");
        assert!(packages.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_commands() {
        let targets = vec![
            PackageTarget::latest("git"),
            PackageTarget::pinned("curl", "7.81.0-1"),
        ];
        assert_eq!(
            Apt.install_command(&targets),
            "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -q git curl=7.81.0-1"
        );
        assert!(Apt.downgrade_command(&targets).contains("--allow-downgrades --no-remove"));
        assert_eq!(
            Apt.remove_command(&["git".to_string()]),
            "DEBIAN_FRONTEND=noninteractive apt-get remove -y -q git"
        );
    }
}
