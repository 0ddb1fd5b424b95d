//! Spack packages.

use super::{PackageManager, PackageTarget, probe_binary, render_names, render_targets};
use crate::types::{ManagerKind, PackageRecord};

/// The spack package manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct Spack;

fn target_arg(t: &PackageTarget) -> String {
    match t.pin() {
        Some(version) => format!("{}@{version}", t.name),
        None => t.name.clone(),
    }
}

impl PackageManager for Spack {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Spack
    }

    fn probe_command(&self) -> String {
        probe_binary("spack")
    }

    fn list_command(&self) -> String {
        "spack find --no-groups --format '{name}\t{version}'".to_string()
    }

    fn parse_installed(&self, output: &str) -> (Vec<PackageRecord>, Vec<String>) {
        let mut packages = Vec::new();
        let mut warnings = Vec::new();

        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // spack prints a summary header like "==> 12 installed packages"
            if line.starts_with("==>") {
                continue;
            }
            match line.split_once('\t') {
                Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                    packages.push(PackageRecord {
                        name: name.to_string(),
                        version: version.to_string(),
                        manager: ManagerKind::Spack,
                        source: "spack".to_string(),
                    });
                }
                _ => warnings.push(format!("unrecognised spack find line: {line:?}")),
            }
        }

        (packages, warnings)
    }

    fn install_command(&self, targets: &[PackageTarget]) -> String {
        format!("spack install {}", render_targets(targets, target_arg))
    }

    fn downgrade_command(&self, targets: &[PackageTarget]) -> String {
        // Spack installs side by side; the older build is added, not swapped
        format!("spack install {}", render_targets(targets, target_arg))
    }

    fn remove_command(&self, names: &[String]) -> String {
        format!("spack uninstall -y {}", render_names(names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spack_find() {
        let output = "==> 2 installed packages\nhdf5\t1.14.3\nopenmpi\t5.0.1\n";
        let (packages, warnings) = Spack.parse_installed(output);
        assert!(warnings.is_empty());
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "hdf5");
    }

    #[test]
    fn test_commands() {
        let targets = vec![PackageTarget::pinned("hdf5", "1.14.3")];
        assert_eq!(Spack.install_command(&targets), "spack install hdf5@1.14.3");
        assert_eq!(Spack.remove_command(&["hdf5".into()]), "spack uninstall -y hdf5");
    }
}
