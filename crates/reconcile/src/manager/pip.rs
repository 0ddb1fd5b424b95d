//! Python packages via pip.

use super::{PackageManager, PackageTarget, probe_binary, render_names, render_targets};
use crate::types::{ManagerKind, PackageRecord};
use serde::Deserialize;

/// The pip package manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pip;

#[derive(Deserialize)]
struct PipEntry {
    name: String,
    version: String,
}

fn target_arg(t: &PackageTarget) -> String {
    match t.parsed() {
        Some(constraint) => format!("{}{constraint}", t.name),
        None => t.name.clone(),
    }
}

impl PackageManager for Pip {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Pip
    }

    fn probe_command(&self) -> String {
        probe_binary("pip")
    }

    fn list_command(&self) -> String {
        "pip list --format=json --disable-pip-version-check".to_string()
    }

    fn parse_installed(&self, output: &str) -> (Vec<PackageRecord>, Vec<String>) {
        match serde_json::from_str::<Vec<PipEntry>>(output) {
            Ok(entries) => (
                entries
                    .into_iter()
                    .map(|e| PackageRecord {
                        name: e.name,
                        version: e.version,
                        manager: ManagerKind::Pip,
                        source: "pypi".to_string(),
                    })
                    .collect(),
                Vec::new(),
            ),
            Err(e) => (Vec::new(), vec![format!("unparsable pip list output: {e}")]),
        }
    }

    fn install_command(&self, targets: &[PackageTarget]) -> String {
        format!(
            "pip install -q --disable-pip-version-check {}",
            render_targets(targets, target_arg)
        )
    }

    fn upgrade_command(&self, targets: &[PackageTarget]) -> String {
        format!(
            "pip install -q --disable-pip-version-check --upgrade {}",
            render_targets(targets, target_arg)
        )
    }

    fn downgrade_command(&self, targets: &[PackageTarget]) -> String {
        // pip check fails when the downgrade broke a dependent
        format!(
            "pip install -q --disable-pip-version-check --no-deps {} && pip check",
            render_targets(targets, target_arg)
        )
    }

    fn remove_command(&self, names: &[String]) -> String {
        format!(
            "pip uninstall -y -q --disable-pip-version-check {}",
            render_names(names)
        )
    }
}
