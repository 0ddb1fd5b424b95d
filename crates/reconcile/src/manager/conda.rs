//! Conda packages in the base environment.

use super::{PackageManager, PackageTarget, probe_binary, render_names, render_targets};
use crate::types::{ManagerKind, PackageRecord};
use serde::Deserialize;

/// The conda package manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct Conda;

#[derive(Deserialize)]
struct CondaEntry {
    name: String,
    version: String,
    #[serde(default)]
    channel: Option<String>,
}

/// Conda match specs accept `name=version` and `name>=version` forms.
fn target_arg(t: &PackageTarget) -> String {
    match (t.pin(), t.parsed()) {
        (Some(version), _) => format!("{}={version}", t.name),
        (None, Some(constraint)) => format!("{}{constraint}", t.name),
        (None, None) => t.name.clone(),
    }
}

impl PackageManager for Conda {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Conda
    }

    fn probe_command(&self) -> String {
        probe_binary("conda")
    }

    fn list_command(&self) -> String {
        "conda list --json".to_string()
    }

    fn parse_installed(&self, output: &str) -> (Vec<PackageRecord>, Vec<String>) {
        match serde_json::from_str::<Vec<CondaEntry>>(output) {
            Ok(entries) => (
                entries
                    .into_iter()
                    .map(|e| PackageRecord {
                        name: e.name,
                        version: e.version,
                        manager: ManagerKind::Conda,
                        source: e.channel.unwrap_or_default(),
                    })
                    .collect(),
                Vec::new(),
            ),
            Err(e) => (Vec::new(), vec![format!("unparsable conda list output: {e}")]),
        }
    }

    fn install_command(&self, targets: &[PackageTarget]) -> String {
        format!(
            "conda install -y -q --freeze-installed {}",
            render_targets(targets, target_arg)
        )
    }

    fn upgrade_command(&self, targets: &[PackageTarget]) -> String {
        format!("conda install -y -q {}", render_targets(targets, target_arg))
    }

    fn downgrade_command(&self, targets: &[PackageTarget]) -> String {
        // --freeze-installed makes the solve fail instead of moving dependents
        format!(
            "conda install -y -q --freeze-installed {}",
            render_targets(targets, target_arg)
        )
    }

    fn remove_command(&self, names: &[String]) -> String {
        format!("conda remove -y -q {}", render_names(names))
    }
}
