//! Read-only discovery of an instance's current state.
//!
//! Every probe is a plain shell command run through the executor. Output
//! that cannot be understood becomes an [`InspectionWarning`] rather than an
//! error; only a failed transport aborts the inspection.

use crate::error::Result;
use crate::manager::{self, PackageManager};
use crate::types::{
    HASH_HEADER, InstanceState, ManagerKind, PORT_HEADER, PackageRecord, SERVICE_PREFIX,
    ServiceRecord, UNIT_DIR, UnitState, UserRecord,
};
use hostkit::{Deadline, ExecutionResult, InstanceId, RemoteExecutor};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lists managed unit files and whether each is enabled.
pub const UNIT_FILES_PROBE: &str =
    "systemctl list-unit-files 'strata-*' --type=service --no-legend --no-pager";

/// Lists managed units and their runtime state.
pub const UNITS_PROBE: &str =
    "systemctl list-units 'strata-*' --type=service --all --no-legend --no-pager --plain";

/// Lists listening TCP sockets without a header.
pub const PORTS_PROBE: &str = "ss -Htln";

/// Regular accounts.
pub const PASSWD_PROBE: &str = "getent passwd";

/// Group membership.
pub const GROUP_PROBE: &str = "getent group";

/// The lowest uid given to regular accounts.
const FIRST_REGULAR_UID: u32 = 1000;

/// The uid of `nobody` on most distributions.
const NOBODY_UID: u32 = 65534;

/// Output of one probe that could not be fully understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionWarning {
    /// Probe that produced it (`apt`, `services`, `ports`, ...)
    pub probe: String,
    /// What went wrong
    pub message: String,
}

impl InspectionWarning {
    fn new(probe: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
            message: message.into(),
        }
    }
}

/// Snapshot of an instance plus anything the probes could not parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    /// The observed state
    pub state: InstanceState,
    /// Non-fatal probe problems
    pub warnings: Vec<InspectionWarning>,
}

/// Command that prints the engine's header lines from every managed unit.
pub fn headers_probe() -> String {
    format!("grep -Hs '^# strata-' {UNIT_DIR}/{SERVICE_PREFIX}*.service")
}

/// Inspect `instance` and build a fresh [`InstanceState`].
///
/// Manager probes run in parallel; the remaining probes run in sequence.
pub fn inspect(
    executor: &dyn RemoteExecutor,
    instance: &InstanceId,
    deadline: &Deadline,
) -> Result<Inspection> {
    log::debug!("Inspecting {instance}");
    let mut state = InstanceState::empty();
    let mut warnings = Vec::new();

    let managers: Vec<&'static dyn PackageManager> = manager::all().collect();
    let scans = managers
        .par_iter()
        .map(|m| scan_manager(executor, instance, *m, deadline))
        .collect::<Vec<_>>();
    for scan in scans {
        let scan = scan?;
        if scan.present {
            state.managers.insert(scan.kind);
        }
        state.packages.extend(scan.packages);
        warnings.extend(scan.warnings);
    }
    warnings.extend(shared_package_warnings(&state.packages));

    let unit_files = run(executor, instance, UNIT_FILES_PROBE, deadline)?;
    let units = run(executor, instance, UNITS_PROBE, deadline)?;
    let headers = run(executor, instance, &headers_probe(), deadline)?;
    state.services = parse_services(&unit_files, &units, &headers, &mut warnings);

    let passwd = run(executor, instance, PASSWD_PROBE, deadline)?;
    let group = run(executor, instance, GROUP_PROBE, deadline)?;
    state.users = parse_users(&passwd, &group, &mut warnings);

    let ports = run(executor, instance, PORTS_PROBE, deadline)?;
    if ports.success() {
        let (open, bad) = parse_listening_ports(&ports.stdout);
        state.open_ports = open;
        warnings.extend(bad.into_iter().map(|m| InspectionWarning::new("ports", m)));
    } else {
        warnings.push(failed_probe("ports", &ports));
    }

    state.normalize();
    log::debug!(
        "Inspected {instance}: {} packages, {} services, {} users, {} warnings",
        state.packages.len(),
        state.services.len(),
        state.users.len(),
        warnings.len()
    );
    Ok(Inspection { state, warnings })
}

fn run(
    executor: &dyn RemoteExecutor,
    instance: &InstanceId,
    command: &str,
    deadline: &Deadline,
) -> Result<ExecutionResult> {
    log::trace!("probe on {instance}: {command}");
    Ok(executor.execute(instance, command, deadline)?)
}

fn failed_probe(probe: &str, result: &ExecutionResult) -> InspectionWarning {
    InspectionWarning::new(
        probe,
        format!("exit {}: {}", result.exit_code, result.stderr.trim()),
    )
}

struct ManagerScan {
    kind: ManagerKind,
    present: bool,
    packages: Vec<PackageRecord>,
    warnings: Vec<InspectionWarning>,
}

fn scan_manager(
    executor: &dyn RemoteExecutor,
    instance: &InstanceId,
    manager: &dyn PackageManager,
    deadline: &Deadline,
) -> Result<ManagerScan> {
    let kind = manager.kind();
    let mut scan = ManagerScan {
        kind,
        present: false,
        packages: Vec::new(),
        warnings: Vec::new(),
    };

    if !run(executor, instance, &manager.probe_command(), deadline)?.success() {
        return Ok(scan);
    }
    scan.present = true;

    let listing = run(executor, instance, &manager.list_command(), deadline)?;
    if !listing.success() {
        scan.warnings.push(failed_probe(kind.as_str(), &listing));
        return Ok(scan);
    }
    let (packages, bad) = manager.parse_installed(&listing.stdout);
    scan.packages = packages;
    scan.warnings = bad
        .into_iter()
        .map(|m| InspectionWarning::new(kind.as_str(), m))
        .collect();
    Ok(scan)
}

/// A name installed by more than one manager is worth pointing out.
fn shared_package_warnings(packages: &[PackageRecord]) -> Vec<InspectionWarning> {
    let mut owners: BTreeMap<&str, BTreeSet<ManagerKind>> = BTreeMap::new();
    for p in packages {
        owners.entry(p.name.as_str()).or_default().insert(p.manager);
    }
    owners
        .into_iter()
        .filter(|(_, managers)| managers.len() > 1)
        .map(|(name, managers)| {
            let list: Vec<&str> = managers.iter().map(ManagerKind::as_str).collect();
            InspectionWarning::new(
                "packages",
                format!("{name} is installed by {}", list.join(" and ")),
            )
        })
        .collect()
}

fn short_name(unit: &str) -> Option<&str> {
    unit.strip_prefix(SERVICE_PREFIX)?
        .strip_suffix(".service")
        .filter(|s| !s.is_empty())
}

fn parse_services(
    unit_files: &ExecutionResult,
    units: &ExecutionResult,
    headers: &ExecutionResult,
    warnings: &mut Vec<InspectionWarning>,
) -> Vec<ServiceRecord> {
    // name -> enabled
    let mut files: BTreeMap<String, bool> = BTreeMap::new();
    if unit_files.success() {
        for line in unit_files.stdout.lines() {
            let mut cols = line.split_whitespace();
            let (Some(unit), Some(state)) = (cols.next(), cols.next()) else {
                continue;
            };
            if let Some(name) = short_name(unit) {
                files.insert(name.to_string(), state == "enabled");
            }
        }
    } else {
        warnings.push(failed_probe("services", unit_files));
    }

    let mut runtime: BTreeMap<String, UnitState> = BTreeMap::new();
    if units.success() {
        for line in units.stdout.lines() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let [unit, _load, active, ..] = cols.as_slice() else {
                continue;
            };
            if let Some(name) = short_name(unit) {
                let state = match *active {
                    "active" | "reloading" => UnitState::Active,
                    "failed" => UnitState::Failed,
                    _ => UnitState::Inactive,
                };
                runtime.insert(name.to_string(), state);
            }
        }
    } else {
        warnings.push(failed_probe("services", units));
    }

    // grep exits 1 without matches and 2 when the glob matched no file
    let mut recorded: BTreeMap<String, (Option<u16>, Option<String>)> = BTreeMap::new();
    if headers.success() || (headers.exit_code <= 2 && headers.stdout.trim().is_empty()) {
        for line in headers.stdout.lines() {
            let Some((path, header)) = line.split_once(':') else {
                continue;
            };
            let Some(name) = path.rsplit('/').next().and_then(short_name) else {
                continue;
            };
            let entry = recorded.entry(name.to_string()).or_default();
            if let Some(port) = header.strip_prefix(PORT_HEADER) {
                match port.trim().parse::<u16>() {
                    Ok(port) => entry.0 = Some(port),
                    Err(_) => warnings.push(InspectionWarning::new(
                        "services",
                        format!("{name}: bad port header {:?}", port.trim()),
                    )),
                }
            } else if let Some(hash) = header.strip_prefix(HASH_HEADER) {
                entry.1 = Some(hash.trim().to_string());
            }
        }
    } else {
        warnings.push(failed_probe("services", headers));
    }

    files
        .into_iter()
        .map(|(name, enabled)| {
            let unit_state = runtime.get(&name).copied().unwrap_or(UnitState::Inactive);
            let (port, content_hash) = recorded.remove(&name).unwrap_or_default();
            ServiceRecord {
                name,
                unit_state,
                port,
                enabled,
                content_hash,
            }
        })
        .collect()
}

fn parse_users(
    passwd: &ExecutionResult,
    group: &ExecutionResult,
    warnings: &mut Vec<InspectionWarning>,
) -> Vec<UserRecord> {
    if !passwd.success() {
        warnings.push(failed_probe("users", passwd));
        return Vec::new();
    }

    let mut users = Vec::new();
    for line in passwd.stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            warnings.push(InspectionWarning::new(
                "users",
                format!("unrecognised passwd line: {line:?}"),
            ));
            continue;
        }
        let Ok(uid) = fields[2].parse::<u32>() else {
            warnings.push(InspectionWarning::new(
                "users",
                format!("bad uid for {}: {:?}", fields[0], fields[2]),
            ));
            continue;
        };
        if uid < FIRST_REGULAR_UID || uid == NOBODY_UID || fields[0] == "nobody" {
            continue;
        }
        users.push(UserRecord {
            name: fields[0].to_string(),
            uid,
            groups: Vec::new(),
            shell: fields[6].to_string(),
        });
    }

    if group.success() {
        for line in group.stdout.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            let [name, _, _, members] = fields.as_slice() else {
                continue;
            };
            for member in members.split(',').filter(|m| !m.is_empty()) {
                if let Some(user) = users.iter_mut().find(|u| u.name == member) {
                    user.groups.push((*name).to_string());
                }
            }
        }
    } else {
        warnings.push(failed_probe("users", group));
    }

    users
}

/// Parse `ss -Htln` output into the set of listening ports.
pub fn parse_listening_ports(output: &str) -> (BTreeSet<u16>, Vec<String>) {
    let mut ports = BTreeSet::new();
    let mut warnings = Vec::new();
    let re = match Regex::new(r":(\d+)\s") {
        Ok(re) => re,
        Err(e) => return (ports, vec![e.to_string()]),
    };

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        // Local address is the fourth column; the peer column follows it
        let local = line.split_whitespace().nth(3).map(|s| format!("{s} "));
        let port = local
            .as_deref()
            .and_then(|l| re.captures(l))
            .and_then(|c| c[1].parse::<u16>().ok());
        match port {
            Some(port) => {
                ports.insert(port);
            }
            None => warnings.push(format!("unrecognised ss line: {line:?}")),
        }
    }

    (ports, warnings)
}
