//! In-process stand-in for a workstation.
//!
//! [`SimMachine`] implements [`RemoteExecutor`] by interpreting the commands
//! the engine sends: presence probes, listings, package manager batches,
//! `systemctl`, the account tools, `ss`, `getent` and the backup read.
//! Anything else exits 127 the way a shell would.

use crate::plan::render_unit;
use crate::types::{
    ManagerKind, PORT_HEADER, SERVICE_PREFIX, ServiceConfig, UNIT_DIR, UnitState, unit_path,
};
use crate::version::{Version, VersionConstraint};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hostkit::{Deadline, ExecutionResult, InstanceId, RemoteExecutor};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct Account {
    uid: u32,
    groups: BTreeSet<String>,
    shell: String,
}

struct Unit {
    enabled: bool,
    state: UnitState,
}

/// `package` stops working when `dependency` drops below `minimum`.
struct Requirement {
    manager: ManagerKind,
    package: String,
    dependency: String,
    minimum: Version,
}

#[derive(Default)]
struct Machine {
    managers: BTreeSet<ManagerKind>,
    installed: BTreeMap<(ManagerKind, String), String>,
    catalog: BTreeMap<(ManagerKind, String), Vec<String>>,
    requirements: Vec<Requirement>,
    users: BTreeMap<String, Account>,
    groups: BTreeSet<String>,
    homes: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    // keyed by short service name
    units: BTreeMap<String, Unit>,
    foreign_ports: BTreeSet<u16>,
    environment: BTreeMap<String, String>,
    disconnected: bool,
    // (pattern, failures left)
    transient: Vec<(String, usize)>,
    history: Vec<String>,
}

#[derive(Default)]
struct Gate {
    pattern: Option<String>,
    paused: bool,
    released: bool,
}

/// A simulated Ubuntu workstation.
pub(crate) struct SimMachine {
    machine: Mutex<Machine>,
    gate: Mutex<Gate>,
    signal: Condvar,
}

impl SimMachine {
    /// Ubuntu with python3 and pip from apt, conda and pip available, one
    /// regular user and sshd on port 22.
    pub(crate) fn ubuntu() -> Self {
        let sim = Self {
            machine: Mutex::new(Machine::default()),
            gate: Mutex::new(Gate::default()),
            signal: Condvar::new(),
        };
        {
            let mut m = sim.lock();
            m.managers = [ManagerKind::Apt, ManagerKind::Conda, ManagerKind::Pip]
                .into_iter()
                .collect();
            let catalog: [(ManagerKind, &str, &[&str]); 11] = [
                (ManagerKind::Apt, "python3", &["3.10.6-1~22.04"]),
                (ManagerKind::Apt, "python3-pip", &["22.0.2+dfsg-1"]),
                (ManagerKind::Apt, "git", &["1:2.34.1-1ubuntu1"]),
                (ManagerKind::Apt, "curl", &["7.81.0-1ubuntu1.15"]),
                (ManagerKind::Conda, "jupyterlab", &["4.0.11", "4.1.2"]),
                (ManagerKind::Conda, "pytorch", &["2.0.1", "2.1.0"]),
                (ManagerKind::Conda, "cudatoolkit", &["11.8.0"]),
                (ManagerKind::Conda, "numpy", &["1.24.4", "1.26.4"]),
                (ManagerKind::Pip, "pip", &["22.0.2"]),
                (ManagerKind::Pip, "numpy", &["1.24.4", "1.26.4"]),
                (ManagerKind::Pip, "pandas", &["2.1.4", "2.2.0"]),
            ];
            for (kind, name, versions) in catalog {
                m.catalog.insert(
                    (kind, name.to_string()),
                    versions.iter().map(|v| (*v).to_string()).collect(),
                );
            }
            for (kind, name, version) in [
                (ManagerKind::Apt, "python3", "3.10.6-1~22.04"),
                (ManagerKind::Apt, "python3-pip", "22.0.2+dfsg-1"),
                (ManagerKind::Pip, "pip", "22.0.2"),
            ] {
                m.installed
                    .insert((kind, name.to_string()), version.to_string());
            }
            m.groups = ["sudo", "users"].into_iter().map(str::to_string).collect();
            m.users.insert(
                "ubuntu".into(),
                Account {
                    uid: 1000,
                    groups: ["sudo".to_string()].into_iter().collect(),
                    shell: "/bin/bash".into(),
                },
            );
            m.homes.insert("ubuntu".into());
            m.foreign_ports.insert(22);
            m.environment.insert(
                "PATH".into(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into(),
            );
            m.environment.insert("HOME".into(), "/root".into());
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `name` at `version`, adding the version to the catalog.
    pub(crate) fn install_package(&self, kind: ManagerKind, name: &str, version: &str) {
        let mut m = self.lock();
        let available = m.catalog.entry((kind, name.to_string())).or_default();
        if !available.iter().any(|v| v == version) {
            available.push(version.to_string());
        }
        m.installed
            .insert((kind, name.to_string()), version.to_string());
    }

    /// Make `package` break when `dependency` drops below `minimum`.
    pub(crate) fn require(&self, kind: ManagerKind, package: &str, dependency: &str, minimum: &str) {
        let Ok(minimum) = Version::parse(minimum) else {
            return;
        };
        self.lock().requirements.push(Requirement {
            manager: kind,
            package: package.into(),
            dependency: dependency.into(),
            minimum,
        });
    }

    /// Add an engine-managed service as if a previous apply wrote it.
    pub(crate) fn add_managed_service(&self, service: &ServiceConfig, active: bool) {
        let mut m = self.lock();
        m.files.insert(
            unit_path(&service.name),
            render_unit(service).into_bytes(),
        );
        m.units.insert(
            service.name.clone(),
            Unit {
                enabled: true,
                state: if active {
                    UnitState::Active
                } else {
                    UnitState::Inactive
                },
            },
        );
    }

    /// Create or replace a file.
    pub(crate) fn put_file(&self, path: &str, contents: &[u8]) {
        self.lock().files.insert(path.to_string(), contents.to_vec());
    }

    /// Contents of a file.
    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Installed version of a package.
    pub(crate) fn installed(&self, kind: ManagerKind, name: &str) -> Option<String> {
        self.lock().installed.get(&(kind, name.to_string())).cloned()
    }

    /// Whether `name` still has a home directory.
    pub(crate) fn has_home(&self, name: &str) -> bool {
        self.lock().homes.contains(name)
    }

    /// Set a variable in the login environment.
    pub(crate) fn set_env(&self, name: &str, value: &str) {
        self.lock()
            .environment
            .insert(name.to_string(), value.to_string());
    }

    /// Fail the next `times` commands containing `pattern` with a dropped
    /// connection.
    pub(crate) fn fail_transiently(&self, pattern: &str, times: usize) {
        self.lock().transient.push((pattern.to_string(), times));
    }

    /// Drop the connection for good.
    pub(crate) fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// Every command received, including failed attempts.
    pub(crate) fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// How many commands containing `pattern` were received.
    pub(crate) fn attempts(&self, pattern: &str) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// Block the first command containing `pattern` until [`Self::resume`].
    pub(crate) fn pause_on(&self, pattern: &str) {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        *gate = Gate {
            pattern: Some(pattern.to_string()),
            paused: false,
            released: false,
        };
    }

    /// Wait until a command is held at the gate.
    pub(crate) fn wait_until_paused(&self) {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        while !gate.paused {
            gate = self
                .signal
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Let the held command through.
    pub(crate) fn resume(&self) {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        gate.released = true;
        self.signal.notify_all();
    }

    fn wait_at_gate(&self, command: &str) {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if !gate.pattern.as_deref().is_some_and(|p| command.contains(p)) {
            return;
        }
        gate.pattern = None;
        gate.paused = true;
        self.signal.notify_all();
        while !gate.released {
            gate = self
                .signal
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl RemoteExecutor for SimMachine {
    fn execute(
        &self,
        instance: &InstanceId,
        command: &str,
        deadline: &Deadline,
    ) -> hostkit::Result<ExecutionResult> {
        deadline.check()?;
        self.wait_at_gate(command);
        let mut m = self.lock();
        m.history.push(command.to_string());
        m.interrupt(instance, command)?;
        let result = m.run(command);
        drop(m);
        // The command ran, but the caller stopped waiting for it
        deadline.check()?;
        Ok(result)
    }

    fn copy_file(
        &self,
        instance: &InstanceId,
        contents: &[u8],
        remote_path: &str,
        deadline: &Deadline,
    ) -> hostkit::Result<()> {
        deadline.check()?;
        let label = format!("copy {remote_path}");
        self.wait_at_gate(&label);
        let mut m = self.lock();
        m.history.push(label.clone());
        m.interrupt(instance, &label)?;
        m.files.insert(remote_path.to_string(), contents.to_vec());
        Ok(())
    }
}

fn ok() -> ExecutionResult {
    ExecutionResult::ok("")
}

fn short_name(unit: &str) -> Option<&str> {
    unit.strip_prefix(SERVICE_PREFIX)?.strip_suffix(".service")
}

/// Split a command line into words, honouring single quotes and
/// backslash escapes.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn is_env_assignment(word: &str) -> bool {
    word.split_once('=').is_some_and(|(key, _)| {
        !key.is_empty() && key.chars().all(|c| c.is_ascii_uppercase() || c == '_')
    })
}

/// `name`, `name=1.2`, `name==1.2`, `name>=1.2`, `name@1.2`.
fn split_spec(spec: &str) -> (String, Option<String>) {
    if let Some((name, version)) = spec.split_once('@') {
        return (name.to_string(), Some(format!("=={version}")));
    }
    match spec.find(['=', '<', '>', '!', '~']) {
        Some(i) => (spec[..i].to_string(), Some(spec[i..].to_string())),
        None => (spec.to_string(), None),
    }
}

impl Machine {
    fn interrupt(&mut self, instance: &InstanceId, command: &str) -> hostkit::Result<()> {
        if self.disconnected {
            return Err(hostkit::Error::Connectivity {
                instance: instance.clone(),
                ssh_reason: "connection refused".into(),
                remote_command_reason: "agent not responding".into(),
            });
        }
        if let Some(slot) = self
            .transient
            .iter_mut()
            .find(|(pattern, left)| *left > 0 && command.contains(pattern.as_str()))
        {
            slot.1 -= 1;
            return Err(hostkit::Error::Transient {
                message: "connection reset by peer".into(),
            });
        }
        Ok(())
    }

    fn run(&mut self, command: &str) -> ExecutionResult {
        if let Some(rest) = command.strip_prefix("if [ -e ") {
            return self.read_backup(rest);
        }
        let mut out = ok();
        for segment in command.split(" && ") {
            let result = self.run_words(&split_words(segment));
            if !result.success() {
                return result;
            }
            out.stdout.push_str(&result.stdout);
        }
        out
    }

    fn run_words(&mut self, words: &[String]) -> ExecutionResult {
        let start = words
            .iter()
            .position(|w| !is_env_assignment(w))
            .unwrap_or(words.len());
        let Some((program, args)) = words[start..].split_first() else {
            return ok();
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match program.as_str() {
            "command" => self.probe(&args),
            "apt-get" => self.package_tool(ManagerKind::Apt, &args),
            "dnf" => self.package_tool(ManagerKind::Dnf, &args),
            "conda" => self.package_tool(ManagerKind::Conda, &args),
            "pip" => self.package_tool(ManagerKind::Pip, &args),
            "spack" => self.package_tool(ManagerKind::Spack, &args),
            "dpkg-query" => self.listing(ManagerKind::Apt),
            "rpm" => self.listing(ManagerKind::Dnf),
            "systemctl" => self.systemctl(&args),
            "grep" => self.unit_headers(),
            "getent" => self.getent(&args),
            "ss" => self.listening(),
            "env" => self.env(),
            "sh" => match args.as_slice() {
                ["-c" | "-lc", inner] => self.run(inner),
                _ => ExecutionResult::failed(2, "sh: unsupported invocation"),
            },
            "groupadd" => self.groupadd(&args),
            "useradd" => self.useradd(&args),
            "usermod" => self.usermod(&args),
            "userdel" => self.userdel(&args),
            "rm" => self.rm(&args),
            other => ExecutionResult::failed(127, format!("sh: {other}: command not found")),
        }
    }

    fn probe(&self, args: &[&str]) -> ExecutionResult {
        let kind = match args.iter().find(|a| !a.starts_with('-')) {
            Some(&"apt-get") => ManagerKind::Apt,
            Some(&"dnf") => ManagerKind::Dnf,
            Some(&"conda") => ManagerKind::Conda,
            Some(&"pip") => ManagerKind::Pip,
            Some(&"spack") => ManagerKind::Spack,
            _ => return ExecutionResult::failed(1, ""),
        };
        if self.managers.contains(&kind) {
            ok()
        } else {
            ExecutionResult::failed(1, "")
        }
    }

    fn read_backup(&self, rest: &str) -> ExecutionResult {
        let Some((quoted, _)) = rest.split_once(" ]") else {
            return ExecutionResult::failed(2, "sh: syntax error");
        };
        let path = split_words(quoted).concat();
        match self.files.get(&path) {
            Some(bytes) => ExecutionResult::ok(format!("{}\n", STANDARD.encode(bytes))),
            None => ExecutionResult::failed(100, ""),
        }
    }

    // ------------------------------------------------------------------
    // Packages
    // ------------------------------------------------------------------

    fn package_tool(&mut self, kind: ManagerKind, args: &[&str]) -> ExecutionResult {
        if !self.managers.contains(&kind) {
            return ExecutionResult::failed(127, format!("sh: {kind}: command not found"));
        }
        let operands: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();
        let Some((verb, rest)) = operands.split_first() else {
            return ok();
        };
        match *verb {
            "update" => ok(),
            "list" | "find" => self.listing(kind),
            "install" | "upgrade" | "downgrade" => self.install(kind, rest),
            "remove" | "uninstall" => {
                for name in rest {
                    self.installed.remove(&(kind, (*name).to_string()));
                }
                ok()
            }
            "check" => match self.broken_requirement(&self.installed) {
                Some(broken) => ExecutionResult::failed(1, broken),
                None => ok(),
            },
            other => ExecutionResult::failed(1, format!("unsupported {kind} command {other}")),
        }
    }

    fn listing(&self, kind: ManagerKind) -> ExecutionResult {
        if !self.managers.contains(&kind) {
            return ExecutionResult::failed(127, "command not found");
        }
        let packages = self
            .installed
            .iter()
            .filter(|((m, _), _)| *m == kind)
            .map(|((_, name), version)| (name.as_str(), version.as_str()));

        let stdout = match kind {
            ManagerKind::Apt => packages
                .map(|(n, v)| format!("ii \t{n}\t{v}\n"))
                .collect(),
            ManagerKind::Dnf => packages
                .map(|(n, v)| format!("{n}\t0:{v}\tx86_64\n"))
                .collect(),
            ManagerKind::Spack => packages.map(|(n, v)| format!("{n}\t{v}\n")).collect(),
            ManagerKind::Conda => serde_json::Value::Array(
                packages
                    .map(|(n, v)| serde_json::json!({"name": n, "version": v, "channel": "conda-forge"}))
                    .collect(),
            )
            .to_string(),
            ManagerKind::Pip => serde_json::Value::Array(
                packages
                    .map(|(n, v)| serde_json::json!({"name": n, "version": v}))
                    .collect(),
            )
            .to_string(),
        };
        ExecutionResult::ok(stdout)
    }

    fn install(&mut self, kind: ManagerKind, specs: &[&str]) -> ExecutionResult {
        let mut next = self.installed.clone();
        for spec in specs {
            let (name, constraint) = split_spec(spec);
            let constraint = match constraint.as_deref().map(VersionConstraint::parse) {
                None => VersionConstraint::Any,
                Some(Ok(c)) => c,
                Some(Err(e)) => return ExecutionResult::failed(1, e.to_string()),
            };
            let Some(available) = self.catalog.get(&(kind, name.clone())) else {
                return ExecutionResult::failed(100, format!("E: Unable to locate package {name}"));
            };
            let chosen = available
                .iter()
                .filter_map(|v| Version::parse(v).ok())
                .filter(|v| constraint.satisfies(v))
                .max();
            let Some(chosen) = chosen else {
                return ExecutionResult::failed(1, format!("no version of {name} matches {spec}"));
            };
            next.insert((kind, name), chosen.as_str().to_string());
        }
        if let Some(broken) = self.broken_requirement(&next) {
            return ExecutionResult::failed(1, broken);
        }
        self.installed = next;
        ok()
    }

    fn broken_requirement(&self, installed: &BTreeMap<(ManagerKind, String), String>) -> Option<String> {
        self.requirements.iter().find_map(|req| {
            installed.get(&(req.manager, req.package.clone()))?;
            let have = installed
                .get(&(req.manager, req.dependency.clone()))
                .and_then(|v| Version::parse(v).ok());
            match have {
                Some(v) if v >= req.minimum => None,
                _ => Some(format!(
                    "{} requires {} >= {}",
                    req.package,
                    req.dependency,
                    req.minimum.as_str()
                )),
            }
        })
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    fn managed_units(&self) -> Vec<(String, String)> {
        let prefix = format!("{UNIT_DIR}/");
        self.files
            .keys()
            .filter_map(|path| {
                let unit = path.strip_prefix(&prefix)?;
                let name = short_name(unit)?;
                Some((unit.to_string(), name.to_string()))
            })
            .collect()
    }

    fn systemctl(&mut self, args: &[&str]) -> ExecutionResult {
        let operands: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();
        let Some((verb, rest)) = operands.split_first() else {
            return ok();
        };
        match *verb {
            "daemon-reload" => ok(),
            "list-unit-files" => {
                let stdout = self
                    .managed_units()
                    .into_iter()
                    .map(|(unit, name)| {
                        let enabled = self.units.get(&name).is_some_and(|u| u.enabled);
                        let state = if enabled { "enabled" } else { "disabled" };
                        format!("{unit} {state} enabled\n")
                    })
                    .collect::<String>();
                ExecutionResult::ok(stdout)
            }
            "list-units" => {
                let stdout = self
                    .managed_units()
                    .into_iter()
                    .map(|(unit, name)| {
                        let state = self
                            .units
                            .get(&name)
                            .map_or(UnitState::Inactive, |u| u.state);
                        let (active, sub) = match state {
                            UnitState::Active => ("active", "running"),
                            UnitState::Inactive => ("inactive", "dead"),
                            UnitState::Failed => ("failed", "failed"),
                        };
                        format!("{unit} loaded {active} {sub} {unit}\n")
                    })
                    .collect::<String>();
                ExecutionResult::ok(stdout)
            }
            "enable" | "disable" | "stop" | "start" | "restart" => {
                let Some(unit) = rest.first() else {
                    return ExecutionResult::failed(1, "Too few arguments.");
                };
                let Some(name) = short_name(unit) else {
                    return ExecutionResult::failed(5, format!("Unit {unit} not found."));
                };
                self.unit_action(verb, unit, name)
            }
            other => ExecutionResult::failed(1, format!("Unknown command verb {other}.")),
        }
    }

    fn unit_action(&mut self, verb: &str, unit: &str, name: &str) -> ExecutionResult {
        let path = unit_path(name);
        let Some(contents) = self.files.get(&path).cloned() else {
            return if verb == "stop" && self.units.remove(name).is_some() {
                ok()
            } else {
                ExecutionResult::failed(5, format!("Unit {unit} not found."))
            };
        };
        let entry = self.units.entry(name.to_string()).or_insert(Unit {
            enabled: false,
            state: UnitState::Inactive,
        });
        match verb {
            "enable" => entry.enabled = true,
            "disable" => entry.enabled = false,
            "stop" => entry.state = UnitState::Inactive,
            _ => {
                let text = String::from_utf8_lossy(&contents);
                let run_as = text
                    .lines()
                    .find_map(|l| l.trim().strip_prefix("User="))
                    .map(str::to_string);
                if run_as.is_some_and(|u| !self.users.contains_key(&u)) {
                    if let Some(entry) = self.units.get_mut(name) {
                        entry.state = UnitState::Failed;
                    }
                    return ExecutionResult::failed(
                        1,
                        format!("Job for {unit} failed because the control process exited with error code."),
                    );
                }
                if let Some(entry) = self.units.get_mut(name) {
                    entry.state = UnitState::Active;
                }
            }
        }
        ok()
    }

    fn unit_headers(&self) -> ExecutionResult {
        let units = self.managed_units();
        if units.is_empty() {
            return ExecutionResult::failed(2, "");
        }
        let mut stdout = String::new();
        for (unit, _) in units {
            let path = format!("{UNIT_DIR}/{unit}");
            let text = self
                .files
                .get(&path)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            for line in text.lines().filter(|l| l.starts_with("# strata-")) {
                stdout.push_str(&format!("{path}:{line}\n"));
            }
        }
        if stdout.is_empty() {
            ExecutionResult::failed(1, "")
        } else {
            ExecutionResult::ok(stdout)
        }
    }

    fn listening(&self) -> ExecutionResult {
        let mut ports = self.foreign_ports.clone();
        for (unit, name) in self.managed_units() {
            let active = self
                .units
                .get(&name)
                .is_some_and(|u| u.state == UnitState::Active);
            if !active {
                continue;
            }
            let path = format!("{UNIT_DIR}/{unit}");
            let text = self
                .files
                .get(&path)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            if let Some(port) = text
                .lines()
                .find_map(|l| l.strip_prefix(PORT_HEADER))
                .and_then(|p| p.trim().parse::<u16>().ok())
            {
                ports.insert(port);
            }
        }
        let stdout: String = ports
            .iter()
            .map(|p| format!("LISTEN 0      4096   0.0.0.0:{p}        0.0.0.0:*\n"))
            .collect();
        ExecutionResult::ok(stdout)
    }

    fn env(&self) -> ExecutionResult {
        let stdout: String = self
            .environment
            .iter()
            .map(|(name, value)| format!("{name}={value}\n"))
            .collect();
        ExecutionResult::ok(stdout)
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    fn getent(&self, args: &[&str]) -> ExecutionResult {
        match args.first() {
            Some(&"passwd") => {
                let mut out = String::from("root:x:0:0:root:/root:/bin/bash\n");
                out.push_str("nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin\n");
                for (name, account) in &self.users {
                    out.push_str(&format!(
                        "{name}:x:{uid}:{uid}::/home/{name}:{shell}\n",
                        uid = account.uid,
                        shell = account.shell
                    ));
                }
                ExecutionResult::ok(out)
            }
            Some(&"group") => {
                let mut out = String::from("root:x:0:\n");
                for (i, group) in self.groups.iter().enumerate() {
                    let members: Vec<&str> = self
                        .users
                        .iter()
                        .filter(|(_, a)| a.groups.contains(group))
                        .map(|(n, _)| n.as_str())
                        .collect();
                    out.push_str(&format!("{group}:x:{}:{}\n", 100 + i, members.join(",")));
                }
                ExecutionResult::ok(out)
            }
            _ => ExecutionResult::failed(1, "Unknown database"),
        }
    }

    fn groupadd(&mut self, args: &[&str]) -> ExecutionResult {
        for group in args.iter().filter(|a| !a.starts_with('-')) {
            self.groups.insert((*group).to_string());
        }
        ok()
    }

    fn useradd(&mut self, args: &[&str]) -> ExecutionResult {
        let mut shell = "/bin/sh".to_string();
        let mut groups = BTreeSet::new();
        let mut uid = None;
        let mut home = false;
        let mut name = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "-m" => home = true,
                "-s" => shell = iter.next().map_or(shell, |s| (*s).to_string()),
                "-G" => {
                    groups = iter
                        .next()
                        .map(|g| g.split(',').filter(|g| !g.is_empty()).map(str::to_string).collect())
                        .unwrap_or_default();
                }
                "-u" => uid = iter.next().and_then(|u| u.parse::<u32>().ok()),
                other => name = Some(other.to_string()),
            }
        }
        let Some(name) = name else {
            return ExecutionResult::failed(2, "useradd: missing user name");
        };
        if self.users.contains_key(&name) {
            return ExecutionResult::failed(9, format!("useradd: user '{name}' already exists"));
        }
        if let Some(missing) = groups.iter().find(|g| !self.groups.contains(*g)) {
            return ExecutionResult::failed(6, format!("useradd: group '{missing}' does not exist"));
        }
        let uid = match uid {
            Some(uid) if self.users.values().any(|a| a.uid == uid) => {
                return ExecutionResult::failed(4, format!("useradd: UID {uid} is not unique"));
            }
            Some(uid) => uid,
            None => self.users.values().map(|a| a.uid).max().unwrap_or(999) + 1,
        };
        if home {
            self.homes.insert(name.clone());
        }
        self.users.insert(name, Account { uid, groups, shell });
        ok()
    }

    fn usermod(&mut self, args: &[&str]) -> ExecutionResult {
        let mut shell = None;
        let mut groups = None;
        let mut name = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "-s" => shell = iter.next().map(|s| (*s).to_string()),
                "-G" => {
                    groups = iter.next().map(|g| {
                        g.split(',')
                            .filter(|g| !g.is_empty())
                            .map(str::to_string)
                            .collect::<BTreeSet<_>>()
                    });
                }
                other => name = Some(other.to_string()),
            }
        }
        let Some(name) = name else {
            return ExecutionResult::failed(2, "usermod: missing user name");
        };
        if let Some(missing) = groups
            .iter()
            .flatten()
            .find(|g| !self.groups.contains(*g))
        {
            return ExecutionResult::failed(6, format!("usermod: group '{missing}' does not exist"));
        }
        let Some(account) = self.users.get_mut(&name) else {
            return ExecutionResult::failed(6, format!("usermod: user '{name}' does not exist"));
        };
        if let Some(shell) = shell {
            account.shell = shell;
        }
        if let Some(groups) = groups {
            account.groups = groups;
        }
        ok()
    }

    fn userdel(&mut self, args: &[&str]) -> ExecutionResult {
        let remove_home = args.contains(&"-r");
        let Some(name) = args.iter().find(|a| !a.starts_with('-')) else {
            return ExecutionResult::failed(2, "userdel: missing user name");
        };
        if self.users.remove(*name).is_none() {
            return ExecutionResult::failed(6, format!("userdel: user '{name}' does not exist"));
        }
        if remove_home {
            self.homes.remove(*name);
        }
        ok()
    }

    fn rm(&mut self, args: &[&str]) -> ExecutionResult {
        for path in args.iter().filter(|a| !a.starts_with('-')) {
            self.files.remove(*path);
            let unit = path.rsplit('/').next().unwrap_or_default();
            if let Some(name) = short_name(unit) {
                self.units.remove(name);
            }
        }
        ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostkit::CancelToken;

    fn run(sim: &SimMachine, command: &str) -> ExecutionResult {
        sim.execute(
            &InstanceId::new("ws-1"),
            command,
            &Deadline::unbounded(&CancelToken::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_split_words_handles_quotes() {
        assert_eq!(
            split_words("usermod -G '' 'it'\\''s'"),
            vec!["usermod", "-G", "", "it's"]
        );
    }

    #[test]
    fn test_install_respects_requirements() {
        let sim = SimMachine::ubuntu();
        sim.install_package(ManagerKind::Pip, "pandas", "2.2.0");
        sim.install_package(ManagerKind::Pip, "numpy", "1.26.4");
        sim.require(ManagerKind::Pip, "pandas", "numpy", "1.26");

        let result = run(&sim, "pip install -q --no-deps numpy==1.24.4 && pip check");
        assert_eq!(result.exit_code, 1);
        assert_eq!(sim.installed(ManagerKind::Pip, "numpy").as_deref(), Some("1.26.4"));
    }

    #[test]
    fn test_unknown_command_exits_127() {
        let sim = SimMachine::ubuntu();
        assert_eq!(run(&sim, "yum install foo").exit_code, 127);
        assert_eq!(run(&sim, "command -v dnf >/dev/null 2>&1").exit_code, 1);
    }

    #[test]
    fn test_restart_fails_without_run_as_user() {
        let sim = SimMachine::ubuntu();
        sim.put_file(
            "/etc/systemd/system/strata-x.service",
            b"[Service]\nUser=ghost\nExecStart=/bin/true\n",
        );
        assert_eq!(run(&sim, "systemctl restart strata-x.service").exit_code, 1);
        assert_eq!(run(&sim, "useradd -m ghost").exit_code, 0);
        assert!(run(&sim, "systemctl restart strata-x.service").success());
    }
}
