use crate::paths;
use anyhow::{Context, Result};
use hostkit::backend::remote_command::AwsCliCommandService;
use hostkit::{ConnectivityFacts, ExecutorOptions, RetryConfig, StaticRegistry};
use reconcile::{EngineConfig, Template};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Config file
// ============================================================================

/// Contents of `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ledger, checkpoints and blobs live here; defaults to the state dir
    pub state_dir: Option<String>,
    /// Worker threads for multi-instance applies
    pub workers: usize,
    /// Deadline for one plan step, in seconds
    pub command_timeout_secs: u64,
    /// Deadline for an inspection, in seconds
    pub inspect_timeout_secs: u64,
    /// Retry policy for transient remote failures
    pub retry: RetryConfig,
    /// Transport selection and SSH client options
    pub executor: ExecutorOptions,
    /// Remote-command service settings
    pub aws: AwsConfig,
    /// Known instances
    pub instances: BTreeMap<String, ConnectivityFacts>,
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            state_dir: None,
            workers: 4,
            command_timeout_secs: engine.command_timeout.as_secs(),
            inspect_timeout_secs: engine.inspect_timeout.as_secs(),
            retry: RetryConfig::default(),
            executor: ExecutorOptions::default(),
            aws: AwsConfig::default(),
            instances: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
}

impl Config {
    /// Load the config from `path`, or from the default location.
    ///
    /// A missing default file yields the defaults; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (paths::config_file()?, false),
        };
        if !explicit && !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolved state directory.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(paths::expand(dir)),
            None => paths::state_dir(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            inspect_timeout: Duration::from_secs(self.inspect_timeout_secs),
        }
    }

    pub fn registry(&self) -> StaticRegistry {
        let mut registry = StaticRegistry::new();
        for (id, facts) in &self.instances {
            registry.insert(id.as_str(), facts.clone());
        }
        registry
    }

    pub fn command_service(&self) -> AwsCliCommandService {
        let mut service = AwsCliCommandService::new();
        if let Some(region) = &self.aws.region {
            service = service.with_region(region);
        }
        if let Some(profile) = &self.aws.profile {
            service = service.with_profile(profile);
        }
        service
    }
}

// ============================================================================
// Templates
// ============================================================================

/// Load a flattened template from a `.toml` or `.json` file.
pub fn load_template(path: &Path) -> Result<Template> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read template {}", path.display()))?;
    let template: Template = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Invalid TOML template {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON template {}", path.display()))?,
    };
    template
        .validate()
        .with_context(|| format!("Template {} failed validation", path.display()))?;
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostkit::{InstanceId, InstanceRegistry};
    use reconcile::{ManagerKind, PackageSource};

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.workers, 4);
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
state_dir = "/var/lib/strata"
workers = 8
command_timeout_secs = 600

[retry]
max_retries = 5
base_delay = 500
backoff_factor = 2.0
max_delay = 30000
jitter = 0.1

[executor]
default_ssh_user = "ec2-user"

[executor.ssh]
strict_host_key_checking = "yes"

[aws]
region = "eu-west-1"

[instances.ws-1]
address = "203.0.113.7"
key_path = "~/.ssh/research.pem"

[instances.ws-2]
remote_command_agent = true
cloud_instance_id = "i-0123456789abcdef0"
"#,
        )
        .unwrap();

        assert_eq!(config.state_dir().unwrap(), PathBuf::from("/var/lib/strata"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.engine_config().command_timeout, Duration::from_secs(600));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.executor.default_ssh_user, "ec2-user");
        assert_eq!(config.executor.ssh.strict_host_key_checking, "yes");
        assert_eq!(config.aws.region.as_deref(), Some("eu-west-1"));

        let registry = config.registry();
        assert_eq!(registry.len(), 2);
        let ws2 = registry.facts(&InstanceId::new("ws-2")).unwrap();
        assert!(ws2.remote_command_agent);
        assert!(registry.facts(&InstanceId::new("ws-3")).is_none());
    }

    #[test]
    fn test_bad_field_types_fail() {
        assert!(Config::parse("workers = \"many\"").is_err());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_load_toml_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jupyter-lab.toml");
        fs::write(
            &path,
            r#"
name = "jupyter-lab"
version = "1.0"

[[packages.conda]]
name = "jupyterlab"
version_constraint = ">=4.0"

[[services]]
name = "jupyter"
unit_definition = "[Service]\nExecStart=/opt/conda/bin/jupyter lab\n"
port = 8888
user = "jupyter"

[[users]]
name = "jupyter"
groups = ["users"]
"#,
        )
        .unwrap();

        let template = load_template(&path).unwrap();
        assert_eq!(template.name, "jupyter-lab");
        let conda = &template.packages[&PackageSource::Manager(ManagerKind::Conda)];
        assert_eq!(conda[0].version_constraint.as_deref(), Some(">=4.0"));
        assert_eq!(template.services[0].port, Some(8888));
    }

    #[test]
    fn test_load_json_template_rejects_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(
            &path,
            r#"{"name": "bad", "packages": {"system": [{"name": "curl; rm -rf /"}]}}"#,
        )
        .unwrap();
        let err = load_template(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed validation"));
    }
}
