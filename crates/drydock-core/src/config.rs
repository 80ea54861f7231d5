//! `drydock.toml` configuration and environment credentials.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::domain::error::{DrydockError, Result};
use crate::domain::image::{ImageRef, ServiceImageSpec};
use crate::domain::scan::Severity;
use crate::domain::target::DeploymentTarget;
use crate::gate::{GateMode, GatePolicy};
use crate::git::short_revision;
use crate::resource_set::ResourceSet;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "drydock.toml";

pub const ENV_REGISTRY_USER: &str = "DRYDOCK_REGISTRY_USER";
pub const ENV_REGISTRY_TOKEN: &str = "DRYDOCK_REGISTRY_TOKEN";
pub const ENV_KUBECONFIG: &str = "DRYDOCK_KUBECONFIG";
pub const ENV_KUBE_CONTEXT: &str = "DRYDOCK_KUBE_CONTEXT";

fn dns_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("static DNS-1123 pattern")
    })
}

/// Reject names that are not DNS-1123 labels (lowercase alphanumerics and
/// '-', at most 63 characters).
pub fn validate_dns_label(kind: &str, value: &str) -> Result<()> {
    if dns_label().is_match(value) {
        Ok(())
    } else {
        Err(DrydockError::config(format!(
            "{kind} name '{value}' is not a valid DNS-1123 label"
        )))
    }
}

// ---------------------------------------------------------------------------
// File sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    /// Upper bound on concurrent builds/scans/pushes.
    pub max_parallel: usize,
    /// Directory holding persisted run state.
    pub state_dir: PathBuf,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            state_dir: PathBuf::from(".drydock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrySection {
    /// e.g. `registry.example.com/voting`.
    pub repository_prefix: String,
    /// Tag template; `{revision}` and `{short_revision}` are substituted.
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    "latest".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateSection {
    pub threshold: Severity,
    pub mode: GateMode,
}

impl Default for GateSection {
    fn default() -> Self {
        let policy = GatePolicy::default();
        Self {
            threshold: policy.threshold,
            mode: policy.mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RolloutSection {
    /// How long to wait for a restarted workload to become healthy.
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for RolloutSection {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    /// Build context, relative to the config file.
    pub context: PathBuf,
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    /// Overrides `<repository_prefix>/<name>`.
    #[serde(default)]
    pub repository: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    pub endpoint: String,
    pub namespace: String,
    /// Resource-set file, relative to the config file.
    pub resource_set: PathBuf,
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    pub registry: RegistrySection,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rollout: RolloutSection,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    base_dir: PathBuf,
}

/// Per-invocation overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub threshold: Option<String>,
    pub mode: Option<String>,
    pub state_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DrydockError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Parse and validate. Relative paths resolve against the working directory.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| DrydockError::config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.pipeline.state_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.repository_prefix.trim().is_empty() {
            return Err(DrydockError::config("registry.repository_prefix is empty"));
        }
        if self.registry.tag.trim().is_empty() {
            return Err(DrydockError::config("registry.tag is empty"));
        }
        if self.pipeline.max_parallel == 0 {
            return Err(DrydockError::config("pipeline.max_parallel must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(DrydockError::config("retry.max_attempts must be at least 1"));
        }
        if self.rollout.timeout_secs == 0 || self.rollout.poll_interval_ms == 0 {
            return Err(DrydockError::config(
                "rollout.timeout_secs and rollout.poll_interval_ms must be positive",
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for s in &self.services {
            validate_dns_label("service", &s.name)?;
            if !seen.insert(s.name.as_str()) {
                return Err(DrydockError::config(format!(
                    "service '{}' declared twice",
                    s.name
                )));
            }
        }

        let mut names = std::collections::BTreeSet::new();
        let mut namespaces = std::collections::BTreeSet::new();
        for t in &self.targets {
            validate_dns_label("namespace", &t.namespace)?;
            if t.endpoint.trim().is_empty() {
                return Err(DrydockError::config(format!(
                    "target '{}' has an empty endpoint",
                    t.name
                )));
            }
            if !names.insert(t.name.as_str()) || !namespaces.insert(t.namespace.as_str()) {
                return Err(DrydockError::config(format!(
                    "target '{}' ({}) declared twice",
                    t.name, t.namespace
                )));
            }
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(t) = &overrides.threshold {
            self.gate.threshold = t.parse()?;
        }
        if let Some(m) = &overrides.mode {
            self.gate.mode = m.parse()?;
        }
        if let Some(dir) = &overrides.state_dir {
            self.pipeline.state_dir = dir.clone();
        }
        Ok(())
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy::new(self.gate.threshold, self.gate.mode)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Expand the tag template for a revision.
    pub fn resolve_tag(&self, revision: &str) -> String {
        self.registry
            .tag
            .replace("{short_revision}", short_revision(revision))
            .replace("{revision}", revision)
    }

    /// Build unit for a declared service at `revision`.
    pub fn image_spec(&self, service: &ServiceConfig, revision: &str) -> ServiceImageSpec {
        let repository = service.repository.clone().unwrap_or_else(|| {
            format!(
                "{}/{}",
                self.registry.repository_prefix.trim_end_matches('/'),
                service.name
            )
        });
        ServiceImageSpec {
            name: service.name.clone(),
            context: self.resolve(&service.context),
            dockerfile: service.dockerfile.clone(),
            target: ImageRef::new(repository, self.resolve_tag(revision)),
        }
    }

    /// Look a target up by name or namespace.
    pub fn target(&self, selector: &str) -> Result<&TargetConfig> {
        self.targets
            .iter()
            .find(|t| t.name == selector || t.namespace == selector)
            .ok_or_else(|| DrydockError::config(format!("unknown deployment target '{selector}'")))
    }

    /// The only target, or the one named by `selector`.
    pub fn select_target(&self, selector: Option<&str>) -> Result<&TargetConfig> {
        match (selector, self.targets.as_slice()) {
            (Some(s), _) => self.target(s),
            (None, [only]) => Ok(only),
            (None, []) => Err(DrydockError::config("no deployment targets configured")),
            (None, _) => Err(DrydockError::config(
                "several deployment targets configured; pass --target",
            )),
        }
    }

    /// Load and validate the target's resource set.
    pub fn load_target(&self, target: &TargetConfig) -> Result<DeploymentTarget> {
        let resources = ResourceSet::load(&self.resolve(&target.resource_set))?;
        if resources.namespace != target.namespace {
            return Err(DrydockError::config(format!(
                "resource set for target '{}' is scoped to namespace '{}', expected '{}'",
                target.name, resources.namespace, target.namespace
            )));
        }
        Ok(DeploymentTarget {
            name: target.name.clone(),
            endpoint: target.endpoint.clone(),
            namespace: target.namespace.clone(),
            resources,
        })
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Registry login, read from the environment only.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub token: SecretString,
}

impl RegistryCredentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let username = required(&lookup, ENV_REGISTRY_USER)?;
        let token = required(&lookup, ENV_REGISTRY_TOKEN)?;
        Ok(Self {
            username,
            token: SecretString::from(token),
        })
    }

    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }
}

/// Cluster access for the runner, read from the environment only.
#[derive(Debug, Clone)]
pub struct ClusterCredentials {
    /// Path to the kubeconfig; treated as a secret reference.
    pub kubeconfig: SecretString,
    pub context: Option<String>,
}

impl ClusterCredentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let kubeconfig = required(&lookup, ENV_KUBECONFIG)?;
        Ok(Self {
            kubeconfig: SecretString::from(kubeconfig),
            context: lookup(ENV_KUBE_CONTEXT).filter(|c| !c.trim().is_empty()),
        })
    }

    pub fn kubeconfig_path(&self) -> &str {
        self.kubeconfig.expose_secret()
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    match lookup(key) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DrydockError::config(format!(
            "missing credential: environment variable {key} is not set"
        ))),
    }
}
