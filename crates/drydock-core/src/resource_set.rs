//! Declarative, namespace-scoped resource set applied by the deploy stage.
//!
//! Loaded from JSON or TOML. Workload images are either a placeholder naming a
//! pipeline service (resolved to the pushed reference at render time) or a
//! fixed reference that is never rebuilt.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::validate_dns_label;
use crate::domain::deploy::{SkipReason, SkippedWorkload};
use crate::domain::error::{DrydockError, Result};
use crate::domain::image::ImageRef;
use crate::domain::target::WorkloadManifest;
use crate::network_policy::{NetworkPolicyRule, NetworkPolicySet};

/// Kubernetes NodePort allocation range.
const NODE_PORT_RANGE: std::ops::RangeInclusive<u16> = 30000..=32767;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSet {
    pub namespace: String,
    #[serde(default)]
    pub workloads: Vec<WorkloadSpec>,
    #[serde(default)]
    pub exposures: Vec<ExposureRule>,
    #[serde(default)]
    pub network_policy: Vec<NetworkPolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: WorkloadImage,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub ports: Vec<u16>,
}

fn default_replicas() -> u32 {
    1
}

/// `{ service = "vote" }` or `{ reference = "redis:7-alpine" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadImage {
    /// Placeholder for the artifact the pipeline publishes for this service.
    Service(String),
    /// Fixed third-party image.
    Reference(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposureRule {
    pub workload: String,
    pub port: u16,
    /// Container port; defaults to `port`.
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub kind: ExposureKind,
}

impl ExposureRule {
    pub fn target_port(&self) -> u16 {
        self.target_port.unwrap_or(self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureKind {
    #[default]
    Internal,
    NodePort(u16),
}

/// The resource set rendered against one run's published images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedResourceSet {
    pub namespace: String,
    pub workloads: Vec<WorkloadManifest>,
    /// Exposures whose workload is rendered in this apply.
    pub exposures: Vec<ExposureRule>,
    /// Full desired policy set of the namespace.
    pub policy: NetworkPolicySet,
    pub skipped: Vec<SkippedWorkload>,
}

impl ResourceSet {
    /// Load from a `.json` or `.toml` file and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DrydockError::config(format!(
                "cannot read resource set {}: {e}",
                path.display()
            ))
        })?;
        let set = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw)?,
            Some("toml") => Self::from_toml_str(&raw)?,
            _ => {
                return Err(DrydockError::config(format!(
                    "resource set {} must have a .json or .toml extension",
                    path.display()
                )))
            }
        };
        set.validate()?;
        Ok(set)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| DrydockError::config(format!("malformed resource set: {e}")))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| DrydockError::config(format!("malformed resource set: {e}")))
    }

    pub fn workload_names(&self) -> BTreeSet<String> {
        self.workloads.iter().map(|w| w.name.clone()).collect()
    }

    pub fn policy_set(&self) -> Result<NetworkPolicySet> {
        NetworkPolicySet::from_rules(self.namespace.clone(), self.network_policy.iter().cloned())
    }

    pub fn validate(&self) -> Result<()> {
        validate_dns_label("namespace", &self.namespace)?;

        let mut names = BTreeSet::new();
        for w in &self.workloads {
            validate_dns_label("workload", &w.name)?;
            if !names.insert(w.name.as_str()) {
                return Err(DrydockError::config(format!(
                    "workload '{}' declared twice in namespace '{}'",
                    w.name, self.namespace
                )));
            }
            if w.replicas == 0 {
                return Err(DrydockError::config(format!(
                    "workload '{}' must have at least one replica",
                    w.name
                )));
            }
            if let WorkloadImage::Reference(r) = &w.image {
                ImageRef::parse(r)?;
            }
        }

        let mut exposed = BTreeSet::new();
        for e in &self.exposures {
            // One Service per workload, named after it.
            if !exposed.insert(e.workload.as_str()) {
                return Err(DrydockError::config(format!(
                    "workload '{}' is exposed more than once",
                    e.workload
                )));
            }
            let Some(w) = self.workloads.iter().find(|w| w.name == e.workload) else {
                return Err(DrydockError::config(format!(
                    "exposure on port {} references unknown workload '{}'",
                    e.port, e.workload
                )));
            };
            if !w.ports.is_empty() && !w.ports.contains(&e.target_port()) {
                return Err(DrydockError::config(format!(
                    "exposure targets port {} which workload '{}' does not declare",
                    e.target_port(),
                    w.name
                )));
            }
            if let ExposureKind::NodePort(p) = e.kind {
                if !NODE_PORT_RANGE.contains(&p) {
                    return Err(DrydockError::config(format!(
                        "node port {p} for workload '{}' is outside {}-{}",
                        e.workload,
                        NODE_PORT_RANGE.start(),
                        NODE_PORT_RANGE.end()
                    )));
                }
            }
        }

        let policy = self.policy_set()?;
        policy.validate_selectors(&self.workload_names())?;
        Ok(())
    }

    /// Render workloads against the run's published images.
    ///
    /// Service workloads whose artifact is in `published` get that reference.
    /// Those in `excluded` failed earlier in the run and are skipped; those in
    /// neither were not part of the run and are left as they are.
    pub fn render(
        &self,
        published: &BTreeMap<String, ImageRef>,
        excluded: &BTreeSet<String>,
    ) -> Result<RenderedResourceSet> {
        let mut workloads = Vec::new();
        let mut skipped = Vec::new();

        for w in &self.workloads {
            let (service, image) = match &w.image {
                WorkloadImage::Reference(r) => (None, ImageRef::parse(r)?),
                WorkloadImage::Service(s) => match published.get(s) {
                    Some(image) => (Some(s.clone()), image.clone()),
                    None => {
                        let reason = if excluded.contains(s) {
                            SkipReason::ArtifactExcluded
                        } else {
                            SkipReason::NotInRun
                        };
                        skipped.push(SkippedWorkload {
                            name: w.name.clone(),
                            service: s.clone(),
                            reason,
                        });
                        continue;
                    }
                },
            };
            workloads.push(WorkloadManifest {
                name: w.name.clone(),
                service,
                image,
                replicas: w.replicas,
                ports: w.ports.clone(),
            });
        }

        let rendered: BTreeSet<&str> = workloads.iter().map(|w| w.name.as_str()).collect();
        let exposures = self
            .exposures
            .iter()
            .filter(|e| rendered.contains(e.workload.as_str()))
            .cloned()
            .collect();

        Ok(RenderedResourceSet {
            namespace: self.namespace.clone(),
            workloads,
            exposures,
            policy: self.policy_set()?,
            skipped,
        })
    }
}
