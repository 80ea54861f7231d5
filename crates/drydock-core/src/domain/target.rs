//! Deployment targets and the cluster-facing shapes applied to them.

use serde::{Deserialize, Serialize};

use super::image::ImageRef;
use crate::resource_set::ResourceSet;

/// Identity of a mutation domain: one namespace on one cluster endpoint.
///
/// The runner's mutation lock is keyed by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub endpoint: String,
    pub namespace: String,
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.namespace)
    }
}

/// A long-lived deployment target, referenced (not owned) by each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// Human-readable target name (e.g. "production").
    pub name: String,
    /// Cluster endpoint identity.
    pub endpoint: String,
    pub namespace: String,
    /// Declarative resource set applied on every deploy.
    pub resources: ResourceSet,
}

impl DeploymentTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            endpoint: self.endpoint.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// A workload definition rendered against resolved image references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadManifest {
    pub name: String,
    /// Service whose artifact this workload runs, if it was built by the pipeline.
    pub service: Option<String>,
    pub image: ImageRef,
    pub replicas: u32,
    pub ports: Vec<u16>,
}

/// What the cluster did with an applied object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyChange {
    Created,
    Configured,
    Unchanged,
}

/// Replica readiness reported by the cluster for one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadHealth {
    pub desired: u32,
    /// Replicas running the latest pod template.
    pub updated: u32,
    pub ready: u32,
}

impl WorkloadHealth {
    /// All desired replicas are updated and ready.
    pub fn is_healthy(&self) -> bool {
        self.updated >= self.desired && self.ready >= self.desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health() {
        let h = WorkloadHealth {
            desired: 2,
            updated: 2,
            ready: 1,
        };
        assert!(!h.is_healthy());
        let h = WorkloadHealth {
            desired: 2,
            updated: 2,
            ready: 2,
        };
        assert!(h.is_healthy());
    }

    #[test]
    fn test_target_key_display() {
        let key = TargetKey {
            endpoint: "https://k8s.local:6443".to_string(),
            namespace: "vote".to_string(),
        };
        assert_eq!(key.to_string(), "https://k8s.local:6443/vote");
    }
}
