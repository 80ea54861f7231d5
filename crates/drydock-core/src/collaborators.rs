//! Contracts for the external systems the pipeline orchestrates.
//!
//! The pipeline never builds, scans, stores or schedules anything itself; it
//! calls these traits. Process-backed implementations live in
//! [`crate::process`], in-memory ones in [`crate::fakes`].

use async_trait::async_trait;

use crate::domain::error::Result;
use crate::domain::image::{ImageRef, ServiceImageSpec};
use crate::domain::scan::ScanReport;
use crate::domain::target::{ApplyChange, WorkloadHealth, WorkloadManifest};
use crate::network_policy::NetworkPolicySet;
use crate::resource_set::ExposureRule;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Container image builder.
///
/// Errors are deterministic for fixed inputs and are never retried.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `spec` and return the artifact reference, carrying its digest.
    async fn build(&self, spec: &ServiceImageSpec, revision: &str) -> Result<ImageRef>;
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Vulnerability scanner.
#[async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    /// Scan a built image. Findings are returned in scanner order.
    async fn scan(&self, image: &ImageRef) -> Result<ScanReport>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Container registry.
///
/// Network failures surface as `TransientInfra`, authentication failures as
/// `Configuration`.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Publish `image` under its tag and return the published reference.
    async fn push(&self, image: &ImageRef) -> Result<ImageRef>;
}

// ---------------------------------------------------------------------------
// Cluster control plane
// ---------------------------------------------------------------------------

/// Cluster control plane for one endpoint.
///
/// All applies are declarative and idempotent: reapplying an identical
/// object reports [`ApplyChange::Unchanged`].
#[async_trait]
pub trait ClusterControlPlane: Send + Sync {
    /// Image currently configured for a workload, `None` if it does not exist.
    async fn deployed_image(&self, namespace: &str, workload: &str) -> Result<Option<ImageRef>>;

    async fn apply_workload(&self, namespace: &str, workload: &WorkloadManifest)
        -> Result<ApplyChange>;

    async fn apply_exposure(&self, namespace: &str, exposure: &ExposureRule)
        -> Result<ApplyChange>;

    /// The rule set currently in force for `namespace`.
    async fn network_policy(&self, namespace: &str) -> Result<NetworkPolicySet>;

    /// Replace the namespace's whole rule set with `desired`.
    async fn replace_network_policy(&self, desired: &NetworkPolicySet) -> Result<()>;

    /// Signal running instances to restart, so a re-pushed tag is pulled.
    async fn restart_workload(&self, namespace: &str, workload: &str) -> Result<()>;

    async fn workload_health(&self, namespace: &str, workload: &str) -> Result<WorkloadHealth>;
}
