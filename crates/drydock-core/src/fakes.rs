//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `FakeBuilder`, `FakeScanner`, `FakeRegistry`, `FakeCluster` and
//! `MemoryOutcomeSink`. Each fake records the calls it receives and can be
//! scripted to fail, so pipeline behaviour is testable without a container
//! runtime, scanner, registry or cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::collaborators::{ClusterControlPlane, ImageBuilder, ImageRegistry, VulnerabilityScanner};
use crate::domain::error::{DrydockError, Result};
use crate::domain::image::{ImageRef, ServiceImageSpec};
use crate::domain::run::StageOutcome;
use crate::domain::scan::{ScanFinding, ScanReport};
use crate::domain::target::{ApplyChange, WorkloadHealth, WorkloadManifest};
use crate::network_policy::NetworkPolicySet;
use crate::obs::OutcomeSink;
use crate::resource_set::ExposureRule;

fn content_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Tracks how many calls are in flight at once.
#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// FakeBuilder
// ---------------------------------------------------------------------------

/// Deterministic builder: the digest is derived from service, context and
/// revision, so rebuilding the same inputs yields the same artifact.
#[derive(Debug, Default)]
pub struct FakeBuilder {
    failures: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
    in_flight: InFlight,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build of `service` fails with `reason`.
    pub fn fail_service(&self, service: &str, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(service.to_string(), reason.to_string());
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Services built, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.in_flight.peak()
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, spec: &ServiceImageSpec, revision: &str) -> Result<ImageRef> {
        self.calls.lock().unwrap().push(spec.name.clone());
        self.in_flight.enter();
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.exit();

        if let Some(reason) = self.failures.lock().unwrap().get(&spec.name) {
            return Err(DrydockError::Build {
                service: spec.name.clone(),
                reason: reason.clone(),
            });
        }
        let digest = content_digest(&[
            &spec.name,
            &spec.context.to_string_lossy(),
            revision,
        ]);
        Ok(spec.target.clone().with_digest(digest))
    }
}

// ---------------------------------------------------------------------------
// FakeScanner
// ---------------------------------------------------------------------------

/// Scanner returning scripted findings per repository (none by default).
#[derive(Debug, Default)]
pub struct FakeScanner {
    findings: Mutex<HashMap<String, Vec<ScanFinding>>>,
    failures_left: Mutex<HashMap<String, u32>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FakeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_findings(&self, repository: &str, findings: Vec<ScanFinding>) {
        self.findings
            .lock()
            .unwrap()
            .insert(repository.to_string(), findings);
    }

    /// The next `times` scans of `repository` fail as unreachable.
    pub fn fail_times(&self, repository: &str, times: u32) {
        self.failures_left
            .lock()
            .unwrap()
            .insert(repository.to_string(), times);
    }

    pub fn attempts(&self, repository: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(repository)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl VulnerabilityScanner for FakeScanner {
    async fn scan(&self, image: &ImageRef) -> Result<ScanReport> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(image.repository.clone())
            .or_default() += 1;

        if let Some(left) = self.failures_left.lock().unwrap().get_mut(&image.repository) {
            if *left > 0 {
                *left -= 1;
                return Err(DrydockError::transient(format!(
                    "scanner unavailable for {image}"
                )));
            }
        }

        let findings = self
            .findings
            .lock()
            .unwrap()
            .get(&image.repository)
            .cloned()
            .unwrap_or_default();
        Ok(ScanReport::new(image.clone(), findings))
    }
}

// ---------------------------------------------------------------------------
// FakeRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryFailure {
    Network(u32),
    Auth,
}

/// Registry with per-repository network or authentication failures.
#[derive(Debug, Default)]
pub struct FakeRegistry {
    failures: Mutex<HashMap<String, RegistryFailure>>,
    attempts: Mutex<HashMap<String, u32>>,
    pushed: Mutex<Vec<ImageRef>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` pushes of `repository` fail as unreachable.
    pub fn fail_times(&self, repository: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(repository.to_string(), RegistryFailure::Network(times));
    }

    /// Every push of `repository` is rejected as unauthorized.
    pub fn reject_auth(&self, repository: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(repository.to_string(), RegistryFailure::Auth);
    }

    pub fn attempts(&self, repository: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(repository)
            .copied()
            .unwrap_or(0)
    }

    pub fn pushed(&self) -> Vec<ImageRef> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn was_pushed(&self, repository: &str) -> bool {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .any(|i| i.repository == repository)
    }
}

#[async_trait]
impl ImageRegistry for FakeRegistry {
    async fn push(&self, image: &ImageRef) -> Result<ImageRef> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(image.repository.clone())
            .or_default() += 1;

        if let Some(failure) = self.failures.lock().unwrap().get_mut(&image.repository) {
            match failure {
                RegistryFailure::Auth => {
                    return Err(DrydockError::config(format!(
                        "registry rejected credentials for {}",
                        image.repository
                    )))
                }
                RegistryFailure::Network(left) if *left > 0 => {
                    *left -= 1;
                    return Err(DrydockError::transient(format!(
                        "registry unreachable pushing {}",
                        image.tagged()
                    )));
                }
                RegistryFailure::Network(_) => {}
            }
        }

        self.pushed.lock().unwrap().push(image.clone());
        Ok(image.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeCluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DeployedWorkload {
    manifest: WorkloadManifest,
    restarts: u32,
}

#[derive(Debug, Default)]
struct ClusterState {
    workloads: BTreeMap<(String, String), DeployedWorkload>,
    exposures: BTreeMap<(String, String, u16), ExposureRule>,
    policies: BTreeMap<String, NetworkPolicySet>,
    /// Every policy set ever visible, per namespace, in commit order.
    policy_history: BTreeMap<String, Vec<NetworkPolicySet>>,
    ops: Vec<String>,
    apply_failures: HashMap<String, u32>,
    never_healthy: BTreeSet<String>,
    /// Remaining policy commits that fail.
    policy_failures: u32,
    /// Rule changes applied before a failing commit errors out.
    partial_commit_rules: usize,
    unreachable: bool,
}

/// In-memory control plane with scriptable failures.
#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    latency: Mutex<Duration>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `workload` is already running `image`.
    pub fn seed_workload(&self, namespace: &str, workload: &str, image: ImageRef) {
        let manifest = WorkloadManifest {
            name: workload.to_string(),
            service: None,
            image,
            replicas: 1,
            ports: Vec::new(),
        };
        self.state.lock().unwrap().workloads.insert(
            (namespace.to_string(), workload.to_string()),
            DeployedWorkload {
                manifest,
                restarts: 0,
            },
        );
    }

    pub fn seed_policy(&self, set: NetworkPolicySet) {
        let mut state = self.state.lock().unwrap();
        state
            .policy_history
            .entry(set.namespace().to_string())
            .or_default()
            .push(set.clone());
        state.policies.insert(set.namespace().to_string(), set);
    }

    /// The next `times` policy commits fail after applying
    /// `applied_before_failure` individual rule changes.
    pub fn fail_policy_commits(&self, times: u32, applied_before_failure: usize) {
        let mut state = self.state.lock().unwrap();
        state.policy_failures = times;
        state.partial_commit_rules = applied_before_failure;
    }

    /// The next `times` applies of `workload` fail as unreachable.
    pub fn fail_apply_times(&self, workload: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .apply_failures
            .insert(workload.to_string(), times);
    }

    /// Restarted replicas of `workload` never become ready.
    pub fn never_healthy(&self, workload: &str) {
        self.state
            .lock()
            .unwrap()
            .never_healthy
            .insert(workload.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Delay every workload apply, to widen race windows in tests.
    pub fn set_apply_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn current_policy(&self, namespace: &str) -> NetworkPolicySet {
        self.state
            .lock()
            .unwrap()
            .policies
            .get(namespace)
            .cloned()
            .unwrap_or_else(|| NetworkPolicySet::empty(namespace))
    }

    pub fn policy_history(&self, namespace: &str) -> Vec<NetworkPolicySet> {
        self.state
            .lock()
            .unwrap()
            .policy_history
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn image_of(&self, namespace: &str, workload: &str) -> Option<ImageRef> {
        self.state
            .lock()
            .unwrap()
            .workloads
            .get(&(namespace.to_string(), workload.to_string()))
            .map(|w| w.manifest.image.clone())
    }

    pub fn restarts(&self, namespace: &str, workload: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .workloads
            .get(&(namespace.to_string(), workload.to_string()))
            .map_or(0, |w| w.restarts)
    }

    /// Mutating operations in the order the cluster received them.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            return Err(DrydockError::transient("cluster endpoint unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterControlPlane for FakeCluster {
    async fn deployed_image(&self, namespace: &str, workload: &str) -> Result<Option<ImageRef>> {
        self.check_reachable()?;
        Ok(self.image_of(namespace, workload))
    }

    async fn apply_workload(
        &self,
        namespace: &str,
        workload: &WorkloadManifest,
    ) -> Result<ApplyChange> {
        self.check_reachable()?;
        self.state
            .lock()
            .unwrap()
            .ops
            .push(format!("apply-begin:{namespace}/{}", workload.name));

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(format!("apply-end:{namespace}/{}", workload.name));
        if let Some(left) = state.apply_failures.get_mut(&workload.name) {
            if *left > 0 {
                *left -= 1;
                return Err(DrydockError::transient(format!(
                    "apply of {} timed out",
                    workload.name
                )));
            }
        }

        let key = (namespace.to_string(), workload.name.clone());
        let change = match state.workloads.get_mut(&key) {
            Some(existing) if existing.manifest == *workload => ApplyChange::Unchanged,
            Some(existing) => {
                existing.manifest = workload.clone();
                ApplyChange::Configured
            }
            None => {
                state.workloads.insert(
                    key,
                    DeployedWorkload {
                        manifest: workload.clone(),
                        restarts: 0,
                    },
                );
                ApplyChange::Created
            }
        };
        Ok(change)
    }

    async fn apply_exposure(&self, namespace: &str, exposure: &ExposureRule) -> Result<ApplyChange> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), exposure.workload.clone(), exposure.port);
        let change = match state.exposures.insert(key, exposure.clone()) {
            Some(prev) if prev == *exposure => ApplyChange::Unchanged,
            Some(_) => ApplyChange::Configured,
            None => ApplyChange::Created,
        };
        Ok(change)
    }

    async fn network_policy(&self, namespace: &str) -> Result<NetworkPolicySet> {
        self.check_reachable()?;
        Ok(self.current_policy(namespace))
    }

    async fn replace_network_policy(&self, desired: &NetworkPolicySet) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        let namespace = desired.namespace().to_string();
        state.ops.push(format!("policy:{namespace}"));

        let current = state
            .policies
            .get(&namespace)
            .cloned()
            .unwrap_or_else(|| NetworkPolicySet::empty(&namespace));

        if state.policy_failures > 0 {
            state.policy_failures -= 1;
            // Rules are written one at a time; the failure leaves a prefix applied.
            let diff = current.diff(desired);
            let mut partial = current;
            let mut budget = state.partial_commit_rules;
            for rule in &diff.removed {
                if budget == 0 {
                    break;
                }
                partial.rules.remove(rule);
                budget -= 1;
            }
            for rule in &diff.added {
                if budget == 0 {
                    break;
                }
                partial.rules.insert(rule.clone());
                budget -= 1;
            }
            state
                .policy_history
                .entry(namespace.clone())
                .or_default()
                .push(partial.clone());
            state.policies.insert(namespace.clone(), partial);
            return Err(DrydockError::transient(format!(
                "policy commit for namespace '{namespace}' interrupted"
            )));
        }

        state
            .policy_history
            .entry(namespace.clone())
            .or_default()
            .push(desired.clone());
        state.policies.insert(namespace, desired.clone());
        Ok(())
    }

    async fn restart_workload(&self, namespace: &str, workload: &str) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("restart:{namespace}/{workload}"));
        match state
            .workloads
            .get_mut(&(namespace.to_string(), workload.to_string()))
        {
            Some(w) => {
                w.restarts += 1;
                Ok(())
            }
            None => Err(DrydockError::Rollout {
                workload: workload.to_string(),
                reason: "workload not found".to_string(),
            }),
        }
    }

    async fn workload_health(&self, namespace: &str, workload: &str) -> Result<WorkloadHealth> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        let desired = state
            .workloads
            .get(&(namespace.to_string(), workload.to_string()))
            .map_or(0, |w| w.manifest.replicas);
        let ready = if state.never_healthy.contains(workload) {
            0
        } else {
            desired
        };
        Ok(WorkloadHealth {
            desired,
            updated: desired,
            ready,
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryOutcomeSink
// ---------------------------------------------------------------------------

/// Collects outcome records in memory.
#[derive(Debug, Default)]
pub struct MemoryOutcomeSink {
    outcomes: Mutex<Vec<StageOutcome>>,
}

impl MemoryOutcomeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<StageOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutcomeSink for MemoryOutcomeSink {
    async fn record(&self, outcome: &StageOutcome) -> Result<()> {
        self.outcomes.lock().unwrap().push(outcome.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_policy::NetworkPolicyRule;
    use std::path::PathBuf;

    fn spec(name: &str) -> ServiceImageSpec {
        ServiceImageSpec {
            name: name.to_string(),
            context: PathBuf::from(name),
            dockerfile: None,
            target: ImageRef::new(format!("registry.local/{name}"), "latest"),
        }
    }

    #[tokio::test]
    async fn test_builder_is_deterministic() {
        let b = FakeBuilder::new();
        let a1 = b.build(&spec("vote"), "rev1").await.unwrap();
        let a2 = b.build(&spec("vote"), "rev1").await.unwrap();
        let a3 = b.build(&spec("vote"), "rev2").await.unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, a3);
        assert!(a1.digest.as_deref().unwrap().starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_registry_scripted_failures() {
        let r = FakeRegistry::new();
        let img = ImageRef::new("registry.local/vote", "latest");
        r.fail_times("registry.local/vote", 1);
        assert!(r.push(&img).await.unwrap_err().is_transient());
        assert!(r.push(&img).await.is_ok());
        assert_eq!(r.attempts("registry.local/vote"), 2);

        r.reject_auth("registry.local/vote");
        assert_eq!(
            r.push(&img).await.unwrap_err().class(),
            crate::ErrorClass::Configuration
        );
    }

    #[tokio::test]
    async fn test_cluster_apply_is_idempotent() {
        let c = FakeCluster::new();
        let m = WorkloadManifest {
            name: "vote".to_string(),
            service: Some("vote".to_string()),
            image: ImageRef::new("registry.local/vote", "latest"),
            replicas: 2,
            ports: vec![80],
        };
        assert_eq!(c.apply_workload("vote", &m).await.unwrap(), ApplyChange::Created);
        assert_eq!(c.apply_workload("vote", &m).await.unwrap(), ApplyChange::Unchanged);
    }

    #[tokio::test]
    async fn test_partial_policy_commit_leaves_prefix() {
        let c = FakeCluster::new();
        let before = NetworkPolicySet::from_rules(
            "vote",
            vec![NetworkPolicyRule::allow("vote", "redis", Some(6379))],
        )
        .unwrap();
        c.seed_policy(before.clone());
        c.fail_policy_commits(1, 1);

        let desired = NetworkPolicySet::from_rules(
            "vote",
            vec![
                NetworkPolicyRule::allow("worker", "redis", Some(6379)),
                NetworkPolicyRule::allow("worker", "db", Some(5432)),
            ],
        )
        .unwrap();
        assert!(c.replace_network_policy(&desired).await.is_err());
        let now = c.current_policy("vote");
        assert_ne!(now, before);
        assert_ne!(now, desired);
    }
}
