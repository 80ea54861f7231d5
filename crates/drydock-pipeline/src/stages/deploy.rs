//! Deploy stage: renders the target's resource set against the run's
//! published images and applies it through a runner lease.

use std::collections::{BTreeMap, BTreeSet};

use drydock_core::{
    retry, ApplyResult, DeploymentTarget, DrydockError, ExposureApply, FailureDetail, ImageRef,
    Result, RetryOn, RetryPolicy, WorkloadApply, WorkloadManifest,
};
use tracing::{info, warn};

use super::policy::NetworkPolicyEnforcer;
use crate::runner::RunnerLease;

#[derive(Debug, Clone, Copy)]
pub struct DeployStage {
    retry: RetryPolicy,
    enforcer: NetworkPolicyEnforcer,
}

impl DeployStage {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            enforcer: NetworkPolicyEnforcer::new(retry),
        }
    }

    /// Apply workloads, then exposures, then the namespace's rule set.
    ///
    /// Only a rendering failure (a malformed resource set) is returned as an
    /// error. Per-workload, per-exposure and policy failures are recorded in
    /// the [`ApplyResult`].
    pub async fn deploy(
        &self,
        lease: &RunnerLease,
        target: &DeploymentTarget,
        published: &BTreeMap<String, ImageRef>,
        excluded: &BTreeSet<String>,
    ) -> Result<ApplyResult> {
        if lease.target() != &target.key() {
            return Err(DrydockError::config(format!(
                "lease for {} cannot deploy to {}",
                lease.target(),
                target.key()
            )));
        }

        let rendered = target.resources.render(published, excluded)?;
        let mut result = ApplyResult::new(target.key());
        result.skipped = rendered.skipped;

        for manifest in &rendered.workloads {
            let applied = self.apply_workload(lease, &target.namespace, manifest).await;
            result.workloads.push(applied);
        }

        let cluster = lease.cluster();
        for exposure in &rendered.exposures {
            let operation = format!("apply exposure {}:{}", exposure.workload, exposure.port);
            let attempted = retry(&self.retry, &operation, RetryOn::Transient, |_| {
                cluster.apply_exposure(&target.namespace, exposure)
            })
            .await;
            let (change, failure) = match attempted.result {
                Ok(change) => (Some(change), None),
                Err(e) => (None, Some(FailureDetail::from(&e))),
            };
            result.exposures.push(ExposureApply {
                workload: exposure.workload.clone(),
                port: exposure.port,
                change,
                failure,
            });
        }

        result.policy = self.enforcer.enforce(cluster, &rendered.policy).await;

        info!(
            event = "deploy.applied",
            target = %result.target,
            workloads = result.workloads.len(),
            failed = result.failed_workloads().count(),
            skipped = result.skipped.len(),
        );
        Ok(result)
    }

    async fn apply_workload(
        &self,
        lease: &RunnerLease,
        namespace: &str,
        manifest: &WorkloadManifest,
    ) -> WorkloadApply {
        let cluster = lease.cluster();
        let mut applied = WorkloadApply {
            name: manifest.name.clone(),
            service: manifest.service.clone(),
            previous: None,
            desired: manifest.image.clone(),
            change: None,
            attempts: 0,
            failure: None,
        };

        let operation = format!("read {}/{}", namespace, manifest.name);
        let previous = retry(&self.retry, &operation, RetryOn::Transient, |_| {
            cluster.deployed_image(namespace, &manifest.name)
        })
        .await;
        match previous.result {
            Ok(prev) => applied.previous = prev,
            Err(e) => {
                warn!(workload = %manifest.name, error = %e, "cannot read deployed image");
                applied.attempts = previous.attempts;
                applied.failure = Some(FailureDetail::from(&e));
                return applied;
            }
        }

        let operation = format!("apply {}/{}", namespace, manifest.name);
        let attempted = retry(&self.retry, &operation, RetryOn::Transient, |_| {
            cluster.apply_workload(namespace, manifest)
        })
        .await;
        applied.attempts = attempted.attempts;
        match attempted.result {
            Ok(change) => applied.change = Some(change),
            Err(e) => applied.failure = Some(FailureDetail::from(&e)),
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{AbortSignal, Runner};
    use drydock_core::fakes::FakeCluster;
    use drydock_core::{ApplyChange, PolicyApplyOutcome, ResourceSet, SkipReason};
    use std::sync::Arc;

    const RESOURCES: &str = r#"
namespace = "vote"

[[workloads]]
name = "vote"
replicas = 2
ports = [80]
image = { service = "vote" }

[[workloads]]
name = "result"
ports = [80]
image = { service = "result" }

[[workloads]]
name = "redis"
ports = [6379]
image = { reference = "redis:7-alpine" }

[[exposures]]
workload = "vote"
port = 5000
target_port = 80
kind = { node_port = 31000 }

[[exposures]]
workload = "result"
port = 5001
target_port = 80

[[network_policy]]
from = "vote"
to = "redis"
port = 6379
action = "allow"
"#;

    fn target() -> DeploymentTarget {
        DeploymentTarget {
            name: "production".to_string(),
            endpoint: "https://k8s.local".to_string(),
            namespace: "vote".to_string(),
            resources: ResourceSet::from_toml_str(RESOURCES).unwrap(),
        }
    }

    fn published(names: &[&str]) -> BTreeMap<String, ImageRef> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    ImageRef::new(format!("registry.local/{n}"), "abc").with_digest("sha256:01"),
                )
            })
            .collect()
    }

    async fn lease(cluster: Arc<FakeCluster>) -> (Runner, RunnerLease) {
        let runner = Runner::new(cluster);
        let lease = runner
            .acquire(&target().key(), "run-1", &AbortSignal::never())
            .await
            .unwrap();
        (runner, lease)
    }

    #[tokio::test]
    async fn test_deploy_applies_everything() {
        let cluster = Arc::new(FakeCluster::new());
        let (_runner, lease) = lease(cluster.clone()).await;

        let result = DeployStage::new(RetryPolicy::none())
            .deploy(&lease, &target(), &published(&["vote", "result"]), &BTreeSet::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.workloads.len(), 3);
        assert!(result
            .workloads
            .iter()
            .all(|w| w.change == Some(ApplyChange::Created) && w.previous.is_none()));
        assert_eq!(result.exposures.len(), 2);
        assert_eq!(result.policy, PolicyApplyOutcome::Applied { added: 1, removed: 0 });
        assert_eq!(
            cluster.image_of("vote", "redis"),
            Some(ImageRef::new("redis", "7-alpine"))
        );
    }

    #[tokio::test]
    async fn test_redeploy_is_a_no_op() {
        let cluster = Arc::new(FakeCluster::new());
        let (_runner, lease) = lease(cluster.clone()).await;
        let stage = DeployStage::new(RetryPolicy::none());
        let images = published(&["vote", "result"]);

        stage.deploy(&lease, &target(), &images, &BTreeSet::new()).await.unwrap();
        let again = stage.deploy(&lease, &target(), &images, &BTreeSet::new()).await.unwrap();

        assert!(again
            .workloads
            .iter()
            .all(|w| w.change == Some(ApplyChange::Unchanged) && !w.image_changed()));
        assert!(again
            .exposures
            .iter()
            .all(|e| e.change == Some(ApplyChange::Unchanged)));
        assert_eq!(again.policy, PolicyApplyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_excluded_service_is_skipped_and_untouched() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed_workload("vote", "result", ImageRef::new("registry.local/result", "old"));
        let (_runner, lease) = lease(cluster.clone()).await;

        let excluded: BTreeSet<String> = ["result".to_string()].into();
        let result = DeployStage::new(RetryPolicy::none())
            .deploy(&lease, &target(), &published(&["vote"]), &excluded)
            .await
            .unwrap();

        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].reason, SkipReason::ArtifactExcluded);
        assert!(result.exposures.iter().all(|e| e.workload != "result"));
        assert_eq!(
            cluster.image_of("vote", "result"),
            Some(ImageRef::new("registry.local/result", "old"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_workload_failure_is_partial() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_apply_times("vote", 5);
        let (_runner, lease) = lease(cluster.clone()).await;

        let result = DeployStage::new(RetryPolicy::new(2, 100))
            .deploy(&lease, &target(), &published(&["vote", "result"]), &BTreeSet::new())
            .await
            .unwrap();

        let vote = result.workloads.iter().find(|w| w.name == "vote").unwrap();
        assert_eq!(vote.attempts, 2);
        assert!(vote.failure.is_some());
        assert_eq!(result.failed_workloads().count(), 1);
        assert_eq!(
            result.to_error().unwrap().class(),
            drydock_core::ErrorClass::PartialDeployment
        );
    }

    #[tokio::test]
    async fn test_lease_for_other_target_is_rejected() {
        let cluster = Arc::new(FakeCluster::new());
        let runner = Runner::new(cluster);
        let other = drydock_core::TargetKey {
            endpoint: "https://k8s.local".to_string(),
            namespace: "staging".to_string(),
        };
        let lease = runner.acquire(&other, "run-1", &AbortSignal::never()).await.unwrap();
        let err = DeployStage::new(RetryPolicy::none())
            .deploy(&lease, &target(), &published(&["vote"]), &BTreeSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), drydock_core::ErrorClass::Configuration);
    }
}
