//! Rollout stage: forced restart of running workloads whose image changed.

use std::time::Duration;

use drydock_core::obs::emit_rollout_transition;
use drydock_core::{retry, RetryOn, RetryPolicy, RolloutRecord, WorkloadApply};
use tracing::debug;

use crate::runner::RunnerLease;

#[derive(Debug, Clone, Copy)]
pub struct RolloutStage {
    retry: RetryPolicy,
    timeout: Duration,
    poll_interval: Duration,
}

impl RolloutStage {
    pub fn new(retry: RetryPolicy, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            retry,
            timeout,
            poll_interval,
        }
    }

    /// Whether `applied` warrants a rollout: it was already running and its
    /// image differs from the one now applied.
    pub fn needs_rollout(applied: &WorkloadApply) -> bool {
        applied.succeeded() && applied.image_changed()
    }

    /// Restart the workload and wait for all replicas to be updated and
    /// ready. A timeout fails the record; nothing is rolled back.
    pub async fn rollout(
        &self,
        lease: &RunnerLease,
        namespace: &str,
        applied: &WorkloadApply,
    ) -> RolloutRecord {
        let previous = applied
            .previous
            .clone()
            .unwrap_or_else(|| applied.desired.clone());
        let mut record = RolloutRecord::pending(&applied.name, previous, applied.desired.clone());
        let workload = applied.name.as_str();
        let cluster = lease.cluster();

        let operation = format!("restart {namespace}/{workload}");
        let restarted = retry(&self.retry, &operation, RetryOn::Transient, |_| {
            cluster.restart_workload(namespace, workload)
        })
        .await;
        if let Err(e) = restarted.result {
            self.finish(&mut record, Some(format!("restart failed: {e}")));
            return record;
        }
        if record.begin().is_ok() {
            emit_rollout_transition(workload, "in_progress");
        }

        let wait = async {
            loop {
                match cluster.workload_health(namespace, workload).await {
                    Ok(health) if health.is_healthy() => return,
                    Ok(health) => debug!(
                        workload = %workload,
                        ready = health.ready,
                        desired = health.desired,
                        "waiting for replicas"
                    ),
                    Err(e) => debug!(workload = %workload, error = %e, "health probe failed"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        let reason = match tokio::time::timeout(self.timeout, wait).await {
            Ok(()) => None,
            Err(_) => Some(format!(
                "replicas not healthy after {}s",
                self.timeout.as_secs()
            )),
        };
        self.finish(&mut record, reason);
        record
    }

    fn finish(&self, record: &mut RolloutRecord, failure: Option<String>) {
        let transition = match failure {
            None => record.complete().map(|_| "complete"),
            Some(reason) => record.fail(reason).map(|_| "failed"),
        };
        if let Ok(status) = transition {
            emit_rollout_transition(&record.workload, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{AbortSignal, Runner};
    use drydock_core::fakes::FakeCluster;
    use drydock_core::{ImageRef, RolloutStatus, TargetKey};
    use std::sync::Arc;

    fn key() -> TargetKey {
        TargetKey {
            endpoint: "https://k8s.local".to_string(),
            namespace: "vote".to_string(),
        }
    }

    fn applied(name: &str, previous: Option<ImageRef>) -> WorkloadApply {
        WorkloadApply {
            name: name.to_string(),
            service: Some(name.to_string()),
            previous,
            desired: ImageRef::new(format!("registry.local/{name}"), "new").with_digest("sha256:02"),
            change: Some(drydock_core::ApplyChange::Configured),
            attempts: 1,
            failure: None,
        }
    }

    fn stage() -> RolloutStage {
        RolloutStage::new(
            RetryPolicy::none(),
            Duration::from_secs(30),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_needs_rollout_only_for_changed_running_workloads() {
        let old = ImageRef::new("registry.local/vote", "old");
        assert!(RolloutStage::needs_rollout(&applied("vote", Some(old))));
        assert!(!RolloutStage::needs_rollout(&applied("vote", None)));

        let same = applied("vote", None);
        let unchanged = applied("vote", Some(same.desired.clone()));
        assert!(!RolloutStage::needs_rollout(&unchanged));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_completes() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed_workload("vote", "vote", ImageRef::new("registry.local/vote", "old"));
        let runner = Runner::new(cluster.clone());
        let lease = runner.acquire(&key(), "run-1", &AbortSignal::never()).await.unwrap();

        let record = stage()
            .rollout(&lease, "vote", &applied("vote", Some(ImageRef::new("registry.local/vote", "old"))))
            .await;
        assert_eq!(record.status, RolloutStatus::Complete);
        assert_eq!(cluster.restarts("vote", "vote"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_times_out_without_rollback() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed_workload("vote", "vote", ImageRef::new("registry.local/vote", "old"));
        cluster.never_healthy("vote");
        let runner = Runner::new(cluster.clone());
        let lease = runner.acquire(&key(), "run-1", &AbortSignal::never()).await.unwrap();

        let record = stage()
            .rollout(&lease, "vote", &applied("vote", Some(ImageRef::new("registry.local/vote", "old"))))
            .await;
        assert_eq!(record.status, RolloutStatus::Failed);
        assert!(record.reason.as_deref().unwrap().contains("30s"));
        // the old image is not put back
        assert_eq!(cluster.restarts("vote", "vote"), 1);
    }

    #[tokio::test]
    async fn test_restart_of_missing_workload_fails_record() {
        let cluster = Arc::new(FakeCluster::new());
        let runner = Runner::new(cluster);
        let lease = runner.acquire(&key(), "run-1", &AbortSignal::never()).await.unwrap();

        let record = stage()
            .rollout(&lease, "vote", &applied("ghost", Some(ImageRef::new("registry.local/ghost", "old"))))
            .await;
        assert_eq!(record.status, RolloutStatus::Failed);
        assert!(record.reason.as_deref().unwrap().starts_with("restart failed"));
    }
}
