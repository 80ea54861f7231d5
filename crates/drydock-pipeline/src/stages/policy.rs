//! Network policy enforcement: whole-set replacement with restore on failure.
//!
//! The diff between the rule set in force and the desired set is computed
//! before anything is sent. The desired set then goes out in a single
//! replace call. If that call fails, the enforcer reads the set back and, if
//! the cluster no longer holds the snapshot taken before the apply, commits
//! the snapshot again. Either the full desired set or the previous set is in
//! force afterwards.

use drydock_core::obs::emit_policy_diff;
use drydock_core::{
    retry, ClusterControlPlane, NetworkPolicySet, PolicyApplyOutcome, RetryOn, RetryPolicy,
};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct NetworkPolicyEnforcer {
    retry: RetryPolicy,
}

impl NetworkPolicyEnforcer {
    /// `retry` covers reads and the restore commit. The forward commit is
    /// attempted once.
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub async fn enforce(
        &self,
        cluster: &dyn ClusterControlPlane,
        desired: &NetworkPolicySet,
    ) -> PolicyApplyOutcome {
        let namespace = desired.namespace();

        let snapshot = match self.read(cluster, namespace).await {
            Ok(set) => set,
            Err(e) => {
                // Nothing was sent; whatever was in force still is.
                return PolicyApplyOutcome::Failed {
                    message: format!("cannot read current rule set: {e}"),
                    restored: true,
                };
            }
        };

        let diff = snapshot.diff(desired);
        emit_policy_diff(namespace, &diff);
        if diff.is_empty() {
            return PolicyApplyOutcome::Unchanged;
        }

        let commit_err = match cluster.replace_network_policy(desired).await {
            Ok(()) => {
                return PolicyApplyOutcome::Applied {
                    added: diff.added.len(),
                    removed: diff.removed.len(),
                }
            }
            Err(e) => e,
        };
        warn!(
            event = "policy.commit_failed",
            namespace = %namespace,
            error = %commit_err,
        );

        let restored = self.restore(cluster, &snapshot).await;
        PolicyApplyOutcome::Failed {
            message: commit_err.to_string(),
            restored,
        }
    }

    async fn read(
        &self,
        cluster: &dyn ClusterControlPlane,
        namespace: &str,
    ) -> drydock_core::Result<NetworkPolicySet> {
        let operation = format!("read network policy {namespace}");
        retry(&self.retry, &operation, RetryOn::Transient, |_| {
            cluster.network_policy(namespace)
        })
        .await
        .result
    }

    /// Put `snapshot` back in force unless it already is.
    async fn restore(&self, cluster: &dyn ClusterControlPlane, snapshot: &NetworkPolicySet) -> bool {
        let namespace = snapshot.namespace();
        if let Ok(current) = self.read(cluster, namespace).await {
            if current == *snapshot {
                return true;
            }
        }

        let operation = format!("restore network policy {namespace}");
        let attempted = retry(&self.retry, &operation, RetryOn::Transient, |_| {
            cluster.replace_network_policy(snapshot)
        })
        .await;
        match attempted.result {
            Ok(()) => {
                warn!(event = "policy.restored", namespace = %namespace, rules = snapshot.len());
                true
            }
            Err(e) => {
                error!(event = "policy.restore_failed", namespace = %namespace, error = %e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::fakes::FakeCluster;
    use drydock_core::NetworkPolicyRule;

    fn before() -> NetworkPolicySet {
        NetworkPolicySet::from_rules(
            "vote",
            vec![
                NetworkPolicyRule::allow("vote", "redis", Some(6379)),
                NetworkPolicyRule::allow("worker", "redis", Some(6379)),
            ],
        )
        .unwrap()
    }

    fn desired() -> NetworkPolicySet {
        NetworkPolicySet::from_rules(
            "vote",
            vec![
                NetworkPolicyRule::allow("vote", "redis", Some(6379)),
                NetworkPolicyRule::allow("worker", "redis", Some(6379)),
                NetworkPolicyRule::allow("worker", "db", Some(5432)),
                NetworkPolicyRule::allow("result", "db", Some(5432)),
            ],
        )
        .unwrap()
    }

    fn enforcer() -> NetworkPolicyEnforcer {
        NetworkPolicyEnforcer::new(RetryPolicy::new(3, 10))
    }

    #[tokio::test]
    async fn test_applies_full_set() {
        let cluster = FakeCluster::new();
        cluster.seed_policy(before());

        let outcome = enforcer().enforce(&cluster, &desired()).await;
        assert_eq!(outcome, PolicyApplyOutcome::Applied { added: 2, removed: 0 });
        assert_eq!(cluster.current_policy("vote"), desired());
    }

    #[tokio::test]
    async fn test_identical_set_is_not_sent() {
        let cluster = FakeCluster::new();
        cluster.seed_policy(desired());

        let outcome = enforcer().enforce(&cluster, &desired()).await;
        assert_eq!(outcome, PolicyApplyOutcome::Unchanged);
        assert!(!cluster.ops().iter().any(|op| op.starts_with("policy:")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_commit_restores_previous_set() {
        let cluster = FakeCluster::new();
        cluster.seed_policy(before());
        cluster.fail_policy_commits(1, 1);

        let outcome = enforcer().enforce(&cluster, &desired()).await;
        match outcome {
            PolicyApplyOutcome::Failed { restored, .. } => assert!(restored),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(cluster.current_policy("vote"), before());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_failure_without_partial_state_needs_no_restore() {
        let cluster = FakeCluster::new();
        cluster.seed_policy(before());
        cluster.fail_policy_commits(1, 0);

        let outcome = enforcer().enforce(&cluster, &desired()).await;
        assert!(matches!(outcome, PolicyApplyOutcome::Failed { restored: true, .. }));
        // one failed commit, no restore commit
        let commits = cluster.ops().iter().filter(|op| op.starts_with("policy:")).count();
        assert_eq!(commits, 1);
        assert_eq!(cluster.current_policy("vote"), before());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_cluster_sends_nothing() {
        let cluster = FakeCluster::new();
        cluster.seed_policy(before());
        cluster.set_unreachable(true);

        let outcome = enforcer().enforce(&cluster, &desired()).await;
        assert!(matches!(outcome, PolicyApplyOutcome::Failed { restored: true, .. }));
        cluster.set_unreachable(false);
        assert_eq!(cluster.current_policy("vote"), before());
    }
}
