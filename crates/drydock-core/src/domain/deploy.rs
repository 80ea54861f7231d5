//! Outcome of applying a declarative resource set to a target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::DrydockError;
use super::image::ImageRef;
use super::run::FailureDetail;
use super::target::{ApplyChange, TargetKey};

/// Per-workload apply result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadApply {
    pub name: String,
    pub service: Option<String>,
    /// Image the cluster reported before this apply (None for new workloads).
    pub previous: Option<ImageRef>,
    pub desired: ImageRef,
    pub change: Option<ApplyChange>,
    pub attempts: u32,
    pub failure: Option<FailureDetail>,
}

impl WorkloadApply {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// An already-running workload whose image differs from the desired one.
    pub fn image_changed(&self) -> bool {
        matches!(&self.previous, Some(prev) if prev != &self.desired)
    }
}

/// Per-exposure apply result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureApply {
    pub workload: String,
    pub port: u16,
    pub change: Option<ApplyChange>,
    pub failure: Option<FailureDetail>,
}

/// Result of enforcing the namespace's network policy set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicyApplyOutcome {
    /// Not reached (e.g. run aborted before policy enforcement).
    NotAttempted,
    /// Cluster set already equals the desired set.
    Unchanged,
    /// Full desired set committed.
    Applied { added: usize, removed: usize },
    /// Commit failed. `restored` is true when the pre-apply set is in force.
    Failed { message: String, restored: bool },
}

impl PolicyApplyOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, PolicyApplyOutcome::Failed { .. })
    }
}

/// Why a workload from the resource set was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Its service failed build, scan, gate or push in this run.
    ArtifactExcluded,
    /// Its service was not part of this trigger; the running version is kept.
    NotInRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedWorkload {
    pub name: String,
    pub service: String,
    pub reason: SkipReason,
}

/// Final result of one DeployStage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub target: TargetKey,
    pub workloads: Vec<WorkloadApply>,
    pub exposures: Vec<ExposureApply>,
    pub policy: PolicyApplyOutcome,
    pub skipped: Vec<SkippedWorkload>,
    pub applied_at: DateTime<Utc>,
}

impl ApplyResult {
    pub fn new(target: TargetKey) -> Self {
        Self {
            target,
            workloads: Vec::new(),
            exposures: Vec::new(),
            policy: PolicyApplyOutcome::NotAttempted,
            skipped: Vec::new(),
            applied_at: Utc::now(),
        }
    }

    pub fn failed_workloads(&self) -> impl Iterator<Item = &WorkloadApply> {
        self.workloads.iter().filter(|w| !w.succeeded())
    }

    pub fn is_success(&self) -> bool {
        self.workloads.iter().all(WorkloadApply::succeeded)
            && self.exposures.iter().all(|e| e.failure.is_none())
            && !self.policy.is_failed()
    }

    /// Summarise failures as a partial-deployment error.
    pub fn to_error(&self) -> Option<DrydockError> {
        if self.is_success() {
            return None;
        }
        let failed = self.failed_workloads().count()
            + self.exposures.iter().filter(|e| e.failure.is_some()).count()
            + usize::from(self.policy.is_failed());
        let total = self.workloads.len() + self.exposures.len() + 1;
        Some(DrydockError::PartialDeployment { failed, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorClass;

    fn key() -> TargetKey {
        TargetKey {
            endpoint: "k8s".to_string(),
            namespace: "vote".to_string(),
        }
    }

    fn apply(name: &str, previous: Option<&str>, failure: bool) -> WorkloadApply {
        WorkloadApply {
            name: name.to_string(),
            service: Some(name.to_string()),
            previous: previous.map(|d| ImageRef::new("r/x", "latest").with_digest(d)),
            desired: ImageRef::new("r/x", "latest").with_digest("sha256:new"),
            change: Some(ApplyChange::Configured),
            attempts: 1,
            failure: failure.then(|| FailureDetail {
                class: ErrorClass::TransientInfra,
                message: "cluster unreachable".to_string(),
            }),
        }
    }

    #[test]
    fn test_image_changed() {
        assert!(apply("a", Some("sha256:old"), false).image_changed());
        assert!(!apply("a", Some("sha256:new"), false).image_changed());
        assert!(!apply("a", None, false).image_changed());
    }

    #[test]
    fn test_partial_failure_error() {
        let mut result = ApplyResult::new(key());
        result.workloads.push(apply("vote", None, false));
        result.workloads.push(apply("result", None, true));
        result.policy = PolicyApplyOutcome::Unchanged;
        assert!(!result.is_success());
        match result.to_error() {
            Some(DrydockError::PartialDeployment { failed, .. }) => assert_eq!(failed, 1),
            other => panic!("expected PartialDeployment, got {:?}", other),
        }
    }

    #[test]
    fn test_policy_failure_fails_result() {
        let mut result = ApplyResult::new(key());
        result.policy = PolicyApplyOutcome::Failed {
            message: "boom".to_string(),
            restored: true,
        };
        assert!(!result.is_success());
    }
}
