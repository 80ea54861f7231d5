//! Rollout records: forced restarts of running workloads onto a new image.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{DrydockError, Result};
use super::image::ImageRef;

/// Lifecycle of one workload rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl RolloutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutStatus::Complete | RolloutStatus::Failed)
    }
}

/// Record of one forced rollout. Terminal state is final for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub workload: String,
    pub previous: ImageRef,
    pub new: ImageRef,
    pub status: RolloutStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason (present when `Failed`).
    pub reason: Option<String>,
}

impl RolloutRecord {
    pub fn pending(workload: impl Into<String>, previous: ImageRef, new: ImageRef) -> Self {
        Self {
            workload: workload.into(),
            previous,
            new,
            status: RolloutStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            reason: None,
        }
    }

    /// Pending -> InProgress, once the restart has been signalled.
    pub fn begin(&mut self) -> Result<()> {
        self.transition(RolloutStatus::InProgress)
    }

    /// InProgress -> Complete.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(RolloutStatus::Complete)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Pending | InProgress -> Failed.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(RolloutStatus::Failed)?;
        self.finished_at = Some(Utc::now());
        self.reason = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, to: RolloutStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (RolloutStatus::Pending, RolloutStatus::InProgress)
                | (RolloutStatus::Pending, RolloutStatus::Failed)
                | (RolloutStatus::InProgress, RolloutStatus::Complete)
                | (RolloutStatus::InProgress, RolloutStatus::Failed)
        );
        if !allowed {
            return Err(DrydockError::Rollout {
                workload: self.workload.clone(),
                reason: format!("invalid transition {:?} -> {:?}", self.status, to),
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RolloutRecord {
        RolloutRecord::pending(
            "vote",
            ImageRef::new("r/vote", "latest").with_digest("sha256:old"),
            ImageRef::new("r/vote", "latest").with_digest("sha256:new"),
        )
    }

    #[test]
    fn test_happy_path() {
        let mut r = record();
        r.begin().unwrap();
        r.complete().unwrap();
        assert_eq!(r.status, RolloutStatus::Complete);
        assert!(r.finished_at.is_some());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut r = record();
        r.begin().unwrap();
        r.fail("timed out").unwrap();
        assert!(r.complete().is_err());
        assert!(r.begin().is_err());
        assert_eq!(r.status, RolloutStatus::Failed);
        assert_eq!(r.reason.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_cannot_complete_without_begin() {
        let mut r = record();
        assert!(r.complete().is_err());
    }
}
