//! drydock domain model.

pub mod deploy;
pub mod error;
pub mod image;
pub mod rollout;
pub mod run;
pub mod scan;
pub mod target;

pub use deploy::{
    ApplyResult, ExposureApply, PolicyApplyOutcome, SkipReason, SkippedWorkload, WorkloadApply,
};
pub use error::{DrydockError, ErrorClass, Result};
pub use image::{ImageRef, ServiceImage, ServiceImageSpec};
pub use rollout::{RolloutRecord, RolloutStatus};
pub use run::{
    ArtifactRecord, ArtifactState, FailureDetail, OutcomeStatus, PipelineRun, RunStatus,
    StageExecution, StageFailure, StageKind, StageOutcome, Trigger,
};
pub use scan::{ScanFinding, ScanReport, Severity};
pub use target::{
    ApplyChange, DeploymentTarget, TargetKey, WorkloadHealth, WorkloadManifest,
};
