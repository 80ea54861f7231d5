//! Pipeline run model: trigger, stage executions, per-artifact state.
//!
//! A [`PipelineRun`] is created on trigger, mutated only through the methods
//! below (the pipeline controller is the only caller), and becomes immutable
//! once it reaches a terminal status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deploy::ApplyResult;
use super::error::{DrydockError, ErrorClass, Result};
use super::image::{ImageRef, ServiceImage, ServiceImageSpec};
use super::rollout::{RolloutRecord, RolloutStatus};
use super::scan::ScanReport;
use crate::gate::{GateDecision, GateOutcome};

/// A push event on a tracked revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Source revision (commit SHA).
    pub revision: String,
    /// Services to build in this run.
    pub services: Vec<String>,
    /// Free-form origin, e.g. `push:refs/heads/main`.
    pub source: Option<String>,
}

impl Trigger {
    pub fn new(revision: impl Into<String>, services: Vec<String>) -> Self {
        Self {
            revision: revision.into(),
            services,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Pipeline stages in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Build,
    Scan,
    Gate,
    Push,
    Deploy,
    Rollout,
}

impl StageKind {
    pub const ORDER: [StageKind; 6] = [
        StageKind::Build,
        StageKind::Scan,
        StageKind::Gate,
        StageKind::Push,
        StageKind::Deploy,
        StageKind::Rollout,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Build => "build",
            StageKind::Scan => "scan",
            StageKind::Gate => "gate",
            StageKind::Push => "push",
            StageKind::Deploy => "deploy",
            StageKind::Rollout => "rollout",
        }
    }

    /// The stage that must have completed before this one.
    pub fn previous(&self) -> Option<StageKind> {
        let idx = Self::ORDER.iter().position(|s| s == self)?;
        idx.checked_sub(1).map(|i| Self::ORDER[i])
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-artifact status within one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

/// Serializable snapshot of an error attached to an artifact or workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&DrydockError> for FailureDetail {
    fn from(err: &DrydockError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Structured outcome record: one per stage per artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub run_id: String,
    pub stage: StageKind,
    /// Service name (build..push) or workload name (deploy, rollout).
    pub artifact: String,
    pub status: OutcomeStatus,
    pub attempts: u32,
    pub failure: Option<FailureDetail>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StageOutcome {
    fn new(run_id: &str, stage: StageKind, artifact: &str, status: OutcomeStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            artifact: artifact.to_string(),
            status,
            attempts: 0,
            failure: None,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn succeeded(run_id: &str, stage: StageKind, artifact: &str, attempts: u32) -> Self {
        let mut o = Self::new(run_id, stage, artifact, OutcomeStatus::Succeeded);
        o.attempts = attempts;
        o
    }

    pub fn failed(
        run_id: &str,
        stage: StageKind,
        artifact: &str,
        err: &DrydockError,
        attempts: u32,
    ) -> Self {
        Self::failed_with(run_id, stage, artifact, FailureDetail::from(err), attempts)
    }

    /// Failed outcome from an already captured failure.
    pub fn failed_with(
        run_id: &str,
        stage: StageKind,
        artifact: &str,
        failure: FailureDetail,
        attempts: u32,
    ) -> Self {
        let mut o = Self::new(run_id, stage, artifact, OutcomeStatus::Failed);
        o.attempts = attempts;
        o.failure = Some(failure);
        o
    }

    pub fn skipped(run_id: &str, stage: StageKind, artifact: &str, reason: &str) -> Self {
        let mut o = Self::new(run_id, stage, artifact, OutcomeStatus::Skipped);
        o.detail = Some(reason.to_string());
        o
    }

    pub fn aborted(run_id: &str, stage: StageKind, artifact: &str) -> Self {
        Self::new(run_id, stage, artifact, OutcomeStatus::Aborted)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One stage execution within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage: StageKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<StageOutcome>,
}

impl StageExecution {
    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .count()
    }

    /// True when no artifact failed or was aborted in this stage.
    pub fn succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o.status, OutcomeStatus::Succeeded | OutcomeStatus::Skipped))
    }

    /// Most severe failure class recorded in this stage.
    pub fn worst_class(&self) -> Option<ErrorClass> {
        ErrorClass::most_severe(self.outcomes.iter().filter_map(|o| match o.status {
            OutcomeStatus::Aborted => Some(ErrorClass::Aborted),
            _ => o.failure.as_ref().map(|f| f.class),
        }))
    }
}

/// Where an artifact stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageKind,
    pub detail: FailureDetail,
}

/// Display state of an artifact, derived from its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Pending,
    Built,
    Scanned,
    GatePassed,
    Published,
    Failed,
    Aborted,
}

/// Everything the run knows about one service's artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub spec: ServiceImageSpec,
    pub image: Option<ServiceImage>,
    pub scan: Option<ScanReport>,
    pub gate: Option<GateDecision>,
    pub published: Option<ImageRef>,
    pub failure: Option<StageFailure>,
    pub aborted: bool,
}

impl ArtifactRecord {
    pub fn new(spec: ServiceImageSpec) -> Self {
        Self {
            spec,
            image: None,
            scan: None,
            gate: None,
            published: None,
            failure: None,
            aborted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Still eligible for downstream stages.
    pub fn is_active(&self) -> bool {
        self.failure.is_none() && !self.aborted
    }

    pub fn state(&self) -> ArtifactState {
        if self.aborted {
            ArtifactState::Aborted
        } else if self.failure.is_some() {
            ArtifactState::Failed
        } else if self.published.is_some() {
            ArtifactState::Published
        } else if matches!(&self.gate, Some(g) if g.outcome == GateOutcome::Pass) {
            ArtifactState::GatePassed
        } else if self.scan.is_some() {
            ArtifactState::Scanned
        } else if self.image.is_some() {
            ArtifactState::Built
        } else {
            ArtifactState::Pending
        }
    }
}

/// One execution of the pipeline for one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    id: String,
    trigger: Trigger,
    status: RunStatus,
    stages: Vec<StageExecution>,
    artifacts: BTreeMap<String, ArtifactRecord>,
    deployment: Option<ApplyResult>,
    rollouts: Vec<RolloutRecord>,
    error: Option<FailureDetail>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trigger,
            status: RunStatus::Pending,
            stages: Vec::new(),
            artifacts: BTreeMap::new(),
            deployment: None,
            rollouts: Vec::new(),
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn stages(&self) -> &[StageExecution] {
        &self.stages
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRecord> {
        self.artifacts.values()
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactRecord> {
        self.artifacts.get(name)
    }

    /// Names of artifacts still eligible for downstream stages.
    pub fn active_artifacts(&self) -> Vec<String> {
        self.artifacts
            .values()
            .filter(|a| a.is_active())
            .map(|a| a.name().to_string())
            .collect()
    }

    pub fn deployment(&self) -> Option<&ApplyResult> {
        self.deployment.as_ref()
    }

    pub fn rollouts(&self) -> &[RolloutRecord] {
        &self.rollouts
    }

    pub fn error(&self) -> Option<&FailureDetail> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// The last stage that was started, if any.
    pub fn current_stage(&self) -> Option<StageKind> {
        self.stages.last().map(|s| s.stage)
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DrydockError::RunFinalized(self.id.clone()));
        }
        Ok(())
    }

    /// Pending -> Running.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        self.status = RunStatus::Running;
        Ok(())
    }

    /// Register a build unit. Service names must be unique within the run.
    pub fn add_artifact(&mut self, spec: ServiceImageSpec) -> Result<()> {
        self.ensure_mutable()?;
        if self.artifacts.contains_key(&spec.name) {
            return Err(DrydockError::config(format!(
                "service '{}' declared twice in one run",
                spec.name
            )));
        }
        self.artifacts
            .insert(spec.name.clone(), ArtifactRecord::new(spec));
        Ok(())
    }

    /// Open the next stage. Stages run in fixed order, each exactly once,
    /// and only after the previous stage has finished.
    pub fn begin_stage(&mut self, stage: StageKind) -> Result<()> {
        self.ensure_mutable()?;
        if self.status != RunStatus::Running {
            return Err(DrydockError::config(format!(
                "cannot start stage {stage}: run is {}",
                self.status
            )));
        }
        if self.stage(stage).is_some() {
            return Err(DrydockError::config(format!(
                "stage {stage} has already run for run {}",
                self.id
            )));
        }
        if let Some(prev) = stage.previous() {
            match self.stage(prev) {
                Some(exec) if exec.finished_at.is_some() => {}
                _ => {
                    return Err(DrydockError::config(format!(
                        "stage {prev} has not run; cannot start {stage}"
                    )))
                }
            }
        }
        self.stages.push(StageExecution {
            stage,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
        });
        Ok(())
    }

    fn open_stage_mut(&mut self, stage: StageKind) -> Result<&mut StageExecution> {
        match self.stages.last_mut() {
            Some(exec) if exec.stage == stage && exec.finished_at.is_none() => Ok(exec),
            _ => Err(DrydockError::config(format!("stage {stage} is not open"))),
        }
    }

    /// Attach an outcome record to the open stage.
    pub fn record_outcome(&mut self, outcome: StageOutcome) -> Result<()> {
        self.ensure_mutable()?;
        let exec = self.open_stage_mut(outcome.stage)?;
        exec.outcomes.push(outcome);
        Ok(())
    }

    pub fn end_stage(&mut self, stage: StageKind) -> Result<()> {
        self.ensure_mutable()?;
        let exec = self.open_stage_mut(stage)?;
        exec.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn artifact_mut(&mut self, name: &str) -> Result<&mut ArtifactRecord> {
        self.ensure_mutable()?;
        self.artifacts
            .get_mut(name)
            .ok_or_else(|| DrydockError::config(format!("unknown artifact '{name}'")))
    }

    /// Remove an artifact from all downstream stages of this run.
    pub fn exclude_artifact(
        &mut self,
        name: &str,
        stage: StageKind,
        err: &DrydockError,
    ) -> Result<()> {
        let record = self.artifact_mut(name)?;
        if record.failure.is_none() {
            record.failure = Some(StageFailure {
                stage,
                detail: FailureDetail::from(err),
            });
        }
        Ok(())
    }

    pub fn set_deployment(&mut self, result: ApplyResult) -> Result<()> {
        self.ensure_mutable()?;
        self.deployment = Some(result);
        Ok(())
    }

    pub fn push_rollout(&mut self, record: RolloutRecord) -> Result<()> {
        self.ensure_mutable()?;
        self.rollouts.push(record);
        Ok(())
    }

    /// Whether every artifact made it through and every deploy/rollout step succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.error.is_none()
            && self.artifacts.values().all(ArtifactRecord::is_active)
            && self.deployment.as_ref().map_or(true, ApplyResult::is_success)
            && self
                .rollouts
                .iter()
                .all(|r| r.status == RolloutStatus::Complete)
    }

    /// Close the run as Succeeded or Failed according to per-artifact detail.
    pub fn finalize(&mut self) -> Result<RunStatus> {
        self.ensure_mutable()?;
        self.status = if self.all_succeeded() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.finished_at = Some(Utc::now());
        Ok(self.status)
    }

    /// Abort the whole run on a run-level error (configuration errors).
    pub fn fail(&mut self, err: &DrydockError) -> Result<()> {
        self.ensure_mutable()?;
        self.close_open_stage();
        self.error = Some(FailureDetail::from(err));
        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Operator abort: in-flight artifacts of the open stage and all still
    /// active artifacts are marked aborted. Published images are kept.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        let run_id = self.id.clone();
        let active = self.active_artifacts();
        if let Some(exec) = self.stages.last_mut() {
            if exec.finished_at.is_none() {
                let recorded: Vec<String> =
                    exec.outcomes.iter().map(|o| o.artifact.clone()).collect();
                for name in active.iter().filter(|n| !recorded.contains(n)) {
                    exec.outcomes
                        .push(StageOutcome::aborted(&run_id, exec.stage, name));
                }
            }
        }
        self.close_open_stage();
        for name in active {
            if let Some(record) = self.artifacts.get_mut(&name) {
                record.aborted = true;
            }
        }
        self.error = Some(FailureDetail::from(&DrydockError::Aborted));
        self.status = RunStatus::Aborted;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn close_open_stage(&mut self) {
        if let Some(exec) = self.stages.last_mut() {
            if exec.finished_at.is_none() {
                exec.finished_at = Some(Utc::now());
            }
        }
    }

    /// Most severe failure class across the run, for exit-code reporting.
    pub fn worst_class(&self) -> Option<ErrorClass> {
        let run_level = self.error.as_ref().map(|e| e.class);
        let artifacts = self
            .artifacts
            .values()
            .filter_map(|a| a.failure.as_ref().map(|f| f.detail.class));
        let deploy = self
            .deployment
            .as_ref()
            .and_then(|d| d.to_error())
            .map(|e| e.class());
        let rollouts = self
            .rollouts
            .iter()
            .filter(|r| r.status == RolloutStatus::Failed)
            .map(|_| ErrorClass::PartialDeployment);
        ErrorClass::most_severe(
            run_level
                .into_iter()
                .chain(artifacts)
                .chain(deploy)
                .chain(rollouts),
        )
    }
}
