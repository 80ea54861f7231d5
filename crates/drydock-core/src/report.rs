//! Run reports: a compact summary of a `PipelineRun` rendered as Markdown
//! for humans and JSON for tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::deploy::{ApplyResult, PolicyApplyOutcome};
use crate::domain::error::{ErrorClass, Result};
use crate::domain::rollout::{RolloutRecord, RolloutStatus};
use crate::domain::run::{ArtifactState, FailureDetail, OutcomeStatus, PipelineRun, RunStatus, StageKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageKind,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub aborted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub name: String,
    pub state: ArtifactState,
    pub published: Option<String>,
    /// Findings at or above the gate threshold, rendered one per line.
    pub findings: Vec<String>,
    pub failed_stage: Option<StageKind>,
    pub failure: Option<FailureDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub revision: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub worst_class: Option<ErrorClass>,
    pub error: Option<FailureDetail>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageSummary>,
    pub artifacts: Vec<ArtifactSummary>,
    pub deployment: Option<ApplyResult>,
    pub rollouts: Vec<RolloutRecord>,
}

/// Exit code for a run: 0 when it succeeded, otherwise the most severe class.
pub fn exit_code(run: &PipelineRun) -> i32 {
    match (run.status(), run.worst_class()) {
        (RunStatus::Aborted, _) => ErrorClass::Aborted.exit_code(),
        (_, Some(class)) => class.exit_code(),
        _ => 0,
    }
}

/// Exit code for one stage entrypoint: 0 when every artifact of the stage
/// succeeded. Deploy and rollout failures report as partial deployments.
pub fn stage_exit_code(run: &PipelineRun, stage: StageKind) -> i32 {
    if run.status() == RunStatus::Aborted {
        return ErrorClass::Aborted.exit_code();
    }
    if let Some(err) = run.error() {
        return err.class.exit_code();
    }
    let class = match stage {
        StageKind::Deploy => run
            .deployment()
            .and_then(|d| d.to_error())
            .map(|e| e.class()),
        StageKind::Rollout => run
            .rollouts()
            .iter()
            .any(|r| r.status == RolloutStatus::Failed)
            .then_some(ErrorClass::PartialDeployment),
        _ => run.stage(stage).and_then(|exec| exec.worst_class()),
    };
    class.map_or(0, |c| c.exit_code())
}

impl RunReport {
    pub fn from_run(run: &PipelineRun) -> Self {
        let stages = run
            .stages()
            .iter()
            .map(|exec| {
                let count = |s: OutcomeStatus| exec.outcomes.iter().filter(|o| o.status == s).count();
                StageSummary {
                    stage: exec.stage,
                    succeeded: count(OutcomeStatus::Succeeded),
                    failed: count(OutcomeStatus::Failed),
                    skipped: count(OutcomeStatus::Skipped),
                    aborted: count(OutcomeStatus::Aborted),
                }
            })
            .collect();

        let artifacts = run
            .artifacts()
            .map(|a| ArtifactSummary {
                name: a.name().to_string(),
                state: a.state(),
                published: a.published.as_ref().map(ToString::to_string),
                findings: a
                    .gate
                    .as_ref()
                    .map(|g| g.render_findings())
                    .unwrap_or_default(),
                failed_stage: a.failure.as_ref().map(|f| f.stage),
                failure: a.failure.as_ref().map(|f| f.detail.clone()),
            })
            .collect();

        Self {
            run_id: run.id().to_string(),
            revision: run.trigger().revision.clone(),
            status: run.status(),
            exit_code: exit_code(run),
            worst_class: run.worst_class(),
            error: run.error().cloned(),
            created_at: run.created_at(),
            finished_at: run.finished_at(),
            stages,
            artifacts,
            deployment: run.deployment().cloned(),
            rollouts: run.rollouts().to_vec(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# drydock run `{}`\n\n", self.run_id));
        out.push_str(&format!(
            "- revision: `{}`\n- status: **{}** (exit {})\n",
            self.revision, self.status, self.exit_code
        ));
        if let Some(err) = &self.error {
            out.push_str(&format!("- error: {} ({})\n", err.message, err.class));
        }
        out.push('\n');

        out.push_str("## Stages\n\n");
        out.push_str("| stage | succeeded | failed | skipped | aborted |\n");
        out.push_str("|-------|-----------|--------|---------|---------|\n");
        for s in &self.stages {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                s.stage, s.succeeded, s.failed, s.skipped, s.aborted
            ));
        }
        out.push('\n');

        out.push_str("## Artifacts\n\n");
        for a in &self.artifacts {
            let state = serde_json::to_value(a.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            out.push_str(&format!("- **{}**: {}", a.name, state));
            if let Some(p) = &a.published {
                out.push_str(&format!(" `{p}`"));
            }
            if let (Some(stage), Some(f)) = (a.failed_stage, &a.failure) {
                out.push_str(&format!(" (failed at {stage}: {})", f.message));
            }
            out.push('\n');
            for finding in &a.findings {
                out.push_str(&format!("  - {finding}\n"));
            }
        }
        out.push('\n');

        if let Some(d) = &self.deployment {
            out.push_str(&format!("## Deployment to `{}`\n\n", d.target));
            for w in &d.workloads {
                let result = match (&w.failure, w.change) {
                    (Some(f), _) => format!("failed: {}", f.message),
                    (None, Some(change)) => format!("{change:?}").to_lowercase(),
                    (None, None) => "not applied".to_string(),
                };
                out.push_str(&format!("- {} `{}`: {}\n", w.name, w.desired, result));
            }
            for s in &d.skipped {
                out.push_str(&format!("- {} skipped ({:?})\n", s.name, s.reason));
            }
            let policy = match &d.policy {
                PolicyApplyOutcome::NotAttempted => "not attempted".to_string(),
                PolicyApplyOutcome::Unchanged => "unchanged".to_string(),
                PolicyApplyOutcome::Applied { added, removed } => {
                    format!("applied (+{added} -{removed})")
                }
                PolicyApplyOutcome::Failed { message, restored } => {
                    format!("failed: {message} (previous rules restored: {restored})")
                }
            };
            out.push_str(&format!("- network policy: {policy}\n\n"));
        }

        if !self.rollouts.is_empty() {
            out.push_str("## Rollouts\n\n");
            for r in &self.rollouts {
                out.push_str(&format!(
                    "- {}: `{}` -> `{}` {:?}",
                    r.workload, r.previous, r.new, r.status
                ));
                if let Some(reason) = &r.reason {
                    out.push_str(&format!(" ({reason})"));
                }
                out.push('\n');
            }
        }
        out
    }
}
