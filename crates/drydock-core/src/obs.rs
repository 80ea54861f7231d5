//! Structured observability hooks for pipeline runs.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for lifecycle events (run, stage, gate, runner lock,
//!   policy diff, rollout)
//! - The `OutcomeSink` contract that receives one record per stage per artifact
//!
//! Events are emitted at `info!` level with an `event` field; set `RUST_LOG`
//! to filter and pass `--json` to the CLI for JSON lines.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::error::Result;
use crate::domain::run::{OutcomeStatus, RunStatus, StageKind, StageOutcome};
use crate::domain::target::TargetKey;
use crate::gate::GateDecision;
use crate::network_policy::PolicyDiff;

/// RAII guard that enters a run-scoped tracing span.
///
/// ```ignore
/// let _span = RunSpan::enter("0b6f...");
/// // every event below carries run_id
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// The run-scoped span, for instrumenting futures that may move between threads.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("drydock.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, revision: &str, services: usize) {
    info!(event = "run.started", run_id = %run_id, revision = %revision, services);
}

pub fn emit_run_finished(run_id: &str, status: RunStatus, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms,
    );
}

pub fn emit_stage_started(run_id: &str, stage: StageKind, artifacts: usize) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage, artifacts);
}

pub fn emit_stage_finished(run_id: &str, stage: StageKind, failed: usize) {
    info!(event = "stage.finished", run_id = %run_id, stage = %stage, failed);
}

/// Gate decision, including every blocking finding (also under warn-only).
pub fn emit_gate_evaluated(run_id: &str, decision: &GateDecision) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        image = %decision.image,
        threshold = %decision.threshold,
        mode = %decision.mode,
        blocking = decision.blocking,
        passed = decision.passed(),
    );
    for line in decision.render_findings() {
        warn!(event = "gate.finding", run_id = %run_id, image = %decision.image, finding = %line);
    }
}

pub fn emit_lock_queued(target: &TargetKey, holder: &str) {
    info!(event = "runner.lock_queued", target = %target, holder = %holder);
}

pub fn emit_lock_acquired(target: &TargetKey, holder: &str, waited_ms: u64) {
    info!(event = "runner.lock_acquired", target = %target, holder = %holder, waited_ms);
}

pub fn emit_lock_released(target: &TargetKey, holder: &str) {
    info!(event = "runner.lock_released", target = %target, holder = %holder);
}

pub fn emit_policy_diff(namespace: &str, diff: &PolicyDiff) {
    info!(
        event = "policy.diff",
        namespace = %namespace,
        added = diff.added.len(),
        removed = diff.removed.len(),
    );
}

pub fn emit_rollout_transition(workload: &str, status: &str) {
    info!(event = "rollout.transition", workload = %workload, status = %status);
}

/// Warning-level: a run could not be persisted or finalised.
pub fn emit_run_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.error", run_id = %run_id, error = %error);
}

// ---------------------------------------------------------------------------
// Outcome sinks
// ---------------------------------------------------------------------------

/// Receives one structured outcome record per stage per artifact.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record(&self, outcome: &StageOutcome) -> Result<()>;
}

/// Writes each outcome as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOutcomeSink;

#[async_trait]
impl OutcomeSink for TracingOutcomeSink {
    async fn record(&self, o: &StageOutcome) -> Result<()> {
        let class = o.failure.as_ref().map(|f| f.class.to_string());
        match o.status {
            OutcomeStatus::Failed => warn!(
                event = "stage.outcome",
                run_id = %o.run_id,
                stage = %o.stage,
                artifact = %o.artifact,
                status = "failed",
                attempts = o.attempts,
                class = class.as_deref().unwrap_or(""),
                error = o.failure.as_ref().map(|f| f.message.as_str()).unwrap_or(""),
            ),
            status => info!(
                event = "stage.outcome",
                run_id = %o.run_id,
                stage = %o.stage,
                artifact = %o.artifact,
                status = ?status,
                attempts = o.attempts,
                detail = o.detail.as_deref().unwrap_or(""),
            ),
        }
        Ok(())
    }
}

/// Appends outcomes as newline-delimited JSON for external collectors.
#[derive(Debug)]
pub struct JsonLinesOutcomeSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesOutcomeSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OutcomeSink for JsonLinesOutcomeSink {
    async fn record(&self, outcome: &StageOutcome) -> Result<()> {
        let mut line = serde_json::to_vec(outcome)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::DrydockError;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesOutcomeSink::new(dir.path().join("outcomes.ndjson"));

        sink.record(&StageOutcome::succeeded("r1", StageKind::Build, "vote", 1))
            .await
            .unwrap();
        sink.record(&StageOutcome::failed(
            "r1",
            StageKind::Push,
            "result",
            &DrydockError::transient("registry down"),
            3,
        ))
        .await
        .unwrap();

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<StageOutcome> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].artifact, "vote");
        assert_eq!(lines[1].attempts, 3);
        assert_eq!(lines[1].status, OutcomeStatus::Failed);
    }

    #[tokio::test]
    async fn test_tracing_sink_never_fails() {
        let o = StageOutcome::skipped("r1", StageKind::Deploy, "worker", "not in run");
        assert!(TracingOutcomeSink.record(&o).await.is_ok());
    }
}
