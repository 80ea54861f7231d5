//! Observability tests for pipeline lifecycle tracing.
//!
//! The `emit_*` hooks must be callable from any context without a configured
//! subscriber and must show up in captured logs when one is installed.

use drydock_core::obs::{
    emit_gate_evaluated, emit_lock_acquired, emit_lock_queued, emit_lock_released,
    emit_policy_diff, emit_rollout_transition, emit_run_error, emit_run_finished,
    emit_run_started, emit_stage_finished, emit_stage_started,
};
use drydock_core::{
    evaluate_gate, GateMode, ImageRef, NetworkPolicyRule, NetworkPolicySet, OutcomeSink,
    RunSpan, RunStatus, ScanFinding, ScanReport, Severity, StageKind, StageOutcome, TargetKey,
    TracingOutcomeSink,
};
use tracing_test::traced_test;

fn target() -> TargetKey {
    TargetKey {
        endpoint: "https://k8s.local:6443".to_string(),
        namespace: "vote".to_string(),
    }
}

#[traced_test]
#[test]
fn test_run_lifecycle_events() {
    let _span = RunSpan::enter("run-123");
    emit_run_started("run-123", "0123abc", 3);
    emit_stage_started("run-123", StageKind::Build, 3);
    emit_stage_finished("run-123", StageKind::Build, 0);
    emit_run_finished("run-123", RunStatus::Succeeded, 4200);

    assert!(logs_contain("run.started"));
    assert!(logs_contain("stage.finished"));
    assert!(logs_contain("run.finished"));
}

#[traced_test]
#[test]
fn test_gate_findings_logged_under_warn_only() {
    let report = ScanReport::new(
        ImageRef::new("registry.local/vote", "latest"),
        vec![ScanFinding {
            severity: Severity::Critical,
            identifier: "CVE-2024-1135".to_string(),
            component: "gunicorn".to_string(),
            fixed_version: Some("22.0.0".to_string()),
        }],
    );
    let decision = evaluate_gate(&report, Severity::High, GateMode::WarnOnly);
    assert!(decision.passed());

    emit_gate_evaluated("run-gate", &decision);
    assert!(logs_contain("gate.evaluated"));
    assert!(logs_contain("CVE-2024-1135"));
}

#[traced_test]
#[test]
fn test_runner_and_policy_events() {
    emit_lock_queued(&target(), "run-b");
    emit_lock_acquired(&target(), "run-a", 0);
    emit_lock_released(&target(), "run-a");

    let before = NetworkPolicySet::empty("vote");
    let after = NetworkPolicySet::from_rules(
        "vote",
        vec![NetworkPolicyRule::allow("vote", "redis", Some(6379))],
    )
    .unwrap();
    emit_policy_diff("vote", &before.diff(&after));
    emit_rollout_transition("vote", "in_progress");
    emit_run_error("run-a", &"state dir not writable");

    assert!(logs_contain("runner.lock_queued"));
    assert!(logs_contain("policy.diff"));
    assert!(logs_contain("run.error"));
}

#[traced_test]
#[tokio::test]
async fn test_tracing_outcome_sink_logs_record() {
    let outcome = StageOutcome::succeeded("run-1", StageKind::Push, "vote", 2);
    TracingOutcomeSink.record(&outcome).await.unwrap();
    assert!(logs_contain("stage.outcome"));
}
