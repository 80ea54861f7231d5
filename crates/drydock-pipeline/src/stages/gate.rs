//! Gate stage: applies the run's gate policy to each scan report.

use drydock_core::obs::emit_gate_evaluated;
use drydock_core::{GateDecision, GatePolicy, ScanReport};

#[derive(Debug, Clone, Copy)]
pub struct GateStage {
    policy: GatePolicy,
}

impl GateStage {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    /// Evaluate and log the decision, including every finding at or above
    /// the threshold.
    pub fn evaluate(&self, run_id: &str, report: &ScanReport) -> GateDecision {
        let decision = self.policy.evaluate(report);
        emit_gate_evaluated(run_id, &decision);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::{GateMode, ImageRef, ScanFinding, Severity};

    fn report() -> ScanReport {
        ScanReport::new(
            ImageRef::new("registry.local/vote", "abc"),
            vec![ScanFinding {
                severity: Severity::Critical,
                identifier: "CVE-2024-3094".to_string(),
                component: "xz-utils".to_string(),
                fixed_version: Some("5.6.1+really5.4.5-1".to_string()),
            }],
        )
    }

    #[test]
    fn test_strict_blocks_critical() {
        let stage = GateStage::new(GatePolicy::new(Severity::High, GateMode::Strict));
        let decision = stage.evaluate("run-1", &report());
        assert!(!decision.passed());
        assert_eq!(decision.blocking, 1);
    }

    #[test]
    fn test_warn_only_passes_but_keeps_findings() {
        let stage = GateStage::new(GatePolicy::new(Severity::High, GateMode::WarnOnly));
        let decision = stage.evaluate("run-1", &report());
        assert!(decision.passed());
        assert_eq!(decision.findings.len(), 1);
    }
}
