//! Security gate evaluation for scanned images.
//!
//! Applies a [`GatePolicy`] (severity threshold + run-level mode) to a
//! [`ScanReport`] to produce a [`GateDecision`]. Evaluation is a pure
//! function of its inputs: the same report and policy always yield the
//! same decision.

use serde::{Deserialize, Serialize};

use crate::domain::error::DrydockError;
use crate::domain::image::ImageRef;
use crate::domain::scan::{ScanFinding, ScanReport, Severity};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Run-level gate mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Any finding at/above the threshold fails the artifact.
    Strict,
    /// Findings are reported but the artifact always passes.
    #[serde(alias = "warn")]
    WarnOnly,
}

impl std::fmt::Display for GateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateMode::Strict => f.write_str("strict"),
            GateMode::WarnOnly => f.write_str("warn"),
        }
    }
}

impl std::str::FromStr for GateMode {
    type Err = DrydockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(GateMode::Strict),
            "warn" | "warn-only" | "warn_only" => Ok(GateMode::WarnOnly),
            other => Err(DrydockError::config(format!(
                "invalid gate mode '{other}' (expected strict or warn)"
            ))),
        }
    }
}

/// Threshold and mode applied to every artifact of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    pub threshold: Severity,
    pub mode: GateMode,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            threshold: Severity::High,
            mode: GateMode::Strict,
        }
    }
}

impl GatePolicy {
    pub fn new(threshold: Severity, mode: GateMode) -> Self {
        Self { threshold, mode }
    }

    /// Parse CLI-style `--threshold` / `--mode` values.
    pub fn parse(threshold: &str, mode: &str) -> Result<Self, DrydockError> {
        Ok(Self {
            threshold: threshold.parse()?,
            mode: mode.parse()?,
        })
    }

    pub fn evaluate(&self, report: &ScanReport) -> GateDecision {
        evaluate_gate(report, self.threshold, self.mode)
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    Fail,
}

/// The gate decision for one image. Derived, never persisted beyond the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub image: ImageRef,
    pub outcome: GateOutcome,
    pub threshold: Severity,
    pub mode: GateMode,
    /// Number of findings at or above the threshold.
    pub blocking: usize,
    /// Those findings, in report order (logged even under warn-only).
    pub findings: Vec<ScanFinding>,
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Pass
    }

    /// The error to attach to the artifact when the decision is a failure.
    pub fn to_error(&self) -> Option<DrydockError> {
        match self.outcome {
            GateOutcome::Pass => None,
            GateOutcome::Fail => Some(DrydockError::SecurityGate {
                image: self.image.to_string(),
                threshold: self.threshold,
                blocking: self.blocking,
            }),
        }
    }

    /// One line per blocking finding, e.g. `critical CVE-2024-1 openssl (fixed in 3.0.14)`.
    pub fn render_findings(&self) -> Vec<String> {
        self.findings
            .iter()
            .map(|f| match &f.fixed_version {
                Some(v) => format!("{} {} {} (fixed in {})", f.severity, f.identifier, f.component, v),
                None => format!("{} {} {}", f.severity, f.identifier, f.component),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Count findings with severity >= `threshold` and decide.
///
/// Strict: Pass iff the count is zero. Warn-only: always Pass.
pub fn evaluate_gate(report: &ScanReport, threshold: Severity, mode: GateMode) -> GateDecision {
    let findings: Vec<ScanFinding> = report.at_or_above(threshold).cloned().collect();
    let blocking = findings.len();

    let outcome = match mode {
        GateMode::WarnOnly => GateOutcome::Pass,
        GateMode::Strict if blocking == 0 => GateOutcome::Pass,
        GateMode::Strict => GateOutcome::Fail,
    };

    GateDecision {
        image: report.image.clone(),
        outcome,
        threshold,
        mode,
        blocking,
        findings,
    }
}
