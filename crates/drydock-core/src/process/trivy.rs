//! trivy image scanner.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{run_command, CommandSpec, DEFAULT_COMMAND_TIMEOUT};
use crate::collaborators::VulnerabilityScanner;
use crate::domain::error::{DrydockError, Result};
use crate::domain::image::ImageRef;
use crate::domain::scan::{ScanFinding, ScanReport, Severity};

/// `trivy image --format json --quiet <ref>`.
#[derive(Debug, Clone)]
pub struct TrivyScanner {
    binary: String,
    timeout: Duration,
}

impl Default for TrivyScanner {
    fn default() -> Self {
        Self {
            binary: "trivy".to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl TrivyScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl VulnerabilityScanner for TrivyScanner {
    async fn scan(&self, image: &ImageRef) -> Result<ScanReport> {
        let cmd = CommandSpec::new(&self.binary)
            .timeout(self.timeout)
            .args(["image", "--format", "json", "--quiet"])
            .arg(image.tagged());
        let out = run_command(&cmd).await?;
        if !out.success() {
            return Err(DrydockError::transient(format!(
                "trivy failed for {}: {}",
                image.tagged(),
                out.stderr_summary()
            )));
        }
        parse_report(image, &out.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct TrivyOutput {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Debug, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,
    #[serde(rename = "PkgName")]
    package: String,
    #[serde(rename = "Severity")]
    severity: String,
    #[serde(rename = "FixedVersion", default)]
    fixed_version: Option<String>,
}

fn map_severity(raw: &str) -> Severity {
    match raw.to_ascii_uppercase().as_str() {
        "CRITICAL" => Severity::Critical,
        "HIGH" => Severity::High,
        "MEDIUM" => Severity::Medium,
        // LOW, UNKNOWN and anything new
        _ => Severity::Low,
    }
}

/// Parse trivy's JSON report. Findings keep trivy's order.
pub fn parse_report(image: &ImageRef, json: &str) -> Result<ScanReport> {
    let parsed: TrivyOutput = serde_json::from_str(json)
        .map_err(|e| DrydockError::transient(format!("unreadable trivy output: {e}")))?;

    let findings = parsed
        .results
        .into_iter()
        .flat_map(|r| r.vulnerabilities.unwrap_or_default())
        .map(|v| ScanFinding {
            severity: map_severity(&v.severity),
            identifier: v.id,
            component: v.package,
            fixed_version: v.fixed_version.filter(|f| !f.is_empty()),
        })
        .collect();

    Ok(ScanReport::new(image.clone(), findings))
}
