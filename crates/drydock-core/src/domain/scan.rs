//! Vulnerability scan results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::DrydockError;
use super::image::ImageRef;

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = DrydockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(DrydockError::config(format!(
                "invalid severity threshold '{other}' (expected low, medium, high or critical)"
            ))),
        }
    }
}

/// A single vulnerability reported by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub severity: Severity,
    /// Vulnerability reference (e.g. CVE-2024-1234).
    pub identifier: String,
    /// Affected package or component.
    pub component: String,
    /// Version that fixes the finding, when the scanner knows one.
    pub fixed_version: Option<String>,
}

/// Scanner output for one built image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub image: ImageRef,
    pub findings: Vec<ScanFinding>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanReport {
    pub fn new(image: ImageRef, findings: Vec<ScanFinding>) -> Self {
        Self {
            image,
            findings,
            scanned_at: Utc::now(),
        }
    }

    /// Findings with severity at or above `threshold`, in report order.
    pub fn at_or_above(&self, threshold: Severity) -> impl Iterator<Item = &ScanFinding> {
        self.findings.iter().filter(move |f| f.severity >= threshold)
    }

    /// Highest severity present, if any.
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity, id: &str) -> ScanFinding {
        ScanFinding {
            severity,
            identifier: id.to_string(),
            component: "openssl".to_string(),
            fixed_version: None,
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_severity_parse_case_insensitive() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!(" critical ".parse::<Severity>().unwrap(), Severity::Critical);
        let err = "severe".parse::<Severity>().unwrap_err();
        assert!(err.to_string().contains("invalid severity threshold"));
    }

    #[test]
    fn test_at_or_above_filters_in_order() {
        let report = ScanReport::new(
            ImageRef::new("registry/vote", "latest"),
            vec![
                finding(Severity::Low, "CVE-1"),
                finding(Severity::Critical, "CVE-2"),
                finding(Severity::High, "CVE-3"),
            ],
        );
        let ids: Vec<&str> = report
            .at_or_above(Severity::High)
            .map(|f| f.identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["CVE-2", "CVE-3"]);
        assert_eq!(report.max_severity(), Some(Severity::Critical));
    }
}
