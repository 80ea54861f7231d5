//! Domain-level error taxonomy for drydock.

use serde::{Deserialize, Serialize};

use super::scan::Severity;

/// Failure classes that drive retry, exclusion and exit-code policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed input, missing credential, invalid threshold. Aborts the run.
    Configuration,
    /// Scanner, registry or cluster temporarily unreachable. Retried.
    TransientInfra,
    /// Findings at/above threshold under strict mode.
    SecurityGate,
    /// Some workloads deployed or rolled out, others did not.
    PartialDeployment,
    /// Deterministic build failure. Never retried.
    Build,
    /// Operator abort.
    Aborted,
    /// Anything else (I/O on the state store, serialization).
    Internal,
}

impl ErrorClass {
    /// Process exit code used by the stage entrypoints.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorClass::Configuration => 2,
            ErrorClass::SecurityGate => 3,
            ErrorClass::TransientInfra => 4,
            ErrorClass::PartialDeployment => 5,
            ErrorClass::Build | ErrorClass::Internal => 1,
            ErrorClass::Aborted => 130,
        }
    }

    /// Rank used to pick the class reported when several artifacts fail.
    /// Higher wins.
    pub fn severity_rank(&self) -> u8 {
        match self {
            ErrorClass::Aborted => 6,
            ErrorClass::Configuration => 5,
            ErrorClass::SecurityGate => 4,
            ErrorClass::TransientInfra => 3,
            ErrorClass::PartialDeployment => 2,
            ErrorClass::Build => 1,
            ErrorClass::Internal => 0,
        }
    }

    /// Pick the most severe class out of `classes`.
    pub fn most_severe<I: IntoIterator<Item = ErrorClass>>(classes: I) -> Option<ErrorClass> {
        classes.into_iter().max_by_key(ErrorClass::severity_rank)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::TransientInfra => "transient_infra",
            ErrorClass::SecurityGate => "security_gate",
            ErrorClass::PartialDeployment => "partial_deployment",
            ErrorClass::Build => "build",
            ErrorClass::Aborted => "aborted",
            ErrorClass::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// drydock domain errors.
#[derive(Debug, thiserror::Error)]
pub enum DrydockError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<DrydockError>,
    },

    #[error("security gate failed for {image}: {blocking} finding(s) at or above {threshold}")]
    SecurityGate {
        image: String,
        threshold: Severity,
        blocking: usize,
    },

    #[error("partial deployment failure: {failed} of {total} workload(s) failed")]
    PartialDeployment { failed: usize, total: usize },

    #[error("build failed for service '{service}': {reason}")]
    Build { service: String, reason: String },

    #[error("rollout of '{workload}' failed: {reason}")]
    Rollout { workload: String, reason: String },

    #[error("run aborted")]
    Aborted,

    #[error("run {0} is terminal and can no longer be mutated")]
    RunFinalized(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DrydockError {
    /// Failure class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            DrydockError::Configuration(_) => ErrorClass::Configuration,
            DrydockError::TransientInfra(_) | DrydockError::RetryExhausted { .. } => {
                ErrorClass::TransientInfra
            }
            DrydockError::SecurityGate { .. } => ErrorClass::SecurityGate,
            DrydockError::PartialDeployment { .. } | DrydockError::Rollout { .. } => {
                ErrorClass::PartialDeployment
            }
            DrydockError::Build { .. } => ErrorClass::Build,
            DrydockError::Aborted => ErrorClass::Aborted,
            DrydockError::RunFinalized(_)
            | DrydockError::Internal(_)
            | DrydockError::Serialization(_)
            | DrydockError::Io(_) => ErrorClass::Internal,
        }
    }

    /// Whether a retry may succeed. Only a bare transient error qualifies;
    /// an exhausted retry is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, DrydockError::TransientInfra(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DrydockError::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        DrydockError::TransientInfra(msg.into())
    }
}

/// Result type for drydock domain operations.
pub type Result<T> = std::result::Result<T, DrydockError>;
