//! drydock core library
//!
//! Domain model, gate policy, default-deny network authorization, resource
//! sets, configuration and the contracts (plus process-backed and in-memory
//! implementations) for the builder, scanner, registry and cluster that the
//! pipeline orchestrates.

pub mod collaborators;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod gate;
pub mod git;
pub mod network_policy;
pub mod obs;
pub mod process;
pub mod report;
pub mod resource_set;
pub mod retry;
pub mod telemetry;

pub use collaborators::{ClusterControlPlane, ImageBuilder, ImageRegistry, VulnerabilityScanner};

pub use config::{
    ClusterCredentials, ConfigOverrides, PipelineConfig, RegistryCredentials, ServiceConfig,
    TargetConfig, DEFAULT_CONFIG_FILE,
};

pub use domain::{
    ApplyChange, ApplyResult, ArtifactRecord, ArtifactState, DeploymentTarget, DrydockError,
    ErrorClass, ExposureApply, FailureDetail, ImageRef, OutcomeStatus, PipelineRun,
    PolicyApplyOutcome, Result, RolloutRecord, RolloutStatus, RunStatus, ScanFinding, ScanReport,
    ServiceImage, ServiceImageSpec, Severity, SkipReason, SkippedWorkload, StageExecution,
    StageFailure, StageKind, StageOutcome, TargetKey, Trigger, WorkloadApply, WorkloadHealth,
    WorkloadManifest,
};

pub use gate::{evaluate_gate, GateDecision, GateMode, GateOutcome, GatePolicy};

pub use git::capture_head_sha;

pub use network_policy::{NetworkPolicyRule, NetworkPolicySet, PolicyAction, PolicyDiff};

pub use obs::{JsonLinesOutcomeSink, OutcomeSink, RunSpan, TracingOutcomeSink};

pub use report::{exit_code, stage_exit_code, RunReport};

pub use resource_set::{
    ExposureKind, ExposureRule, RenderedResourceSet, ResourceSet, WorkloadImage, WorkloadSpec,
};

pub use retry::{retry, Attempted, RetryOn, RetryPolicy};

pub use telemetry::init_tracing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
