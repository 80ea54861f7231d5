//! drydock pipeline - stage sequencing for build, scan, gate, push, deploy and rollout
//!
//! Provides:
//! - Typed stages, one artifact per call
//! - A controller that fans out per artifact and excludes failures
//! - The runner: per-target serialisation of cluster mutations
//! - Network policy enforcement with restore on failure
//! - Persisted run state for stage-by-stage execution

pub mod parallel;
pub mod pipeline;
pub mod runner;
pub mod spec;
pub mod stages;
pub mod state;

// Re-export key types
pub use parallel::{fan_out, ArtifactResult};
pub use pipeline::{Collaborators, PipelineController};
pub use runner::{AbortHandle, AbortSignal, Runner, RunnerLease};
pub use spec::resolve_services;
pub use stages::{
    BuildStage, DeployStage, GateStage, GatedArtifact, NetworkPolicyEnforcer, PushStage,
    RolloutStage, ScanStage,
};
pub use state::RunStateStore;
