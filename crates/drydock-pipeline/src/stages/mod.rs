//! Typed pipeline stages.
//!
//! Each stage declares its input and output types and handles exactly one
//! artifact (or, for deploy, one target) per call. Sequencing, fan-out,
//! exclusion and outcome recording belong to the controller.

pub mod build;
pub mod deploy;
pub mod gate;
pub mod policy;
pub mod push;
pub mod rollout;
pub mod scan;

pub use build::BuildStage;
pub use deploy::DeployStage;
pub use gate::GateStage;
pub use policy::NetworkPolicyEnforcer;
pub use push::{GatedArtifact, PushStage};
pub use rollout::RolloutStage;
pub use scan::ScanStage;
