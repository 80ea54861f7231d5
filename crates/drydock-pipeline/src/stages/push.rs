//! Push stage: publishes gated artifacts to the registry.

use std::sync::Arc;

use drydock_core::{
    retry, Attempted, GateDecision, ImageRef, ImageRegistry, RetryOn, RetryPolicy, ServiceImage,
};

/// An artifact whose gate decision passed. The only input [`PushStage`]
/// accepts, so a gate-failed image cannot reach the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatedArtifact {
    name: String,
    image: ImageRef,
}

impl GatedArtifact {
    /// `None` unless `decision` passed and refers to this image.
    pub fn new(image: &ServiceImage, decision: &GateDecision) -> Option<Self> {
        (decision.passed() && decision.image == image.artifact).then(|| Self {
            name: image.name.clone(),
            image: image.artifact.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }
}

#[derive(Clone)]
pub struct PushStage {
    registry: Arc<dyn ImageRegistry>,
    retry: RetryPolicy,
}

impl PushStage {
    pub fn new(registry: Arc<dyn ImageRegistry>, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    /// Push under the resolved tag. Network failures are retried,
    /// authentication failures are not.
    pub async fn push(&self, artifact: &GatedArtifact) -> Attempted<ImageRef> {
        let operation = format!("push {}", artifact.image.tagged());
        retry(&self.retry, &operation, RetryOn::Transient, |_| {
            self.registry.push(&artifact.image)
        })
        .await
    }
}
