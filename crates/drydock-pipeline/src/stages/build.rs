//! Build stage: one builder invocation per service.

use std::sync::Arc;

use drydock_core::{ImageBuilder, Result, ServiceImage, ServiceImageSpec};
use tracing::debug;

/// Produces a [`ServiceImage`] per build unit. Build errors are final for
/// the service in this run and are never retried.
#[derive(Clone)]
pub struct BuildStage {
    builder: Arc<dyn ImageBuilder>,
}

impl BuildStage {
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self { builder }
    }

    pub async fn build(&self, spec: &ServiceImageSpec, revision: &str) -> Result<ServiceImage> {
        debug!(service = %spec.name, context = %spec.context.display(), "building image");
        let artifact = self.builder.build(spec, revision).await?;
        Ok(ServiceImage::from_build(spec, artifact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::fakes::FakeBuilder;
    use drydock_core::{ErrorClass, ImageRef};
    use std::path::PathBuf;

    fn spec(name: &str) -> ServiceImageSpec {
        ServiceImageSpec {
            name: name.to_string(),
            context: PathBuf::from(name),
            dockerfile: None,
            target: ImageRef::new(format!("registry.local/{name}"), "abc123"),
        }
    }

    #[tokio::test]
    async fn test_build_keeps_resolved_tag() {
        let stage = BuildStage::new(Arc::new(FakeBuilder::new()));
        let image = stage.build(&spec("vote"), "abc123").await.unwrap();
        assert_eq!(image.name, "vote");
        assert_eq!(image.tag, "abc123");
        assert!(image.artifact.digest.is_some());
    }

    #[tokio::test]
    async fn test_build_failure_is_build_class() {
        let builder = Arc::new(FakeBuilder::new());
        builder.fail_service("result", "npm ci exited 1");
        let stage = BuildStage::new(builder.clone());
        let err = stage.build(&spec("result"), "abc123").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Build);
        assert_eq!(builder.calls(), vec!["result".to_string()]);
    }
}
