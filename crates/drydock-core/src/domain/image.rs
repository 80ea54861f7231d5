//! Service image identities: build units and artifact references.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::{DrydockError, Result};

/// Reference to a container image: `repository:tag[@digest]`.
///
/// The digest is the content address reported by the builder or registry.
/// Two references with the same tag but different digests are different
/// images, which is what makes a tag-only bump observable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// `repository:tag` without the digest, as used in manifests and pushes.
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Parse `repository[:tag][@digest]`. Missing tag defaults to `latest`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DrydockError::config("image reference is empty"));
        }

        let (name, digest) = match input.split_once('@') {
            Some((n, d)) if !d.is_empty() => (n, Some(d.to_string())),
            Some(_) => {
                return Err(DrydockError::config(format!(
                    "image reference '{input}' has an empty digest"
                )))
            }
            None => (input, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are registry ports.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (&name[..split], &name[split + 1..])
            }
            None => (name, "latest"),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(DrydockError::config(format!(
                "invalid image reference '{input}'"
            )));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        })
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.digest {
            Some(d) => write!(f, "{}:{}@{}", self.repository, self.tag, d),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}

/// A build unit: one declared service resolved for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceImageSpec {
    /// Service name, unique within a run.
    pub name: String,
    /// Build context directory.
    pub context: PathBuf,
    /// Dockerfile path relative to the context (builder default when absent).
    pub dockerfile: Option<PathBuf>,
    /// Target reference (repository + resolved tag, no digest yet).
    pub target: ImageRef,
}

/// A service image after a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceImage {
    pub name: String,
    pub context: PathBuf,
    /// Resolved tag the image will be published under.
    pub tag: String,
    /// Build result reference (carries the content digest).
    pub artifact: ImageRef,
}

impl ServiceImage {
    pub fn from_build(spec: &ServiceImageSpec, artifact: ImageRef) -> Self {
        Self {
            name: spec.name.clone(),
            context: spec.context.clone(),
            tag: spec.target.tag.clone(),
            artifact,
        }
    }
}
