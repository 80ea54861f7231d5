//! docker CLI: image builds and registry pushes.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{is_auth_failure, is_network_failure, run_command, CommandSpec, DEFAULT_COMMAND_TIMEOUT};
use crate::collaborators::{ImageBuilder, ImageRegistry};
use crate::config::RegistryCredentials;
use crate::domain::error::{DrydockError, Result};
use crate::domain::image::{ImageRef, ServiceImageSpec};

// ---------------------------------------------------------------------------
// DockerBuilder
// ---------------------------------------------------------------------------

/// `docker build`, then `docker image inspect` for the image id.
#[derive(Debug, Clone)]
pub struct DockerBuilder {
    binary: String,
    timeout: Duration,
}

impl Default for DockerBuilder {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl DockerBuilder {
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

    fn build_command(&self, spec: &ServiceImageSpec, revision: &str) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.binary)
            .timeout(self.timeout)
            .args(["build", "-t"])
            .arg(spec.target.tagged())
            .arg("--label")
            .arg(format!("org.opencontainers.image.revision={revision}"));
        if let Some(dockerfile) = &spec.dockerfile {
            cmd = cmd
                .arg("-f")
                .arg(spec.context.join(dockerfile).to_string_lossy());
        }
        cmd.arg(spec.context.to_string_lossy())
    }
}

#[async_trait]
impl ImageBuilder for DockerBuilder {
    async fn build(&self, spec: &ServiceImageSpec, revision: &str) -> Result<ImageRef> {
        if !spec.context.is_dir() {
            return Err(DrydockError::Build {
                service: spec.name.clone(),
                reason: format!("build context {} does not exist", spec.context.display()),
            });
        }

        let out = run_command(&self.build_command(spec, revision)).await?;
        if !out.success() {
            return Err(DrydockError::Build {
                service: spec.name.clone(),
                reason: out.stderr_summary().to_string(),
            });
        }

        let inspect = CommandSpec::new(&self.binary)
            .timeout(self.timeout)
            .args(["image", "inspect", "--format", "{{.Id}}"])
            .arg(spec.target.tagged());
        let out = run_command(&inspect).await?;
        let id = out.stdout.trim();
        if !out.success() || id.is_empty() {
            return Err(DrydockError::Build {
                service: spec.name.clone(),
                reason: format!("cannot inspect built image: {}", out.stderr_summary()),
            });
        }

        info!(event = "build.finished", service = %spec.name, image = %spec.target.tagged(), id = %id);
        Ok(spec.target.clone().with_digest(id))
    }
}

// ---------------------------------------------------------------------------
// DockerRegistry
// ---------------------------------------------------------------------------

/// `docker push`, after a single `docker login --password-stdin`.
#[derive(Debug)]
pub struct DockerRegistry {
    binary: String,
    timeout: Duration,
    credentials: Option<RegistryCredentials>,
    logged_in: OnceCell<()>,
}

impl DockerRegistry {
    /// Without credentials the daemon's existing login is used.
    pub fn new(credentials: Option<RegistryCredentials>) -> Self {
        Self {
            binary: "docker".to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            credentials,
            logged_in: OnceCell::new(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn login(&self, image: &ImageRef) -> Result<()> {
        let Some(creds) = &self.credentials else {
            return Ok(());
        };
        self.logged_in
            .get_or_try_init(|| async {
                let mut cmd = CommandSpec::new(&self.binary)
                    .timeout(self.timeout)
                    .args(["login", "-u"])
                    .arg(&creds.username)
                    .arg("--password-stdin")
                    .stdin(creds.token().as_bytes().to_vec());
                if let Some(host) = registry_host(&image.repository) {
                    cmd = cmd.arg(host);
                }
                let out = run_command(&cmd).await?;
                if out.success() {
                    debug!(event = "registry.login", user = %creds.username);
                    Ok(())
                } else {
                    Err(classify_push_failure(out.stderr_summary()))
                }
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ImageRegistry for DockerRegistry {
    async fn push(&self, image: &ImageRef) -> Result<ImageRef> {
        self.login(image).await?;

        let cmd = CommandSpec::new(&self.binary)
            .timeout(self.timeout)
            .arg("push")
            .arg(image.tagged());
        let out = run_command(&cmd).await?;
        if !out.success() {
            return Err(classify_push_failure(&out.stderr));
        }

        let mut published = ImageRef::new(&image.repository, &image.tag);
        published.digest = parse_push_digest(&out.stdout).or_else(|| image.digest.clone());
        Ok(published)
    }
}

/// Registry host of a repository, `None` for Docker Hub names.
fn registry_host(repository: &str) -> Option<&str> {
    let (first, _) = repository.split_once('/')?;
    (first.contains('.') || first.contains(':') || first == "localhost").then_some(first)
}

/// Auth failures are configuration problems; everything else may pass on retry.
fn classify_push_failure(stderr: &str) -> DrydockError {
    let summary = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("push failed")
        .trim();
    if is_auth_failure(stderr) {
        DrydockError::config(format!("registry authentication failed: {summary}"))
    } else if is_network_failure(stderr) {
        DrydockError::transient(format!("registry unreachable: {summary}"))
    } else {
        DrydockError::transient(format!("registry push failed: {summary}"))
    }
}

/// `latest: digest: sha256:... size: 1234`
fn parse_push_digest(stdout: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"digest:\s*(sha256:[0-9a-f]{64})").expect("static digest pattern")
    });
    re.captures_iter(stdout)
        .last()
        .map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_build_command_args() {
        let spec = ServiceImageSpec {
            name: "worker".to_string(),
            context: PathBuf::from("/src/worker"),
            dockerfile: Some(PathBuf::from("Dockerfile.prod")),
            target: ImageRef::new("registry.local/voting/worker", "abc123"),
        };
        let cmd = DockerBuilder::new().build_command(&spec, "abc123def");
        assert_eq!(cmd.program, "docker");
        assert_eq!(
            cmd.args,
            vec![
                "build",
                "-t",
                "registry.local/voting/worker:abc123",
                "--label",
                "org.opencontainers.image.revision=abc123def",
                "-f",
                "/src/worker/Dockerfile.prod",
                "/src/worker",
            ]
        );
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("registry.local:5000/voting/vote"), Some("registry.local:5000"));
        assert_eq!(registry_host("localhost/vote"), Some("localhost"));
        assert_eq!(registry_host("dockersamples/vote"), None);
        assert_eq!(registry_host("vote"), None);
    }

    #[test]
    fn test_classify_push_failure() {
        assert_eq!(
            classify_push_failure("unauthorized: authentication required").class(),
            crate::ErrorClass::Configuration
        );
        assert!(classify_push_failure("dial tcp: lookup registry.local: no such host").is_transient());
        assert!(classify_push_failure("blob upload unknown").is_transient());
    }

    #[test]
    fn test_parse_push_digest() {
        let out = "The push refers to repository [registry.local/vote]\n\
                   5f70bf18a086: Pushed\n\
                   latest: digest: sha256:3b1f0c4e5d6a7b8c9d0e1f2a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e size: 1573\n";
        assert_eq!(
            parse_push_digest(out).as_deref(),
            Some("sha256:3b1f0c4e5d6a7b8c9d0e1f2a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e")
        );
        assert_eq!(parse_push_digest("no digest here"), None);
    }

    #[tokio::test]
    async fn test_missing_context_is_build_error() {
        let spec = ServiceImageSpec {
            name: "vote".to_string(),
            context: PathBuf::from("/definitely/not/here"),
            dockerfile: None,
            target: ImageRef::new("r/vote", "latest"),
        };
        let err = DockerBuilder::new().build(&spec, "rev").await.unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Build);
    }
}
