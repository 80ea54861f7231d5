//! Process-backed collaborators: docker, trivy and kubectl driven through
//! `tokio::process`.
//!
//! Every invocation is bounded by a timeout. A missing binary is a
//! configuration problem; a timeout is treated as transient.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::error::{DrydockError, Result};

pub mod docker;
pub mod kubectl;
pub mod trivy;

pub use docker::{DockerBuilder, DockerRegistry};
pub use kubectl::KubectlCluster;
pub use trivy::TrivyScanner;

/// Default bound for a single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then closed. Never logged.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, for error messages.
    pub fn stderr_summary(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
    }
}

/// Run a command to completion. A non-zero exit is returned as output;
/// only spawn failures and timeouts are errors.
pub async fn run_command(spec: &CommandSpec) -> Result<CommandOutput> {
    let start = Instant::now();
    debug!(event = "process.spawn", command = %spec.display());

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DrydockError::config(format!(
                "'{}' not found on PATH",
                spec.program
            )),
            _ => DrydockError::config(format!("failed to start '{}': {e}", spec.program)),
        })?;

    if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
        stdin.write_all(input).await?;
        drop(stdin);
    }

    let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            DrydockError::transient(format!(
                "'{}' timed out after {}s",
                spec.display(),
                spec.timeout.as_secs()
            ))
        })??;

    let out = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    debug!(
        event = "process.exit",
        program = %spec.program,
        exit_code = out.exit_code,
        duration_ms = out.duration_ms,
    );
    Ok(out)
}

const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "authentication required",
    "denied: requested access",
    "forbidden",
    "incorrect username or password",
];

const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "no such host",
    "i/o timeout",
    "tls handshake timeout",
    "unable to connect",
    "connection reset",
    "service unavailable",
    "serviceunavailable",
    "temporary failure in name resolution",
    "too many requests",
    "bad gateway",
];

pub(crate) fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    AUTH_MARKERS.iter().any(|m| lower.contains(m))
}

pub(crate) fn is_network_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    NETWORK_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_simple_command() {
        let out = run_command(&CommandSpec::new("echo").arg("hello"))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let out = run_command(&CommandSpec::new("cat").stdin("secret-token"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "secret-token");
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let err = run_command(&CommandSpec::new("drydock-no-such-binary"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Configuration);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let err = run_command(
            &CommandSpec::new("sleep")
                .arg("5")
                .timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_failure_markers() {
        assert!(is_auth_failure("Error response from daemon: Get https://r/v2/: unauthorized"));
        assert!(is_network_failure("dial tcp 10.0.0.1:443: connect: connection refused"));
        assert!(!is_network_failure("manifest invalid"));
    }

    #[test]
    fn test_stderr_summary() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "step 1\nERROR: failed to solve\n\n".to_string(),
            duration_ms: 0,
        };
        assert_eq!(out.stderr_summary(), "ERROR: failed to solve");
    }
}
