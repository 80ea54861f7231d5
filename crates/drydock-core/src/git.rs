//! Source revision capture for triggers that do not name one.

use std::path::Path;
use std::process::Command;

use crate::domain::error::{DrydockError, Result};

/// `git rev-parse HEAD` in `repo_dir`.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| DrydockError::config(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DrydockError::config(format!(
            "cannot determine revision (git rev-parse HEAD failed: {}); pass --revision",
            stderr.trim()
        )));
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        return Err(DrydockError::config(
            "git rev-parse HEAD returned empty output",
        ));
    }
    Ok(sha)
}

/// First 12 characters of a revision, as used in image tags.
pub fn short_revision(revision: &str) -> &str {
    match revision.char_indices().nth(12) {
        Some((idx, _)) => &revision[..idx],
        None => revision,
    }
}
