use crate::config::expand_home;
use crate::error::{Result, SandfixError};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

/// Expand `~`, create the sandbox directory if needed and return its canonical path.
pub fn ensure_sandbox(sandbox_path: &str) -> Result<PathBuf> {
    if sandbox_path.trim().is_empty() {
        return Err(SandfixError::Validation(
            "Sandbox path is not configured. Run `sandfix config` first.".to_string(),
        ));
    }
    let sandbox = expand_home(sandbox_path.trim());
    std::fs::create_dir_all(&sandbox)?;
    Ok(sandbox.canonicalize()?)
}

/// `git clone [--branch B] URL DEST`. The destination must not exist yet.
pub async fn clone_repository(
    repo_url: &str,
    destination: &Path,
    branch: Option<&str>,
) -> Result<()> {
    if destination.exists() {
        return Err(SandfixError::Validation(format!(
            "Destination '{}' already exists. Choose another project name.",
            destination.display()
        )));
    }
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut cmd = Command::new("git");
    cmd.arg("clone");
    if let Some(branch) = branch.filter(|b| !b.trim().is_empty()) {
        cmd.arg("--branch").arg(branch);
    }
    cmd.arg(repo_url).arg(destination).kill_on_drop(true);

    info!(repo = repo_url, dest = %destination.display(), "Cloning repository");
    let output = cmd
        .output()
        .await
        .map_err(|e| SandfixError::Git(format!("Failed to run git clone: {}", e)))?;

    if !output.status.success() {
        return Err(SandfixError::Git(format!(
            "Cloning the repository failed:\n{}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
