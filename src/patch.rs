//! Writes AI-proposed file contents into a project directory.
//!
//! Every target is a path relative to the project root. Absolute paths and `..`
//! segments are rejected before anything touches the filesystem.

use crate::error::{Result, SandfixError};
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// One full-file overwrite proposed by a fix
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
}

/// Check that `relative` stays under whatever root it is joined onto.
pub fn validate_relative_path(relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);

    if relative.trim().is_empty() {
        return Err(SandfixError::UnsafePath("empty path".to_string()));
    }

    if path.is_absolute() || path.has_root() {
        return Err(SandfixError::UnsafePath(format!(
            "absolute paths not allowed: {}",
            path.display()
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(SandfixError::UnsafePath(format!(
                    "path traversal not allowed: {}",
                    path.display()
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(SandfixError::UnsafePath(format!(
                    "absolute paths not allowed: {}",
                    path.display()
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(path.to_path_buf())
}

pub struct PatchApplier {
    project_root: PathBuf,
}

impl PatchApplier {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Overwrite `project_root/relative` with `content`, creating parent directories.
    pub fn apply(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let relative = validate_relative_path(relative)?;
        let target = self.project_root.join(&relative);
        let created = !target.exists();

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;

        if created {
            info!(path = %relative.display(), "Created file");
        } else {
            info!(path = %relative.display(), "Updated file");
        }

        Ok(target)
    }

    /// Apply edits in order, stopping at the first failure. Earlier writes are kept.
    pub fn apply_all(&self, edits: &[FileEdit]) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(edits.len());
        for edit in edits {
            written.push(self.apply(&edit.path, &edit.content)?);
        }
        Ok(written)
    }
}
