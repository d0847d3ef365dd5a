//! Per-request scratch directories.
//!
//! A [`Workspace`] is a guard: `release` consumes it and removes the directory,
//! and dropping an unreleased workspace (cancelled request, panic) removes it too.
//! Either way the directory is removed once.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use crate::error::CompressionError;

const WORKSPACE_PREFIX: &str = "job-";
/// Finished outputs waiting to be read live next to the workspaces under this prefix.
pub(crate) const ARTIFACT_PREFIX: &str = "compressed-";

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, uniquely named directory under the root.
    pub fn acquire(&self) -> Result<Workspace, CompressionError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| CompressionError::workspace(&self.root, e))?;
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| {
                log::error!(
                    target: "mp4_squeeze::workspace",
                    "Failed to create workspace under {}: {}",
                    self.root.display(),
                    e
                );
                CompressionError::workspace(&self.root, e)
            })?;
        log::debug!(
            target: "mp4_squeeze::workspace",
            "Acquired workspace {}",
            dir.path().display()
        );
        Ok(Workspace {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    /// Remove workspaces and artifacts left behind by a previous run that did not
    /// shut down cleanly. Returns the number of entries removed.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let stale_kind = (meta.is_dir() && name.starts_with(WORKSPACE_PREFIX))
                || (meta.is_file() && name.starts_with(ARTIFACT_PREFIX));
            if !stale_kind {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            let result = if meta.is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => log::warn!(
                    target: "mp4_squeeze::workspace",
                    "Failed to remove stale workspace {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }
        if removed > 0 {
            log::info!(
                target: "mp4_squeeze::workspace",
                "Removed {} stale entries from {}",
                removed,
                self.root.display()
            );
        }
        removed
    }
}

#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory and everything in it.
    pub fn release(mut self) -> Result<(), CompressionError> {
        match self.dir.take() {
            Some(dir) => close_dir(dir, &self.path),
            None => Ok(()),
        }
    }
}

fn close_dir(dir: TempDir, path: &Path) -> Result<(), CompressionError> {
    match dir.close() {
        Ok(()) => {
            log::debug!(
                target: "mp4_squeeze::workspace",
                "Released workspace {}",
                path.display()
            );
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            log::error!(
                target: "mp4_squeeze::workspace",
                "Failed to remove workspace {}: {}",
                path.display(),
                e
            );
            Err(CompressionError::workspace(path, e))
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            log::debug!(
                target: "mp4_squeeze::workspace",
                "Workspace {} dropped without release, removing",
                self.path.display()
            );
            let _ = close_dir(dir, &self.path);
        }
    }
}
