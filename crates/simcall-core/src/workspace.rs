//! Per-evaluation working directories.
//!
//! Every evaluation runs in its own directory under a shared base, created by
//! [`WorkspaceManager::acquire`]. Releasing a [`Workspace`] without `retain`
//! removes the tree, and dropping one that was never released removes it
//! too, so a cancelled evaluation leaves nothing behind.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Errors produced by workspace management.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace {path} already exists")]
    AlreadyExists { path: String },

    #[error("invalid workspace name {0:?}")]
    InvalidName(String),

    #[error("cannot stage {source_path} into {workspace}: {source}")]
    Stage {
        source_path: String,
        workspace: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for workspace operations.
pub type WorkspaceResult<T> = std::result::Result<T, WorkspaceError>;

/// Handle to one working directory.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workdir = %self.path.display(), error = %e, "workspace cleanup on drop failed");
            }
        }
    }
}

/// Allocates, populates and releases workspaces.
pub struct WorkspaceManager;

impl WorkspaceManager {
    /// Create a fresh directory `base/name`.
    ///
    /// Fails if it already exists, so two callers with distinct names can
    /// never share a workspace.
    pub fn acquire(base: &Path, name: &str) -> WorkspaceResult<Workspace> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
        {
            return Err(WorkspaceError::InvalidName(name.to_string()));
        }

        std::fs::create_dir_all(base).map_err(|source| WorkspaceError::Io {
            path: base.display().to_string(),
            source,
        })?;

        let path = base.join(name);
        std::fs::create_dir(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::AlreadyExists {
                WorkspaceError::AlreadyExists {
                    path: path.display().to_string(),
                }
            } else {
                WorkspaceError::Io {
                    path: path.display().to_string(),
                    source,
                }
            }
        })?;

        debug!(workdir = %path.display(), "workspace acquired");
        Ok(Workspace {
            path,
            released: false,
        })
    }

    /// Copy `files` into the workspace root, keeping their file names.
    pub fn stage(workspace: &Workspace, files: &[PathBuf]) -> WorkspaceResult<()> {
        for file in files {
            let stage_err = |source| WorkspaceError::Stage {
                source_path: file.display().to_string(),
                workspace: workspace.path.display().to_string(),
                source,
            };
            let name = file.file_name().ok_or_else(|| {
                stage_err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path has no file name",
                ))
            })?;
            std::fs::copy(file, workspace.path.join(name)).map_err(stage_err)?;
        }
        Ok(())
    }

    /// Finish with a workspace. Without `retain` it is removed. Safe to call
    /// repeatedly.
    pub fn release(workspace: &mut Workspace, retain: bool) -> WorkspaceResult<()> {
        if workspace.released {
            return Ok(());
        }
        workspace.released = true;

        if retain {
            debug!(workdir = %workspace.path.display(), "workspace retained");
            return Ok(());
        }

        match std::fs::remove_dir_all(&workspace.path) {
            Ok(()) => {
                debug!(workdir = %workspace.path.display(), "workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkspaceError::Io {
                path: workspace.path.display().to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_creates_unique_directory() {
        let base = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::acquire(base.path(), "point-000001").unwrap();
        assert!(ws.path().is_dir());

        let err = WorkspaceManager::acquire(base.path(), "point-000001").unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyExists { .. }));
    }

    #[test]
    fn test_acquire_rejects_path_like_names() {
        let base = tempfile::tempdir().unwrap();
        for bad in ["", "..", "a/b"] {
            assert!(matches!(
                WorkspaceManager::acquire(base.path(), bad),
                Err(WorkspaceError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_stage_copies_files() {
        let base = tempfile::tempdir().unwrap();
        let src = base.path().join("helper.sh");
        std::fs::write(&src, "echo 1").unwrap();

        let ws = WorkspaceManager::acquire(base.path(), "ws").unwrap();
        WorkspaceManager::stage(&ws, &[src]).unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("helper.sh")).unwrap(),
            "echo 1"
        );
    }

    #[test]
    fn test_stage_missing_file_fails() {
        let base = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::acquire(base.path(), "ws").unwrap();
        let err = WorkspaceManager::stage(&ws, &[base.path().join("nope")]).unwrap_err();
        assert!(matches!(err, WorkspaceError::Stage { .. }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let mut ws = WorkspaceManager::acquire(base.path(), "ws").unwrap();
        let path = ws.path().to_path_buf();

        WorkspaceManager::release(&mut ws, false).unwrap();
        assert!(!path.exists());
        WorkspaceManager::release(&mut ws, false).unwrap();
        WorkspaceManager::release(&mut ws, true).unwrap();
    }

    #[test]
    fn test_release_after_external_removal() {
        let base = tempfile::tempdir().unwrap();
        let mut ws = WorkspaceManager::acquire(base.path(), "ws").unwrap();
        std::fs::remove_dir_all(ws.path()).unwrap();
        WorkspaceManager::release(&mut ws, false).unwrap();
    }

    #[test]
    fn test_release_with_retain_keeps_directory() {
        let base = tempfile::tempdir().unwrap();
        let mut ws = WorkspaceManager::acquire(base.path(), "ws").unwrap();
        let path = ws.path().to_path_buf();
        WorkspaceManager::release(&mut ws, true).unwrap();
        drop(ws);
        assert!(path.is_dir());
    }

    #[test]
    fn test_drop_removes_unreleased_workspace() {
        let base = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::acquire(base.path(), "ws").unwrap();
        let path = ws.path().to_path_buf();
        std::fs::write(path.join("partial.out"), "x").unwrap();
        drop(ws);
        assert!(!path.exists());
    }
}
