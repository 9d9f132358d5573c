// src/workspace/manager.rs
//! Per-user workspaces and course materials
//!
//! ```text
//! workspace_root/
//! ├─ 1/              (user 1, created on first access)
//! │  └─ out/lab-01.ipynb
//! └─ 2/
//! materials_root/    (read-only course content)
//! └─ out/lab-01.ipynb
//! ```
//!
//! Workspaces are never deleted here.

use crate::identity::UserId;
use crate::utils::config::WorkspaceSettings;
use crate::utils::errors::SandboxError;
use crate::workspace::sandbox::{self, real_path, resolve, safe_copy};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, SandboxError>;

/// What [`WorkspaceManager::provision_notebook`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// Copied from materials into the workspace
    Copied(PathBuf),
    /// The user already has a copy; left untouched
    AlreadyPresent(PathBuf),
    /// No such file in the materials; nothing copied
    MissingSource(PathBuf),
}

impl Provisioned {
    /// Path of the notebook inside the user's workspace
    pub fn path(&self) -> &Path {
        match self {
            Provisioned::Copied(path)
            | Provisioned::AlreadyPresent(path)
            | Provisioned::MissingSource(path) => path,
        }
    }
}

/// Resolves user workspaces and material paths
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    workspace_root: PathBuf,
    materials_root: PathBuf,
    settings: WorkspaceSettings,
}

impl WorkspaceManager {
    /// Create the workspace root if needed and canonicalize both roots
    pub fn new(settings: WorkspaceSettings) -> Result<Self> {
        fs::create_dir_all(&settings.workspace_root)?;
        let workspace_root = settings.workspace_root.canonicalize()?;
        let materials_root = settings.materials_root.canonicalize()?;

        info!(
            "Workspaces under {:?}, materials under {:?}",
            workspace_root, materials_root
        );

        Ok(Self {
            workspace_root,
            materials_root,
            settings,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn materials_root(&self) -> &Path {
        &self.materials_root
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    /// `workspace_root/<user_id>`, created on first access
    pub fn user_workspace(&self, user: UserId) -> Result<PathBuf> {
        let candidate = self.workspace_root.join(user.to_string());

        // a pre-planted symlink at <root>/<id> must not redirect the workspace
        self.ensure_strictly_inside(&real_path(&candidate)?)?;

        fs::create_dir_all(&candidate)?;
        let workspace = candidate.canonicalize()?;
        self.ensure_strictly_inside(&workspace)?;

        Ok(workspace)
    }

    fn ensure_strictly_inside(&self, path: &Path) -> Result<()> {
        if path == self.workspace_root || !path.starts_with(&self.workspace_root) {
            warn!("Workspace path escape detected: {:?}", path);
            return Err(SandboxError::Escape(path.display().to_string()));
        }
        Ok(())
    }

    /// Resolve a path inside the user's workspace
    pub fn resolve_in_workspace(&self, user: UserId, relative: &str) -> Result<PathBuf> {
        let workspace = self.user_workspace(user)?;
        resolve(&workspace, relative)
    }

    /// Resolve a path inside the materials directory
    pub fn resolve_material(&self, relative: &str) -> Result<PathBuf> {
        resolve(&self.materials_root, relative)
    }

    /// Copy a material notebook into the user's workspace unless they already have one
    pub fn provision_notebook(&self, user: UserId, lab_file: &str) -> Result<Provisioned> {
        let source = self.resolve_material(lab_file)?;
        let target = self.resolve_in_workspace(user, lab_file)?;

        if target.exists() {
            debug!("Notebook already present for user {}: {:?}", user, target);
            return Ok(Provisioned::AlreadyPresent(target));
        }
        if !source.exists() {
            warn!("Material notebook missing: {:?}", source);
            return Ok(Provisioned::MissingSource(target));
        }

        safe_copy(&source, &target, self.settings.max_copy_bytes)?;
        info!("Provisioned {:?} for user {}", lab_file, user);
        Ok(Provisioned::Copied(target))
    }

    /// Read a notebook, preferring the user's copy over the materials copy
    pub fn open_notebook(&self, user: UserId, lab_file: &str) -> Result<serde_json::Value> {
        let own = match self.resolve_in_workspace(user, lab_file) {
            Ok(path) if path.exists() => Some(path),
            Ok(_) => None,
            Err(err) => {
                debug!("Workspace copy unavailable for {:?}: {}", lab_file, err);
                None
            }
        };

        let path = match own {
            Some(path) => path,
            None => self.resolve_material(lab_file)?,
        };

        if !path.is_file() {
            return Err(SandboxError::NotAFile(path));
        }

        let size = fs::metadata(&path)?.len();
        if size > self.settings.max_notebook_bytes {
            return Err(SandboxError::FileTooLarge {
                size,
                limit: self.settings.max_notebook_bytes,
            });
        }

        let raw = fs::read(&path)?;
        serde_json::from_slice(&raw).map_err(|e| SandboxError::InvalidNotebook(e.to_string()))
    }

    /// Atomically replace the user's copy of a notebook. Returns bytes written.
    pub fn save_notebook(
        &self,
        user: UserId,
        lab_file: &str,
        notebook: &serde_json::Value,
    ) -> Result<u64> {
        if !notebook.is_object() {
            return Err(SandboxError::InvalidNotebook(
                "notebook must be a JSON object".to_string(),
            ));
        }

        let serialized = serde_json::to_vec_pretty(notebook)
            .map_err(|e| SandboxError::InvalidNotebook(e.to_string()))?;
        let size = serialized.len() as u64;
        if size > self.settings.max_notebook_bytes {
            return Err(SandboxError::FileTooLarge {
                size,
                limit: self.settings.max_notebook_bytes,
            });
        }

        let path = self.resolve_in_workspace(user, lab_file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        write_atomic(&path, &serialized)?;
        debug!("Saved {} bytes to {:?}", size, path);
        Ok(size)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = sandbox::temp_sibling(path);
    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager() -> (TempDir, WorkspaceManager) {
        let dir = TempDir::new().unwrap();
        let materials = dir.path().join("materials");
        fs::create_dir_all(materials.join("out")).unwrap();
        fs::write(
            materials.join("out/lab-01.ipynb"),
            serde_json::to_vec(&json!({"cells": [], "nbformat": 4})).unwrap(),
        )
        .unwrap();

        let settings = WorkspaceSettings {
            workspace_root: dir.path().join("workspaces"),
            materials_root: materials,
            max_notebook_bytes: 4096,
            ..Default::default()
        };
        let manager = WorkspaceManager::new(settings).unwrap();
        (dir, manager)
    }

    fn user(id: i64) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn test_user_workspace_created_lazily() {
        let (_dir, manager) = manager();
        let expected = manager.workspace_root().join("42");
        assert!(!expected.exists());

        let workspace = manager.user_workspace(user(42)).unwrap();
        assert_eq!(workspace, expected);
        assert!(workspace.is_dir());

        // idempotent
        assert_eq!(manager.user_workspace(user(42)).unwrap(), expected);
    }

    #[cfg(unix)]
    #[test]
    fn test_user_workspace_symlink_escape() {
        let (dir, manager) = manager();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, manager.workspace_root().join("5")).unwrap();

        assert!(matches!(
            manager.user_workspace(user(5)),
            Err(SandboxError::Escape(_))
        ));
    }

    #[test]
    fn test_provision_copies_once() {
        let (_dir, manager) = manager();

        let first = manager.provision_notebook(user(1), "out/lab-01.ipynb").unwrap();
        assert!(matches!(first, Provisioned::Copied(_)));
        assert!(first.path().exists());

        fs::write(first.path(), b"{\"edited\": true}").unwrap();
        let second = manager.provision_notebook(user(1), "out/lab-01.ipynb").unwrap();
        assert!(matches!(second, Provisioned::AlreadyPresent(_)));
        assert_eq!(fs::read(second.path()).unwrap(), b"{\"edited\": true}");
    }

    #[test]
    fn test_provision_missing_source() {
        let (_dir, manager) = manager();
        let outcome = manager.provision_notebook(user(1), "out/nope.ipynb").unwrap();
        assert!(matches!(outcome, Provisioned::MissingSource(_)));
        assert!(!outcome.path().exists());
    }

    #[test]
    fn test_provision_rejects_traversal() {
        let (_dir, manager) = manager();
        assert!(manager.provision_notebook(user(1), "../../etc/passwd").is_err());
    }

    #[test]
    fn test_open_notebook_falls_back_to_materials() {
        let (_dir, manager) = manager();
        let notebook = manager.open_notebook(user(3), "out/lab-01.ipynb").unwrap();
        assert_eq!(notebook["nbformat"], 4);
    }

    #[test]
    fn test_save_then_open_prefers_workspace() {
        let (_dir, manager) = manager();
        let saved = json!({"cells": [{"source": "print(1)"}], "nbformat": 4});
        let written = manager.save_notebook(user(3), "out/lab-01.ipynb", &saved).unwrap();
        assert!(written > 0);

        let opened = manager.open_notebook(user(3), "out/lab-01.ipynb").unwrap();
        assert_eq!(opened, saved);

        // no temp files left behind
        let dir = manager.user_workspace(user(3)).unwrap().join("out");
        let names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["lab-01.ipynb".to_string()]);
    }

    #[test]
    fn test_save_rejects_non_object_and_oversize() {
        let (_dir, manager) = manager();
        assert!(matches!(
            manager.save_notebook(user(3), "out/x.ipynb", &json!([1, 2, 3])),
            Err(SandboxError::InvalidNotebook(_))
        ));

        let huge = json!({"blob": "x".repeat(10_000)});
        assert!(matches!(
            manager.save_notebook(user(3), "out/x.ipynb", &huge),
            Err(SandboxError::FileTooLarge { .. })
        ));
    }
}
