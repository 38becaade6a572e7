// packages/engine/src/runtime/workspace.rs
//! Per-job workspaces on the shared volume
//!
//! Layout:
//!
//! ```text
//! {volume_root}/
//! ├─ {job_id}/
//! │  ├─ input.pdb            (written before the tool runs)
//! │  ├─ output.pdb|.itp      (written by the tool)
//! │  ├─ console_output.log   (deferred kinds only)
//! │  └─ tppmktop.log         (relocated tool log)
//! └─ ...
//! ```
//!
//! A workspace belongs to exactly one job. Creation is atomic: an existing
//! directory with the same id is a setup error, never shared.

use crate::runtime::job::JobId;
use crate::utils::errors::{EngineError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Console output of a deferred job; its mtime marks the job's completion
pub const CONSOLE_LOG: &str = "console_output.log";

/// Handle to a created workspace directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    job_id: JobId,
    path: PathBuf,
}

impl Workspace {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute path of an artifact inside the workspace
    pub fn artifact(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Artifact path relative to the volume root, as passed to the tool
    pub fn relative(&self, name: &str) -> String {
        format!("{}/{}", self.job_id, name)
    }
}

/// Creates and removes workspaces under a volume root
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a workspace manager, creating the volume root if needed
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        fs::create_dir_all(&root).await.map_err(|e| {
            EngineError::WorkspaceSetup(format!(
                "Failed to create volume root {}: {}",
                root.display(),
                e
            ))
        })?;

        debug!("Workspace root ready at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a job's workspace lives in, whether or not it exists
    pub fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    /// Create the workspace directory for `job_id`. Fails if it already exists.
    pub async fn create(&self, job_id: &JobId) -> Result<Workspace> {
        validate_job_id(job_id)?;

        let path = self.path_for(job_id);
        fs::create_dir(&path).await.map_err(|e| {
            EngineError::WorkspaceSetup(format!(
                "Problem making calc-folder {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!(job_id = %job_id, "Created workspace {:?}", path);

        Ok(Workspace {
            job_id: job_id.clone(),
            path,
        })
    }

    /// Write the job payload verbatim as `name`.
    ///
    /// On failure the workspace directory is removed before returning.
    pub async fn write_input(&self, workspace: &Workspace, name: &str, payload: &str) -> Result<PathBuf> {
        let input = workspace.artifact(name);

        if let Err(e) = fs::write(&input, payload.as_bytes()).await {
            warn!(job_id = %workspace.job_id, "Problem writing {:?}: {}", input, e);
            if let Err(cleanup) = self.destroy(workspace).await {
                warn!(job_id = %workspace.job_id, "Failed to remove workspace after write error: {}", cleanup);
            }
            return Err(EngineError::WorkspaceSetup(format!(
                "Problem writing {}: {}",
                input.display(),
                e
            )));
        }

        debug!(job_id = %workspace.job_id, "Saved input {:?} ({} bytes)", input, payload.len());
        Ok(input)
    }

    /// Read an output artifact written by the tool
    pub async fn read_output(&self, workspace: &Workspace, name: &str) -> Result<Vec<u8>> {
        let path = workspace.artifact(name);

        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(EngineError::OutputMissing(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Write an engine-produced artifact (e.g. the console log) into the workspace
    pub async fn write_artifact(&self, workspace: &Workspace, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = workspace.artifact(name);
        fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Move a file from `source` into the workspace as `name`.
    ///
    /// Returns `false` when `source` does not exist.
    pub async fn relocate_into(&self, workspace: &Workspace, source: &Path, name: &str) -> Result<bool> {
        let target = workspace.artifact(name);

        match fs::rename(source, &target).await {
            Ok(()) => {
                debug!(job_id = %workspace.job_id, "Moved {:?} to {:?}", source, target);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively remove a workspace. Removing an absent workspace is a no-op.
    pub async fn destroy(&self, workspace: &Workspace) -> Result<()> {
        info!(job_id = %workspace.job_id, "Cleaning calc-folder {:?}", workspace.path);
        self.destroy_path(&workspace.path).await.map(|_| ())
    }

    /// Remove a workspace directory by path.
    ///
    /// Returns `true` if something was removed, `false` if it was already gone.
    pub async fn destroy_path(&self, path: &Path) -> Result<bool> {
        if !path.starts_with(&self.root) || path == self.root {
            return Err(EngineError::RuntimeError(format!(
                "Refusing to remove {} outside of workspace root {}",
                path.display(),
                self.root.display()
            )));
        }

        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Workspace {:?} already removed", path);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `job_id` is usable as a single directory name under the root
pub(crate) fn is_valid_job_id(job_id: &JobId) -> bool {
    let id = job_id.as_str();
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\\')
        && !id.contains('\0')
}

/// Job ids become directory names; reject anything that could escape the root.
fn validate_job_id(job_id: &JobId) -> Result<()> {
    if is_valid_job_id(job_id) {
        Ok(())
    } else {
        Err(EngineError::WorkspaceSetup(format!("Invalid job id '{}'", job_id)))
    }
}
