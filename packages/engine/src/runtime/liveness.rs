// packages/engine/src/runtime/liveness.rs
//! Remaining lifetime of deferred workspaces
//!
//! A deferred job's workspace is removed by the reaper `grace` after its
//! console log was written. The time-to-live reported here is computed from
//! the log's mtime and is advisory: it can go negative while the reaper has
//! not fired yet, and a workspace can vanish between two stats.

use crate::runtime::job::JobId;
use crate::runtime::workspace::{is_valid_job_id, WorkspaceManager, CONSOLE_LOG};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::debug;

/// Liveness state of a job's workspace
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "ttl", rename_all = "snake_case")]
pub enum Liveness {
    /// No workspace on disk
    Dead,
    /// Workspace exists, job still running
    Pending,
    /// Seconds left before the reaper removes the workspace
    Alive(f64),
}

impl Liveness {
    /// Wire encoding: `0` dead, `-1` pending, remaining seconds otherwise
    pub fn as_ttl(&self) -> f64 {
        match self {
            Liveness::Dead => 0.0,
            Liveness::Pending => -1.0,
            Liveness::Alive(seconds) => *seconds,
        }
    }
}

/// Computes workspace time-to-live
pub struct LivenessQuery {
    workspaces: Arc<WorkspaceManager>,
    grace: Duration,
}

impl LivenessQuery {
    pub fn new(workspaces: Arc<WorkspaceManager>, grace: Duration) -> Self {
        Self { workspaces, grace }
    }

    /// Liveness of `job_id`'s workspace.
    ///
    /// `completed` tells whether the job is known to have finished; a finished
    /// job whose workspace exists without a console log is an internal fault.
    pub async fn ttl(&self, job_id: &JobId, completed: bool) -> Result<Liveness> {
        if !is_valid_job_id(job_id) {
            return Ok(Liveness::Dead);
        }

        let dir = self.workspaces.path_for(job_id);
        let marker = dir.join(CONSOLE_LOG);

        match fs::metadata(&marker).await {
            Ok(meta) => {
                let modified = meta.modified()?;
                let ttl = self.grace.as_secs_f64() - seconds_since(modified);
                debug!(job_id = %job_id, "Workspace alive, ttl {:.3}s", ttl);
                Ok(Liveness::Alive(ttl))
            }
            Err(e) if is_absent(&e) => match fs::metadata(&dir).await {
                Ok(meta) if meta.is_dir() => {
                    if completed {
                        Err(EngineError::OutputMissing(marker))
                    } else {
                        Ok(Liveness::Pending)
                    }
                }
                Ok(_) => Ok(Liveness::Dead),
                // removed by the reaper between the two stats
                Err(e) if is_absent(&e) => Ok(Liveness::Dead),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }
}

fn is_absent(err: &std::io::Error) -> bool {
    // ENOTDIR shows up when a path component is a plain file
    err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(nix::libc::ENOTDIR)
}

/// Signed seconds elapsed since `then`
fn seconds_since(then: SystemTime) -> f64 {
    match SystemTime::now().duration_since(then) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(ahead) => -ahead.duration().as_secs_f64(),
    }
}
