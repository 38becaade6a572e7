// packages/engine/src/runtime/reaper.rs
//! Deferred workspace teardown
//!
//! Workspaces of deferred job kinds stay on disk for a grace window so that
//! clients can poll their liveness and fetch artifacts. The reaper owns a
//! background task with a timer queue; scheduling is fire-and-forget and does
//! not depend on the job task that requested it.
//!
//! ```text
//! handler ── schedule(path, 300s) ──► channel ──► DelayQueue ──► destroy_path
//! ```
//!
//! Timers live in memory only. On startup, [`Reaper::recover`] rebuilds the
//! schedule from the completion-artifact timestamps left on the volume.

use crate::observability;
use crate::runtime::workspace::{WorkspaceManager, CONSOLE_LOG};
use crate::utils::errors::{EngineError, Result};
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

/// Broker-independent delayed teardown of workspaces
pub trait DelayedTeardown: Send + Sync {
    /// Remove `workspace` once `delay` has elapsed
    fn schedule(&self, workspace: PathBuf, delay: Duration) -> Result<()>;
}

enum ReaperCommand {
    Schedule { path: PathBuf, delay: Duration },
    Shutdown,
}

/// What a startup recovery sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Completed workspaces past their grace window, removed now
    pub reaped: usize,
    /// Completed workspaces still inside their grace window
    pub rescheduled: usize,
    /// Workspaces without a completion artifact, left by a crashed run
    pub orphans_removed: usize,
}

/// Background reaper for deferred workspaces
pub struct Reaper {
    tx: mpsc::UnboundedSender<ReaperCommand>,
    workspaces: Arc<WorkspaceManager>,
    pending: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Start the reaper task. Must be called within a Tokio runtime.
    pub fn start(workspaces: Arc<WorkspaceManager>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(Self::run(rx, Arc::clone(&workspaces), Arc::clone(&pending)));

        info!("Reaper started for {:?}", workspaces.root());

        Self {
            tx,
            workspaces,
            pending,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<ReaperCommand>,
        workspaces: Arc<WorkspaceManager>,
        pending: Arc<AtomicUsize>,
    ) {
        let mut queue: DelayQueue<PathBuf> = DelayQueue::new();

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(ReaperCommand::Schedule { path, delay }) => {
                        debug!("Calc-folder {:?} is scheduled to be cleaned in {:?}", path, delay);
                        queue.insert(path, delay);
                    }
                    Some(ReaperCommand::Shutdown) | None => break,
                },

                Some(expired) = queue.next(), if !queue.is_empty() => {
                    let path = expired.into_inner();
                    reap(&workspaces, &path).await;
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        if !queue.is_empty() {
            info!(
                "Reaper stopping with {} workspaces pending; they will be recovered on next start",
                queue.len()
            );
        }
    }

    /// Number of scheduled teardowns that have not fired yet
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Rebuild the teardown schedule from what is on disk.
    ///
    /// Completed workspaces (with a console log) are removed or re-scheduled
    /// according to the log's mtime. Workspaces without one that are older
    /// than `orphan_after` are removed as leftovers of an interrupted run.
    pub async fn recover(&self, grace: Duration, orphan_after: Duration) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut entries = fs::read_dir(self.workspaces.root()).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => {}
                _ => continue,
            }

            match fs::metadata(path.join(CONSOLE_LOG)).await {
                Ok(meta) => {
                    let age = age_of(meta.modified()?);
                    if age >= grace {
                        reap(&self.workspaces, &path).await;
                        report.reaped += 1;
                    } else {
                        self.schedule(path, grace - age)?;
                        report.rescheduled += 1;
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let age = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                        Ok(modified) => age_of(modified),
                        Err(_) => continue,
                    };
                    if age >= orphan_after {
                        warn!("Removing orphaned workspace {:?} (age {:?})", path, age);
                        reap(&self.workspaces, &path).await;
                        report.orphans_removed += 1;
                    }
                }
                Err(e) => warn!("Skipping workspace {:?}: {}", path, e),
            }
        }

        info!(
            "Workspace recovery: {} reaped, {} rescheduled, {} orphans removed",
            report.reaped, report.rescheduled, report.orphans_removed
        );
        Ok(report)
    }

    /// Stop the background task. Pending timers are dropped.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ReaperCommand::Shutdown);

        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Reaper task failed: {}", e);
            }
        }
    }
}

impl DelayedTeardown for Reaper {
    fn schedule(&self, workspace: PathBuf, delay: Duration) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);

        self.tx
            .send(ReaperCommand::Schedule {
                path: workspace,
                delay,
            })
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                EngineError::ReaperUnavailable("reaper task has stopped".to_string())
            })
    }
}

async fn reap(workspaces: &WorkspaceManager, path: &Path) {
    match workspaces.destroy_path(path).await {
        Ok(true) => {
            info!("Removed folder: {:?}", path);
            observability::record_workspace_reaped();
        }
        Ok(false) => debug!("Folder {:?} was already removed", path),
        Err(e) => error!("Error removing folder {:?}: {}", path, e),
    }
}

/// Time since `modified`; timestamps in the future count as zero
fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}
