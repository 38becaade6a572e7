// packages/engine/src/runtime/dispatcher.rs
//! In-process job dispatcher
//!
//! Jobs are spawned as Tokio tasks and tracked in an in-memory registry keyed
//! by job id. Each task:
//!
//! 1. waits for a worker slot
//! 2. arms the soft-timeout timer, which fires the job's cancellation token
//! 3. runs the job handler to completion (the handler always returns a result)
//! 4. stores the result in the registry
//!
//! Finished records are kept for the retention window and pruned on later
//! submissions. Ids that were never seen, or were pruned, read as pending.

use crate::runtime::classifier::classify_setup_failure;
use crate::runtime::handler::{HandledJob, JobHandler};
use crate::runtime::job::{Deadline, JobContext, JobId, JobKind, JobResult, ToolId};
use crate::runtime::liveness::{Liveness, LivenessQuery};
use crate::runtime::version_probe::{ToolVersion, VersionProbe};
use crate::runtime::worker_pool::{PoolStats, WorkerPool};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Diagnostics of jobs cut short by `Dispatcher::shutdown`
pub const SHUTDOWN_MESSAGE: &str = "Engine shutting down";

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub deadline: Deadline,

    /// Upper bound on `run_sync`
    pub sync_wait: Duration,

    /// How long finished records stay queryable
    pub retention: Duration,
}

/// Lifecycle of a job in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for a worker slot
    Queued,
    Running,
    Finished(HandledJob),
}

/// Registry entry of one job
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub kind: JobKind,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: JobState,
}

/// Client-facing job status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Success {
        result: Vec<u8>,
        workspace: Option<PathBuf>,
    },
    Failure {
        diagnostics: String,
        workspace: Option<PathBuf>,
    },
}

impl From<&HandledJob> for JobStatus {
    fn from(handled: &HandledJob) -> Self {
        match &handled.result {
            JobResult::Success { output, .. } => JobStatus::Success {
                result: output.clone(),
                workspace: handled.workspace.clone(),
            },
            other => JobStatus::Failure {
                diagnostics: other.diagnostics().to_string(),
                workspace: handled.workspace.clone(),
            },
        }
    }
}

struct Inner {
    handler: Arc<JobHandler>,
    pool: WorkerPool,
    liveness: LivenessQuery,
    probe: Arc<VersionProbe>,
    settings: DispatcherSettings,
    records: DashMap<JobId, JobRecord>,
    shutdown: CancellationToken,
}

/// Submits jobs and answers status queries
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<JobHandler>,
        pool: WorkerPool,
        liveness: LivenessQuery,
        probe: Arc<VersionProbe>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                pool,
                liveness,
                probe,
                settings,
                records: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue a job and return its id immediately. Must be called within a
    /// Tokio runtime.
    pub fn submit(&self, kind: JobKind, payload: impl Into<String>) -> JobId {
        self.prune();

        let job_id = JobId::generate();
        let payload = payload.into();

        self.inner.records.insert(
            job_id.clone(),
            JobRecord {
                kind,
                submitted_at: Utc::now(),
                finished_at: None,
                state: JobState::Queued,
            },
        );
        info!(job_id = %job_id, kind = %kind, "Job submitted ({} bytes)", payload.len());

        let inner = Arc::clone(&self.inner);
        let task_id = job_id.clone();
        tokio::spawn(async move {
            let handled = inner.execute(&task_id, kind, &payload).await;

            if let Some(mut record) = inner.records.get_mut(&task_id) {
                record.finished_at = Some(Utc::now());
                record.state = JobState::Finished(handled);
            }
        });

        job_id
    }

    /// Run a renumber job and wait for its result.
    ///
    /// Waiting longer than the configured sync wait is a server fault and
    /// returns `ExecutionTimeout`; the job itself keeps running to completion.
    pub async fn run_sync(&self, payload: impl Into<String>) -> Result<JobResult> {
        let job_id = self.submit(JobKind::Renumber, payload);
        let handled = self.wait(&job_id, self.inner.settings.sync_wait).await?;
        Ok(handled.result)
    }

    /// Wait until `job_id` finishes or `timeout` elapses
    pub async fn wait(&self, job_id: &JobId, timeout: Duration) -> Result<HandledJob> {
        let started = Instant::now();

        loop {
            match self.inner.records.get(job_id).map(|r| r.state.clone()) {
                Some(JobState::Finished(handled)) => return Ok(handled),
                Some(_) => {}
                None => {
                    return Err(EngineError::RuntimeError(format!(
                        "Job {} not found (may have been pruned)",
                        job_id
                    )))
                }
            }

            if started.elapsed() >= timeout {
                warn!(job_id = %job_id, "Timed out waiting for job after {:?}", timeout);
                return Err(EngineError::ExecutionTimeout);
            }

            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Current status of `job_id`
    pub fn status(&self, job_id: &JobId) -> JobStatus {
        match self.inner.records.get(job_id) {
            Some(record) => match &record.state {
                JobState::Finished(handled) => JobStatus::from(handled),
                JobState::Queued | JobState::Running => JobStatus::Pending,
            },
            None => JobStatus::Pending,
        }
    }

    /// Registry entry of `job_id`, if still retained
    pub fn record(&self, job_id: &JobId) -> Option<JobRecord> {
        self.inner.records.get(job_id).map(|r| r.clone())
    }

    /// Remaining lifetime of `job_id`'s workspace
    pub async fn liveness(&self, job_id: &JobId) -> Result<Liveness> {
        let completed = matches!(
            self.inner.records.get(job_id).map(|r| r.finished_at.is_some()),
            Some(true)
        );
        self.inner.liveness.ttl(job_id, completed).await
    }

    pub async fn probe_version(&self, tool: ToolId) -> Option<ToolVersion> {
        self.inner.probe.probe(tool).await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Cancel running jobs and refuse queued ones. Running jobs finish with a
    /// setup error rather than a soft timeout.
    pub fn shutdown(&self) {
        info!("Dispatcher shutting down");
        self.inner.shutdown.cancel();
        self.inner.pool.close();
    }

    /// Drop finished records older than the retention window
    fn prune(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.inner.settings.retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;

        let before = self.inner.records.len();
        self.inner
            .records
            .retain(|_, record| record.finished_at.map_or(true, |at| at > cutoff));

        let pruned = before.saturating_sub(self.inner.records.len());
        if pruned > 0 {
            debug!("Pruned {} finished job records", pruned);
        }
    }
}

impl Inner {
    async fn execute(&self, job_id: &JobId, kind: JobKind, payload: &str) -> HandledJob {
        let slot = match self.pool.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                warn!(job_id = %job_id, "No worker slot: {}", e);
                return HandledJob {
                    result: classify_setup_failure(&e),
                    workspace: None,
                };
            }
        };

        let mut ctx = JobContext::new(job_id.clone(), kind, self.settings.deadline);
        ctx.cancel = self.shutdown.child_token();

        if let Some(mut record) = self.records.get_mut(job_id) {
            record.state = JobState::Running;
            ctx.created_at = record.submitted_at;
        }
        debug!(job_id = %job_id, slot = slot.id(), "Job running");

        let soft = ctx.deadline.soft;
        let cancel = ctx.cancel.clone();
        let soft_fired = Arc::new(AtomicBool::new(false));
        let fired = Arc::clone(&soft_fired);
        let timer_id = job_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(soft).await;
            info!(job_id = %timer_id, "Soft time limit of {:?} reached", soft);
            fired.store(true, Ordering::SeqCst);
            cancel.cancel();
        });

        let mut handled = self.handler.process(&ctx, payload).await;
        timer.abort();

        // the token also fires on shutdown, which is not the job's fault
        if matches!(handled.result, JobResult::SoftTimeout { .. })
            && !soft_fired.load(Ordering::SeqCst)
            && self.shutdown.is_cancelled()
        {
            warn!(job_id = %job_id, "Job interrupted by engine shutdown");
            handled.result = JobResult::SetupError {
                message: SHUTDOWN_MESSAGE.to_string(),
            };
        }

        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::runtime::job::SOFT_TIMEOUT_MESSAGE;
    use crate::runtime::sandbox::IsolationMode;
    use crate::utils::config::{EngineConfig, ToolSpec};
    use tempfile::tempdir;

    const PDB: &str = "ATOM      1  N   ALA A   1      11.104   6.134  -6.504  1.00  0.00           N\nEND\n";

    fn fake(script: &str, name: &str) -> ToolSpec {
        ToolSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), name.to_string()],
        }
    }

    fn config(root: &std::path::Path, renumber: &str, topology: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.sandbox.isolation = IsolationMode::Host;
        config.sandbox.volume_root = root.to_path_buf();
        config.tools.renumber = fake(renumber, "tpprenum");
        config.tools.topology = fake(topology, "runtppmktop.sh");
        config.runtime.pool_size = 2;
        config.runtime.sync_wait_secs = 20;
        config
    }

    #[tokio::test]
    async fn test_run_sync_renumber() {
        let dir = tempdir().unwrap();
        let engine = Engine::start(config(dir.path(), r#"cp "$2" "$4""#, "exit 1"))
            .await
            .unwrap();

        let result = engine.dispatcher().run_sync(PDB).await.unwrap();
        assert_eq!(result.output(), Some(PDB.as_bytes()));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job_is_pending() {
        let dir = tempdir().unwrap();
        let engine = Engine::start(config(dir.path(), "exit 0", "exit 0")).await.unwrap();

        let id = JobId::from("task-which-doesnot-exist");
        assert_eq!(engine.dispatcher().status(&id), JobStatus::Pending);
        assert_eq!(engine.dispatcher().liveness(&id).await.unwrap(), Liveness::Dead);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_reports_pending_then_failure() {
        let dir = tempdir().unwrap();
        let engine = Engine::start(config(dir.path(), "sleep 1; echo 'bad input'; exit 4", "exit 1"))
            .await
            .unwrap();
        let dispatcher = engine.dispatcher();

        let id = dispatcher.submit(JobKind::Renumber, PDB);
        assert_eq!(dispatcher.status(&id), JobStatus::Pending);

        let handled = dispatcher.wait(&id, Duration::from_secs(20)).await.unwrap();
        assert_eq!(handled.result.outcome(), "tool_failure");
        assert_eq!(
            dispatcher.status(&id),
            JobStatus::Failure {
                diagnostics: "bad input".to_string(),
                workspace: None
            }
        );

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_soft_timeout_through_dispatcher() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), "sleep 30", "exit 1");
        config.limits.soft_timeout_secs = 1;
        config.limits.hard_timeout_secs = 10;
        let engine = Engine::start(config).await.unwrap();

        let started = Instant::now();
        let result = engine.dispatcher().run_sync(PDB).await.unwrap();

        assert_eq!(
            result,
            JobResult::SoftTimeout {
                message: SOFT_TIMEOUT_MESSAGE.to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_secs(9));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_running_job_without_soft_timeout() {
        let dir = tempdir().unwrap();
        let engine = Engine::start(config(dir.path(), "sleep 30", "exit 1")).await.unwrap();
        let dispatcher = engine.dispatcher().clone();

        let id = dispatcher.submit(JobKind::Renumber, PDB);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(dispatcher.record(&id).unwrap().state, JobState::Running);

        let started = Instant::now();
        engine.shutdown().await;
        let handled = dispatcher.wait(&id, Duration::from_secs(20)).await.unwrap();

        assert_eq!(
            handled.result,
            JobResult::SetupError {
                message: SHUTDOWN_MESSAGE.to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_record_timestamps() {
        let dir = tempdir().unwrap();
        let engine = Engine::start(config(dir.path(), r#"cp "$2" "$4""#, "exit 1"))
            .await
            .unwrap();
        let dispatcher = engine.dispatcher();

        let before = Utc::now();
        let id = dispatcher.submit(JobKind::Renumber, PDB);
        let queued = dispatcher.record(&id).unwrap();
        assert!(queued.submitted_at >= before);
        assert_eq!(queued.kind, JobKind::Renumber);

        dispatcher.wait(&id, Duration::from_secs(20)).await.unwrap();
        let finished = dispatcher.record(&id).unwrap();
        assert_eq!(finished.submitted_at, queued.submitted_at);
        assert!(finished.finished_at.unwrap() >= finished.submitted_at);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_wait_exceeded_is_execution_timeout() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), "sleep 3", "exit 1");
        config.runtime.sync_wait_secs = 1;
        let engine = Engine::start(config).await.unwrap();

        let err = engine.dispatcher().run_sync(PDB).await.unwrap_err();
        assert!(matches!(err, EngineError::ExecutionTimeout));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_topology_liveness_lifecycle() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), "exit 1", r#"sleep 1; printf 'itp' > "$4"; echo ok"#);
        config.reaper.grace_window_secs = 2;
        let engine = Engine::start(config).await.unwrap();
        let dispatcher = engine.dispatcher();

        let id = dispatcher.submit(JobKind::TopologyBuild, PDB);

        // running: workspace exists, no console log yet
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(dispatcher.liveness(&id).await.unwrap(), Liveness::Pending);

        dispatcher.wait(&id, Duration::from_secs(20)).await.unwrap();
        let workspace = dir.path().join(id.as_str());
        assert_eq!(
            dispatcher.status(&id),
            JobStatus::Success {
                result: b"itp".to_vec(),
                workspace: Some(workspace.clone())
            }
        );

        let first = dispatcher.liveness(&id).await.unwrap().as_ttl();
        assert!(first > 0.0 && first <= 2.0, "ttl {}", first);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = dispatcher.liveness(&id).await.unwrap().as_ttl();
        assert!(second < first);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!workspace.exists());
        assert_eq!(dispatcher.liveness(&id).await.unwrap(), Liveness::Dead);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrent_jobs() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), r#"sleep 1; cp "$2" "$4""#, "exit 1");
        config.runtime.pool_size = 1;
        let engine = Engine::start(config).await.unwrap();
        let dispatcher = engine.dispatcher();

        let first = dispatcher.submit(JobKind::Renumber, PDB);
        let second = dispatcher.submit(JobKind::Renumber, PDB);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(dispatcher.pool_stats().busy_slots, 1);
        let states = [first.clone(), second.clone()].map(|id| dispatcher.record(&id).unwrap().state);
        assert!(states.contains(&JobState::Queued));
        assert!(states.contains(&JobState::Running));

        dispatcher.wait(&first, Duration::from_secs(20)).await.unwrap();
        dispatcher.wait(&second, Duration::from_secs(20)).await.unwrap();
        assert!(matches!(dispatcher.status(&second), JobStatus::Success { .. }));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_finished_records_are_pruned() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), r#"cp "$2" "$4""#, "exit 1");
        config.runtime.result_retention_secs = 0;
        let engine = Engine::start(config).await.unwrap();
        let dispatcher = engine.dispatcher();

        let first = dispatcher.submit(JobKind::Renumber, PDB);
        dispatcher.wait(&first, Duration::from_secs(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = dispatcher.submit(JobKind::Renumber, PDB);
        assert!(dispatcher.record(&first).is_none());
        assert_eq!(dispatcher.status(&first), JobStatus::Pending);
        assert!(dispatcher.record(&second).is_some());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_version() {
        let dir = tempdir().unwrap();
        let engine = Engine::start(config(dir.path(), "echo 'TPP version: 1.0, 5'", "exit 1"))
            .await
            .unwrap();

        let version = engine.dispatcher().probe_version(ToolId::Renumber).await.unwrap();
        assert_eq!(version.major, "1.0");
        assert_eq!(version.minor, "5");
        assert!(engine.dispatcher().probe_version(ToolId::TopologyBuild).await.is_none());

        engine.shutdown().await;
    }
}
