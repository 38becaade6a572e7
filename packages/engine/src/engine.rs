// packages/engine/src/engine.rs
//! Engine context
//!
//! Owns every long-lived component and wires them together from one
//! [`EngineConfig`]. There is no global state: callers hold an `Engine` and
//! reach the dispatcher through it.

use crate::runtime::dispatcher::{Dispatcher, DispatcherSettings};
use crate::runtime::handler::JobHandler;
use crate::runtime::job::Deadline;
use crate::runtime::liveness::LivenessQuery;
use crate::runtime::process_manager::ProcessManager;
use crate::runtime::reaper::{DelayedTeardown, Reaper, RecoveryReport};
use crate::runtime::sandbox::Sandbox;
use crate::runtime::version_probe::VersionProbe;
use crate::runtime::worker_pool::WorkerPool;
use crate::runtime::workspace::WorkspaceManager;
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Running engine
pub struct Engine {
    config: EngineConfig,
    workspaces: Arc<WorkspaceManager>,
    reaper: Arc<Reaper>,
    dispatcher: Dispatcher,
    recovery: RecoveryReport,
}

impl Engine {
    /// Build all components and recover workspaces left by a previous run.
    /// Must be called within a Tokio runtime.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let workspaces = Arc::new(WorkspaceManager::new(&config.sandbox.volume_root).await?);
        let sandbox = Arc::new(Sandbox::new(config.sandbox.clone())?);
        let processes = Arc::new(ProcessManager::new());

        let reaper = Arc::new(Reaper::start(Arc::clone(&workspaces)));
        let grace = config.reaper.grace_window();
        let recovery = reaper.recover(grace, Self::orphan_age(&config)).await?;

        let probe = Arc::new(VersionProbe::new(
            Arc::clone(&sandbox),
            Arc::clone(&processes),
            config.tools.clone(),
            config.limits.probe_timeout(),
        ));

        let teardown: Arc<dyn DelayedTeardown> = reaper.clone();
        let handler = Arc::new(JobHandler::new(
            Arc::clone(&workspaces),
            sandbox,
            processes,
            teardown,
            Arc::clone(&probe),
            config.tools.clone(),
            grace,
        ));

        let dispatcher = Dispatcher::new(
            handler,
            WorkerPool::new(config.runtime.pool_size),
            LivenessQuery::new(Arc::clone(&workspaces), grace),
            probe,
            DispatcherSettings {
                deadline: Deadline {
                    soft: config.limits.soft_timeout(),
                    hard: config.limits.hard_timeout(),
                },
                sync_wait: Duration::from_secs(config.runtime.sync_wait_secs),
                retention: Duration::from_secs(config.runtime.result_retention_secs),
            },
        );

        info!(
            "Engine started: {:?} isolation, volume {:?}, {} workers",
            config.sandbox.isolation, config.sandbox.volume_root, config.runtime.pool_size
        );

        Ok(Self {
            config,
            workspaces,
            reaper,
            dispatcher,
            recovery,
        })
    }

    /// Workspaces without a completion marker older than this are leftovers
    /// of a crashed run
    fn orphan_age(config: &EngineConfig) -> Duration {
        config.limits.hard_timeout() + config.reaper.grace_window()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// What the startup recovery sweep did
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Run the recovery sweep again
    pub async fn sweep(&self) -> Result<RecoveryReport> {
        self.reaper
            .recover(self.config.reaper.grace_window(), Self::orphan_age(&self.config))
            .await
    }

    /// Cancel running jobs and stop the reaper. Pending teardowns are
    /// picked up by the next start's recovery sweep.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.reaper.shutdown().await;
        info!("Engine stopped");
    }
}
