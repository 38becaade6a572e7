// packages/engine/src/runtime/mod.rs
//! Job execution runtime
//!
//! This module provides the job execution and workspace lifecycle, including:
//!
//! - **Dispatcher**: In-process job submission, status and liveness queries
//! - **Worker Pool**: Bounded number of concurrently running jobs
//! - **Job Handler**: One job end to end, from workspace setup to teardown
//! - **Workspace Manager**: Per-job directories on the shared volume
//! - **Sandbox / Process Manager**: Time-bounded tool runs inside the container
//! - **Classifier**: Raw process outcome to tagged job result
//! - **Reaper**: Delayed teardown of workspaces that must stay queryable
//! - **Liveness**: Remaining lifetime of a kept workspace
//! - **Version Probe**: Tool version discovery
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Dispatcher ── WorkerPool(n) ── soft timer ─► cancel token │
//! │      │                                                   │
//! │      ▼                                                   │
//! │ JobHandler                                               │
//! │  ├─ WorkspaceManager   {root}/{job_id}/input.pdb          │
//! │  ├─ Sandbox + ProcessManager   docker exec ... (hard)     │
//! │  ├─ Classifier         ProcessOutcome ─► JobResult        │
//! │  └─ teardown: destroy now | Reaper.schedule(grace)        │
//! │                                                          │
//! │ LivenessQuery ── console_output.log mtime + grace        │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod classifier;
pub mod dispatcher;
pub mod handler;
pub mod job;
pub mod liveness;
pub mod process_manager;
pub mod reaper;
pub mod sandbox;
pub mod version_probe;
pub mod worker_pool;
pub mod workspace;

// Re-export commonly used types
pub use classifier::{classify, Artifact};
pub use dispatcher::{Dispatcher, DispatcherSettings, JobStatus};
pub use handler::{HandledJob, JobHandler};
pub use job::{Deadline, JobContext, JobId, JobKind, JobResult, ToolId};
pub use liveness::{Liveness, LivenessQuery};
pub use process_manager::{ProcessManager, ProcessOutcome};
pub use reaper::{DelayedTeardown, Reaper, RecoveryReport};
pub use sandbox::{IsolationMode, Sandbox, SandboxConfig};
pub use version_probe::{ToolVersion, VersionProbe};
pub use worker_pool::{PoolStats, WorkerPool};
pub use workspace::{Workspace, WorkspaceManager};
