// packages/engine/src/runtime/job.rs
//! Job domain types
//!
//! A job id doubles as the name of its workspace directory, so the existence
//! of `{volume_root}/{job_id}` is a proxy for the job's workspace being alive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// User-facing message attached to every soft-timeout result
pub const SOFT_TIMEOUT_MESSAGE: &str =
    "Input is too large to be processed within the current time budget.";

/// Opaque job identifier, unique per submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happens to a job's workspace once the job finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Removed before the result is reported
    Immediate,
    /// Kept for the grace window, then removed by the reaper
    Deferred,
}

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Renumber atoms of a PDB structure; result returned inline
    Renumber,
    /// Build a topology; result directory stays queryable for the grace window
    TopologyBuild,
    /// Query a tool's version; no workspace involved
    VersionProbe,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Renumber => "renumber",
            JobKind::TopologyBuild => "topology_build",
            JobKind::VersionProbe => "version_probe",
        }
    }

    /// Input artifact name, `None` for kinds without a workspace
    pub fn input_artifact(&self) -> Option<&'static str> {
        match self {
            JobKind::Renumber | JobKind::TopologyBuild => Some("input.pdb"),
            JobKind::VersionProbe => None,
        }
    }

    /// Artifact whose presence marks a successful run
    pub fn output_artifact(&self) -> Option<&'static str> {
        match self {
            JobKind::Renumber => Some("output.pdb"),
            JobKind::TopologyBuild => Some("output.itp"),
            JobKind::VersionProbe => None,
        }
    }

    pub fn teardown(&self) -> Teardown {
        match self {
            JobKind::TopologyBuild => Teardown::Deferred,
            JobKind::Renumber | JobKind::VersionProbe => Teardown::Immediate,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "renumber" | "tpprenum" => Ok(JobKind::Renumber),
            "topology" | "topology_build" | "tppmktop" => Ok(JobKind::TopologyBuild),
            "version" | "version_probe" => Ok(JobKind::VersionProbe),
            other => Err(format!("Unknown job kind: {}", other)),
        }
    }
}

/// External tools that can be probed for a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    Renumber,
    TopologyBuild,
}

impl ToolId {
    /// Public program name
    pub fn name(&self) -> &'static str {
        match self {
            ToolId::Renumber => "tpprenum",
            ToolId::TopologyBuild => "tppmktop",
        }
    }
}

impl FromStr for ToolId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "tpprenum" => Ok(ToolId::Renumber),
            "tppmktop" => Ok(ToolId::TopologyBuild),
            other => Err(format!("Unknown program name: {}", other)),
        }
    }
}

/// Soft and hard time limits of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub soft: Duration,
    pub hard: Duration,
}

/// Everything the handler needs to know about the job it is running
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub kind: JobKind,
    /// Submission time; includes time spent waiting for a worker slot
    pub created_at: DateTime<Utc>,
    pub deadline: Deadline,

    /// Fired by the dispatcher when the soft limit elapses or the engine
    /// shuts down
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(id: JobId, kind: JobKind, deadline: Deadline) -> Self {
        Self {
            id,
            kind,
            created_at: Utc::now(),
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Time since submission
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }
}

/// Terminal outcome of a job. Exactly one variant is produced per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    Success {
        output: Vec<u8>,
        diagnostics: String,
    },
    ToolFailure {
        exit_code: i32,
        diagnostics: String,
    },
    SoftTimeout {
        message: String,
    },
    SetupError {
        message: String,
    },
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success { .. })
    }

    /// Output payload, present only on success
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            JobResult::Success { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Human-readable diagnostic text of any variant
    pub fn diagnostics(&self) -> &str {
        match self {
            JobResult::Success { diagnostics, .. } => diagnostics,
            JobResult::ToolFailure { diagnostics, .. } => diagnostics,
            JobResult::SoftTimeout { message } => message,
            JobResult::SetupError { message } => message,
        }
    }

    /// Short label used in logs and metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            JobResult::Success { .. } => "success",
            JobResult::ToolFailure { .. } => "tool_failure",
            JobResult::SoftTimeout { .. } => "soft_timeout",
            JobResult::SetupError { .. } => "setup_error",
        }
    }
}
