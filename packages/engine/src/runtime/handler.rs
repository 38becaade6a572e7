// packages/engine/src/runtime/handler.rs
//! Job handler
//!
//! Runs one job end to end:
//!
//! ```text
//! create workspace ─► write input ─► run tool ─► read artifact ─► classify
//!                                                                   │
//!                      Renumber: destroy now ◄──────────────────────┤
//!        TopologyBuild: console log + reaper schedule ◄─────────────┘
//! ```
//!
//! Every error on this path ends up as a [`JobResult`] variant; the
//! dispatcher never sees an `Err`.

use crate::observability;
use crate::runtime::classifier::{classify, classify_setup_failure, Artifact};
use crate::runtime::job::{JobContext, JobKind, JobResult, Teardown, ToolId};
use crate::runtime::process_manager::ProcessManager;
use crate::runtime::reaper::DelayedTeardown;
use crate::runtime::sandbox::Sandbox;
use crate::runtime::version_probe::VersionProbe;
use crate::runtime::workspace::{Workspace, WorkspaceManager, CONSOLE_LOG};
use crate::utils::config::{ToolSpec, ToolsConfig};
use crate::utils::errors::EngineError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Result of a handled job plus the workspace left behind, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledJob {
    pub result: JobResult,

    /// Workspace kept on disk for the grace window (deferred kinds only)
    pub workspace: Option<PathBuf>,
}

impl HandledJob {
    fn finished(result: JobResult) -> Self {
        Self {
            result,
            workspace: None,
        }
    }

    fn setup_failure(error: &EngineError) -> Self {
        Self::finished(classify_setup_failure(error))
    }
}

/// Executes jobs against the sandbox
pub struct JobHandler {
    workspaces: Arc<WorkspaceManager>,
    sandbox: Arc<Sandbox>,
    processes: Arc<ProcessManager>,
    teardown: Arc<dyn DelayedTeardown>,
    probe: Arc<VersionProbe>,
    tools: ToolsConfig,
    grace: Duration,
}

impl JobHandler {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        sandbox: Arc<Sandbox>,
        processes: Arc<ProcessManager>,
        teardown: Arc<dyn DelayedTeardown>,
        probe: Arc<VersionProbe>,
        tools: ToolsConfig,
        grace: Duration,
    ) -> Self {
        Self {
            workspaces,
            sandbox,
            processes,
            teardown,
            probe,
            tools,
            grace,
        }
    }

    /// Run the job described by `ctx` with `payload` as input
    pub async fn process(&self, ctx: &JobContext, payload: &str) -> HandledJob {
        let started = Instant::now();

        let handled = match ctx.kind {
            JobKind::VersionProbe => self.probe_version(payload).await,
            JobKind::Renumber | JobKind::TopologyBuild => self.run_tool(ctx, payload).await,
        };

        let elapsed = started.elapsed();
        observability::record_job(ctx.kind.as_str(), handled.result.outcome(), elapsed);
        info!(
            job_id = %ctx.id,
            kind = %ctx.kind,
            outcome = handled.result.outcome(),
            "Job finished in {:.3}s ({:.3}s since submission)",
            elapsed.as_secs_f64(),
            ctx.age().as_secs_f64()
        );

        handled
    }

    async fn run_tool(&self, ctx: &JobContext, payload: &str) -> HandledJob {
        let kind = ctx.kind;
        let (Some(input), Some(output)) = (kind.input_artifact(), kind.output_artifact()) else {
            return HandledJob::setup_failure(&EngineError::RuntimeError(format!(
                "{} jobs do not run in a workspace",
                kind
            )));
        };

        let workspace = match self.workspaces.create(&ctx.id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(job_id = %ctx.id, "{}", e);
                return HandledJob::setup_failure(&e);
            }
        };

        // write_input removes the workspace itself on failure
        if let Err(e) = self.workspaces.write_input(&workspace, input, payload).await {
            error!(job_id = %ctx.id, "{}", e);
            return HandledJob::setup_failure(&e);
        }

        let (tool, args) = self.invocation(kind, &workspace);
        let command = self.sandbox.command(tool, &args);
        info!(job_id = %ctx.id, "Running command: {}", command.display());

        let outcome = self.processes.run(&command, ctx.deadline.hard, &ctx.cancel).await;

        let artifact = if outcome.exited_successfully() {
            match self.workspaces.read_output(&workspace, output).await {
                Ok(bytes) => Artifact::Present(bytes),
                Err(EngineError::OutputMissing(path)) => {
                    warn!(job_id = %ctx.id, "Expected output {:?} was not written", path);
                    Artifact::Missing {
                        name: output.to_string(),
                    }
                }
                Err(e) => {
                    error!(job_id = %ctx.id, "Failed to read {}: {}", output, e);
                    Artifact::Missing {
                        name: output.to_string(),
                    }
                }
            }
        } else {
            Artifact::Missing {
                name: output.to_string(),
            }
        };

        let console = outcome.output().to_string();
        let result = classify(outcome, artifact);

        match kind.teardown() {
            Teardown::Immediate => {
                if let Err(e) = self.workspaces.destroy(&workspace).await {
                    warn!(job_id = %ctx.id, "Failed to remove workspace: {}", e);
                }
                HandledJob::finished(result)
            }
            Teardown::Deferred => {
                let console = if result.is_success() {
                    console
                } else {
                    result.diagnostics().to_string()
                };
                self.complete_deferred(&workspace, &console).await;

                let path = workspace.path().to_path_buf();
                if let Err(e) = self.teardown.schedule(path.clone(), self.grace) {
                    error!(job_id = %ctx.id, "Failed to schedule workspace removal: {}", e);
                }

                HandledJob {
                    result,
                    workspace: Some(path),
                }
            }
        }
    }

    /// Tool and job-specific arguments; paths are relative to the volume root
    fn invocation(&self, kind: JobKind, workspace: &Workspace) -> (&ToolSpec, Vec<String>) {
        let mut args = vec!["-i".to_string(), workspace.relative("input.pdb")];

        match kind {
            JobKind::TopologyBuild => {
                args.extend([
                    "-o".to_string(),
                    workspace.relative("output.itp"),
                    "-l".to_string(),
                    workspace.relative("lack.itp"),
                    "-m".to_string(),
                    "--separate".to_string(),
                    "-f".to_string(),
                    self.tools.force_field.clone(),
                ]);
                (&self.tools.topology, args)
            }
            JobKind::Renumber | JobKind::VersionProbe => {
                args.extend(["-o".to_string(), workspace.relative("output.pdb")]);
                (&self.tools.renumber, args)
            }
        }
    }

    /// Leave the completion marker behind and collect the tool's log file.
    ///
    /// The console log is written last: its mtime starts the grace window.
    async fn complete_deferred(&self, workspace: &Workspace, console: &str) {
        let job_id = workspace.job_id();
        let tool_log = self.workspaces.root().join(&self.tools.topology_log);

        match self
            .workspaces
            .relocate_into(workspace, &tool_log, &self.tools.topology_log)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job_id, "Tool log {:?} not found", tool_log),
            Err(e) => warn!(job_id = %job_id, "Failed to move tool log {:?}: {}", tool_log, e),
        }

        if let Err(e) = self
            .workspaces
            .write_artifact(workspace, CONSOLE_LOG, console.as_bytes())
            .await
        {
            error!(job_id = %job_id, "Failed to write {}: {}", CONSOLE_LOG, e);
        }
    }

    /// Version probes take the program name as payload and answer with the
    /// JSON-encoded version, or `null` when it cannot be determined.
    async fn probe_version(&self, payload: &str) -> HandledJob {
        let tool = match payload.parse::<ToolId>() {
            Ok(tool) => tool,
            Err(message) => return HandledJob::finished(JobResult::SetupError { message }),
        };

        let version = self.probe.probe(tool).await;

        match serde_json::to_vec(&version) {
            Ok(output) => HandledJob::finished(JobResult::Success {
                output,
                diagnostics: String::new(),
            }),
            Err(e) => HandledJob::finished(JobResult::SetupError {
                message: format!("Failed to encode version: {}", e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::job::{Deadline, JobId, SOFT_TIMEOUT_MESSAGE};
    use crate::runtime::process_manager::{DIAGNOSTIC_LINE_LIMIT, HARD_TIMEOUT_EXIT_CODE};
    use crate::runtime::sandbox::{IsolationMode, SandboxConfig};
    use crate::utils::errors::Result;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingTeardown {
        calls: Mutex<Vec<(PathBuf, Duration)>>,
    }

    impl RecordingTeardown {
        fn calls(&self) -> Vec<(PathBuf, Duration)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DelayedTeardown for RecordingTeardown {
        fn schedule(&self, workspace: PathBuf, delay: Duration) -> Result<()> {
            self.calls.lock().unwrap().push((workspace, delay));
            Ok(())
        }
    }

    const PDB: &str = "HETATM    1  C1  UNL     1       0.931   0.039  -0.043  1.00  0.00           C\nEND\n";

    fn fake(script: &str, name: &str) -> ToolSpec {
        ToolSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), name.to_string()],
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        workspaces: Arc<WorkspaceManager>,
        teardown: Arc<RecordingTeardown>,
        handler: JobHandler,
    }

    async fn fixture(renumber: &str, topology: &str) -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().join("work");
        let workspaces = Arc::new(WorkspaceManager::new(&root).await.unwrap());

        let sandbox = Arc::new(
            Sandbox::new(SandboxConfig {
                isolation: IsolationMode::Host,
                volume_root: root.clone(),
                ..Default::default()
            })
            .unwrap(),
        );
        let processes = Arc::new(ProcessManager::new());
        let tools = ToolsConfig {
            renumber: fake(renumber, "tpprenum"),
            topology: fake(topology, "runtppmktop.sh"),
            ..Default::default()
        };
        let probe = Arc::new(VersionProbe::new(
            Arc::clone(&sandbox),
            Arc::clone(&processes),
            tools.clone(),
            Duration::from_secs(10),
        ));
        let teardown = Arc::new(RecordingTeardown::default());

        let handler = JobHandler::new(
            Arc::clone(&workspaces),
            sandbox,
            processes,
            teardown.clone(),
            probe,
            tools,
            Duration::from_secs(300),
        );

        Fixture {
            _dir: dir,
            root,
            workspaces,
            teardown,
            handler,
        }
    }

    fn context(kind: JobKind) -> JobContext {
        JobContext::new(
            JobId::generate(),
            kind,
            Deadline {
                soft: Duration::from_secs(10),
                hard: Duration::from_secs(20),
            },
        )
    }

    fn workspace_count(root: &Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count()
    }

    #[tokio::test]
    async fn test_renumber_success_returns_output_and_removes_workspace() {
        let fx = fixture(r#"cp "$2" "$4" && echo "renumbered $2""#, "exit 9").await;
        let ctx = context(JobKind::Renumber);

        let handled = fx.handler.process(&ctx, PDB).await;

        assert!(handled.result.is_success(), "{:?}", handled.result);
        assert_eq!(handled.result.output(), Some(PDB.as_bytes()));
        assert_eq!(
            handled.result.diagnostics(),
            format!("renumbered {}/input.pdb", ctx.id)
        );
        assert_eq!(handled.workspace, None);
        assert!(!fx.workspaces.path_for(&ctx.id).exists());
        assert!(fx.teardown.calls().is_empty());
    }

    #[tokio::test]
    async fn test_renumber_failure_truncates_diagnostics() {
        let fx = fixture(
            r#"i=1; while [ $i -le 80 ]; do echo "line $i"; i=$((i+1)); done; exit 1"#,
            "exit 9",
        )
        .await;
        let ctx = context(JobKind::Renumber);

        let handled = fx.handler.process(&ctx, PDB).await;

        match &handled.result {
            JobResult::ToolFailure { exit_code, diagnostics } => {
                assert_eq!(*exit_code, 1);
                let lines: Vec<&str> = diagnostics.split('\n').collect();
                assert!(lines.len() <= DIAGNOSTIC_LINE_LIMIT);
                assert_eq!(lines.last(), Some(&"line 79"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(workspace_count(&fx.root), 0);
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_is_failure() {
        let fx = fixture("echo nothing written", "exit 9").await;
        let ctx = context(JobKind::Renumber);

        let handled = fx.handler.process(&ctx, PDB).await;

        match handled.result {
            JobResult::ToolFailure { exit_code, .. } => assert_eq!(exit_code, 0),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(workspace_count(&fx.root), 0);
    }

    #[tokio::test]
    async fn test_soft_timeout_cancels_and_cleans_up() {
        let fx = fixture("sleep 30", "exit 9").await;
        let ctx = context(JobKind::Renumber);

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let handled = fx.handler.process(&ctx, PDB).await;

        assert_eq!(
            handled.result,
            JobResult::SoftTimeout {
                message: SOFT_TIMEOUT_MESSAGE.to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(workspace_count(&fx.root), 0);
    }

    #[tokio::test]
    async fn test_hard_timeout() {
        let fx = fixture("sleep 30", "exit 9").await;
        let mut ctx = context(JobKind::Renumber);
        ctx.deadline.hard = Duration::from_millis(300);

        let handled = fx.handler.process(&ctx, PDB).await;

        match handled.result {
            JobResult::ToolFailure { exit_code, .. } => assert_eq!(exit_code, HARD_TIMEOUT_EXIT_CODE),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(workspace_count(&fx.root), 0);
    }

    #[tokio::test]
    async fn test_existing_workspace_is_setup_error() {
        let fx = fixture(r#"cp "$2" "$4""#, "exit 9").await;
        let ctx = context(JobKind::Renumber);
        std::fs::create_dir(fx.workspaces.path_for(&ctx.id)).unwrap();

        let handled = fx.handler.process(&ctx, PDB).await;

        assert_eq!(handled.result.outcome(), "setup_error");
        assert!(handled.result.diagnostics().contains("calc-folder"));
        // the directory belongs to someone else and is left alone
        assert!(fx.workspaces.path_for(&ctx.id).exists());
    }

    #[tokio::test]
    async fn test_topology_success_keeps_workspace() {
        let script = r#"
            [ "$5" = "-l" ] && [ "$7" = "-m" ] && [ "$8" = "--separate" ] \
                && [ "$9" = "-f" ] && [ "${10}" = "OPLS-AA" ] || exit 3
            printf '[ moleculetype ]' > "$4"
            echo "tool log" > tppmktop.log
            echo "topology built"
        "#;
        let fx = fixture("exit 9", script).await;
        let ctx = context(JobKind::TopologyBuild);

        let handled = fx.handler.process(&ctx, PDB).await;

        assert!(handled.result.is_success(), "{:?}", handled.result);
        assert_eq!(handled.result.output(), Some(&b"[ moleculetype ]"[..]));

        let path = fx.workspaces.path_for(&ctx.id);
        assert_eq!(handled.workspace.as_deref(), Some(path.as_path()));
        assert!(path.join("input.pdb").exists());
        assert_eq!(
            std::fs::read_to_string(path.join(CONSOLE_LOG)).unwrap(),
            "topology built"
        );
        assert!(path.join("tppmktop.log").exists());
        assert!(!fx.root.join("tppmktop.log").exists());

        assert_eq!(fx.teardown.calls(), vec![(path, Duration::from_secs(300))]);
    }

    #[tokio::test]
    async fn test_topology_failure_keeps_workspace_with_diagnostics() {
        let fx = fixture("exit 9", "echo 'unknown residue UNL'; exit 2").await;
        let ctx = context(JobKind::TopologyBuild);

        let handled = fx.handler.process(&ctx, PDB).await;

        match &handled.result {
            JobResult::ToolFailure { exit_code, diagnostics } => {
                assert_eq!(*exit_code, 2);
                assert_eq!(diagnostics, "unknown residue UNL");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let path = handled.workspace.clone().unwrap();
        assert_eq!(
            std::fs::read_to_string(path.join(CONSOLE_LOG)).unwrap(),
            "unknown residue UNL"
        );
        assert_eq!(fx.teardown.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_topology_soft_timeout_writes_marker() {
        let fx = fixture("exit 9", "sleep 30").await;
        let ctx = context(JobKind::TopologyBuild);
        ctx.cancel.cancel();

        let handled = fx.handler.process(&ctx, PDB).await;

        assert_eq!(handled.result.outcome(), "soft_timeout");
        let path = handled.workspace.unwrap();
        assert_eq!(
            std::fs::read_to_string(path.join(CONSOLE_LOG)).unwrap(),
            SOFT_TIMEOUT_MESSAGE
        );
    }

    #[tokio::test]
    async fn test_version_probe_job() {
        let fx = fixture(
            r#"[ "$1" = "-h" ] && echo "TPP version: 3.1, 2024""#,
            "exit 1",
        )
        .await;

        let handled = fx.handler.process(&context(JobKind::VersionProbe), "tpprenum").await;
        let version: serde_json::Value =
            serde_json::from_slice(handled.result.output().unwrap()).unwrap();
        assert_eq!(version["major"], "3.1");
        assert_eq!(version["minor"], "2024");

        let handled = fx.handler.process(&context(JobKind::VersionProbe), "tppmktop").await;
        assert_eq!(handled.result.output(), Some(&b"null"[..]));

        let handled = fx.handler.process(&context(JobKind::VersionProbe), "gromacs").await;
        assert_eq!(handled.result.outcome(), "setup_error");

        assert_eq!(workspace_count(&fx.root), 0);
    }
}
