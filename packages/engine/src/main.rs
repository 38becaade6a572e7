// packages/engine/src/main.rs
//! TPP Job Engine
//!
//! Command-line front end: runs single jobs through the engine, probes tool
//! versions and sweeps stale workspaces. Results are printed as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tpp_engine::observability::{init_metrics, init_tracing};
use tpp_engine::runtime::job::{JobKind, ToolId};
use tpp_engine::runtime::liveness::Liveness;
use tpp_engine::utils::config::EngineConfig;
use tpp_engine::{Engine, VERSION};
use tracing::info;

/// Slack on top of the hard timeout for output draining and kill grace
const WAIT_SLACK: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "tpp-engine")]
#[command(version, about = "Run TPP tools as isolated, time-bounded jobs", long_about = None)]
#[command(after_help = "EXAMPLES:
    tpp-engine run renumber structure.pdb
    tpp-engine run topology ligand.pdb
    tpp-engine probe tppmktop
    tpp-engine --config /etc/tpp-engine.toml sweep

NOTES:
    A topology workspace outlives this process. Its teardown timer stops when
    the command exits, so the workspace is removed by the first `sweep` (or
    engine start) after its ttl elapses. Schedule `tpp-engine sweep`
    periodically, e.g. from cron, to keep the volume clean.
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $TPP_ENGINE_CONFIG, then ./tpp-engine.toml)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one job and print its result
    Run {
        /// Job kind (renumber, topology)
        #[arg(value_name = "KIND")]
        kind: JobKind,

        /// PDB input file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print the version reported by a tool
    Probe {
        /// Program name (tpprenum, tppmktop)
        #[arg(value_name = "PROGRAM")]
        tool: ToolId,
    },
    /// Remove expired and orphaned workspaces
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(Some(path.as_path())),
        None => EngineConfig::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    info!("Starting TPP engine v{}", VERSION);

    let engine = Engine::start(config).await?;
    let outcome = execute(&engine, cli.command).await;
    engine.shutdown().await;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Run the command; `Ok(false)` means it ran but the job did not succeed
async fn execute(engine: &Engine, command: Commands) -> Result<bool> {
    match command {
        Commands::Run { kind, file } => {
            let payload = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let dispatcher = engine.dispatcher();
            let job_id = dispatcher.submit(kind, payload);
            let handled = dispatcher
                .wait(&job_id, engine.config().limits.hard_timeout() + WAIT_SLACK)
                .await?;

            let ttl = match &handled.workspace {
                // the teardown timer dies with this process; `sweep` removes it later
                Some(_) => dispatcher.liveness(&job_id).await.ok().map(|l| l.as_ttl()),
                None => Some(Liveness::Dead.as_ttl()),
            };

            let report = json!({
                "job_id": job_id,
                "kind": kind,
                "outcome": handled.result.outcome(),
                "output": handled.result.output().map(String::from_utf8_lossy),
                "diagnostics": handled.result.diagnostics(),
                "workspace": handled.workspace,
                "ttl": ttl,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);

            Ok(handled.result.is_success())
        }
        Commands::Probe { tool } => {
            let version = engine.dispatcher().probe_version(tool).await;
            let found = version.is_some();

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "program": tool.name(),
                    "version": version,
                }))?
            );

            Ok(found)
        }
        Commands::Sweep => {
            // the startup recovery already swept; report what it did
            let report = engine.recovery();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "reaped": report.reaped,
                    "rescheduled": report.rescheduled,
                    "orphans_removed": report.orphans_removed,
                }))?
            );

            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_help_points_to_periodic_sweep() {
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("tpp-engine sweep"));
        assert!(help.contains("periodically"));
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from(["tpp-engine", "run", "topology", "ligand.pdb"]).unwrap();
        match cli.command {
            Commands::Run { kind, file } => {
                assert_eq!(kind, JobKind::TopologyBuild);
                assert_eq!(file, PathBuf::from("ligand.pdb"));
            }
            _ => panic!("expected run command"),
        }
    }
}
