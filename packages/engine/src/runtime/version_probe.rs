// packages/engine/src/runtime/version_probe.rs
//! Tool version discovery
//!
//! Runs `<tool> -h` inside the sandbox and looks for a line of the form
//! `TPP version: <major>, <minor>`. Version information is advisory: any
//! failure yields `None`.

use crate::runtime::job::ToolId;
use crate::runtime::process_manager::{ProcessManager, ProcessOutcome};
use crate::runtime::sandbox::Sandbox;
use crate::utils::config::ToolsConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

static VERSION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*TPP version: (.+),\s*(.+)$").expect("version pattern is valid"));

/// Version reported by a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub major: String,
    pub minor: String,
}

/// Find the first version line in tool output
pub fn parse_version(output: &str) -> Option<ToolVersion> {
    output.lines().find_map(|line| {
        VERSION_LINE.captures(line).map(|caps| ToolVersion {
            major: caps[1].to_string(),
            minor: caps[2].to_string(),
        })
    })
}

/// Probes tool versions through the sandbox
pub struct VersionProbe {
    sandbox: Arc<Sandbox>,
    processes: Arc<ProcessManager>,
    tools: ToolsConfig,
    timeout: Duration,
}

impl VersionProbe {
    pub fn new(
        sandbox: Arc<Sandbox>,
        processes: Arc<ProcessManager>,
        tools: ToolsConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            sandbox,
            processes,
            tools,
            timeout,
        }
    }

    /// Version of `tool`, or `None` if it cannot be determined
    pub async fn probe(&self, tool: ToolId) -> Option<ToolVersion> {
        info!("Requesting version for program: {}", tool.name());

        let tool_spec = match tool {
            ToolId::Renumber => &self.tools.renumber,
            ToolId::TopologyBuild => &self.tools.topology,
        };
        let command = self.sandbox.command(tool_spec, &["-h".to_string()]);

        match self
            .processes
            .run(&command, self.timeout, &CancellationToken::new())
            .await
        {
            ProcessOutcome::Exited {
                exit_code: 0,
                output,
            } => {
                let version = parse_version(&output);
                match &version {
                    Some(v) => info!("Found version: {}, {} for program: {}", v.major, v.minor, tool.name()),
                    None => error!("Could not find version information in output:\n{}", output),
                }
                version
            }
            other => {
                error!(
                    "Error running command: {}\nOutcome: {:?}",
                    command.display(),
                    other
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sandbox::{IsolationMode, SandboxConfig};
    use crate::utils::config::ToolSpec;
    use tempfile::tempdir;

    fn probe_with(dir: &std::path::Path, script: &str) -> VersionProbe {
        let sandbox = Sandbox::new(SandboxConfig {
            isolation: IsolationMode::Host,
            volume_root: dir.to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        let tool = ToolSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "tpprenum".to_string()],
        };
        let tools = ToolsConfig {
            renumber: tool.clone(),
            topology: tool,
            ..Default::default()
        };

        VersionProbe::new(
            Arc::new(sandbox),
            Arc::new(ProcessManager::new()),
            tools,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_parse_version_first_match() {
        let output = "Usage: tpprenum -i <in> -o <out>\n  TPP version: 2.1, 17\nTPP version: 9, 9";
        assert_eq!(
            parse_version(output),
            Some(ToolVersion {
                major: "2.1".to_string(),
                minor: "17".to_string()
            })
        );
    }

    #[test]
    fn test_parse_version_absent() {
        assert_eq!(parse_version("Usage: tpprenum\nno version here"), None);
        assert_eq!(parse_version(""), None);
    }

    #[tokio::test]
    async fn test_probe_reads_help_output() {
        let dir = tempdir().unwrap();
        let probe = probe_with(
            dir.path(),
            r#"[ "$1" = "-h" ] || exit 2; echo "Usage: tool"; echo " TPP version: 3, 0rc1""#,
        );

        let version = probe.probe(ToolId::Renumber).await;
        assert_eq!(
            version,
            Some(ToolVersion {
                major: "3".to_string(),
                minor: "0rc1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_probe_failure_is_absent() {
        let dir = tempdir().unwrap();
        let probe = probe_with(dir.path(), "echo 'TPP version: 1, 2'; exit 1");

        assert_eq!(probe.probe(ToolId::TopologyBuild).await, None);
    }

    #[tokio::test]
    async fn test_probe_without_pattern_is_absent() {
        let dir = tempdir().unwrap();
        let probe = probe_with(dir.path(), "echo 'tppmktop, unknown build'");

        assert_eq!(probe.probe(ToolId::TopologyBuild).await, None);
    }
}
