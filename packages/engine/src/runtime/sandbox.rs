// packages/engine/src/runtime/sandbox.rs
//! Sandbox for isolating tool processes
//!
//! Tools run inside a long-lived container that shares the work volume with
//! the engine. A job is executed with `<runtime> exec --user <uid>:<gid>
//! <container> <tool> <args>`, so files written by the tool are owned by the
//! engine's own identity on the host side.
//!
//! Paths handed to the tool are relative to the volume root (`{job_id}/input.pdb`).
//! In container mode the container's working directory is the volume mount;
//! in host mode the tool is started with the volume root as its cwd.

use crate::utils::config::ToolSpec;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// How tool processes are isolated from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// `<runtime> exec` into a running container
    Container,
    /// Run the tool directly on the host (development and tests)
    Host,
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub isolation: IsolationMode,

    /// Container runtime binary
    pub runtime: String,

    /// Name of the container hosting the tools
    pub container: String,

    /// Shared work volume, as seen from the engine
    pub volume_root: PathBuf,

    /// `uid:gid` override; defaults to the engine's own identity
    pub user: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Container,
            runtime: "docker".to_string(),
            container: "tpproject-tpp-1".to_string(),
            volume_root: PathBuf::from("/tmp/work"),
            user: None,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.isolation == IsolationMode::Container {
            if self.runtime.is_empty() {
                return Err(EngineError::ConfigError(
                    "sandbox.runtime cannot be empty".to_string(),
                ));
            }
            if self.container.is_empty() {
                return Err(EngineError::ConfigError(
                    "sandbox.container cannot be empty".to_string(),
                ));
            }
        }

        if let Some(user) = &self.user {
            user.parse::<UserIdentity>()?;
        }

        Ok(())
    }
}

/// Numeric user/group identity passed across the sandbox boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl UserIdentity {
    /// Identity of the running engine process
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

impl FromStr for UserIdentity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::ConfigError(format!("Invalid uid:gid '{}'", s));

        let (uid, gid) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            uid: uid.trim().parse().map_err(|_| invalid())?,
            gid: gid.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// A fully resolved command line, ready for the process manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl SandboxedCommand {
    /// Human-readable command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Wraps tool invocations into the configured isolation context
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    identity: UserIdentity,
}

impl Sandbox {
    /// Create a new sandbox
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;

        let identity = match &config.user {
            Some(user) => user.parse()?,
            None => UserIdentity::current(),
        };

        debug!(
            "Sandbox configured: {:?} isolation, identity {}",
            config.isolation, identity
        );

        Ok(Self { config, identity })
    }

    /// Build the command line that runs `tool` with `args` inside the sandbox
    pub fn command(&self, tool: &ToolSpec, args: &[String]) -> SandboxedCommand {
        match self.config.isolation {
            IsolationMode::Container => {
                let mut argv = vec![
                    "exec".to_string(),
                    "--user".to_string(),
                    self.identity.to_string(),
                    self.config.container.clone(),
                    tool.program.clone(),
                ];
                argv.extend(tool.args.iter().cloned());
                argv.extend(args.iter().cloned());

                SandboxedCommand {
                    program: self.config.runtime.clone(),
                    args: argv,
                    cwd: None,
                }
            }
            IsolationMode::Host => {
                let mut argv = tool.args.clone();
                argv.extend(args.iter().cloned());

                SandboxedCommand {
                    program: tool.program.clone(),
                    args: argv,
                    cwd: Some(self.config.volume_root.clone()),
                }
            }
        }
    }
}
