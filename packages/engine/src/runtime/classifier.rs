// packages/engine/src/runtime/classifier.rs
//! Result classification
//!
//! Pure mapping from a raw process outcome plus the presence of the expected
//! output artifact to a [`JobResult`]. The mapping is total:
//!
//! | outcome                      | artifact | result                        |
//! |------------------------------|----------|-------------------------------|
//! | exit 0                       | present  | `Success`                     |
//! | exit 0                       | missing  | `ToolFailure { exit_code: 0 }`|
//! | exit != 0                    | -        | `ToolFailure { exit_code }`   |
//! | hard timeout                 | -        | `ToolFailure { 124 }`         |
//! | cancelled (soft timeout)     | -        | `SoftTimeout`                 |
//! | could not start              | -        | `ToolFailure { 127 }`         |

use crate::runtime::job::{JobResult, SOFT_TIMEOUT_MESSAGE};
use crate::runtime::process_manager::{
    truncate_diagnostics, ProcessOutcome, HARD_TIMEOUT_EXIT_CODE, SPAWN_FAILURE_EXIT_CODE,
};
use crate::utils::errors::EngineError;

/// Output artifact as observed after the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Present(Vec<u8>),
    Missing { name: String },
}

/// Classify a finished run
pub fn classify(outcome: ProcessOutcome, artifact: Artifact) -> JobResult {
    match outcome {
        ProcessOutcome::Exited {
            exit_code: 0,
            output,
        } => match artifact {
            Artifact::Present(bytes) => JobResult::Success {
                output: bytes,
                diagnostics: output,
            },
            Artifact::Missing { name } => JobResult::ToolFailure {
                exit_code: 0,
                diagnostics: with_header(
                    &format!("Tool exited normally but did not produce {}", name),
                    &output,
                ),
            },
        },
        ProcessOutcome::Exited { exit_code, output } => JobResult::ToolFailure {
            exit_code,
            diagnostics: truncate_diagnostics(&output),
        },
        ProcessOutcome::HardTimeout { output, limit } => JobResult::ToolFailure {
            exit_code: HARD_TIMEOUT_EXIT_CODE,
            diagnostics: with_header(
                &format!("Tool killed after exceeding the hard timeout of {}s", limit.as_secs_f64()),
                &output,
            ),
        },
        ProcessOutcome::Cancelled { .. } => JobResult::SoftTimeout {
            message: SOFT_TIMEOUT_MESSAGE.to_string(),
        },
        ProcessOutcome::Failed { message } => JobResult::ToolFailure {
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            diagnostics: message,
        },
    }
}

/// Classify a failure that happened before the tool could run
pub fn classify_setup_failure(error: &EngineError) -> JobResult {
    JobResult::SetupError {
        message: error.to_string(),
    }
}

/// Prefix truncated tool output with an engine-generated line
fn with_header(header: &str, output: &str) -> String {
    if output.is_empty() {
        return header.to_string();
    }
    // keep the header within the line budget
    let tail = truncate_diagnostics(output);
    let mut lines: Vec<&str> = tail.split('\n').collect();
    if lines.len() >= crate::runtime::process_manager::DIAGNOSTIC_LINE_LIMIT {
        lines.remove(0);
    }
    std::iter::once(header)
        .chain(lines)
        .collect::<Vec<_>>()
        .join("\n")
}
