// packages/engine/src/lib.rs
//! TPP Job Engine Library
//!
//! This library runs the TPP structure tools (`tpprenum`, `tppmktop`) as
//! isolated, time-bounded jobs and manages the on-disk workspaces they use.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **engine**: The `Engine` context that wires every component together
//! - **runtime**: Dispatching, sandboxed execution, workspaces, teardown
//! - **observability**: Tracing subscriber and Prometheus metrics
//! - **utils**: Configuration and error types

// Public module exports
pub mod engine;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use engine::Engine;
pub use runtime::dispatcher::{Dispatcher, JobStatus};
pub use runtime::job::{JobId, JobKind, JobResult};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
