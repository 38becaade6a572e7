// packages/engine/src/utils/mod.rs
//! Common utilities shared by the runtime
//!
//! - **config**: Layered engine configuration (defaults, TOML file, environment)
//! - **errors**: Engine-wide error type and `Result` alias

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
