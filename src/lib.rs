//! secbench: sandboxed execution runner for code security benchmarks.
//!
//! This library provisions isolated environments, runs model-generated code
//! and its tests inside them with streamed output, and tears them down
//! afterward. CodeQL findings can be collected for CWE-based scoring.

pub mod analysis;
pub mod cli;
pub mod error;
pub mod runner;

// Re-export commonly used types
pub use error::{AnalysisError, ConfigError, RunnerError};
pub use runner::{
    CommandInvocation, CommandStream, DockerRunner, Environment, EnvironmentSession,
    EnvironmentState, LocalRunner, Runner, RunnerConfig, SessionRunner,
};
