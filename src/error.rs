//! Error types for secbench operations.
//!
//! Defines error types for the major subsystems:
//! - Environment provisioning, command execution and teardown
//! - Runner configuration loading
//! - Static analysis (CodeQL + SARIF)

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::runner::EnvironmentState;

/// Errors raised by runners and the environments they manage.
///
/// The runtime outcome of an executed command (non-zero exit, crash) is
/// never represented here; it is reported through the command's exit
/// status on [`crate::runner::CommandStream`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Template error in '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("Failed to provision environment at {}: {reason}", path.display())]
    Provisioning { path: PathBuf, reason: String },

    #[error("Cannot {operation} environment '{environment}' in {state} state")]
    StateViolation {
        environment: String,
        state: EnvironmentState,
        operation: &'static str,
    },

    #[error("Invalid command invocation: {0}")]
    InvalidInvocation(String),

    #[error("Environment root {} is already in use", .0.display())]
    RootInUse(PathBuf),

    #[error("Failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command output exceeded the limit of {limit} bytes")]
    OutputLimitExceeded { limit: usize },

    #[error("Failed to tear down environment at {}: {reason}", path.display())]
    Teardown { path: PathBuf, reason: String },

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Builds a launch error for `command`.
    pub fn launch(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::Launch {
            command: command.into(),
            source,
        }
    }

    /// Returns true for errors produced by a resource limit rather than a fault.
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            RunnerError::Timeout(_) | RunnerError::OutputLimitExceeded { .. }
        )
    }
}

/// Errors that can occur while loading runner configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur while running static analysis.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis tool '{0}' not found on PATH")]
    ToolNotFound(String),

    #[error("Database creation failed: {0}")]
    DatabaseCreation(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SARIF parse error: {0}")]
    Sarif(#[from] serde_json::Error),
}
