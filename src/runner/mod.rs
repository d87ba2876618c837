//! Sandboxed execution runner for benchmark evaluation.
//!
//! This module provisions isolated environments, executes untrusted,
//! model-generated code and shell commands inside them, streams output
//! line by line, and tears the environments down afterward.
//!
//! # Architecture
//!
//! ```text
//! setup (run_detached) → exec_command* → remove
//!        │                     │
//!    Environment          CommandStream (lines, then exit status)
//! ```
//!
//! Two backends are provided: [`LocalRunner`] (host shell plus a private
//! directory or virtual environment) and [`DockerRunner`] (a detached
//! container driven through the `docker` CLI).
//!
//! # Example
//!
//! ```ignore
//! use secbench::runner::{EnvironmentSession, LocalRunner, RunnerConfig};
//!
//! let runner = LocalRunner::new("local", "{{ target }}", RunnerConfig::default());
//! let session = EnvironmentSession::open(&runner, "t1", ".test_env".as_ref()).await?;
//!
//! let mut stream = session.exec("pip install -r requirements.txt").await?;
//! while let Some(line) = stream.next_line().await {
//!     println!("[t1] {}", line?);
//! }
//! println!("exit code: {:?}", stream.exit_code());
//!
//! session.close().await?;
//! ```

pub mod config;
pub mod docker;
pub mod environment;
pub mod local;
mod ownership;
pub mod process;
pub mod session;
pub mod template;

use std::path::Path;

use async_trait::async_trait;

use crate::error::RunnerError;

pub use config::{DockerConfig, RunnerConfig, VolumeMount};
pub use docker::DockerRunner;
pub use environment::{CommandInvocation, Environment, EnvironmentState};
pub use local::LocalRunner;
pub use process::{CommandOutput, CommandStream, ExecLimits, ProcessSpec};
pub use session::EnvironmentSession;
pub use template::{CommandTemplate, TemplateParams};

/// Executes a templated command and streams its output.
///
/// Implementations spawn exactly one child per call and never retry.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Returns the runner's name.
    fn name(&self) -> &str;

    /// Returns the command template bound to this runner.
    fn template(&self) -> &CommandTemplate;

    /// Renders the template for `target` and launches it.
    ///
    /// # Errors
    ///
    /// `RunnerError::Template` if rendering fails (nothing is spawned) and
    /// `RunnerError::Launch` if the process cannot be started.
    async fn run(
        &self,
        target: &str,
        params: &TemplateParams,
    ) -> Result<CommandStream, RunnerError>;
}

/// Manages the lifecycle of environments and executes commands in them.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    /// Creates and sets up an environment called `name` rooted at `workdir`.
    async fn run_detached(&self, name: &str, workdir: &Path) -> Result<Environment, RunnerError> {
        let mut environment = Environment::new(name, workdir);
        self.setup(&mut environment).await?;
        Ok(environment)
    }

    /// Moves `environment` from uninitialized to active.
    ///
    /// Calling this on an already active environment is a no-op.
    async fn setup(&self, environment: &mut Environment) -> Result<(), RunnerError>;

    /// Launches one command inside an active environment.
    ///
    /// # Errors
    ///
    /// `RunnerError::StateViolation` unless `environment` is active.
    async fn exec_command(
        &self,
        environment: &Environment,
        invocation: CommandInvocation,
    ) -> Result<CommandStream, RunnerError>;

    /// Stops background activity without removing the environment.
    async fn stop(&self, _environment: &Environment) -> Result<(), RunnerError> {
        Ok(())
    }

    /// Removes the environment's artifacts. Safe to call more than once.
    async fn remove(&self, environment: &mut Environment) -> Result<(), RunnerError>;

    /// Synchronous form of [`SessionRunner::remove`], usable from `Drop`.
    fn remove_blocking(&self, environment: &mut Environment) -> Result<(), RunnerError>;
}
