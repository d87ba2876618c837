//! Scoped environments that are torn down on every exit path.

use std::path::Path;

use tracing::error;

use super::{CommandInvocation, CommandStream, Environment, SessionRunner};
use crate::error::RunnerError;

/// An active environment bound to the runner that owns it.
///
/// Call [`EnvironmentSession::close`] to observe teardown errors. If the
/// session is dropped instead (early return, `?`, panic), the environment
/// is removed synchronously and failures are logged.
pub struct EnvironmentSession<'r, R: SessionRunner + ?Sized> {
    runner: &'r R,
    environment: Option<Environment>,
}

impl<'r, R: SessionRunner + ?Sized> EnvironmentSession<'r, R> {
    /// Sets up an environment called `name` at `workdir`.
    pub async fn open(runner: &'r R, name: &str, workdir: &Path) -> Result<Self, RunnerError> {
        let environment = runner.run_detached(name, workdir).await?;
        Ok(Self {
            runner,
            environment: Some(environment),
        })
    }

    /// Wraps an environment that is already set up.
    pub fn adopt(runner: &'r R, environment: Environment) -> Self {
        Self {
            runner,
            environment: Some(environment),
        }
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    /// Runs one command inside the environment.
    pub async fn exec(
        &self,
        invocation: impl Into<CommandInvocation>,
    ) -> Result<CommandStream, RunnerError> {
        let environment = self.environment.as_ref().ok_or_else(|| {
            RunnerError::InvalidInvocation("session is already closed".to_string())
        })?;
        self.runner
            .exec_command(environment, invocation.into())
            .await
    }

    /// Releases the environment without tearing it down.
    pub fn detach(mut self) -> Option<Environment> {
        self.environment.take()
    }

    /// Tears the environment down and reports the outcome.
    ///
    /// On failure the environment stays with the session, so the removal
    /// is retried when the session is dropped.
    pub async fn close(mut self) -> Result<(), RunnerError> {
        let Some(mut environment) = self.environment.take() else {
            return Ok(());
        };
        match self.runner.remove(&mut environment).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.environment = Some(environment);
                Err(e)
            }
        }
    }
}

impl<R: SessionRunner + ?Sized> Drop for EnvironmentSession<'_, R> {
    fn drop(&mut self) {
        if let Some(mut environment) = self.environment.take() {
            if let Err(e) = self.runner.remove_blocking(&mut environment) {
                error!("Failed to tear down environment {}: {}", environment, e);
            }
        }
    }
}
