//! Local backend: host shell plus a private directory or virtual environment.
//!
//! Each environment is a directory owned by this runner. When an
//! interpreter is configured the directory is also a Python virtual
//! environment, activated per invocation through `VIRTUAL_ENV` and `PATH`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::environment::Activation;
use super::ownership::{self, provisioning_error, RootClaim, RootLocks};
use super::process::{self, ProcessSpec};
use super::{
    CommandInvocation, CommandStream, CommandTemplate, Environment, EnvironmentState, Runner,
    RunnerConfig, SessionRunner, TemplateParams,
};
use crate::error::RunnerError;

pub use super::ownership::MARKER_FILE;

/// Runs commands through the host shell inside private environments.
pub struct LocalRunner {
    name: String,
    template: CommandTemplate,
    config: RunnerConfig,
    roots: RootLocks,
}

impl LocalRunner {
    /// Creates a runner bound to `template`.
    pub fn new(
        name: impl Into<String>,
        template: impl Into<CommandTemplate>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            config,
            roots: RootLocks::default(),
        }
    }

    /// Creates a runner whose template is the bare target.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, "{{ target }}", RunnerConfig::default())
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Sets up an environment called `name` under the configured `env_root`.
    pub async fn run_named(&self, name: &str) -> Result<Environment, RunnerError> {
        let root = self.config.environment_path(name);
        self.run_detached(name, &root).await
    }

    async fn build(
        &self,
        environment: &Environment,
        claim: &RootClaim,
    ) -> Result<Activation, RunnerError> {
        let root = claim.root();
        let bin = root.join("bin");
        tokio::fs::create_dir_all(&bin)
            .await
            .map_err(|e| provisioning_error(root, format!("failed to create directory: {}", e)))?;

        let venv = match &self.config.interpreter {
            Some(interpreter) => {
                if !ownership::is_file(&root.join("pyvenv.cfg")).await {
                    self.create_venv(interpreter, root).await?;
                }
                true
            }
            None => false,
        };
        claim.write_marker(environment, venv).await?;

        let mut activation = Activation::new(root)
            .with_path_prefix(bin)
            .with_var("PYTHONUNBUFFERED", "1");
        if venv {
            activation = activation.with_var("VIRTUAL_ENV", root.display().to_string());
        }
        for (key, value) in &self.config.env {
            activation = activation.with_var(key.clone(), value.clone());
        }
        Ok(activation)
    }

    async fn create_venv(&self, interpreter: &str, root: &Path) -> Result<(), RunnerError> {
        info!(
            "Creating virtual environment at {} using {}",
            root.display(),
            interpreter
        );

        let output = Command::new(interpreter)
            .arg("-m")
            .arg("venv")
            .arg(root)
            .output()
            .await
            .map_err(|e| provisioning_error(root, format!("failed to run {}: {}", interpreter, e)))?;

        if !output.status.success() {
            return Err(provisioning_error(
                root,
                format!(
                    "{} -m venv failed: {}",
                    interpreter,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        if self.config.upgrade_pip {
            let python = root.join("bin").join("python");
            match Command::new(&python)
                .args(["-m", "pip", "install", "--upgrade", "pip"])
                .output()
                .await
            {
                Ok(out) if out.status.success() => debug!("Upgraded pip in {}", root.display()),
                Ok(out) => warn!(
                    "pip upgrade failed in {}: {}",
                    root.display(),
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                Err(e) => warn!("Failed to run pip in {}: {}", root.display(), e),
            }
        }

        Ok(())
    }

    fn complete_removal(
        &self,
        environment: &mut Environment,
        result: std::io::Result<()>,
    ) -> Result<(), RunnerError> {
        let root = environment.root().to_path_buf();
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Environment root {} was already gone", root.display());
            }
            Err(e) => {
                return Err(RunnerError::Teardown {
                    path: root,
                    reason: e.to_string(),
                });
            }
        }

        self.roots.release(&root);
        environment.mark_torn_down();
        info!("Environment {} removed", environment);
        Ok(())
    }
}

#[async_trait]
impl Runner for LocalRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn template(&self) -> &CommandTemplate {
        &self.template
    }

    async fn run(
        &self,
        target: &str,
        params: &TemplateParams,
    ) -> Result<CommandStream, RunnerError> {
        let command = self.template.render(target, params)?;
        let cwd = std::env::current_dir()?;
        let host_path = std::env::var("PATH").ok();
        let env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if self.config.preflight {
            let search_path = self
                .config
                .env
                .get("PATH")
                .map(String::as_str)
                .or(host_path.as_deref());
            process::preflight(&command, &self.config.shell, &env, search_path, &cwd).await?;
        }

        info!("[{}] Running local command: {}", self.name, command);

        let spec = ProcessSpec::shell(&self.config.shell, &command)
            .with_cwd(cwd)
            .with_env(env)
            .with_label(&self.name);
        process::spawn(spec, self.config.limits())
    }
}

#[async_trait]
impl SessionRunner for LocalRunner {
    async fn setup(&self, environment: &mut Environment) -> Result<(), RunnerError> {
        match environment.state() {
            EnvironmentState::Active => {
                debug!("Environment {} is already active", environment);
                return Ok(());
            }
            EnvironmentState::TornDown => {
                return Err(RunnerError::StateViolation {
                    environment: environment.name().to_string(),
                    state: environment.state(),
                    operation: "setup",
                });
            }
            EnvironmentState::Uninitialized => {}
        }

        let root = std::path::absolute(environment.root())
            .map_err(|e| provisioning_error(environment.root(), e.to_string()))?;

        let claim = RootClaim::claim(&root).await?;
        match self.build(environment, &claim).await {
            Ok(activation) => {
                self.roots.hold(claim);
                environment.activate(activation);
                info!("Environment {} is active", environment);
                Ok(())
            }
            Err(e) => {
                claim.rollback().await;
                Err(e)
            }
        }
    }

    async fn exec_command(
        &self,
        environment: &Environment,
        invocation: CommandInvocation,
    ) -> Result<CommandStream, RunnerError> {
        environment.ensure_active("exec_command")?;
        if invocation.command.trim().is_empty() {
            return Err(RunnerError::InvalidInvocation(
                "command is empty".to_string(),
            ));
        }

        let cwd = resolve_working_dir(environment.root(), invocation.working_dir.as_deref())?;
        let host_path = std::env::var("PATH").ok();
        let mut env = environment.command_env(host_path.as_deref());
        env.extend(invocation.env.iter().cloned());

        if self.config.preflight {
            let search_path = env
                .iter()
                .rev()
                .find(|(key, _)| key == "PATH")
                .map(|(_, value)| value.as_str())
                .or(host_path.as_deref());
            process::preflight(
                &invocation.command,
                &self.config.shell,
                &env,
                search_path,
                &cwd,
            )
            .await?;
        }

        info!(
            "Running local command in {}: {}",
            environment, invocation.command
        );

        let spec = ProcessSpec::shell(&self.config.shell, &invocation.command)
            .with_cwd(cwd)
            .with_env(env)
            .with_label(environment.name());
        process::spawn(
            spec,
            self.config.limits().override_timeout(invocation.timeout),
        )
    }

    async fn remove(&self, environment: &mut Environment) -> Result<(), RunnerError> {
        if !needs_removal(environment) {
            return Ok(());
        }
        info!("Removing environment {}", environment);
        let result = tokio::fs::remove_dir_all(environment.root()).await;
        self.complete_removal(environment, result)
    }

    fn remove_blocking(&self, environment: &mut Environment) -> Result<(), RunnerError> {
        if !needs_removal(environment) {
            return Ok(());
        }
        info!("Removing environment {}", environment);
        let result = std::fs::remove_dir_all(environment.root());
        self.complete_removal(environment, result)
    }
}

/// Logs and returns false when `environment` has nothing to remove.
pub(super) fn needs_removal(environment: &Environment) -> bool {
    match environment.state() {
        EnvironmentState::Active => true,
        EnvironmentState::Uninitialized => {
            info!(
                "Environment {} was never set up; nothing to remove",
                environment
            );
            false
        }
        EnvironmentState::TornDown => {
            debug!("Environment {} is already removed", environment);
            false
        }
    }
}

/// Resolves a requested working directory, keeping it inside `root`.
pub(super) fn resolve_working_dir(root: &Path, requested: Option<&Path>) -> Result<PathBuf, RunnerError> {
    let Some(requested) = requested else {
        return Ok(root.to_path_buf());
    };

    if requested
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(RunnerError::InvalidInvocation(format!(
            "working directory {} escapes the environment",
            requested.display()
        )));
    }

    let resolved = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    if !resolved.starts_with(root) {
        return Err(RunnerError::InvalidInvocation(format!(
            "working directory {} is outside {}",
            resolved.display(),
            root.display()
        )));
    }
    Ok(resolved)
}
