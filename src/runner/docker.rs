//! Docker backend, driven through the `docker` CLI.
//!
//! A detached environment is a long-running container (`tail -f /dev/null`)
//! with the environment root mounted at the configured workdir. Commands run
//! through `docker exec`; one-shot runs use `docker run --rm`. Roots follow
//! the same ownership rules as the local backend.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::sanitize_name;
use super::environment::Activation;
use super::local::{needs_removal, resolve_working_dir};
use super::ownership::{provisioning_error, RootClaim, RootLocks};
use super::process::{self, ExecLimits, ProcessSpec};
use super::{
    CommandInvocation, CommandStream, CommandTemplate, Environment, EnvironmentState, Runner,
    RunnerConfig, SessionRunner, TemplateParams,
};
use crate::error::RunnerError;

/// Runs commands inside Docker containers.
pub struct DockerRunner {
    name: String,
    template: CommandTemplate,
    config: RunnerConfig,
    docker_bin: String,
    roots: RootLocks,
}

impl DockerRunner {
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
            docker_bin: "docker".to_string(),
            roots: RootLocks::default(),
        }
    }

    /// Uses a different `docker` executable (e.g. `podman`).
    pub fn with_docker_bin(mut self, bin: impl Into<String>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Returns true if the docker executable is on `PATH`.
    pub fn is_available(&self) -> bool {
        which::which(&self.docker_bin).is_ok()
    }

    /// Container name for `environment`.
    pub fn container_name(&self, environment: &Environment) -> String {
        let suffix: String = environment
            .id()
            .chars()
            .filter(|c| *c != '-')
            .take(8)
            .collect();
        format!("secbench-{}-{}", sanitize_name(environment.name()), suffix)
    }

    /// Arguments for a one-shot `docker run --rm` of `command`.
    pub fn run_args(&self, command: &str) -> Vec<String> {
        let docker = &self.config.docker;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--network={}", docker.network),
            "-w".to_string(),
            docker.workdir.clone(),
        ];
        self.push_mounts_and_env(&mut args);
        args.push(docker.image.clone());
        args.extend([self.config.shell.clone(), "-c".to_string(), command.to_string()]);
        args
    }

    /// Arguments that start the long-running container for an environment.
    pub fn detached_args(&self, container: &str, host_dir: &Path) -> Vec<String> {
        let docker = &self.config.docker;
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container.to_string(),
            format!("--network={}", docker.network),
            "-v".to_string(),
            format!("{}:{}", host_dir.display(), docker.workdir),
            "-w".to_string(),
            docker.workdir.clone(),
        ];
        self.push_mounts_and_env(&mut args);
        args.extend([
            docker.image.clone(),
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]);
        args
    }

    /// Arguments that run `invocation` inside `container`.
    ///
    /// The command's shell records its pid under `exec_id` so that
    /// [`DockerRunner::kill_args`] can reach it if the stream is abandoned.
    pub fn exec_args(
        &self,
        container: &str,
        invocation: &CommandInvocation,
        exec_id: &str,
    ) -> Result<Vec<String>, RunnerError> {
        let workdir = resolve_working_dir(
            Path::new(&self.config.docker.workdir),
            invocation.working_dir.as_deref(),
        )?;

        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            workdir.display().to_string(),
        ];
        for (key, value) in &invocation.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend([
            container.to_string(),
            self.config.shell.clone(),
            "-c".to_string(),
            format!(r#"echo $$ > {}; exec "$0" -c "$1""#, pid_file(exec_id)),
            self.config.shell.clone(),
            invocation.command.clone(),
        ]);
        Ok(args)
    }

    /// Arguments that kill the exec recorded under `exec_id`, group first.
    pub fn kill_args(&self, container: &str, exec_id: &str) -> Vec<String> {
        let pid_file = pid_file(exec_id);
        vec![
            "exec".to_string(),
            container.to_string(),
            self.config.shell.clone(),
            "-c".to_string(),
            format!(
                "p=$(cat {0} 2>/dev/null) && {{ kill -9 -$p 2>/dev/null || kill -9 $p; }}; rm -f {0}",
                pid_file
            ),
        ]
    }

    fn push_mounts_and_env(&self, args: &mut Vec<String>) {
        for volume in &self.config.docker.volumes {
            args.push("-v".to_string());
            args.push(volume.to_docker_mount());
        }
        let env = self.config.env.iter().chain(self.config.docker.env.iter());
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
    }

    /// Pulls the configured image, logging progress lines as they arrive.
    pub async fn pull_image(&self) -> Result<(), RunnerError> {
        let image = &self.config.docker.image;
        info!("Pulling Docker image {}", image);
        let spec = ProcessSpec::new(&self.docker_bin, vec!["pull".to_string(), image.clone()])
            .with_label(format!("pull {}", image));
        let output = process::spawn(spec, ExecLimits::unlimited())?
            .wait_with_output()
            .await?;
        if !output.success() {
            return Err(RunnerError::Docker(format!(
                "failed to pull {}: {}",
                image,
                output.text()
            )));
        }
        Ok(())
    }

    /// Follows the logs of an environment's container.
    pub fn stream_logs(&self, environment: &Environment) -> Result<CommandStream, RunnerError> {
        environment.ensure_active("stream_logs")?;
        let container = container_of(environment)?;
        let spec = ProcessSpec::new(
            &self.docker_bin,
            vec!["logs".to_string(), "-f".to_string(), container.to_string()],
        )
        .with_label(environment.name());
        process::spawn(spec, ExecLimits::unlimited())
    }

    async fn docker(&self, args: &[String]) -> Result<Output, RunnerError> {
        debug!("{} {}", self.docker_bin, args.join(" "));
        Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RunnerError::launch(format!("{} {}", self.docker_bin, args.join(" ")), e))
    }

    fn docker_blocking(&self, args: &[String]) -> Result<Output, RunnerError> {
        debug!("{} {}", self.docker_bin, args.join(" "));
        std::process::Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RunnerError::launch(format!("{} {}", self.docker_bin, args.join(" ")), e))
    }

    async fn start_container(
        &self,
        environment: &Environment,
        claim: &RootClaim,
    ) -> Result<Activation, RunnerError> {
        let root = claim.root();
        claim.write_marker(environment, false).await?;

        let container = self.container_name(environment);
        info!(
            "Starting container {} from {}",
            container, self.config.docker.image
        );
        let output = self
            .docker(&self.detached_args(&container, root))
            .await
            .map_err(|e| provisioning_error(root, e.to_string()))?;
        check_status(&output).map_err(|stderr| {
            provisioning_error(root, format!("failed to start container: {}", stderr))
        })?;

        let mut activation = Activation::new(root).with_handle(container);
        for (key, value) in self.config.env.iter().chain(self.config.docker.env.iter()) {
            activation = activation.with_var(key.clone(), value.clone());
        }
        Ok(activation)
    }

    fn finish_removal(
        &self,
        environment: &mut Environment,
        rm: Output,
        dir: std::io::Result<()>,
    ) -> Result<(), RunnerError> {
        let root = environment.root().to_path_buf();
        if let Err(stderr) = check_status(&rm) {
            if !stderr.contains("No such container") {
                return Err(RunnerError::Teardown {
                    path: root,
                    reason: format!("failed to remove container: {}", stderr),
                });
            }
            warn!("Container for {} was already gone", environment);
        }

        match dir {
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
impl Runner for DockerRunner {
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
        info!(
            "[{}] Running in {}: {}",
            self.name, self.config.docker.image, command
        );
        let spec = ProcessSpec::new(&self.docker_bin, self.run_args(&command))
            .with_command(&command)
            .with_label(&self.name);
        process::spawn(spec, self.config.limits())
    }
}

#[async_trait]
impl SessionRunner for DockerRunner {
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
        match self.start_container(environment, &claim).await {
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
        let container = container_of(environment)?;
        let exec_id = Uuid::new_v4().simple().to_string();
        let args = self.exec_args(container, &invocation, &exec_id)?;
        let kill = std::iter::once(self.docker_bin.clone())
            .chain(self.kill_args(container, &exec_id))
            .collect();

        info!(
            "Running in container {}: {}",
            container, invocation.command
        );

        let spec = ProcessSpec::new(&self.docker_bin, args)
            .with_command(&invocation.command)
            .with_label(environment.name())
            .with_abort_command(kill);
        process::spawn(
            spec,
            self.config.limits().override_timeout(invocation.timeout),
        )
    }

    async fn stop(&self, environment: &Environment) -> Result<(), RunnerError> {
        let Some(container) = environment.handle() else {
            return Ok(());
        };
        info!("Stopping container {}", container);
        let output = self
            .docker(&["stop".to_string(), container.to_string()])
            .await?;
        match check_status(&output) {
            Ok(()) => Ok(()),
            Err(stderr) if stderr.contains("No such container") => Ok(()),
            Err(stderr) => Err(RunnerError::Docker(format!(
                "failed to stop {}: {}",
                container, stderr
            ))),
        }
    }

    async fn remove(&self, environment: &mut Environment) -> Result<(), RunnerError> {
        if !needs_removal(environment) {
            return Ok(());
        }
        info!("Removing environment {}", environment);
        let container = container_of(environment)?.to_string();
        let rm = self
            .docker(&["rm".to_string(), "-f".to_string(), container])
            .await
            .map_err(|e| teardown_error(environment.root(), e))?;
        let dir = tokio::fs::remove_dir_all(environment.root()).await;
        self.finish_removal(environment, rm, dir)
    }

    fn remove_blocking(&self, environment: &mut Environment) -> Result<(), RunnerError> {
        if !needs_removal(environment) {
            return Ok(());
        }
        info!("Removing environment {}", environment);
        let container = container_of(environment)?.to_string();
        let rm = self
            .docker_blocking(&["rm".to_string(), "-f".to_string(), container])
            .map_err(|e| teardown_error(environment.root(), e))?;
        let dir = std::fs::remove_dir_all(environment.root());
        self.finish_removal(environment, rm, dir)
    }
}

fn container_of(environment: &Environment) -> Result<&str, RunnerError> {
    environment.handle().ok_or_else(|| {
        RunnerError::Docker(format!("environment {} has no container", environment))
    })
}

/// Returns the trimmed stderr of a failed command.
fn check_status(output: &Output) -> Result<(), String> {
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Where an exec's shell records its pid inside the container.
fn pid_file(exec_id: &str) -> String {
    format!("/tmp/.secbench-exec-{}.pid", exec_id)
}

fn teardown_error(path: &Path, err: RunnerError) -> RunnerError {
    RunnerError::Teardown {
        path: PathBuf::from(path),
        reason: err.to_string(),
    }
}
