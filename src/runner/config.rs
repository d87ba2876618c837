//! Configuration for runners and the environments they create.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::runner::process::ExecLimits;

/// Default per-invocation timeout (30 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// Default output ceiling per invocation (64 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024 * 1024;

/// Configuration shared by the local and Docker runners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory under which named environments are created.
    pub env_root: PathBuf,
    /// Shell that interprets command strings.
    pub shell: String,
    /// Interpreter used to create a virtual environment (e.g. `python3`).
    /// Without one, environments are plain private directories.
    pub interpreter: Option<String>,
    /// Upgrade pip after creating a virtual environment.
    pub upgrade_pip: bool,
    /// Per-invocation timeout in seconds; `None` disables it.
    pub timeout_secs: Option<u64>,
    /// Per-invocation output ceiling in bytes; `None` disables it.
    pub max_output_bytes: Option<usize>,
    /// Resolve the leading program of each local command before launching it.
    pub preflight: bool,
    /// Variables applied to every command.
    pub env: BTreeMap<String, String>,
    /// Docker backend settings.
    pub docker: DockerConfig,
}

impl RunnerConfig {
    /// Creates a configuration with defaults, rooted at `env_root`.
    pub fn new(env_root: impl Into<PathBuf>) -> Self {
        Self {
            env_root: env_root.into(),
            shell: "/bin/sh".to_string(),
            interpreter: None,
            upgrade_pip: true,
            timeout_secs: Some(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: Some(DEFAULT_MAX_OUTPUT_BYTES),
            preflight: true,
            env: BTreeMap::new(),
            docker: DockerConfig::default(),
        }
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make every invocation fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".to_string()));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_output_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "max_output_bytes must be positive".to_string(),
            ));
        }
        if self.docker.image.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "docker.image must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the shell.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Sets the interpreter used to create virtual environments.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    /// Provisions plain directories instead of virtual environments.
    pub fn without_interpreter(mut self) -> Self {
        self.interpreter = None;
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Disables the timeout.
    pub fn without_timeout(mut self) -> Self {
        self.timeout_secs = None;
        self
    }

    /// Sets the output ceiling.
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Enables or disables the preflight program check.
    pub fn with_preflight(mut self, preflight: bool) -> Self {
        self.preflight = preflight;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replaces the Docker settings.
    pub fn with_docker(mut self, docker: DockerConfig) -> Self {
        self.docker = docker;
        self
    }

    /// Limits applied to each invocation.
    pub fn limits(&self) -> ExecLimits {
        ExecLimits {
            timeout: self.timeout_secs.map(Duration::from_secs),
            max_output_bytes: self.max_output_bytes,
        }
    }

    /// Path of the environment called `name` under `env_root`.
    pub fn environment_path(&self, name: &str) -> PathBuf {
        self.env_root.join(sanitize_name(name))
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(".venvs")
    }
}

/// Settings for the Docker backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image used for ephemeral and detached containers.
    pub image: String,
    /// Network mode ("none", "bridge", "host").
    pub network: String,
    /// Working directory inside the container; the environment root is mounted here.
    pub workdir: String,
    /// Additional volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Variables passed with `-e`.
    pub env: BTreeMap<String, String>,
}

impl DockerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            network: "host".to_string(),
            workdir: "/workspace".to_string(),
            volumes: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Disables network access.
    pub fn without_network(mut self) -> Self {
        self.network = "none".to_string();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self::new("python:3.11-slim")
    }
}

/// Volume mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path.
    pub host_path: PathBuf,
    /// Container path.
    pub container_path: PathBuf,
    /// Whether the mount is read-only.
    #[serde(default)]
    pub readonly: bool,
}

impl VolumeMount {
    /// Creates a new read-write volume mount.
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            readonly: false,
        }
    }

    /// Creates a read-only volume mount.
    pub fn readonly(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            readonly: true,
            ..Self::new(host, container)
        }
    }

    /// Returns the `-v` argument for this mount.
    pub fn to_docker_mount(&self) -> String {
        let ro = if self.readonly { ":ro" } else { "" };
        format!(
            "{}:{}{}",
            self.host_path.display(),
            self.container_path.display(),
            ro
        )
    }
}

/// Reduces `name` to characters safe for paths and container names.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('.');
    if trimmed.is_empty() {
        "env".to_string()
    } else {
        trimmed.to_string()
    }
}
