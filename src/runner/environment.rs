//! Isolated execution environments and the invocations run inside them.
//!
//! An [`Environment`] is an explicit value: activating it never touches the
//! host process environment. Each invocation receives the variables it
//! needs through [`Environment::command_env`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::RunnerError;

/// Lifecycle state of an [`Environment`].
///
/// ```text
/// Uninitialized → Active → TornDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    /// Created but not yet provisioned.
    Uninitialized,
    /// Provisioned and accepting commands.
    Active,
    /// Removed. Terminal.
    TornDown,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentState::Uninitialized => write!(f, "uninitialized"),
            EnvironmentState::Active => write!(f, "active"),
            EnvironmentState::TornDown => write!(f, "torn-down"),
        }
    }
}

/// One isolated execution context, owned by the runner that set it up.
#[derive(Debug)]
pub struct Environment {
    id: String,
    name: String,
    root: PathBuf,
    state: EnvironmentState,
    vars: BTreeMap<String, String>,
    path_prefix: Vec<PathBuf>,
    handle: Option<String>,
    activated_at: Option<DateTime<Utc>>,
    kept: bool,
}

impl Environment {
    /// Creates an uninitialized environment rooted at `root`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            root: root.into(),
            state: EnvironmentState::Uninitialized,
            vars: BTreeMap::new(),
            path_prefix: Vec::new(),
            handle: None,
            activated_at: None,
            kept: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root directory. Absolute once the environment is active.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == EnvironmentState::Active
    }

    /// Variables applied to every invocation.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Directories prepended to `PATH` for every invocation.
    pub fn path_prefix(&self) -> &[PathBuf] {
        &self.path_prefix
    }

    /// Backend handle, e.g. the container name for Docker environments.
    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.activated_at
    }

    /// Fails with a state violation unless the environment is active.
    pub fn ensure_active(&self, operation: &'static str) -> Result<(), RunnerError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(RunnerError::StateViolation {
                environment: self.name.clone(),
                state: self.state,
                operation,
            })
        }
    }

    /// Computes the variables for one invocation on top of the host `PATH`.
    pub fn command_env(&self, host_path: Option<&str>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if !self.path_prefix.is_empty() {
            let mut entries: Vec<String> = self
                .path_prefix
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            if let Some(host) = host_path.filter(|p| !p.is_empty()) {
                entries.push(host.to_string());
            }
            env.push(("PATH".to_string(), entries.join(":")));
        }

        env
    }

    /// Marks the environment active with its resolved root and context.
    pub(crate) fn activate(&mut self, activation: Activation) {
        self.root = activation.root;
        self.vars = activation.vars;
        self.path_prefix = activation.path_prefix;
        self.handle = activation.handle;
        self.state = EnvironmentState::Active;
        self.activated_at = Some(Utc::now());
    }

    pub(crate) fn mark_torn_down(&mut self) {
        self.state = EnvironmentState::TornDown;
    }

    /// Leaves the environment in place and returns its root.
    pub fn keep(mut self) -> PathBuf {
        self.kept = true;
        std::mem::take(&mut self.root)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.root.display())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.is_active() && !self.kept {
            warn!("Environment {} was not torn down properly", self);
        }
    }
}

/// Context applied when an environment becomes active.
#[derive(Debug, Default)]
pub(crate) struct Activation {
    pub root: PathBuf,
    pub vars: BTreeMap<String, String>,
    pub path_prefix: Vec<PathBuf>,
    pub handle: Option<String>,
}

impl Activation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_path_prefix(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path_prefix.push(dir.into());
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }
}

/// One requested execution inside an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Shell command string, interpreted by the backend's shell.
    pub command: String,
    /// Working directory, relative to the environment root.
    pub working_dir: Option<PathBuf>,
    /// Extra variables; these override the environment's own.
    pub env: Vec<(String, String)>,
    /// Overrides the runner's default timeout.
    pub timeout: Option<Duration>,
}

impl CommandInvocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Sets the working directory.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for CommandInvocation {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for CommandInvocation {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}
