//! Command templates resolved into concrete shell command strings.
//!
//! Templates use Tera (Jinja2-style) placeholders. The runner's target is
//! always available as `{{ target }}`; every other placeholder must be
//! supplied through [`TemplateParams`].

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

use crate::error::RunnerError;

/// Name under which the run target is bound in the template context.
pub const TARGET_KEY: &str = "target";

/// Named parameters substituted into a [`CommandTemplate`].
#[derive(Debug, Clone, Default)]
pub struct TemplateParams {
    context: Context,
}

impl TemplateParams {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, returning the updated set.
    pub fn with<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds a parameter in place.
    pub fn insert<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) {
        self.context.insert(key, value);
    }

    /// Returns true if a parameter with this name is set.
    pub fn contains(&self, key: &str) -> bool {
        self.context.contains_key(key)
    }
}

/// A parametrized command string bound to a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate {
    source: String,
}

impl CommandTemplate {
    /// Creates a template from its source text.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Returns the raw template text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Resolves the template into a command string.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Template` if a placeholder has no value, the
    /// template does not parse, or the rendered command is blank.
    pub fn render(&self, target: &str, params: &TemplateParams) -> Result<String, RunnerError> {
        let mut context = params.context.clone();
        context.insert(TARGET_KEY, target);

        let rendered = Tera::one_off(&self.source, &context, false).map_err(|e| {
            RunnerError::Template {
                template: self.source.clone(),
                reason: error_chain(&e),
            }
        })?;

        if rendered.trim().is_empty() {
            return Err(RunnerError::Template {
                template: self.source.clone(),
                reason: "rendered command is empty".to_string(),
            });
        }

        Ok(rendered)
    }
}

impl From<&str> for CommandTemplate {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for CommandTemplate {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl std::fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Flattens a Tera error and its sources into one line.
fn error_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
