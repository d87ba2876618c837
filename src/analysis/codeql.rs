//! CodeQL CLI driver.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use super::sarif::{load_sarif_results, FindingsByFile};
use crate::error::AnalysisError;

/// Runs `codeql database create` and `codeql database analyze`.
#[derive(Debug, Clone)]
pub struct CodeQlRunner {
    binary: String,
}

impl CodeQlRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Returns true if the CodeQL executable can be found.
    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    /// Security query suite for `language`, e.g.
    /// `codeql/python-queries:codeql-suites/python-security-extended.qls`.
    pub fn default_query_suite(language: &str) -> String {
        format!(
            "codeql/{lang}-queries:codeql-suites/{lang}-security-extended.qls",
            lang = language
        )
    }

    /// Builds a database for `source_root`, replacing any existing one.
    pub async fn create_database(
        &self,
        source_root: &Path,
        db_path: &Path,
        language: &str,
    ) -> Result<(), AnalysisError> {
        if db_path.exists() {
            debug!("Removing existing database {}", db_path.display());
            tokio::fs::remove_dir_all(db_path).await?;
        }

        let args = vec![
            "database".to_string(),
            "create".to_string(),
            db_path.display().to_string(),
            format!("--language={}", language),
            format!("--source-root={}", source_root.display()),
            "--overwrite".to_string(),
        ];

        info!(
            "Creating CodeQL database {} from {}",
            db_path.display(),
            source_root.display()
        );
        self.codeql(&args)
            .await
            .map_err(AnalysisError::DatabaseCreation)
    }

    /// Analyzes `db_path`, writing SARIF to `output_path`.
    ///
    /// Uses the language's security suite when `queries` is empty.
    pub async fn analyze(
        &self,
        db_path: &Path,
        output_path: &Path,
        language: &str,
        queries: &[String],
    ) -> Result<(), AnalysisError> {
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut args = vec![
            "database".to_string(),
            "analyze".to_string(),
            db_path.display().to_string(),
            "--format=sarif-latest".to_string(),
            format!("--output={}", output_path.display()),
        ];
        if queries.is_empty() {
            args.push(Self::default_query_suite(language));
        } else {
            args.extend(queries.iter().cloned());
        }

        info!("Running CodeQL analysis: {} {}", self.binary, args.join(" "));
        self.codeql(&args).await.map_err(AnalysisError::Analysis)
    }

    /// Creates a database, analyzes it and loads the findings.
    pub async fn scan(
        &self,
        source_root: &Path,
        db_path: &Path,
        language: &str,
        output_path: &Path,
    ) -> Result<FindingsByFile, AnalysisError> {
        if !self.is_available() {
            return Err(AnalysisError::ToolNotFound(self.binary.clone()));
        }
        self.create_database(source_root, db_path, language).await?;
        self.analyze(db_path, output_path, language, &[]).await?;
        load_sarif_results(output_path)
    }

    /// Runs CodeQL with `args`; on failure returns the tool's stderr.
    async fn codeql(&self, args: &[String]) -> Result<(), String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.binary, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl Default for CodeQlRunner {
    fn default() -> Self {
        Self::new("codeql")
    }
}

/// Default SARIF location for a database.
pub fn default_output_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("sarif")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_query_suite() {
        assert_eq!(
            CodeQlRunner::default_query_suite("python"),
            "codeql/python-queries:codeql-suites/python-security-extended.qls"
        );
        assert_eq!(
            CodeQlRunner::default_query_suite("cpp"),
            "codeql/cpp-queries:codeql-suites/cpp-security-extended.qls"
        );
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        assert!(!CodeQlRunner::new("secbench-no-such-codeql").is_available());
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/tmp/db/python")),
            PathBuf::from("/tmp/db/python.sarif")
        );
    }

    #[tokio::test]
    async fn test_scan_without_tool() {
        let temp = TempDir::new().unwrap();
        let runner = CodeQlRunner::new("secbench-no-such-codeql");
        let err = runner
            .scan(
                temp.path(),
                &temp.path().join("db"),
                "python",
                &temp.path().join("out.sarif"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_database_reports_failure() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("db");
        std::fs::create_dir_all(&db).unwrap();

        // `false` accepts any arguments and exits non-zero.
        let runner = CodeQlRunner::new("false");
        let err = runner
            .create_database(temp.path(), &db, "python")
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::DatabaseCreation(_)));
        assert!(!db.exists());
    }
}
