//! SARIF result parsing.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// One analyzer result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    /// CWE identifiers such as `CWE-079`.
    pub cwes: Vec<String>,
    pub message: String,
}

impl Finding {
    /// Returns true if the finding is tagged with `cwe` (case-insensitive).
    pub fn has_cwe(&self, cwe: &str) -> bool {
        self.cwes.iter().any(|c| c.eq_ignore_ascii_case(cwe))
    }
}

/// Findings keyed by file name (basename only).
pub type FindingsByFile = BTreeMap<String, Vec<Finding>>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SarifLog {
    runs: Vec<SarifRun>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SarifRun {
    tool: SarifTool,
    results: Vec<SarifResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SarifTool {
    driver: SarifDriver,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SarifDriver {
    rules: Vec<SarifRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SarifRule {
    id: String,
    properties: SarifProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SarifProperties {
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SarifResult {
    rule_id: Option<String>,
    message: SarifMessage,
    locations: Vec<SarifLocation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SarifMessage {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SarifLocation {
    physical_location: SarifPhysicalLocation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SarifPhysicalLocation {
    artifact_location: SarifArtifactLocation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SarifArtifactLocation {
    uri: Option<String>,
}

/// Parses SARIF text into findings grouped by file.
///
/// Results without a location are skipped.
pub fn parse_sarif(text: &str) -> Result<FindingsByFile, AnalysisError> {
    let log: SarifLog = serde_json::from_str(text)?;
    let mut findings = FindingsByFile::new();

    for run in log.runs {
        let rules: HashMap<String, Vec<String>> = run
            .tool
            .driver
            .rules
            .into_iter()
            .map(|rule| (rule.id, cwe_tags(&rule.properties.tags)))
            .collect();

        for result in run.results {
            let Some(uri) = result
                .locations
                .first()
                .and_then(|l| l.physical_location.artifact_location.uri.as_deref())
                .filter(|uri| !uri.is_empty())
            else {
                continue;
            };
            let Some(file) = file_name(uri) else {
                continue;
            };

            let rule_id = result.rule_id.unwrap_or_default();
            let cwes = rules.get(&rule_id).cloned().unwrap_or_default();
            findings.entry(file).or_default().push(Finding {
                rule_id,
                cwes,
                message: result.message.text,
            });
        }
    }

    Ok(findings)
}

/// Loads findings from a SARIF file. A missing file yields no findings.
pub fn load_sarif_results(path: impl AsRef<Path>) -> Result<FindingsByFile, AnalysisError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(FindingsByFile::new());
    }
    let text = std::fs::read_to_string(path)?;
    parse_sarif(&text)
}

fn cwe_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .filter(|tag| tag.contains("external/cwe"))
        .filter_map(|tag| tag.rsplit('/').next())
        .map(|id| id.to_uppercase())
        .collect()
}

fn file_name(uri: &str) -> Option<String> {
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
