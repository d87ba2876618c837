//! Static analysis of generated code.
//!
//! Wraps the CodeQL CLI and reduces its SARIF output to per-file findings
//! tagged with CWE identifiers.

pub mod codeql;
pub mod sarif;

pub use codeql::CodeQlRunner;
pub use sarif::{load_sarif_results, parse_sarif, Finding, FindingsByFile};
