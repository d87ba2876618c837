//! Command-line interface for secbench.
//!
//! Provides commands for running command sequences in isolated
//! environments, one-shot templated runs, and CodeQL scans.

mod commands;

pub use commands::{
    parse_cli, run, run_with_cli, Backend, Cli, CodeQlArgs, Commands, ExecArgs, RunArgs,
};
