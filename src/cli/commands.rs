//! CLI command definitions for secbench.
//!
//! Each subcommand drives one piece of the execution runner: running a
//! command sequence inside a fresh environment, running a single templated
//! command, or scanning generated code with CodeQL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::analysis::codeql::{default_output_path, CodeQlRunner};
use crate::runner::{
    DockerRunner, EnvironmentSession, LocalRunner, Runner, RunnerConfig, SessionRunner,
    TemplateParams,
};

/// Default environment name for `secbench exec`.
const DEFAULT_ENV_NAME: &str = "secbench";

/// Sandboxed execution runner for code security benchmarks.
#[derive(Parser)]
#[command(name = "secbench")]
#[command(about = "Run benchmark commands inside isolated environments")]
#[command(version)]
#[command(
    long_about = "secbench provisions isolated environments (a private directory, a Python virtual environment, or a Docker container), runs generated code and its tests inside them, streams the output, and tears the environment down afterward.\n\nExample usage:\n  secbench exec --name t1 --python python3 -- 'pip install -r requirements.txt' 'pytest -q'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Runner configuration file (YAML).
    #[arg(short, long, global = true, env = "SECBENCH_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run commands in order inside a fresh environment.
    Exec(ExecArgs),

    /// Render a command template for a target and run it once.
    Run(RunArgs),

    /// Build a CodeQL database, analyze it, and print findings as JSON.
    #[command(name = "codeql")]
    CodeQl(CodeQlArgs),
}

/// Execution backend.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Host shell with a private directory or virtual environment.
    Local,
    /// Detached Docker container.
    Docker,
}

/// Arguments for `secbench exec`.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Environment name, used for log prefixes and the default root.
    #[arg(short, long, default_value = DEFAULT_ENV_NAME)]
    pub name: String,

    /// Environment root (default: `<env_root>/<name>` from the configuration).
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Execution backend.
    #[arg(short, long, value_enum, default_value = "local")]
    pub backend: Backend,

    /// Interpreter used to create a virtual environment (local backend).
    #[arg(long)]
    pub python: Option<String>,

    /// Per-command timeout in seconds.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Leave the environment in place after the last command.
    #[arg(long)]
    pub keep: bool,

    /// Commands to run, each interpreted by the configured shell.
    #[arg(last = true, required = true)]
    pub commands: Vec<String>,
}

/// Arguments for `secbench run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Command template, e.g. "python3 {{ target }} --seed {{ seed }}".
    #[arg(long)]
    pub template: String,

    /// Value bound to the `target` placeholder.
    #[arg(long)]
    pub target: String,

    /// Extra template parameter (repeatable).
    #[arg(short, long = "param", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// Execution backend.
    #[arg(short, long, value_enum, default_value = "local")]
    pub backend: Backend,
}

/// Arguments for `secbench codeql`.
#[derive(Parser, Debug)]
pub struct CodeQlArgs {
    /// Directory containing the code to analyze.
    #[arg(long)]
    pub source_root: PathBuf,

    /// Database directory (replaced if it exists).
    #[arg(long)]
    pub database: PathBuf,

    /// CodeQL language.
    #[arg(long, default_value = "python")]
    pub language: String,

    /// SARIF output path (default: `<database>.sarif`).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// CodeQL executable.
    #[arg(long, default_value = "codeql")]
    pub codeql: String,
}

/// Parse command-line arguments and return the CLI structure.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Exec(args) => run_exec_command(args, config).await,
        Commands::Run(args) => run_run_command(args, config).await,
        Commands::CodeQl(args) => run_codeql_command(args).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RunnerConfig> {
    match path {
        Some(path) => RunnerConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(RunnerConfig::default()),
    }
}

// ============================================================================
// Exec Command Implementation
// ============================================================================

/// A command in an `exec` sequence that did not exit cleanly.
struct CommandFailure {
    command: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
}

async fn run_exec_command(args: ExecArgs, mut config: RunnerConfig) -> anyhow::Result<()> {
    if let Some(python) = &args.python {
        config = config.with_interpreter(python.clone());
    }
    if let Some(secs) = args.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    let workdir = args
        .workdir
        .clone()
        .unwrap_or_else(|| config.environment_path(&args.name));

    let failure = match args.backend {
        Backend::Local => {
            let runner = LocalRunner::new(&args.name, "{{ target }}", config);
            exec_sequence(&runner, &args, &workdir).await?
        }
        Backend::Docker => {
            let runner = DockerRunner::new(&args.name, "{{ target }}", config);
            exec_sequence(&runner, &args, &workdir).await?
        }
    };

    match failure {
        None => Ok(()),
        Some(failure) => match failure.signal {
            Some(signal) => anyhow::bail!(
                "Command `{}` was killed by signal {}",
                failure.command,
                signal
            ),
            None => anyhow::bail!(
                "Command `{}` exited with code {}",
                failure.command,
                failure
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        },
    }
}

async fn exec_sequence<R: SessionRunner>(
    runner: &R,
    args: &ExecArgs,
    workdir: &Path,
) -> anyhow::Result<Option<CommandFailure>> {
    let session = EnvironmentSession::open(runner, &args.name, workdir).await?;

    let mut failure = None;
    for command in &args.commands {
        let mut stream = session.exec(command.as_str()).await?;
        while let Some(line) = stream.next_line().await {
            println!("[{}] {}", args.name, line?);
        }
        if stream.exit_code() != Some(0) {
            failure = Some(CommandFailure {
                command: command.clone(),
                exit_code: stream.exit_code(),
                signal: stream.exit_signal(),
            });
            break;
        }
    }

    if args.keep {
        if let Some(environment) = session.detach() {
            let root = environment.keep();
            info!("Keeping environment {} at {}", args.name, root.display());
            println!("Environment kept at {}", root.display());
        }
    } else {
        session.close().await?;
    }

    Ok(failure)
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_run_command(args: RunArgs, config: RunnerConfig) -> anyhow::Result<()> {
    let runner: Box<dyn Runner> = match args.backend {
        Backend::Local => Box::new(LocalRunner::new("run", args.template.as_str(), config)),
        Backend::Docker => Box::new(DockerRunner::new("run", args.template.as_str(), config)),
    };

    let mut params = TemplateParams::new();
    for (key, value) in &args.params {
        params.insert(key.clone(), value);
    }

    let mut stream = runner.run(&args.target, &params).await?;
    while let Some(line) = stream.next_line().await {
        println!("{}", line?);
    }

    match stream.exit_code() {
        Some(0) => Ok(()),
        Some(code) => anyhow::bail!("Command exited with code {}", code),
        None => anyhow::bail!(
            "Command was killed by signal {}",
            stream.exit_signal().unwrap_or_default()
        ),
    }
}

// ============================================================================
// CodeQL Command Implementation
// ============================================================================

async fn run_codeql_command(args: CodeQlArgs) -> anyhow::Result<()> {
    let codeql = CodeQlRunner::new(args.codeql);
    let output = args
        .output
        .unwrap_or_else(|| default_output_path(&args.database));

    let findings = codeql
        .scan(&args.source_root, &args.database, &args.language, &output)
        .await?;

    let files = findings.len();
    let total: usize = findings.values().map(Vec::len).sum();
    info!(
        files,
        findings = total,
        "CodeQL analysis complete"
    );

    let summary = serde_json::json!({
        "sarif": output,
        "files": files,
        "total_findings": total,
        "findings": findings,
    });
    let json_output = serde_json::to_string_pretty(&summary)
        .map_err(|e| anyhow::anyhow!("Failed to serialize findings JSON: {}", e))?;
    println!("{}", json_output);

    Ok(())
}

/// Parses a `KEY=VALUE` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{}`", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}
