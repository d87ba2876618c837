//! Child processes and their streamed output.
//!
//! Every command runs in its own process group with stdout and stderr
//! attached to a single anonymous pipe, so lines arrive in the order the
//! process emitted them. The group is killed if the consumer abandons the
//! stream, a limit is hit, or the command finishes with stragglers left.
//! The stream ends when the command itself exits, even if a background
//! child still holds the pipe open.

use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use futures::Stream;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::RunnerError;

/// Per-invocation resource limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecLimits {
    /// Wall-clock limit covering output and process exit.
    pub timeout: Option<Duration>,
    /// Maximum number of output bytes before the command is killed.
    pub max_output_bytes: Option<usize>,
}

impl ExecLimits {
    /// No timeout and no output ceiling.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Replaces the timeout when `timeout` is set.
    pub fn override_timeout(mut self, timeout: Option<Duration>) -> Self {
        if timeout.is_some() {
            self.timeout = timeout;
        }
        self
    }
}

/// A fully resolved process to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable to spawn.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Prefix used when logging output lines.
    pub label: String,
    /// Human-readable command, used in errors.
    pub command: String,
    /// Command run when the stream is abandoned or aborted before exit.
    pub on_abort: Option<Vec<String>>,
}

impl ProcessSpec {
    /// Creates a spec that runs `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let command = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            label: program.clone(),
            program,
            args,
            cwd: None,
            env: Vec::new(),
            command,
            on_abort: None,
        }
    }

    /// Creates a spec that hands `script` to `shell -c`.
    pub fn shell(shell: impl Into<String>, script: impl Into<String>) -> Self {
        let script = script.into();
        let mut spec = Self::new(shell, vec!["-c".to_string(), script.clone()]);
        spec.command = script;
        spec
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Overrides the command shown in errors.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Runs `argv` (fire and forget) if the process is killed before it exits.
    ///
    /// Used when killing the local process group does not reach the real
    /// workload, e.g. a command running behind `docker exec`.
    pub fn with_abort_command(mut self, argv: Vec<String>) -> Self {
        self.on_abort = Some(argv);
        self
    }
}

/// Launches `spec` and returns its output stream.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns `RunnerError::Launch` if the process cannot be started. Nothing
/// about the command's own behavior is reported here.
pub fn spawn(spec: ProcessSpec, limits: ExecLimits) -> Result<CommandStream, RunnerError> {
    let (reader, writer) = std::io::pipe().map_err(|e| RunnerError::launch(&spec.command, e))?;
    let stderr_writer = writer
        .try_clone()
        .map_err(|e| RunnerError::launch(&spec.command, e))?;

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(stderr_writer)
        .kill_on_drop(true)
        .process_group(0);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let child = command
        .spawn()
        .map_err(|e| RunnerError::launch(&spec.command, e))?;
    // The parent must not hold write ends, or EOF never arrives.
    drop(command);

    let guard = ProcessGuard::new(child, spec.on_abort);
    let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;

    debug!(
        "[{}] spawned pid {:?}: {}",
        spec.label,
        guard.pid(),
        spec.command
    );

    Ok(CommandStream {
        label: spec.label,
        reader: Some(BufReader::new(receiver)),
        guard,
        limits,
        deadline: limits.timeout.map(|t| tokio::time::Instant::now() + t),
        started: Instant::now(),
        bytes_read: 0,
        lines_read: 0,
        exit: None,
        finished: false,
    })
}

/// Lazy, finite sequence of output lines from one running command.
///
/// Dropping the stream before it is exhausted kills the process group.
pub struct CommandStream {
    label: String,
    reader: Option<BufReader<pipe::Receiver>>,
    guard: ProcessGuard,
    limits: ExecLimits,
    deadline: Option<tokio::time::Instant>,
    started: Instant,
    bytes_read: usize,
    lines_read: usize,
    exit: Option<ExitStatus>,
    finished: bool,
}

impl CommandStream {
    /// Returns the next output line, or `None` once the process has exited.
    ///
    /// The line terminator (`\n` or `\r\n`) is stripped and invalid UTF-8 is
    /// replaced with U+FFFD, so joined lines are not always byte-equal to the
    /// output. Use [`CommandStream::next_raw_line`] when exact bytes matter.
    ///
    /// An error item is always the last item of the stream.
    pub async fn next_line(&mut self) -> Option<Result<String, RunnerError>> {
        let raw = match self.next_raw_line().await? {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e)),
        };
        let line = decode_line(&raw);
        debug!("[{}] {}", self.label, line);
        Some(Ok(line))
    }

    /// Returns the next output line exactly as emitted, terminator included.
    ///
    /// Concatenating every item reproduces the combined output byte for byte.
    pub async fn next_raw_line(&mut self) -> Option<Result<Vec<u8>, RunnerError>> {
        let mut buf = Vec::new();
        loop {
            if self.finished {
                return None;
            }
            let Some(reader) = self.reader.as_mut() else {
                return self.finish().await.err().map(Err);
            };

            let budget = self
                .limits
                .max_output_bytes
                .map(|max| max.saturating_sub(self.bytes_read + buf.len()) as u64 + 1)
                .unwrap_or(u64::MAX);
            let waiting = self.exit.is_none();
            let guard = &mut self.guard;
            let event = async {
                tokio::select! {
                    read = async {
                        let mut limited = (&mut *reader).take(budget);
                        limited.read_until(b'\n', &mut buf).await
                    } => ReadEvent::Read(read),
                    status = guard.wait(), if waiting => ReadEvent::Exited(status),
                }
            };
            let event = match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, event).await.ok(),
                None => Some(event.await),
            };

            match event {
                None => {
                    let timeout = self.limits.timeout.unwrap_or_default();
                    return Some(Err(self.abort(RunnerError::Timeout(timeout)).await));
                }
                Some(ReadEvent::Exited(Ok(status))) => {
                    // The group is gone; drain whatever the pipe still holds.
                    debug!("[{}] exited with {}, draining output", self.label, status);
                    self.exit = Some(status);
                }
                Some(ReadEvent::Exited(Err(e))) | Some(ReadEvent::Read(Err(e))) => {
                    return Some(Err(self.abort(RunnerError::Io(e)).await));
                }
                Some(ReadEvent::Read(Ok(0))) if buf.is_empty() => {
                    self.reader = None;
                }
                Some(ReadEvent::Read(Ok(_))) => {
                    let total = self.bytes_read + buf.len();
                    if let Some(limit) = self.limits.max_output_bytes {
                        if total > limit {
                            return Some(Err(
                                self.abort(RunnerError::OutputLimitExceeded { limit }).await
                            ));
                        }
                    }
                    self.bytes_read = total;
                    self.lines_read += 1;
                    return Some(Ok(buf));
                }
            }
        }
    }

    /// Drains the stream into a [`CommandOutput`].
    ///
    /// # Errors
    ///
    /// Returns the stream's terminal error (timeout, output limit, I/O).
    pub async fn wait_with_output(mut self) -> Result<CommandOutput, RunnerError> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line?);
        }

        Ok(CommandOutput {
            lines,
            exit_code: self.exit_code(),
            signal: self.exit_signal(),
            duration: self.started.elapsed(),
        })
    }

    /// Converts into a `futures::Stream` of lines.
    pub fn into_lines(mut self) -> impl Stream<Item = Result<String, RunnerError>> + Send {
        async_stream::stream! {
            while let Some(line) = self.next_line().await {
                yield line;
            }
        }
    }

    /// Exit code, once the process has exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|status| status.code())
    }

    /// Terminating signal, if the process was killed by one.
    pub fn exit_signal(&self) -> Option<i32> {
        self.exit.and_then(|status| status.signal())
    }

    /// True once the stream has returned its final item.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn pid(&self) -> Option<u32> {
        self.guard.pid()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    async fn finish(&mut self) -> Result<(), RunnerError> {
        let status = match self.exit {
            Some(status) => status,
            None => {
                let waited = match self.deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, self.guard.wait())
                        .await
                        .ok(),
                    None => Some(self.guard.wait().await),
                };
                match waited {
                    None => {
                        let timeout = self.limits.timeout.unwrap_or_default();
                        return Err(self.abort(RunnerError::Timeout(timeout)).await);
                    }
                    Some(Err(e)) => return Err(self.abort(RunnerError::Io(e)).await),
                    Some(Ok(status)) => status,
                }
            }
        };

        self.exit = Some(status);
        self.finished = true;
        info!(
            "[{}] exited with {} after {:?} ({} lines)",
            self.label,
            status,
            self.started.elapsed(),
            self.lines_read
        );
        Ok(())
    }

    async fn abort(&mut self, err: RunnerError) -> RunnerError {
        warn!("[{}] aborting: {}", self.label, err);
        self.reader = None;
        let status = self.guard.terminate().await;
        self.exit = self.exit.or(status);
        self.finished = true;
        err
    }
}

enum ReadEvent {
    Read(std::io::Result<usize>),
    Exited(std::io::Result<ExitStatus>),
}

/// Strips one trailing `\n` or `\r\n` and decodes lossily.
fn decode_line(raw: &[u8]) -> String {
    let line = match raw.strip_suffix(b"\n") {
        Some(line) => line.strip_suffix(b"\r").unwrap_or(line),
        None => raw,
    };
    String::from_utf8_lossy(line).into_owned()
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("label", &self.label)
            .field("pid", &self.guard.pid())
            .field("lines_read", &self.lines_read)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Collected result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Output lines in emission order.
    pub lines: Vec<String>,
    /// Exit code; `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl CommandOutput {
    /// True if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Output joined with newlines.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Owns the child and kills its process group unless it was reaped.
struct ProcessGuard {
    child: Child,
    pgid: Option<Pid>,
    reaped: bool,
    on_abort: Option<Vec<String>>,
}

impl ProcessGuard {
    fn new(child: Child, on_abort: Option<Vec<String>>) -> Self {
        // process_group(0) makes the child its own group leader.
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        Self {
            child,
            pgid,
            reaped: false,
            on_abort,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pgid.map(|pid| pid.as_raw() as u32)
    }

    fn signal_group(&self, signal: Signal) {
        if let Some(pgid) = self.pgid {
            match killpg(pgid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to signal process group {}: {}", pgid, e),
            }
        }
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        self.signal_group(Signal::SIGKILL);
        Ok(status)
    }

    /// Spawns the abort command, reaping it on a background thread.
    fn run_abort_command(&mut self) {
        let Some(argv) = self.on_abort.take() else {
            return;
        };
        let Some((program, args)) = argv.split_first() else {
            return;
        };
        debug!("Running abort command: {}", argv.join(" "));
        match std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(mut child) => {
                std::thread::spawn(move || child.wait());
            }
            Err(e) => warn!("Failed to run abort command {}: {}", program, e),
        }
    }

    async fn terminate(&mut self) -> Option<ExitStatus> {
        if !self.reaped {
            self.run_abort_command();
        }
        self.signal_group(Signal::SIGKILL);
        if let Err(e) = self.child.start_kill() {
            debug!("start_kill: {}", e);
        }
        let status = match self.child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Failed to reap killed process: {}", e);
                None
            }
        };
        self.reaped = true;
        status
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if !self.reaped {
            debug!("Killing abandoned process group {:?}", self.pgid);
            self.run_abort_command();
            self.signal_group(Signal::SIGKILL);
        }
    }
}

/// Shell builtins and keywords that never resolve through `PATH`.
const SHELL_BUILTINS: &[&str] = &[
    ".", ":", "[", "[[", "!", "{", "(", "alias", "bg", "break", "case", "cd", "command",
    "continue", "declare", "echo", "eval", "exec", "exit", "export", "false", "fg", "for",
    "function", "getopts", "hash", "if", "jobs", "kill", "let", "local", "printf", "pwd",
    "read", "readonly", "return", "select", "set", "shift", "source", "test", "time", "times",
    "trap", "true", "type", "typeset", "ulimit", "umask", "unalias", "unset", "until", "wait",
    "while",
];

/// Characters that make the leading word something other than a plain program name.
const SHELL_META: &[char] = &[
    '$', '`', '"', '\'', '\\', '*', '?', '[', '(', ')', '{', '}', '<', '>', '|', ';', '&', '~',
    '#', '=',
];

/// Checks that the program a shell command starts with can be found.
///
/// A word missing from `search_path` may still be a builtin or function of
/// the configured `shell` (bash's `shopt`, zsh's `setopt`), so the shell
/// itself is asked with `command -v` before the check fails.
///
/// # Errors
///
/// Returns `RunnerError::Launch` with `ErrorKind::NotFound` when the
/// leading program resolves neither as a path, through `search_path`, nor
/// in `shell`.
pub(crate) async fn preflight(
    command: &str,
    shell: &str,
    env: &[(String, String)],
    search_path: Option<&str>,
    cwd: &Path,
) -> Result<(), RunnerError> {
    let Some(program) = leading_program(command) else {
        return Ok(());
    };
    if SHELL_BUILTINS.contains(&program) || program.contains(SHELL_META) {
        return Ok(());
    }

    let found = if program.contains('/') {
        tokio::fs::metadata(cwd.join(program))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    } else {
        which::which_in(program, search_path, cwd).is_ok()
            || shell_resolves(shell, program, env, cwd).await
    };

    if found {
        Ok(())
    } else {
        Err(RunnerError::launch(
            command,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("program '{}' not found", program),
            ),
        ))
    }
}

/// True if `shell` knows `word` as a builtin, function or program.
async fn shell_resolves(shell: &str, word: &str, env: &[(String, String)], cwd: &Path) -> bool {
    let status = Command::new(shell)
        .args(["-c", r#"command -v -- "$1""#, "secbench", word])
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;
    match status {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Could not ask {} about '{}': {}", shell, word, e);
            false
        }
    }
}

/// First word of `command` that is not a `NAME=value` assignment.
fn leading_program(command: &str) -> Option<&str> {
    command.split_whitespace().find(|word| !is_assignment(word))
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}
