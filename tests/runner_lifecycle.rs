//! Integration tests for the environment lifecycle and command streaming.
//!
//! These run real shell commands through the local backend inside
//! temporary directories.

use std::path::Path;
use std::time::{Duration, Instant};

use futures::StreamExt;
use secbench::runner::{
    CommandInvocation, EnvironmentSession, EnvironmentState, LocalRunner, Runner, RunnerConfig,
    SessionRunner, TemplateParams,
};
use secbench::RunnerError;
use tempfile::TempDir;

fn local_runner() -> LocalRunner {
    LocalRunner::with_defaults("local")
}

async fn collect(runner: &LocalRunner, env: &secbench::Environment, cmd: &str) -> Vec<String> {
    runner
        .exec_command(env, cmd.into())
        .await
        .expect("command should launch")
        .wait_with_output()
        .await
        .expect("command should complete")
        .lines
}

#[tokio::test]
async fn test_setup_then_remove_leaves_nothing() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();

    for (name, dir) in [("a", "plain"), ("with space", "nested/deeper/env"), ("t1", ".hidden")] {
        let workdir = temp.path().join(dir);
        let mut env = runner.run_detached(name, &workdir).await.unwrap();
        assert!(workdir.is_dir(), "setup should create {}", workdir.display());

        runner.remove(&mut env).await.unwrap();
        assert!(!workdir.exists(), "remove should delete {}", workdir.display());
        assert_eq!(env.state(), EnvironmentState::TornDown);
    }
}

#[tokio::test]
async fn test_echo_hello_scenario() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join(".test_env");
    let runner = local_runner();

    let mut env = runner.run_detached("t1", &workdir).await.unwrap();
    let output = runner
        .exec_command(&env, "echo hello".into())
        .await
        .unwrap()
        .wait_with_output()
        .await
        .unwrap();

    assert_eq!(output.lines, vec!["hello"]);
    assert_eq!(output.exit_code, Some(0));

    runner.remove(&mut env).await.unwrap();
    assert!(!workdir.exists());
}

#[tokio::test]
async fn test_combined_output_in_emission_order() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    let script = "for i in 1 2 3 4 5; do echo out$i; echo err$i >&2; done";
    let lines = collect(&runner, &env, script).await;

    let expected: Vec<String> = (1..=5)
        .flat_map(|i| [format!("out{}", i), format!("err{}", i)])
        .collect();
    assert_eq!(lines, expected);

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_exec_after_teardown_is_state_violation() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();
    runner.remove(&mut env).await.unwrap();

    let err = runner
        .exec_command(&env, "echo hello".into())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            RunnerError::StateViolation {
                state: EnvironmentState::TornDown,
                ..
            }
        ),
        "unexpected error: {:?}",
        err
    );
}

#[tokio::test]
async fn test_exec_before_setup_is_state_violation() {
    let temp = TempDir::new().unwrap();
    let env = secbench::Environment::new("t1", temp.path().join("env"));

    let err = local_runner()
        .exec_command(&env, "echo hello".into())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunnerError::StateViolation {
            state: EnvironmentState::Uninitialized,
            ..
        }
    ));
}

#[tokio::test]
async fn test_sequential_commands_observe_effects() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    for i in 0..20 {
        collect(&runner, &env, &format!("echo value{} > state.txt", i)).await;
        let lines = collect(&runner, &env, "cat state.txt").await;
        assert_eq!(lines, vec![format!("value{}", i)]);
    }

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_double_teardown_is_noop() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let runner = local_runner();
    let mut env = runner.run_detached("t1", &workdir).await.unwrap();

    runner.remove(&mut env).await.unwrap();
    // A new directory at the same path must survive the second call.
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("other.txt"), "not ours").unwrap();

    runner.remove(&mut env).await.unwrap();
    runner.remove_blocking(&mut env).unwrap();
    assert!(workdir.join("other.txt").is_file());
}

#[tokio::test]
async fn test_nonexistent_binary_is_launch_error() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    let err = runner
        .exec_command(&env, "secbench-definitely-not-a-binary --flag".into())
        .await
        .unwrap_err();
    match err {
        RunnerError::Launch { command, source } => {
            assert!(command.contains("secbench-definitely-not-a-binary"));
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("expected launch error, got {:?}", other),
    }

    // The environment stays usable.
    assert_eq!(collect(&runner, &env, "echo still-here").await, vec!["still-here"]);
    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_nonzero_exit_is_reported_not_raised() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    let output = runner
        .exec_command(&env, "echo failing; exit 3".into())
        .await
        .unwrap()
        .wait_with_output()
        .await
        .unwrap();
    assert_eq!(output.lines, vec!["failing"]);
    assert_eq!(output.exit_code, Some(3));

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_output_is_streamed_incrementally() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    let start = Instant::now();
    let mut stream = runner
        .exec_command(&env, "echo first; sleep 3; echo second".into())
        .await
        .unwrap();

    let first = stream.next_line().await.unwrap().unwrap();
    assert_eq!(first, "first");
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "first line arrived after {:?}",
        start.elapsed()
    );
    assert!(!stream.is_finished());

    assert_eq!(stream.next_line().await.unwrap().unwrap(), "second");
    assert!(stream.next_line().await.is_none());
    assert_eq!(stream.exit_code(), Some(0));

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_timeout_kills_runaway_command() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    let start = Instant::now();
    let invocation = CommandInvocation::new("while true; do sleep 1; done")
        .with_timeout(Duration::from_millis(500));
    let err = runner
        .exec_command(&env, invocation)
        .await
        .unwrap()
        .wait_with_output()
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::Timeout(_)));
    assert!(err.is_limit());
    assert!(start.elapsed() < Duration::from_secs(5));

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_output_ceiling_is_a_distinct_error() {
    let temp = TempDir::new().unwrap();
    let config = RunnerConfig::new(temp.path()).with_max_output_bytes(4096);
    let runner = LocalRunner::new("local", "{{ target }}", config);
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    let mut stream = runner.exec_command(&env, "yes".into()).await.unwrap();
    let mut lines = 0usize;
    let err = loop {
        match stream.next_line().await {
            Some(Ok(_)) => lines += 1,
            Some(Err(e)) => break e,
            None => panic!("stream ended without hitting the ceiling"),
        }
    };

    assert!(matches!(err, RunnerError::OutputLimitExceeded { limit: 4096 }));
    assert!(lines <= 2048);
    assert!(stream.next_line().await.is_none());

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_dropping_stream_kills_process() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let runner = local_runner();
    let mut env = runner.run_detached("t1", &workdir).await.unwrap();

    let mut stream = runner
        .exec_command(&env, "echo started; sleep 1; touch finished.txt".into())
        .await
        .unwrap();
    assert_eq!(stream.next_line().await.unwrap().unwrap(), "started");
    drop(stream);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!workdir.join("finished.txt").exists());

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_background_children_do_not_outlive_command() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let runner = local_runner();
    let mut env = runner.run_detached("t1", &workdir).await.unwrap();

    let start = Instant::now();
    let invocation = CommandInvocation::new("(sleep 2; touch leaked.txt) & echo done")
        .with_timeout(Duration::from_secs(20));
    let output = runner
        .exec_command(&env, invocation)
        .await
        .unwrap()
        .wait_with_output()
        .await
        .unwrap();
    assert_eq!(output.lines, vec!["done"]);
    assert_eq!(output.exit_code, Some(0));
    assert!(
        start.elapsed() < Duration::from_millis(1500),
        "stream waited for the background child: {:?}",
        start.elapsed()
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!workdir.join("leaked.txt").exists());

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_background_server_does_not_turn_exit_into_timeout() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    let start = Instant::now();
    let invocation =
        CommandInvocation::new("sleep 30 & echo done").with_timeout(Duration::from_secs(3));
    let output = runner
        .exec_command(&env, invocation)
        .await
        .unwrap()
        .wait_with_output()
        .await
        .expect("shell exit should end the stream");

    assert_eq!(output.lines, vec!["done"]);
    assert_eq!(output.exit_code, Some(0));
    assert!(start.elapsed() < Duration::from_secs(2));

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_setup_twice_is_noop() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let runner = local_runner();
    let mut env = runner.run_detached("t1", &workdir).await.unwrap();
    collect(&runner, &env, "echo keep > data.txt").await;

    runner.setup(&mut env).await.unwrap();

    assert!(env.is_active());
    assert_eq!(collect(&runner, &env, "cat data.txt").await, vec!["keep"]);
    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_unmanaged_directory_is_rejected_and_preserved() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("project");
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("main.py"), "print('hi')").unwrap();

    let err = local_runner()
        .run_detached("t1", &workdir)
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::Provisioning { .. }));
    assert_eq!(
        std::fs::read_to_string(workdir.join("main.py")).unwrap(),
        "print('hi')"
    );
}

#[tokio::test]
async fn test_shared_root_is_rejected() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let runner = local_runner();

    let mut first = runner.run_detached("first", &workdir).await.unwrap();
    let err = runner.run_detached("second", &workdir).await.unwrap_err();
    assert!(matches!(err, RunnerError::RootInUse(_)));

    runner.remove(&mut first).await.unwrap();
}

#[tokio::test]
async fn test_root_is_exclusive_across_runners() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let a = local_runner();
    let b = local_runner();

    let mut first = a.run_detached("first", &workdir).await.unwrap();
    let err = b.run_detached("second", &workdir).await.unwrap_err();
    assert!(matches!(err, RunnerError::RootInUse(_)), "got {:?}", err);

    // The refused runner left the live environment alone.
    assert!(first.is_active());
    assert_eq!(collect(&a, &first, "echo hi").await, vec!["hi"]);

    a.remove(&mut first).await.unwrap();
    let mut second = b.run_detached("second", &workdir).await.unwrap();
    b.remove(&mut second).await.unwrap();
    assert!(!workdir.exists());
}

#[tokio::test]
async fn test_root_released_when_runner_is_dropped() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");

    let first = {
        let a = local_runner();
        a.run_detached("first", &workdir).await.unwrap().keep()
    };
    assert_eq!(first, std::path::absolute(&workdir).unwrap());

    // A runner that went away no longer holds the root; its marker lets a
    // new runner adopt it.
    let b = local_runner();
    let mut env = b.run_detached("second", &workdir).await.unwrap();
    b.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_failed_teardown_keeps_environment_active() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let runner = local_runner();
    let mut env = runner.run_detached("t1", &workdir).await.unwrap();

    std::fs::remove_dir_all(&workdir).unwrap();
    std::fs::write(&workdir, "not a directory").unwrap();

    let err = runner.remove(&mut env).await.unwrap_err();
    assert!(matches!(err, RunnerError::Teardown { .. }), "got {:?}", err);
    assert_eq!(env.state(), EnvironmentState::Active);

    let err = runner.remove_blocking(&mut env).unwrap_err();
    assert!(matches!(err, RunnerError::Teardown { .. }));
    assert_eq!(env.state(), EnvironmentState::Active);

    std::fs::remove_file(&workdir).unwrap();
    runner.remove(&mut env).await.unwrap();
    assert_eq!(env.state(), EnvironmentState::TornDown);
}

#[tokio::test]
async fn test_bash_builtins_pass_preflight() {
    if !Path::new("/bin/bash").exists() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let config = RunnerConfig::default().with_shell("/bin/bash");
    let runner = LocalRunner::new("bash", "{{ target }}", config);
    let mut env = runner
        .run_detached("t1", &temp.path().join("env"))
        .await
        .unwrap();

    assert_eq!(
        collect(&runner, &env, "shopt -s nullglob; echo ok").await,
        vec!["ok"]
    );
    assert_eq!(
        collect(&runner, &env, "pushd . >/dev/null && echo ok").await,
        vec!["ok"]
    );

    let err = runner
        .exec_command(&env, "secbench-no-such-binary".into())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Launch { .. }));

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_environments_are_independent() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner();
    let mut a = runner.run_detached("a", &temp.path().join("a")).await.unwrap();
    let mut b = runner.run_detached("b", &temp.path().join("b")).await.unwrap();

    let (out_a, out_b) = tokio::join!(
        collect(&runner, &a, "echo from-a > who.txt; sleep 0.2; cat who.txt"),
        collect(&runner, &b, "echo from-b > who.txt; sleep 0.2; cat who.txt"),
    );
    assert_eq!(out_a, vec!["from-a"]);
    assert_eq!(out_b, vec!["from-b"]);

    runner.remove(&mut a).await.unwrap();
    runner.remove(&mut b).await.unwrap();
}

#[tokio::test]
async fn test_working_directory_is_confined() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let runner = local_runner();
    let mut env = runner.run_detached("t1", &workdir).await.unwrap();
    std::fs::create_dir_all(workdir.join("src")).unwrap();

    let lines = collect(&runner, &env, "pwd").await;
    assert_eq!(
        std::fs::canonicalize(&lines[0]).unwrap(),
        std::fs::canonicalize(&workdir).unwrap()
    );

    let output = runner
        .exec_command(&env, CommandInvocation::new("pwd").in_dir("src"))
        .await
        .unwrap()
        .wait_with_output()
        .await
        .unwrap();
    assert_eq!(
        std::fs::canonicalize(&output.lines[0]).unwrap(),
        std::fs::canonicalize(workdir.join("src")).unwrap()
    );

    let err = runner
        .exec_command(&env, CommandInvocation::new("pwd").in_dir("../"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::InvalidInvocation(_)));

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_environment_context_is_scoped_to_invocations() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("env");
    let runner = local_runner();
    let host_path = std::env::var("PATH").ok();

    let mut env = runner.run_detached("t1", &workdir).await.unwrap();

    // Tools installed into the environment's bin directory resolve by name.
    let tool = workdir.join("bin").join("secbench-env-tool");
    std::fs::write(&tool, "#!/bin/sh\necho tool-ran\n").unwrap();
    set_executable(&tool);

    assert_eq!(collect(&runner, &env, "secbench-env-tool").await, vec!["tool-ran"]);
    assert_eq!(
        collect(&runner, &env, "echo $PYTHONUNBUFFERED").await,
        vec!["1"]
    );

    let invocation = CommandInvocation::new("echo $SECBENCH_CASE").with_env("SECBENCH_CASE", "x1");
    let output = runner
        .exec_command(&env, invocation)
        .await
        .unwrap()
        .wait_with_output()
        .await
        .unwrap();
    assert_eq!(output.lines, vec!["x1"]);

    // The host process environment is untouched.
    assert_eq!(std::env::var("PATH").ok(), host_path);
    assert!(std::env::var("SECBENCH_CASE").is_err());

    runner.remove(&mut env).await.unwrap();
}

#[tokio::test]
async fn test_session_cleans_up_on_error_path() {
    async fn evaluate(runner: &LocalRunner, workdir: &Path) -> Result<(), RunnerError> {
        let session = EnvironmentSession::open(runner, "t1", workdir).await?;
        session.exec("echo writing > out.txt").await?.wait_with_output().await?;
        let mut stream = session.exec("yes").await?;
        // Abandon the stream after one line, then fail.
        stream.next_line().await;
        drop(stream);
        Err(RunnerError::InvalidInvocation("grader gave up".to_string()))
    }

    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("session");
    let runner = local_runner();

    assert!(evaluate(&runner, &workdir).await.is_err());
    assert!(!workdir.exists());
}

#[tokio::test]
async fn test_runner_renders_template() {
    let runner = LocalRunner::new(
        "echo-runner",
        "echo {{ target }} {{ mode }}",
        RunnerConfig::default(),
    );
    let params = TemplateParams::new().with("mode", "strict");

    let lines: Vec<String> = runner
        .run("task_12", &params)
        .await
        .unwrap()
        .into_lines()
        .map(|line| line.unwrap())
        .collect()
        .await;
    assert_eq!(lines, vec!["task_12 strict"]);
}

#[tokio::test]
async fn test_runner_missing_parameter_fails_before_spawn() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("spawned.txt");
    let template = format!("touch {} && echo {{{{ missing }}}}", marker.display());
    let runner = LocalRunner::new("broken", template, RunnerConfig::default());

    let err = runner
        .run("task", &TemplateParams::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Template { .. }));
    assert!(!marker.exists());
}

fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}
