//! End-to-end supervision of real child processes.

use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use graceexec_runner::{
    Command, Context, ContextError, ExecError, Input, KillOnlyPolicy, Output, PipeReader,
    SharedBuffer, Signal, StreamName,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const HANDLES_TERM: &str = "trap 'exit 0' TERM; echo ready; while :; do sleep 0.05; done";
const IGNORES_TERM: &str = "trap '' TERM; echo ready; while :; do sleep 0.05; done";

fn sh(script: &str) -> Command {
    Command::new("sh").arg("-c").arg(script)
}

async fn read_line(reader: &mut PipeReader) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await.unwrap();
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap()
}

async fn wait(cmd: &Command) -> Result<ExitStatus, ExecError> {
    tokio::time::timeout(Duration::from_secs(10), cmd.wait())
        .await
        .expect("wait did not return")
}

// ============================================================================
// Exit status
// ============================================================================

#[tokio::test]
async fn test_success_iff_exit_zero() {
    let mut ok = sh("exit 0");
    assert!(ok.run().await.unwrap().success());
    assert_eq!(ok.process_state().and_then(|s| s.code()), Some(0));

    let mut failing = sh("exit 7");
    let err = failing.run().await.unwrap_err();
    assert_eq!(err.exit_status().and_then(|s| s.code()), Some(7));
    assert_eq!(failing.process_state().and_then(|s| s.code()), Some(7));
}

#[tokio::test]
async fn test_second_start_spawns_nothing() {
    let mut cmd = sh("exit 0");
    cmd.start().unwrap();
    let pid = cmd.id();
    assert!(matches!(cmd.start(), Err(ExecError::AlreadyStarted)));
    assert_eq!(cmd.id(), pid);
    wait(&cmd).await.unwrap();
}

#[tokio::test]
async fn test_wait_lifecycle_errors() {
    let mut cmd = sh("exit 0");
    assert!(matches!(cmd.wait().await, Err(ExecError::NotStarted)));

    cmd.start().unwrap();
    wait(&cmd).await.unwrap();
    assert!(matches!(wait(&cmd).await, Err(ExecError::AlreadyCollected)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waits_deliver_one_result() {
    let mut cmd = sh("sleep 0.1");
    cmd.start().unwrap();
    let cmd = Arc::new(cmd);

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let cmd = Arc::clone(&cmd);
            tokio::spawn(async move { wait(&cmd).await })
        })
        .collect();

    let mut collected = 0;
    let mut already = 0;
    for waiter in waiters {
        match waiter.await.unwrap() {
            Ok(status) => {
                assert!(status.success());
                collected += 1;
            }
            Err(ExecError::AlreadyCollected) => already += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((collected, already), (1, 7));
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_combined_output_interleaves() {
    let mut cmd = sh("echo out; echo err 1>&2; echo out-again");
    let output = cmd.combined_output().await.unwrap();
    assert_eq!(output, b"out\nerr\nout-again\n");
}

#[tokio::test]
async fn test_combined_output_keeps_bytes_on_failure() {
    let mut cmd = sh("echo partial; exit 3");
    let err = cmd.combined_output().await.unwrap_err();
    assert_eq!(err.output, b"partial\n");
    assert!(matches!(err.source, ExecError::Exit { .. }));
}

#[tokio::test]
async fn test_combined_output_with_preset_stream() {
    let mut cmd = sh("echo never").stdout(Output::Inherit);
    let err = cmd.combined_output().await.unwrap_err();
    assert!(matches!(
        err.source,
        ExecError::StreamAlreadySet {
            stream: StreamName::Stdout
        }
    ));
    assert!(cmd.id().is_none());
}

#[tokio::test]
async fn test_stdin_reader_is_copied() {
    let stdout = SharedBuffer::new();
    let mut cmd = Command::new("cat")
        .stdin(Input::bytes("through the pipe\n"))
        .stdout(Output::writer(stdout.clone()));
    cmd.run().await.unwrap();
    assert_eq!(stdout.contents(), b"through the pipe\n");
}

#[tokio::test]
async fn test_caller_held_pipes() {
    let mut cmd = Command::new("cat");
    let mut stdin = cmd.stdin_pipe().unwrap();
    let mut stdout = cmd.stdout_pipe().unwrap();
    cmd.start().unwrap();

    stdin.write_all(b"ping\n").await.unwrap();
    stdin.shutdown().await.unwrap();
    assert_eq!(read_line(&mut stdout).await, "ping");

    wait(&cmd).await.unwrap();
    assert!(stdout.is_closed());
}

#[tokio::test]
async fn test_pipe_request_errors() {
    let mut cmd = sh("exit 0").stderr(Output::Inherit);
    assert!(matches!(
        cmd.stderr_pipe(),
        Err(ExecError::StreamAlreadySet {
            stream: StreamName::Stderr
        })
    ));

    let _stdout = cmd.stdout_pipe().unwrap();
    assert!(matches!(
        cmd.stdout_pipe(),
        Err(ExecError::StreamAlreadySet {
            stream: StreamName::Stdout
        })
    ));

    cmd.start().unwrap();
    assert!(matches!(
        cmd.stdin_pipe(),
        Err(ExecError::PipeAfterStart {
            stream: StreamName::Stdin
        })
    ));
    wait(&cmd).await.unwrap();
}

// ============================================================================
// Escalation
// ============================================================================

#[tokio::test]
async fn test_handled_interrupt_reports_cancellation() {
    let ctx = Context::new();
    let mut cmd = Command::with_context(ctx.clone(), "sh")
        .arg("-c")
        .arg(HANDLES_TERM)
        .interrupt(Signal::SIGTERM)
        .grace_period(Duration::from_secs(10));
    let mut stdout = cmd.stdout_pipe().unwrap();
    cmd.start().unwrap();
    assert_eq!(read_line(&mut stdout).await, "ready");

    ctx.cancel();
    let err = wait(&cmd).await.unwrap_err();
    assert!(matches!(err, ExecError::Context(ContextError::Canceled)));
    assert_eq!(cmd.process_state().and_then(|s| s.code()), Some(0));
}

#[tokio::test]
async fn test_ignored_interrupt_is_killed() {
    let ctx = Context::new();
    let mut cmd = Command::with_context(ctx.clone(), "sh")
        .arg("-c")
        .arg(IGNORES_TERM)
        .interrupt(Signal::SIGTERM)
        .grace_period(Duration::from_millis(200));
    let mut stdout = cmd.stdout_pipe().unwrap();
    cmd.start().unwrap();
    assert_eq!(read_line(&mut stdout).await, "ready");

    ctx.cancel();
    let err = wait(&cmd).await.unwrap_err();
    let status = err.exit_status().expect("killed process has an exit status");
    assert_eq!(status.signal(), Some(libc::SIGKILL));
}

#[tokio::test]
async fn test_orphan_holding_pipe_hits_grace_period() {
    let output = SharedBuffer::new();
    let mut cmd = sh("sleep 3 & echo started")
        .stdout(Output::writer(output.clone()))
        .grace_period(Duration::from_millis(100));

    let begun = Instant::now();
    let err = cmd.run().await.unwrap_err();
    assert!(matches!(err, ExecError::GracePeriodExpired));
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(output.contents(), b"started\n");
    assert_eq!(cmd.process_state().and_then(|s| s.code()), Some(0));
}

#[tokio::test]
async fn test_zero_grace_keeps_output_after_exit() {
    for _ in 0..20 {
        let output = SharedBuffer::new();
        let mut cmd = sh("head -c 200000 /dev/zero")
            .stdout(Output::writer(output.clone()))
            .grace_period(Duration::ZERO);
        assert!(cmd.run().await.unwrap().success());
        assert_eq!(output.contents().len(), 200_000);
    }
}

#[tokio::test]
async fn test_zero_grace_kills_on_cancel() {
    let ctx = Context::new();
    let mut cmd = Command::with_context(ctx.clone(), "sh")
        .arg("-c")
        .arg(IGNORES_TERM)
        .interrupt(Signal::SIGTERM)
        .grace_period(Duration::ZERO);
    let mut stdout = cmd.stdout_pipe().unwrap();
    cmd.start().unwrap();
    assert_eq!(read_line(&mut stdout).await, "ready");

    let begun = Instant::now();
    ctx.cancel();
    let err = wait(&cmd).await.unwrap_err();
    let status = err.exit_status().expect("killed process has an exit status");
    assert_eq!(status.signal(), Some(libc::SIGKILL));
    assert!(begun.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_deadline_kills_by_default() {
    let ctx = Context::with_timeout(Duration::from_millis(100));
    let mut cmd = Command::with_context(ctx.clone(), "sleep").arg("5");

    let err = cmd.run().await.unwrap_err();
    let status = err.exit_status().expect("killed process has an exit status");
    assert_eq!(status.signal(), Some(libc::SIGKILL));
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
}

#[tokio::test]
async fn test_handled_deadline_reports_deadline() {
    let ctx = Context::with_timeout(Duration::from_millis(300));
    let mut cmd = Command::with_context(ctx, "sh")
        .arg("-c")
        .arg(HANDLES_TERM)
        .interrupt(Signal::SIGTERM)
        .grace_period(Duration::from_secs(10));

    let err = cmd.run().await.unwrap_err();
    assert!(matches!(
        err,
        ExecError::Context(ContextError::DeadlineExceeded)
    ));
}

#[tokio::test]
async fn test_cancel_without_escalation_is_ignored() {
    let ctx = Context::new();
    ctx.cancel();
    let mut cmd = Command::with_context(ctx, "sleep").arg("0.1").no_interrupt();
    assert!(cmd.run().await.unwrap().success());
}

// ============================================================================
// Start failures
// ============================================================================

#[tokio::test]
async fn test_missing_program_fails_at_start() {
    let mut cmd = Command::new("/nonexistent/graceexec-test-binary");
    let stdout = cmd.stdout_pipe().unwrap();

    match cmd.start() {
        Err(ExecError::Spawn { source, .. }) => {
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("expected spawn error, got {other:?}"),
    }
    assert!(stdout.is_closed());
    assert!(matches!(cmd.wait().await, Err(ExecError::NotStarted)));
    assert!(matches!(cmd.start(), Err(ExecError::AlreadyStarted)));
}

#[tokio::test]
async fn test_interrupt_requires_context() {
    let mut cmd = sh("exit 0").interrupt(Signal::SIGTERM);
    let stdout = cmd.stdout_pipe().unwrap();
    let err = cmd.start().unwrap_err();
    assert!(matches!(err, ExecError::InterruptWithoutContext));
    assert!(err.is_config_error());
    assert!(stdout.is_closed());
    assert!(cmd.id().is_none());
}

#[tokio::test]
async fn test_policy_rejects_signal() {
    let mut cmd = Command::with_context(Context::new(), "true")
        .interrupt(Signal::SIGINT)
        .signal_policy(Arc::new(KillOnlyPolicy));
    assert!(matches!(
        cmd.start(),
        Err(ExecError::UnsupportedSignal {
            signal: Signal::SIGINT
        })
    ));
}

// ============================================================================
// Process attributes
// ============================================================================

#[tokio::test]
async fn test_working_directory_sets_pwd() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = sh("printf %s \"$PWD\"").current_dir(dir.path());
    let output = cmd.combined_output().await.unwrap();
    assert_eq!(String::from_utf8(output).unwrap(), dir.path().display().to_string());
}

#[tokio::test]
async fn test_inherited_pwd_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = sh("printf %s \"$PWD\"")
        .env("GRACEEXEC_TEST", "1")
        .current_dir(dir.path());
    let output = cmd.combined_output().await.unwrap();
    assert_eq!(String::from_utf8(output).unwrap(), dir.path().display().to_string());
}

#[tokio::test]
async fn test_explicit_pwd_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::new("env")
        .env_clear()
        .env("PWD", "/custom")
        .current_dir(dir.path());
    let output = String::from_utf8(cmd.combined_output().await.unwrap()).unwrap();
    assert!(output.lines().any(|line| line == "PWD=/custom"));
    assert_eq!(output.matches("PWD=").count(), 1);
}

#[tokio::test]
async fn test_env_clear_forgets_earlier_pwd() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::new("env")
        .env("PWD", "/custom")
        .env_clear()
        .env("GRACEEXEC_TEST", "1")
        .current_dir(dir.path());
    let output = String::from_utf8(cmd.combined_output().await.unwrap()).unwrap();
    let expected = format!("PWD={}", dir.path().display());
    assert!(output.lines().any(|line| line == expected), "{output}");
    assert_eq!(output.matches("PWD=").count(), 1);
}

#[tokio::test]
async fn test_extra_file_is_inherited() {
    let (mut reader, writer) = std::io::pipe().unwrap();
    let fd = writer.as_raw_fd();
    let mut cmd = sh(&format!("echo via-extra-fd > /dev/fd/{fd}")).extra_file(writer);
    cmd.run().await.unwrap();

    // Our copy of the write end was closed at start, so this sees EOF.
    let mut received = String::new();
    reader.read_to_string(&mut received).unwrap();
    assert_eq!(received, "via-extra-fd\n");
}

#[tokio::test]
async fn test_process_group_leader() {
    let mut cmd = Command::new("sleep").arg("5").process_group(0);
    cmd.start().unwrap();
    let pid = cmd.id().unwrap();
    let raw = nix::unistd::Pid::from_raw(i32::try_from(pid).unwrap());
    assert_eq!(nix::unistd::getpgid(Some(raw)).unwrap(), raw);

    nix::sys::signal::kill(raw, Signal::SIGKILL).unwrap();
    let err = wait(&cmd).await.unwrap_err();
    assert_eq!(
        err.exit_status().and_then(|s| s.signal()),
        Some(libc::SIGKILL)
    );
}
