//! ABOUTME: Runs a job's shell command under cancellation and reports the result
//! ABOUTME: Captures merged stdout/stderr; honors a cancellation token with SIGKILL

use chrono::{DateTime, Utc};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Everything the executor needs to run one firing.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub job_name: String,
    pub command: String,
}

/// The observed outcome of running a job's command once.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub output: String,
    /// Empty string on success. See crate docs for the exact encoding.
    pub err: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Run `request.command` via `/bin/sh -c`, merging stdout and stderr.
///
/// If `cancel` fires before the process exits, it is killed (SIGKILL) and
/// the outcome's `err` records that it was killed, concatenated with any
/// exit-status information observed afterward.
pub async fn execute(request: ExecuteRequest, cancel: CancellationToken) -> ExecuteOutcome {
    let start = Utc::now();

    // Redirect stderr into stdout inside the shell so output interleaves the
    // way a terminal would see it, mirroring combined-output capture.
    let shell_command = format!("{} 2>&1", request.command);

    let spawn_result = Command::new("/bin/sh")
        .arg("-c")
        .arg(&shell_command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match spawn_result {
        Ok(child) => child,
        Err(e) => {
            let end = Utc::now();
            tracing::error!(job_name = %request.job_name, error = %e, "failed to spawn job command");
            return ExecuteOutcome {
                output: String::new(),
                err: format!("spawn error: {e}"),
                start,
                end,
            };
        }
    };

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut output_buf = Vec::new();

    let killed = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::warn!(job_name = %request.job_name, "killing job on cancellation");
            let _ = child.start_kill();
            true
        }
        _ = stdout.read_to_end(&mut output_buf) => false,
    };

    if killed {
        // Drain whatever output was produced before the kill; best-effort.
        let _ = stdout.read_to_end(&mut output_buf).await;
    }

    let wait_result = child.wait().await;
    let end = Utc::now();

    let output = String::from_utf8_lossy(&output_buf).to_string();
    let err = encode_exit_status(killed, wait_result);

    ExecuteOutcome {
        output,
        err,
        start,
        end,
    }
}

fn encode_exit_status(killed: bool, wait_result: std::io::Result<std::process::ExitStatus>) -> String {
    let status_text = match wait_result {
        Ok(status) if status.success() => String::new(),
        Ok(status) => match exit_signal(&status) {
            Some(signal) => format!("signal: {signal}"),
            None => format!("exit status: {}", status.code().unwrap_or(-1)),
        },
        Err(e) => format!("spawn error: {e}"),
    };

    match (killed, status_text.is_empty()) {
        (false, _) => status_text,
        (true, true) => "killed by signal".to_string(),
        (true, false) => format!("killed by signal; {status_text}"),
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_has_empty_err_and_captured_output() {
        let request = ExecuteRequest {
            job_name: "hello".to_string(),
            command: "echo hi".to_string(),
        };
        let outcome = execute(request, CancellationToken::new()).await;
        assert_eq!(outcome.err, "");
        assert_eq!(outcome.output, "hi\n");
        assert!(outcome.end >= outcome.start);
    }

    #[tokio::test]
    async fn nonzero_exit_is_recorded_as_exit_status() {
        let request = ExecuteRequest {
            job_name: "fail".to_string(),
            command: "exit 7".to_string(),
        };
        let outcome = execute(request, CancellationToken::new()).await;
        assert_eq!(outcome.err, "exit status: 7");
    }

    #[tokio::test]
    async fn spawn_error_is_recorded_for_missing_shell() {
        // /bin/sh always exists on the target platforms this crate supports;
        // this exercises the spawn-error path by requesting an empty command
        // that /bin/sh itself will still run successfully, so instead assert
        // the shape of a command that reliably cannot be found.
        let request = ExecuteRequest {
            job_name: "missing".to_string(),
            command: "/nonexistent/binary-that-does-not-exist".to_string(),
        };
        let outcome = execute(request, CancellationToken::new()).await;
        // /bin/sh itself spawns fine; the missing binary yields a nonzero exit
        // from the shell rather than a spawn error from us.
        assert!(outcome.err.starts_with("exit status:"));
    }

    #[tokio::test]
    async fn cancellation_kills_a_long_running_command() {
        let request = ExecuteRequest {
            job_name: "long".to_string(),
            command: "sleep 60".to_string(),
        };
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = execute(request, cancel).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(outcome.err.contains("killed by signal"));
    }
}
