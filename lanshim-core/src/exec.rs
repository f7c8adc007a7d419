//! Host command execution.
//!
//! Every host mutation goes through [`run`], which logs the command line,
//! captures its output and classifies failures so callers can tell a missing
//! target or a privilege problem apart from a genuine failure.

use crate::error::HostError;
use std::ffi::OsStr;
use std::process::Output;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;
use tracing::{debug, warn};

static COMMAND_ID: AtomicU64 = AtomicU64::new(0);

/// Render a program and its arguments the way they would be typed.
pub fn command_line<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Run `program` with `args`, returning stdout on success.
pub async fn run<I, S>(program: &str, args: I) -> Result<String, HostError>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    let command = command_line(program, args.clone());
    let id = COMMAND_ID.fetch_add(1, Ordering::Relaxed);
    debug!(id, command = %command, "running command");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| HostError::Spawn { command: command.clone(), source })?;

    debug!(
        id,
        status = output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
        "finished command"
    );

    if !output.status.success() {
        let err = classify_failure(command, &output);
        warn!(id, "{}", err);
        return Err(err);
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Map a failed command's stderr onto a [`HostError`] kind.
pub(crate) fn classify_failure(command: String, output: &Output) -> HostError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let status = output.status.to_string();
    classify_stderr(command, status, stderr)
}

pub(crate) fn classify_stderr(command: String, status: String, stderr: String) -> HostError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("operation not permitted") || lower.contains("permission denied") {
        HostError::PermissionDenied { command, stderr }
    } else if lower.contains("cannot find device")
        || lower.contains("does not exist")
        || lower.contains("no such process")
        || lower.contains("no such device")
        || lower.contains("not loaded")
    {
        HostError::NotFound { command, stderr }
    } else {
        HostError::Failed { command, status, stderr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(stderr: &str) -> HostError {
        classify_stderr("ip link".into(), "exit status: 2".into(), stderr.into())
    }

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("ip", ["link", "del", "lanshim0"]),
            "ip link del lanshim0"
        );
    }

    #[test]
    fn test_classify_permission() {
        assert!(classify("RTNETLINK answers: Operation not permitted").is_permission_denied());
    }

    #[test]
    fn test_classify_not_found() {
        assert!(classify("Cannot find device \"lanshim0\"").is_not_found());
        assert!(classify("RTNETLINK answers: No such process").is_not_found());
    }

    #[test]
    fn test_classify_other() {
        let err = classify("RTNETLINK answers: File exists");
        assert!(!err.is_not_found());
        assert!(!err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_run_reports_spawn_failure() {
        let err = run("lanshim-no-such-binary", ["x"]).await.unwrap_err();
        assert!(matches!(err, HostError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("echo", ["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
