//! External command execution with a timeout

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::utils::error::{CertError, CertResult};

/// Outcome of one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl CommandReport {
    /// stderr if present, else stdout, trimmed
    pub fn diagnostics(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Run `program args...`, killing it if it outlives `limit`
///
/// Spawn failures are errors; a non-zero exit or a timeout is reported through
/// `success: false`.
pub async fn run_command<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    limit: Duration,
) -> CertResult<CommandReport> {
    let command_str = format!(
        "{} {}",
        program.display(),
        args.iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    );
    info!("Executing: {}", command_str);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let result = timeout(limit, cmd.output()).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => {
            let report = CommandReport {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
                duration_ms,
            };

            if report.success {
                debug!(
                    "Command succeeded in {}ms: {}",
                    duration_ms, command_str
                );
            } else {
                error!(
                    "Command FAILED: exit_code={:?}, command='{}': {}",
                    report.exit_code,
                    command_str,
                    report.diagnostics()
                );
            }
            Ok(report)
        }
        Ok(Err(e)) => Err(CertError::Command(format!(
            "failed to run '{}': {}",
            command_str, e
        ))),
        Err(_) => {
            error!(
                "Command TIMEOUT after {}s: '{}'",
                limit.as_secs(),
                command_str
            );
            Ok(CommandReport {
                success: false,
                stdout: String::new(),
                stderr: format!("timed out after {} seconds", limit.as_secs()),
                exit_code: None,
                duration_ms,
            })
        }
    }
}
