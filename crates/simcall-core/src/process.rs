//! External program execution.
//!
//! [`ProcessRunner::run`] launches one command in a working directory, waits
//! for it (bounded by an optional timeout) and reports the exit code with the
//! captured streams. A non-zero exit is a normal [`ProcessOutput`]; only
//! launch failures and timeouts are errors. A timed-out program still reports
//! what it wrote before it was killed.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long a killed program's pipes get to drain.
const PIPE_GRACE: Duration = Duration::from_millis(100);

/// Errors produced while running an external program.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("cannot launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {limit_ms}ms")]
    Timeout {
        program: String,
        limit_ms: u64,
        /// Output written before the kill.
        stdout: String,
        stderr: String,
    },

    #[error("waiting for {program} failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for process execution.
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

/// Outcome of a program that ran to completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    /// Exit code; -1 when the process was terminated by a signal.
    pub exit_code: i32,

    /// Captured stdout (empty when not captured).
    pub stdout: String,

    /// Captured stderr (empty when not captured).
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ProcessOutput {
    /// Whether the program exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Program invocation as written in a job descriptor.
///
/// A string is a shell command line; an array is an argument vector run
/// without a shell. Either way the input file path is appended as the last
/// positional argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Program {
    Shell(String),
    Argv(Vec<String>),
}

impl Program {
    /// Full argument vector for evaluating `input`.
    pub fn command_for(&self, input: &Path) -> Vec<String> {
        let input = input.display().to_string();
        match self {
            Program::Shell(line) => shell_command(line, input),
            Program::Argv(argv) => {
                let mut cmd = argv.clone();
                cmd.push(input);
                cmd
            }
        }
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &str {
        match self {
            Program::Shell(line) => line.split_whitespace().next().unwrap_or(""),
            Program::Argv(argv) => argv.first().map(String::as_str).unwrap_or(""),
        }
    }
}

#[cfg(unix)]
fn shell_command(line: &str, input: String) -> Vec<String> {
    // `$1` keeps the input path out of the shell parser.
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("{line} \"$1\""),
        "simcall".to_string(),
        input,
    ]
}

#[cfg(not(unix))]
fn shell_command(line: &str, input: String) -> Vec<String> {
    vec![
        "cmd".to_string(),
        "/C".to_string(),
        format!("{line} \"{input}\""),
    ]
}

type StreamBuffer = Arc<Mutex<Vec<u8>>>;

/// Copy `pipe` into `buffer` as the program writes it.
fn drain<R>(pipe: Option<R>, buffer: &StreamBuffer) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut pipe = pipe?;
    let buffer = Arc::clone(buffer);
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    }))
}

async fn captured(buffer: &StreamBuffer) -> String {
    let bytes = buffer.lock().await;
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Runs external programs.
pub struct ProcessRunner;

impl ProcessRunner {
    /// Run `command` (first element is the executable) inside `working_dir`.
    ///
    /// Each call owns its pipes. When `timeout` elapses the child is killed
    /// and [`ProcessError::Timeout`] is returned.
    pub async fn run(
        command: &[String],
        capture_stdout: bool,
        capture_stderr: bool,
        working_dir: &Path,
        timeout: Option<Duration>,
    ) -> ProcessResult<ProcessOutput> {
        let start = Instant::now();

        let Some((exe, args)) = command.split_first() else {
            return Err(ProcessError::EmptyCommand);
        };

        let pipe = |capture: bool| if capture { Stdio::piped() } else { Stdio::null() };

        let mut child = Command::new(exe)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(pipe(capture_stdout))
            .stderr(pipe(capture_stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Launch {
                program: exe.clone(),
                source,
            })?;

        debug!(program = %exe, workdir = %working_dir.display(), pid = ?child.id(), "launched");

        let stdout = StreamBuffer::default();
        let stderr = StreamBuffer::default();
        let mut readers = [
            drain(child.stdout.take(), &stdout),
            drain(child.stderr.take(), &stderr),
        ];

        // Dropping the pending future drops the child, which kills it.
        let finished = async {
            let status = child.wait().await;
            for reader in readers.iter_mut().flatten() {
                let _ = reader.await;
            }
            status
        };
        let status = match timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.ok(),
            None => Some(finished.await),
        };

        let Some(status) = status else {
            let _ = child.kill().await;
            for reader in readers.iter_mut().flatten() {
                if tokio::time::timeout(PIPE_GRACE, &mut *reader).await.is_err() {
                    reader.abort();
                }
            }
            let limit_ms = timeout.map_or(0, |limit| limit.as_millis() as u64);
            debug!(program = %exe, limit_ms, "killed after timeout");
            return Err(ProcessError::Timeout {
                program: exe.clone(),
                limit_ms,
                stdout: captured(&stdout).await,
                stderr: captured(&stderr).await,
            });
        };
        let status = status.map_err(|source| ProcessError::Wait {
            program: exe.clone(),
            source,
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = status.code().unwrap_or(-1);
        debug!(program = %exe, exit_code, elapsed_ms = duration_ms, "exited");

        Ok(ProcessOutput {
            exit_code,
            stdout: captured(&stdout).await,
            stderr: captured(&stderr).await,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_process_output_success() {
        let out = ProcessOutput::default();
        assert!(out.success());
        let out = ProcessOutput {
            exit_code: 3,
            ..Default::default()
        };
        assert!(!out.success());
    }

    #[test]
    fn test_program_untagged_serde() {
        let p: Program = serde_json::from_str("\"./beam --fast\"").unwrap();
        assert_eq!(p, Program::Shell("./beam --fast".to_string()));
        assert_eq!(p.name(), "./beam");

        let p: Program = serde_json::from_str("[\"sh\", \"beam.sh\"]").unwrap();
        assert_eq!(
            p.command_for(Path::new("in.txt")),
            argv(&["sh", "beam.sh", "in.txt"])
        );
    }

    #[tokio::test]
    async fn test_empty_command() {
        let err = ProcessRunner::run(&[], true, true, Path::new("."), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let err = ProcessRunner::run(
            &argv(&["simcall-definitely-not-installed"]),
            true,
            true,
            Path::new("."),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessRunner::run(
            &argv(&["sh", "-c", "echo out; echo err >&2; exit 4"]),
            true,
            true,
            dir.path(),
            Some(Duration::from_secs(10)),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 4);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uncaptured_streams_are_empty() {
        let out = ProcessRunner::run(
            &argv(&["sh", "-c", "echo hidden; echo hidden >&2"]),
            false,
            false,
            Path::new("."),
            None,
        )
        .await
        .unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
        assert!(out.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let out = ProcessRunner::run(
            &argv(&["cat", "marker.txt"]),
            true,
            false,
            dir.path(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "here");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = Instant::now();
        let err = ProcessRunner::run(
            &argv(&["sleep", "5"]),
            true,
            true,
            Path::new("."),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { limit_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let err = ProcessRunner::run(
            &argv(&["sh", "-c", "echo started; echo warming up >&2; exec sleep 5"]),
            true,
            true,
            Path::new("."),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
        match err {
            ProcessError::Timeout { stdout, stderr, .. } => {
                assert_eq!(stdout.trim(), "started");
                assert_eq!(stderr.trim(), "warming up");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_program_receives_input_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in put.txt"), "42").unwrap();
        let cmd = Program::Shell("cat".to_string()).command_for(Path::new("in put.txt"));
        let out = ProcessRunner::run(&cmd, true, true, dir.path(), None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "42");
    }
}
