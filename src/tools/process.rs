//! External process invocation with a hard deadline.
//!
//! Tools never get a stdin: an interactive prompt would otherwise hang the
//! pipeline until the deadline. When the deadline passes the whole process
//! group is killed and whatever the tool had printed so far is returned.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long to wait for the output readers after the child is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A fully built command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{}'", part)
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Seam between adapters and the operating system.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            child.stdout.take().map(|r| drain(r, stdout_buf.clone())),
            child.stderr.take().map(|r| drain(r, stderr_buf.clone())),
        ];

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(source)) => {
                return Err(ProcessError::Wait {
                    program: spec.program.clone(),
                    source,
                })
            }
            Err(_) => {
                kill_group(&mut child).await;
                (None, true)
            }
        };

        for reader in readers.into_iter().flatten() {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
                abort.abort();
            }
        }

        Ok(ProcessOutput {
            stdout: sanitize_output(&take_buffer(&stdout_buf)),
            stderr: sanitize_output(&take_buffer(&stderr_buf)),
            exit_code,
            timed_out,
        })
    }
}

fn drain<R>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut guard) = buf.lock() {
                        guard.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn take_buffer(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    buf.lock().map(|mut guard| std::mem::take(&mut *guard)).unwrap_or_default()
}

/// Kill the child together with anything it spawned.
async fn kill_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a negative pid signals the process group the
        // child leads; it touches no memory.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

/// Make tool output safe to store and display.
/// Binary output is replaced by a short notice; control characters other
/// than newlines, tabs and carriage returns are dropped.
pub fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text = String::from_utf8_lossy(bytes);
    text.chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let started = std::time::Instant::now();
        let output = SystemRunner
            .run(&sh("echo partial; sleep 5; echo never"), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(output.stdout.contains("partial"));
        assert!(!output.stdout.contains("never"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let output = SystemRunner
            .run(&sh("echo out; echo err >&2; exit 3"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!output.timed_out);
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.combined(), "out\n\nerr\n");
    }

    #[tokio::test]
    async fn test_stdin_is_closed() {
        let output = SystemRunner
            .run(&sh("read line; echo \"got:$line\""), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!output.timed_out);
        assert_eq!(output.stdout.trim(), "got:");
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let err = SystemRunner
            .run(&CommandSpec::new("definitely-not-a-real-tool-xyz"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_sanitize_output() {
        assert_eq!(sanitize_output(b"ok\x00\x07 done\n"), "ok done\n");
        let binary = vec![0x01u8; 200];
        assert!(sanitize_output(&binary).starts_with("[Binary output detected"));
    }

    #[test]
    fn test_command_display_quotes_spaces() {
        let spec = CommandSpec::new("curl").args(["-I", "http://a b"]);
        assert_eq!(spec.display(), "curl -I 'http://a b'");
    }
}
