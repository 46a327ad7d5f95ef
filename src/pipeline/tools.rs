//! External tool invocation.
//!
//! qpdf and ghostscript run as child processes through a [`ToolRunner`]. The
//! trait is the seam tests use to script tool behaviour without either binary
//! installed; [`ProcessRunner`] is the real implementation.
//!
//! Every call is bounded by a deadline. On expiry the child is killed (the
//! command is spawned with `kill_on_drop`) and the call fails with
//! [`ToolExecutionError::Timeout`]. Because the wait is an ordinary future,
//! a long tool run never blocks the worker's lock renewal.

use crate::error::ToolExecutionError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// One bounded tool call.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Short label used in errors and logs (`"qpdf"`, `"gs"`).
    pub tool: &'static str,
    /// Executable to launch.
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Combined stdout + stderr cap.
    pub max_buffer: usize,
    /// Exit codes treated as success.
    pub success_codes: Vec<i32>,
}

impl ToolInvocation {
    pub fn new(tool: &'static str, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
            timeout,
            max_buffer: 1024 * 1024,
            success_codes: vec![0],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn max_buffer(mut self, bytes: usize) -> Self {
        self.max_buffer = bytes;
        self
    }

    pub fn success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }

    /// The argument following `flag`, if any.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// The value of a `-sName=value` / `-rN` style argument.
    pub fn arg_value(&self, prefix: &str) -> Option<&str> {
        self.args.iter().find_map(|a| a.strip_prefix(prefix))
    }
}

/// Captured output of a successful call.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external tools.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolExecutionError>;
}

/// [`ToolRunner`] backed by real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, inv: ToolInvocation) -> Result<ToolOutput, ToolExecutionError> {
        let start = Instant::now();
        let child = Command::new(&inv.program)
            .args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolExecutionError::Spawn {
                tool: inv.tool.to_string(),
                source,
            })?;

        let output = match tokio::time::timeout(inv.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ToolExecutionError::Spawn {
                    tool: inv.tool.to_string(),
                    source,
                })
            }
            // Dropping the wait future drops the child, which kills it.
            Err(_) => {
                return Err(ToolExecutionError::Timeout {
                    tool: inv.tool.to_string(),
                    after: inv.timeout,
                })
            }
        };

        if output.stdout.len() + output.stderr.len() > inv.max_buffer {
            return Err(ToolExecutionError::OutputTooLarge {
                tool: inv.tool.to_string(),
                limit: inv.max_buffer,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code();
        debug!(
            tool = inv.tool,
            code = ?code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "tool finished"
        );

        match code {
            Some(c) if inv.success_codes.contains(&c) => Ok(ToolOutput {
                code: c,
                stdout,
                stderr,
            }),
            _ => Err(ToolExecutionError::NonZeroExit {
                tool: inv.tool.to_string(),
                code,
                stderr: stderr.trim().to_string(),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ToolErrorKind;

    fn sh(script: &str, timeout: Duration) -> ToolInvocation {
        ToolInvocation::new("sh", "sh", timeout).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let out = ProcessRunner
            .run(sh("echo 12", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "12");
        assert_eq!(out.code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_typed() {
        let err = ProcessRunner
            .run(sh("echo broken >&2; exit 2", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::NonZero);
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn extra_success_codes_are_accepted() {
        let out = ProcessRunner
            .run(sh("exit 3", Duration::from_secs(5)).success_codes(&[0, 3]))
            .await
            .unwrap();
        assert_eq!(out.code, 3);
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let err = ProcessRunner
            .run(sh("sleep 5", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::Timeout);
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let inv = ToolInvocation::new("qpdf", "definitely-not-a-real-binary-3141", Duration::from_secs(1));
        let err = ProcessRunner.run(inv).await.unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::Spawn);
    }

    #[tokio::test]
    async fn oversized_output_is_rejected() {
        let err = ProcessRunner
            .run(sh("head -c 4096 /dev/zero", Duration::from_secs(5)).max_buffer(1024))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::OutputTooLarge);
    }

    #[test]
    fn argument_lookup() {
        let inv = ToolInvocation::new("gs", "gs", Duration::from_secs(1))
            .arg("-r600")
            .arg("-sOutputFile=/tmp/x.png")
            .arg("--pages")
            .arg("in.pdf");
        assert_eq!(inv.arg_value("-r"), Some("600"));
        assert_eq!(inv.arg_value("-sOutputFile="), Some("/tmp/x.png"));
        assert_eq!(inv.arg_after("--pages"), Some("in.pdf"));
    }
}
