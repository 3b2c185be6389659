//! Execution seam for the external machine tool.
//!
//! Everything that talks to the tool goes through [`CommandRunner`], so the
//! reconciler and lifecycle operations can be driven against a scripted
//! runner in tests. [`MachineTool`] is the production implementation.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::RunError;

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Line-oriented sink for the tool's own output, so callers can surface it
/// to the user while the invocation runs through the normal error path.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-invocation options: environment overrides, an optional cancellation
/// token, and an optional output sink. A cancelled invocation kills the
/// child and fails.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub envs: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
    pub logger: Option<LogSink>,
}

impl RunOptions {
    pub fn cancellable(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::default()
        }
    }

    pub fn with_logger(mut self, logger: LogSink) -> Self {
        self.logger = Some(logger);
        self
    }
}

pub trait CommandRunner: Send + Sync {
    fn execute(
        &self,
        args: &[String],
        opts: RunOptions,
    ) -> impl Future<Output = Result<RunOutput, RunError>> + Send;
}

// ── MachineTool ──────────────────────────────────────────

/// Runs the machine tool binary as a child process, capturing both streams.
#[derive(Debug, Clone)]
pub struct MachineTool {
    binary: PathBuf,
}

impl MachineTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

impl CommandRunner for MachineTool {
    async fn execute(&self, args: &[String], opts: RunOptions) -> Result<RunOutput, RunError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the in-flight future (cancellation) must not leave
            // an orphaned child behind.
            .kill_on_drop(true);
        for (key, value) in &opts.envs {
            cmd.env(key, value);
        }

        tracing::debug!(binary = %self.binary.display(), ?args, "invoking machine tool");

        let child = cmd.spawn().map_err(|e| {
            RunError::message(format!("failed to spawn {}: {e}", self.binary.display()))
        })?;

        let waited = child.wait_with_output();
        let output = match opts.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(RunError {
                            name: Some("Cancelled".into()),
                            message: Some(format!(
                                "{} {} cancelled",
                                self.binary.display(),
                                args.join(" ")
                            )),
                            stderr: None,
                        });
                    }
                    result = waited => result,
                }
            }
            None => waited.await,
        }
        .map_err(|e| RunError::message(format!("failed to wait for {}: {e}", self.binary.display())))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        // Forward the tool's own output before the exit check so a failed
        // invocation still reaches the sink.
        if let Some(logger) = &opts.logger {
            for line in stdout.lines().chain(stderr.lines()) {
                logger(line);
            }
        }

        if !output.status.success() {
            return Err(RunError {
                name: None,
                message: Some(format!(
                    "{} {} exited with {}",
                    self.binary.display(),
                    args.join(" "),
                    output.status,
                )),
                stderr: (!stderr.is_empty()).then_some(stderr),
            });
        }

        Ok(RunOutput { stdout, stderr })
    }
}
