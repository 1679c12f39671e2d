//! External media-resolution helper invocation
//!
//! The helper is an external program (yt-dlp in production). Callers see a
//! single awaited call returning exit code plus captured output; the process
//! is killed if it outlives its timeout.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of a finished helper process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HelperOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl HelperOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("helper did not finish within {0:?} and was killed")]
    Timeout(Duration),

    #[error("failed to run helper: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One helper call
#[derive(Debug, Clone)]
pub struct HelperInvocation {
    pub args: Vec<String>,
    /// Cookie file to authenticate with, if credentials are in use
    pub cookies: Option<PathBuf>,
    pub timeout: Duration,
}

#[async_trait]
pub trait MediaHelper: Send + Sync {
    async fn run(&self, invocation: &HelperInvocation) -> Result<HelperOutput, HelperError>;
}

/// Runs the helper as a child process
#[derive(Debug, Clone)]
pub struct ProcessHelper {
    program: String,
    base_args: Vec<String>,
}

impl ProcessHelper {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// yt-dlp with quiet, config-independent defaults and an optional
    /// outbound proxy
    pub fn yt_dlp(binary: impl Into<String>, proxy: Option<&str>) -> Self {
        let mut base_args = vec![
            "--ignore-config".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
        ];
        if let Some(proxy) = proxy {
            base_args.push("--proxy".to_string());
            base_args.push(proxy.to_string());
        }
        Self::new(binary, base_args)
    }
}

#[async_trait]
impl MediaHelper for ProcessHelper {
    async fn run(&self, invocation: &HelperInvocation) -> Result<HelperOutput, HelperError> {
        let mut command = Command::new(&self.program);
        command.args(&self.base_args);
        if let Some(cookies) = &invocation.cookies {
            command.arg("--cookies").arg(cookies);
        }
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            program = %self.program,
            args = ?invocation.args,
            with_cookies = invocation.cookies.is_some(),
            "Spawning helper"
        );
        let child = command.spawn()?;

        // Dropping the wait future on timeout drops the child, which kills it
        match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(HelperOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    timeout_ms = invocation.timeout.as_millis() as u64,
                    "Helper timed out and was killed"
                );
                Err(HelperError::Timeout(invocation.timeout))
            }
        }
    }
}
