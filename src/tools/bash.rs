//! Bash command execution: a configurable, cancellable shell tool used as a
//! worked `ToolRunner` example. Supports timeouts, command allow/deny lists,
//! a working-directory restriction, custom environment variables, and a
//! cap on captured stdout/stderr size.
//!
//! The allow/deny check only inspects the first token of the command
//! string; shell metacharacters (`;`, `&&`, `$(...)`) can chain additional
//! commands past it. Treat it as a first-line guard, not a sandbox.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

use crate::cancel::CancellationToken;
use crate::interfaces::{RunnerError, RunnerOutput, ToolRunner};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Linux,
    #[allow(non_camel_case_types)]
    macOS,
}

impl Platform {
    pub fn shell_path(&self) -> &'static str {
        match self {
            Platform::Linux => "/bin/bash",
            Platform::macOS => "/bin/bash",
        }
    }

    pub fn shell_flag(&self) -> &'static str {
        "-c"
    }
}

#[derive(Debug, Clone)]
pub struct BashResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl BashResult {
    pub fn success(stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            exit_code: 0,
            duration_ms,
        }
    }

    pub fn failure(stdout: String, stderr: String, exit_code: i32, duration_ms: u64) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_code,
            duration_ms,
        }
    }
}

#[derive(Debug)]
pub enum BashError {
    Timeout(String),
    CommandDenied(String),
    CwdRestrictionViolated(String),
    ExecutionFailed(String),
    IoError(std::io::Error),
    OutputTooLarge(String),
    Cancelled,
}

impl std::fmt::Display for BashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BashError::Timeout(msg) => write!(f, "Command timeout: {}", msg),
            BashError::CommandDenied(msg) => write!(f, "Command denied: {}", msg),
            BashError::CwdRestrictionViolated(msg) => {
                write!(f, "CWD restriction violated: {}", msg)
            }
            BashError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            BashError::IoError(e) => write!(f, "IO error: {}", e),
            BashError::OutputTooLarge(msg) => write!(f, "Output too large: {}", msg),
            BashError::Cancelled => write!(f, "Command cancelled"),
        }
    }
}

impl std::error::Error for BashError {}

const DEFAULT_MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

async fn read_limited<R: AsyncReadExt + Unpin>(
    mut reader: R,
    max_bytes: usize,
    stream_name: &'static str,
) -> Result<Vec<u8>, BashError> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return Ok(buf),
            Ok(n) => {
                if buf.len() + n > max_bytes {
                    return Err(BashError::OutputTooLarge(format!(
                        "{} exceeded the {} byte limit",
                        stream_name, max_bytes
                    )));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => return Err(BashError::IoError(e)),
        }
    }
}

/// Thread-safe: share a single instance via `Arc<BashTool>` across agents.
#[derive(Clone)]
pub struct BashTool {
    platform: Platform,
    timeout_secs: u64,
    allowed_commands: Arc<Mutex<Option<Vec<String>>>>,
    denied_commands: Arc<Mutex<Option<Vec<String>>>>,
    cwd_restriction: Arc<Mutex<Option<PathBuf>>>,
    env_vars: Arc<Mutex<HashMap<String, String>>>,
    max_output_size: usize,
}

impl BashTool {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            timeout_secs: 30,
            allowed_commands: Arc::new(Mutex::new(None)),
            denied_commands: Arc::new(Mutex::new(None)),
            cwd_restriction: Arc::new(Mutex::new(None)),
            env_vars: Arc::new(Mutex::new(HashMap::new())),
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Only commands starting with one of these prefixes (or whose basename
    /// does) may run.
    pub fn with_allowed_commands(self, cmds: Vec<String>) -> Self {
        *self.allowed_commands.lock().unwrap() = Some(cmds);
        self
    }

    /// Commands starting with any of these prefixes are rejected; wins over
    /// an allowlist entry for the same prefix.
    pub fn with_denied_commands(self, cmds: Vec<String>) -> Self {
        *self.denied_commands.lock().unwrap() = Some(cmds);
        self
    }

    pub fn with_cwd_restriction(self, path: PathBuf) -> Self {
        *self.cwd_restriction.lock().unwrap() = Some(path);
        self
    }

    /// Child is killed and `BashError::OutputTooLarge` returned if either
    /// stream exceeds this many bytes. Defaults to 10 MiB.
    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    pub fn with_env_var(self, key: String, value: String) -> Self {
        self.env_vars.lock().unwrap().insert(key, value);
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Case-insensitive; checks both the raw command and the basename of its
    /// first token, so `/bin/rm` and `rm` are caught by the same rule.
    fn is_command_allowed(&self, cmd: &str) -> Result<(), BashError> {
        let cmd_lower = cmd.trim().to_lowercase();

        let first_word = cmd_lower.split_whitespace().next().unwrap_or("");
        let cmd_basename = first_word.rsplit('/').next().unwrap_or(first_word);

        let matches = |entry: &str| -> bool {
            let e = entry.to_lowercase();
            cmd_lower.starts_with(&e) || cmd_basename.starts_with(&e)
        };

        if let Some(denied) = self.denied_commands.lock().unwrap().as_ref() {
            for denied_cmd in denied {
                if matches(denied_cmd) {
                    return Err(BashError::CommandDenied(format!(
                        "Command '{}' is denied",
                        denied_cmd
                    )));
                }
            }
        }

        if let Some(allowed) = self.allowed_commands.lock().unwrap().as_ref() {
            if !allowed.iter().any(|allowed_cmd| matches(allowed_cmd)) {
                return Err(BashError::CommandDenied(
                    "Command not in allowed list".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub async fn execute(&self, cmd: &str) -> Result<BashResult, BashError> {
        self.is_command_allowed(cmd)?;

        let start_time = Instant::now();
        let platform = self.platform;
        let shell_path = platform.shell_path().to_string();
        let shell_flag = platform.shell_flag().to_string();
        let cmd = cmd.to_string();
        let timeout = std::time::Duration::from_secs(self.timeout_secs);

        let env_vars = self.env_vars.lock().unwrap().clone();
        let cwd = self.cwd_restriction.lock().unwrap().clone();

        let max_output = self.max_output_size;

        match tokio::time::timeout(timeout, async move {
            let mut command = TokioCommand::new(&shell_path);
            command
                .arg(&shell_flag)
                .arg(&cmd)
                .envs(env_vars)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped());

            if let Some(dir) = cwd {
                command.current_dir(dir);
            }

            let mut child = command.spawn().map_err(BashError::IoError)?;
            let stdout_pipe = child.stdout.take().expect("stdout was piped");
            let stderr_pipe = child.stderr.take().expect("stderr was piped");

            // Read concurrently to avoid pipe-buffer deadlocks.
            let (stdout_result, stderr_result) = tokio::join!(
                read_limited(stdout_pipe, max_output, "stdout"),
                read_limited(stderr_pipe, max_output, "stderr"),
            );

            let (stdout_bytes, stderr_bytes) = match (stdout_result, stderr_result) {
                (Err(e), _) | (_, Err(e)) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return Err(e);
                }
                (Ok(out), Ok(err)) => (out, err),
            };

            let status = child.wait().await.map_err(BashError::IoError)?;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let stdout = String::from_utf8_lossy(&stdout_bytes).to_string();
            let stderr = String::from_utf8_lossy(&stderr_bytes).to_string();

            if status.success() {
                Ok(BashResult::success(stdout, stderr, duration_ms))
            } else {
                let exit_code = status.code().unwrap_or(-1);
                Ok(BashResult::failure(stdout, stderr, exit_code, duration_ms))
            }
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BashError::Timeout(format!(
                "Command exceeded {} second timeout",
                self.timeout_secs
            ))),
        }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new(Platform::Linux)
    }
}

/// Expects a `"command"` string argument. `working_dir`, if given and no
/// fixed `cwd_restriction` is configured, is applied by prefixing a `cd`.
/// Honors `ctx` cancellation by racing it against the underlying execution.
#[async_trait]
impl ToolRunner for BashTool {
    async fn execute(
        &self,
        ctx: CancellationToken,
        _name: &str,
        args: &HashMap<String, Value>,
        working_dir: Option<&str>,
    ) -> Result<RunnerOutput, RunnerError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| RunnerError::from("missing required argument: command"))?;

        let effective_command = match working_dir {
            Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
            None => command.to_string(),
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(RunnerError::from(BashError::Cancelled.to_string())),
            r = self.execute(&effective_command) => r,
        };

        let result = result.map_err(|e| RunnerError::from(e.to_string()))?;

        Ok(RunnerOutput {
            content: result.stdout.clone(),
            metadata: serde_json::json!({
                "stdout": result.stdout,
                "stderr": result.stderr,
                "exit_code": result.exit_code,
                "duration_ms": result.duration_ms,
                "success": result.success,
            }),
        })
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let bash = BashTool::new(Platform::Linux);
        let r = bash.execute("echo hello").await.unwrap();
        assert!(r.success);
        assert_eq!(r.stdout.trim(), "hello");
        assert_eq!(r.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let bash = BashTool::new(Platform::Linux);
        let r = bash.execute("exit 7").await.unwrap();
        assert!(!r.success);
        assert_eq!(r.exit_code, 7);
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let bash = BashTool::new(Platform::Linux).with_timeout(1);
        let result = bash.execute("sleep 10").await;
        assert!(matches!(result, Err(BashError::Timeout(_))));
    }

    #[tokio::test]
    async fn denylist_wins_over_allowlist() {
        let bash = BashTool::new(Platform::Linux)
            .with_allowed_commands(vec!["echo".to_string(), "rm".to_string()])
            .with_denied_commands(vec!["rm".to_string()]);
        assert!(bash.execute("rm file").await.is_err());
        assert!(bash.execute("echo ok").await.is_ok());
    }

    #[tokio::test]
    async fn tool_runner_requires_command_argument() {
        let bash = BashTool::new(Platform::Linux);
        let args = HashMap::new();
        let err = bash
            .execute(CancellationToken::new(), "bash", &args, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[tokio::test]
    async fn tool_runner_returns_stdout_as_content() {
        let bash = BashTool::new(Platform::Linux);
        let mut args = HashMap::new();
        args.insert("command".to_string(), Value::String("echo hi".to_string()));
        let out = ToolRunner::execute(&bash, CancellationToken::new(), "bash", &args, None)
            .await
            .unwrap();
        assert_eq!(out.content.trim(), "hi");
        assert_eq!(out.metadata["exit_code"].as_i64().unwrap(), 0);
    }

    #[tokio::test]
    async fn tool_runner_honors_cancellation() {
        let bash = BashTool::new(Platform::Linux).with_timeout(30);
        let ctx = CancellationToken::new();
        let mut args = HashMap::new();
        args.insert("command".to_string(), Value::String("sleep 5".to_string()));

        ctx.cancel();
        let err = ToolRunner::execute(&bash, ctx, "bash", &args, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancel"));
    }
}
