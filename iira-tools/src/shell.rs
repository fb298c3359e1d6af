use crate::agent::ExecutionResult;
use crate::error::{Result, ToolError};
use crate::script::{ParamValues, Script};
use crate::traits::{ScriptTool, ToolKind};
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::Command;

const NO_OUTPUT_MESSAGE: &str = "Script executed successfully with no output.";
const OUTPUT_BYTES_MAX: usize = 64_000;
const ETXTBSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ShellPolicy {
    /// `None` lets a script run until it exits.
    pub timeout: Option<Duration>,
    /// Directory the temporary script files are written to.
    pub scratch_dir: PathBuf,
}

impl Default for ShellPolicy {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(300)),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

/// Runs a script body from the registry as a standalone executable.
///
/// The body is written to a private temporary file which is removed when the
/// [`TempPath`] guard drops, on every return path.
#[derive(Debug, Clone)]
pub struct ShellScriptTool {
    policy: ShellPolicy,
}

impl ShellScriptTool {
    pub fn new(policy: ShellPolicy) -> Self {
        Self { policy }
    }

    async fn materialize(&self, content: String) -> Result<TempPath> {
        let dir = self.policy.scratch_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<TempPath> {
            let mut file = tempfile::Builder::new()
                .prefix("iira-")
                .suffix(".sh")
                .tempfile_in(&dir)?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755))?;
            }
            // Close the write handle before exec.
            Ok(file.into_temp_path())
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("script write task join error: {e}")))?
    }

    async fn spawn(&self, path: &TempPath, args: &[String]) -> Result<tokio::process::Child> {
        let mut attempt = 1;
        loop {
            let mut cmd = Command::new(path.to_path_buf());
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            match cmd.spawn() {
                Ok(child) => return Ok(child),
                // A concurrent fork can briefly hold the freshly written file open.
                Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                    tracing::debug!(attempt, "script file busy; retrying spawn");
                    tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(ToolError::ExecutionFailed(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl ScriptTool for ShellScriptTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Shell
    }

    #[tracing::instrument(level = "info", skip_all, fields(script_name = %script.name))]
    async fn execute(&self, script: &Script, params: &ParamValues) -> Result<ExecutionResult> {
        if script.content.trim().is_empty() {
            return Err(ToolError::InvalidArguments(format!(
                "Script content for '{}' is empty.",
                script.name
            )));
        }

        let args = script.positional_args(params);
        let path = self.materialize(script.content.clone()).await?;
        tracing::info!(path = %path.display(), args = ?args, "running script");

        let child = self.spawn(&path, &args).await?;
        let output = match self.policy.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| ToolError::Timeout(timeout.as_secs()))??,
            None => child.wait_with_output().await?,
        };
        drop(path);

        let stdout = truncate(String::from_utf8_lossy(&output.stdout).trim());
        let stderr = truncate(String::from_utf8_lossy(&output.stderr).trim());

        if output.status.success() {
            tracing::info!(script_name = %script.name, "script succeeded");
            let out = if stdout.is_empty() {
                NO_OUTPUT_MESSAGE.to_string()
            } else {
                stdout
            };
            return Ok(ExecutionResult::success(out));
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let combined = format!("{stdout}\n{stderr}").trim().to_string();
        tracing::error!(script_name = %script.name, exit_code, output = %combined, "script failed");
        Ok(ExecutionResult::error(combined))
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= OUTPUT_BYTES_MAX {
        return s.to_string();
    }
    let mut end = OUTPUT_BYTES_MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &s[..end])
}
