use crate::script::{ParamValues, Script};
use crate::shell::ShellScriptTool;
use crate::traits::{ScriptTool, ToolKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: String,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: output.into(),
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Tool dispatcher. Never fails: every problem comes back as an error result
/// so one bad script cannot take down the caller.
pub struct ExecutionAgent {
    shell: ShellScriptTool,
}

impl ExecutionAgent {
    pub fn new(shell: ShellScriptTool) -> Self {
        tracing::info!(tools = ?ToolKind::ALL, "execution agent initialized");
        Self { shell }
    }

    fn tool(&self, kind: ToolKind) -> &dyn ScriptTool {
        match kind {
            ToolKind::Shell => &self.shell,
        }
    }

    #[tracing::instrument(level = "info", skip(self, script, params), fields(script_name = %script.name))]
    pub async fn run(&self, tool_name: &str, script: &Script, params: &ParamValues) -> ExecutionResult {
        let Some(kind) = ToolKind::parse(tool_name) else {
            tracing::error!(tool_name, "execution request for unknown tool");
            return ExecutionResult::error(format!("Tool '{tool_name}' not found."));
        };

        let tool = self.tool(kind);
        tracing::info!(tool = %tool.kind(), "dispatching script");
        match tool.execute(script, params).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(tool = %kind, error = %e, "tool raised while running script");
                ExecutionResult::error(format!("Failed to execute tool '{tool_name}': {e}"))
            }
        }
    }
}
