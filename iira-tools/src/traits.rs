use crate::agent::ExecutionResult;
use crate::error::Result;
use crate::script::{ParamValues, Script};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The closed set of dispatch tools a script can name in `script_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    #[serde(rename = "shell_script")]
    Shell,
}

impl ToolKind {
    pub const ALL: [ToolKind; 1] = [ToolKind::Shell];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell_script",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shell_script" | "shell" | "sh" => Some(Self::Shell),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ScriptTool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Run `script` with `params`. A non-zero exit is an `Ok` error result;
    /// `Err` means the script could not be run at all.
    async fn execute(&self, script: &Script, params: &ParamValues) -> Result<ExecutionResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_kind_parses_aliases() {
        assert_eq!(ToolKind::parse("shell_script"), Some(ToolKind::Shell));
        assert_eq!(ToolKind::parse(" Shell "), Some(ToolKind::Shell));
        assert_eq!(ToolKind::parse("python_script"), None);
    }

    #[test]
    fn tool_kind_serializes_as_script_type() {
        let v = serde_json::to_value(ToolKind::Shell).unwrap();
        assert_eq!(v, serde_json::json!("shell_script"));
    }
}
