//! Script execution tools for IIRA.
//!
//! A resolved plan step is handed to the [`ExecutionAgent`], which dispatches
//! it to the tool named by the script's `script_type`.

mod agent;
mod error;
mod script;
mod shell;
mod traits;

pub use agent::{ExecutionAgent, ExecutionResult, ExecutionStatus};
pub use error::{Result, ToolError};
pub use script::{ParamValues, Script, ScriptParam, value_is_empty};
pub use shell::{ShellPolicy, ShellScriptTool};
pub use traits::{ScriptTool, ToolKind};
