//! Run one registered script by name with caller-supplied parameters,
//! outside any incident.

use crate::error::ResolutionError;
use crate::store::ScriptRegistry;
use iira_tools::{ExecutionAgent, ExecutionResult, ParamValues, Script};
use std::sync::Arc;

/// The tool named by the script's `script_type`, if it names one.
pub(crate) fn execution_tool(script: &Script) -> Option<&str> {
    script
        .script_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Parse `KEY=VALUE`. The value is taken as JSON when it parses as JSON and
/// as a plain string otherwise, so `PORT=8080` is a number and
/// `HOST=web-01` a string.
pub fn parse_param_assignment(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("parameter '{raw}' must look like KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("parameter '{raw}' has an empty name");
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub struct ScriptRunner {
    registry: Arc<dyn ScriptRegistry>,
    executor: Arc<ExecutionAgent>,
}

impl ScriptRunner {
    pub fn new(registry: Arc<dyn ScriptRegistry>, executor: Arc<ExecutionAgent>) -> Self {
        Self { registry, executor }
    }

    /// Names the script does not declare are dropped. Missing required
    /// parameters fail before anything runs.
    #[tracing::instrument(level = "info", skip(self, params), fields(params = params.len()))]
    pub async fn run(
        &self,
        name: &str,
        mut params: ParamValues,
    ) -> Result<ExecutionResult, ResolutionError> {
        let script = self
            .registry
            .get_script_by_name(name)
            .await
            .map_err(ResolutionError::upstream)?
            .ok_or_else(|| {
                ResolutionError::ResolutionFailure(format!("Script '{name}' not found in registry."))
            })?;
        let tool = execution_tool(&script).ok_or_else(|| {
            ResolutionError::ResolutionFailure(format!("Script '{name}' has no execution tool type."))
        })?;

        params.retain(|key, _| {
            let declared = script.params.iter().any(|p| &p.param_name == key);
            if !declared {
                tracing::warn!(param = %key, "ignoring parameter the script does not declare");
            }
            declared
        });
        let missing = script.missing_required(&params);
        if !missing.is_empty() {
            return Err(ResolutionError::ParameterFailure { missing });
        }

        let result = self.executor.run(tool, &script, &params).await;
        tracing::info!(status = ?result.status, "direct script run finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewScript, temp_database};
    use iira_tools::{ExecutionStatus, ScriptParam, ShellPolicy, ShellScriptTool};
    use serde_json::json;
    use std::time::Duration;

    fn host_param() -> ScriptParam {
        ScriptParam {
            param_name: "HOSTNAME".to_string(),
            param_type: "string".to_string(),
            required: true,
            default_value: None,
        }
    }

    fn script(name: &str, body: &str, script_type: Option<&str>) -> NewScript {
        NewScript {
            name: name.to_string(),
            description: String::new(),
            tags: vec![],
            content: body.to_string(),
            script_type: script_type.map(str::to_string),
            params: vec![host_param()],
        }
    }

    async fn runner() -> (tempfile::TempDir, ScriptRunner) {
        let (dir, db) = temp_database().await;
        db.add_script(script(
            "greet_host",
            "#!/bin/sh\necho \"hello $1\"\n",
            Some("shell_script"),
        ))
        .await
        .unwrap();
        db.add_script(script("typeless", "#!/bin/sh\necho no\n", None))
            .await
            .unwrap();
        let executor = Arc::new(ExecutionAgent::new(ShellScriptTool::new(ShellPolicy {
            timeout: Some(Duration::from_secs(10)),
            scratch_dir: dir.path().to_path_buf(),
        })));
        (dir, ScriptRunner::new(Arc::new(db), executor))
    }

    #[test]
    fn assignments_parse_json_or_fall_back_to_text() {
        assert_eq!(parse_param_assignment("PORT=8080").unwrap(), ("PORT".to_string(), json!(8080)));
        assert_eq!(
            parse_param_assignment("HOSTNAME=web-01").unwrap(),
            ("HOSTNAME".to_string(), json!("web-01"))
        );
        assert_eq!(
            parse_param_assignment("QUERY=a=b").unwrap(),
            ("QUERY".to_string(), json!("a=b"))
        );
        assert_eq!(parse_param_assignment("EMPTY=").unwrap().1, json!(""));
        assert!(parse_param_assignment("novalue").is_err());
        assert!(parse_param_assignment(" =x").is_err());
    }

    #[tokio::test]
    async fn runs_script_with_given_parameters() {
        let (_dir, runner) = runner().await;
        let params = ParamValues::from([
            ("HOSTNAME".to_string(), json!("web-01")),
            ("UNUSED".to_string(), json!(1)),
        ]);
        let result = runner.run("greet_host", params).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.output.trim(), "hello web-01");
    }

    #[tokio::test]
    async fn missing_required_parameter_fails_before_running() {
        let (_dir, runner) = runner().await;
        let err = runner.run("greet_host", ParamValues::new()).await.unwrap_err();
        assert!(matches!(err, ResolutionError::ParameterFailure { missing } if missing == ["HOSTNAME"]));
    }

    #[tokio::test]
    async fn unknown_or_typeless_script_is_a_resolution_failure() {
        let (_dir, runner) = runner().await;
        let err = runner.run("nope", ParamValues::new()).await.unwrap_err();
        assert!(matches!(err, ResolutionError::ResolutionFailure(m) if m.contains("not found")));

        let params = ParamValues::from([("HOSTNAME".to_string(), json!("h"))]);
        let err = runner.run("typeless", params).await.unwrap_err();
        assert!(matches!(err, ResolutionError::ResolutionFailure(m) if m.contains("no execution tool type")));
    }
}
