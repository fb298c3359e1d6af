use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameter values keyed by `param_name`, as returned by the extractor.
pub type ParamValues = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptParam {
    pub param_name: String,
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl ScriptParam {
    pub fn has_default(&self) -> bool {
        self.default_value
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
    }

    /// Value passed on the command line: the supplied value, else the
    /// declared default, else nothing.
    pub fn effective_value(&self, values: &ParamValues) -> Option<String> {
        match values.get(&self.param_name) {
            Some(v) if !value_is_empty(v) => Some(render_value(v)),
            _ => self.default_value.clone().filter(|d| !d.trim().is_empty()),
        }
    }
}

/// A registered automation script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content: String,
    /// Name of the dispatch tool, e.g. `shell_script`.
    #[serde(default)]
    pub script_type: Option<String>,
    #[serde(default)]
    pub params: Vec<ScriptParam>,
}

impl Script {
    /// Required parameters that are empty in `values` and have no default.
    pub fn missing_required(&self, values: &ParamValues) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| p.required)
            .filter(|p| values.get(&p.param_name).is_none_or(value_is_empty))
            .filter(|p| !p.has_default())
            .map(|p| p.param_name.clone())
            .collect()
    }

    /// Arguments in declaration order. Parameters with neither a value nor a
    /// default are left out.
    pub fn positional_args(&self, values: &ParamValues) -> Vec<String> {
        self.params
            .iter()
            .filter_map(|p| p.effective_value(values))
            .collect()
    }
}

pub fn value_is_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => false,
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
