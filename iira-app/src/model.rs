//! Data shared between retrieval, planning and the resolution loop.

use iira_tools::ParamValues;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentStatus {
    New,
    #[serde(rename = "In Progress")]
    InProgress,
    Resolved,
    Error,
    #[serde(rename = "SOP not found")]
    SopNotFound,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::InProgress => "In Progress",
            Self::Resolved => "Resolved",
            Self::Error => "Error",
            Self::SopNotFound => "SOP not found",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "New" => Some(Self::New),
            "In Progress" => Some(Self::InProgress),
            "Resolved" => Some(Self::Resolved),
            "Error" => Some(Self::Error),
            "SOP not found" => Some(Self::SopNotFound),
            _ => None,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    #[serde(default)]
    pub id: i64,
    pub number: String,
    pub short_description: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cmdb_ci: Option<String>,
    #[serde(default)]
    pub business_service: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub assignment_group: Option<String>,
    #[serde(default = "default_status")]
    pub status: IncidentStatus,
}

fn default_status() -> IncidentStatus {
    IncidentStatus::New
}

impl Incident {
    /// Text handed to retrieval: the short description plus the long one.
    pub fn search_text(&self) -> (&str, Option<&str>) {
        (
            self.short_description.as_str(),
            self.description.as_deref().filter(|d| !d.trim().is_empty()),
        )
    }
}

/// A documented remediation procedure (SOP) as stored in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub steps: Vec<ProcedureStep>,
}

impl Procedure {
    /// Text embedded for this procedure at ingest time.
    pub fn embedding_text(&self) -> String {
        let mut text = format!("{} {}", self.title, self.issue);
        for step in &self.steps {
            text.push(' ');
            text.push_str(&step.description);
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureStep {
    pub description: String,
    #[serde(default, alias = "script")]
    pub script_name: Option<String>,
    #[serde(default)]
    pub script_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredProcedure {
    #[serde(flatten)]
    pub procedure: Procedure,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    #[serde(default)]
    pub tool: Option<String>,
}

impl PlanStep {
    /// The named tool, or `None` for a manual step.
    pub fn tool_name(&self) -> Option<&str> {
        let tool = self.tool.as_deref()?.trim();
        match tool.to_ascii_lowercase().as_str() {
            "" | "n/a" | "none" | "null" | "manual" => None,
            _ => Some(tool),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: usize,
    pub description: String,
    pub resolved_script_name: Option<String>,
    pub resolved_script_id: Option<String>,
    #[serde(default)]
    pub extracted_parameters: ParamValues,
    pub status: StepStatus,
    pub output: String,
}

/// Context visible to parameter extraction.
///
/// Starts as the incident's fields and grows by one `{script_name}_output`
/// entry per successful step. Never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResolutionContext {
    fields: BTreeMap<String, serde_json::Value>,
}

impl ResolutionContext {
    pub fn from_incident(incident: &Incident) -> Self {
        let mut fields = BTreeMap::new();
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(incident) {
            for (k, v) in map {
                if !v.is_null() {
                    fields.insert(k, v);
                }
            }
        }
        Self { fields }
    }

    pub fn with_output(&self, script_name: &str, output: &str) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(
            format!("{script_name}_output"),
            serde_json::Value::String(output.to_string()),
        );
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.fields.clone().into_iter().collect())
    }
}
