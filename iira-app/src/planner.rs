//! LLM-backed plan generation, parameter extraction, hypothetical
//! procedure writing and SOP structuring.
//!
//! Model text is never trusted: the first JSON object is cut out and
//! deserialized into a strict shape, and anything else is a typed failure.

use crate::error::ResolutionError;
use crate::model::{Plan, Procedure, ProcedureStep, ResolutionContext, ScoredProcedure};
use async_trait::async_trait;
use iira_llm::{LlmError, OllamaClient, parse_json_object};
use iira_tools::{ParamValues, ScriptParam};
use serde::Deserialize;
use std::fmt::Write as _;

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate_plan(
        &self,
        query: &str,
        candidates: &[ScoredProcedure],
    ) -> Result<Plan, ResolutionError>;
}

#[async_trait]
pub trait ParameterExtractor: Send + Sync {
    /// Best-effort values for `params`. Keys outside `params` are dropped.
    async fn extract(
        &self,
        context: &ResolutionContext,
        params: &[ScriptParam],
    ) -> Result<ParamValues, ResolutionError>;
}

#[async_trait]
pub trait HydeWriter: Send + Sync {
    /// A short, ideal procedure summary for the incident, used as a
    /// substitute search text.
    async fn hypothetical_procedure(&self, incident_text: &str) -> Result<String, ResolutionError>;
}

#[async_trait]
pub trait ProcedureStructurer: Send + Sync {
    /// Title, issue and step descriptions from free-form SOP text. Steps come
    /// back unbound; no script names or ids are filled in.
    async fn structure_procedure(&self, text: &str) -> anyhow::Result<Procedure>;
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    steps: Vec<PlanStepResponse>,
}

#[derive(Debug, Deserialize)]
struct PlanStepResponse {
    description: String,
    #[serde(default)]
    tool: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StructuredProcedure {
    title: String,
    #[serde(default)]
    issue: String,
    steps: Vec<StructuredStep>,
}

#[derive(Debug, Deserialize)]
struct StructuredStep {
    #[serde(default)]
    description: Option<String>,
}

pub struct LlmPlanner {
    client: OllamaClient,
    plan_model: String,
    params_model: String,
    hyde_model: String,
}

impl LlmPlanner {
    pub fn new(
        client: OllamaClient,
        plan_model: impl Into<String>,
        params_model: impl Into<String>,
        hyde_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            plan_model: plan_model.into(),
            params_model: params_model.into(),
            hyde_model: hyde_model.into(),
        }
    }
}

fn upstream(e: LlmError) -> ResolutionError {
    ResolutionError::upstream(e)
}

pub(crate) fn plan_prompt(query: &str, candidates: &[ScoredProcedure]) -> String {
    let mut context = String::new();
    for (i, c) in candidates.iter().enumerate() {
        let p = &c.procedure;
        let _ = writeln!(context, "Context Document {}:", i + 1);
        let _ = writeln!(context, "Title: {}", p.title);
        let _ = writeln!(context, "Issue: {}", p.issue);
        let _ = writeln!(context, "Steps:");
        for step in &p.steps {
            let tool = step.script_name.as_deref().unwrap_or("N/A");
            let _ = writeln!(context, "- {} (Tool: {tool})", step.description);
        }
        context.push('\n');
    }
    format!(
        r#"You are an incident resolution manager.
Turn the query and the procedure documents below into an ordered plan of actionable steps.

Query: "{query}"

{context}
Respond with JSON only, in exactly this shape:
{{"steps": [{{"description": "string", "tool": "string or null"}}]}}
Use the tool names from the documents. Use null when a step is manual. No comments."#
    )
}

pub(crate) fn parse_plan(text: &str) -> Result<Plan, ResolutionError> {
    let parsed: PlanResponse = parse_json_object(text).map_err(|e| {
        tracing::warn!(error = %e, raw = %text, "plan response rejected");
        ResolutionError::PlanningFailure(format!("unusable plan from model: {e}"))
    })?;
    Ok(Plan {
        steps: parsed
            .steps
            .into_iter()
            .map(|s| crate::model::PlanStep {
                description: s.description.trim().to_string(),
                tool: s.tool.map(|t| t.trim().to_string()),
            })
            .collect(),
    })
}

pub(crate) fn params_prompt(context: &ResolutionContext, params: &[ScriptParam]) -> String {
    let context_json =
        serde_json::to_string_pretty(&context.to_json()).unwrap_or_else(|_| "{}".to_string());
    let mut wanted = String::new();
    for p in params {
        let _ = writeln!(
            wanted,
            "param_name: '{}', type: '{}', required: '{}'",
            p.param_name, p.param_type, p.required
        );
    }
    format!(
        r#"You extract script parameters from incident data. Output JSON only.

Incident data:
{context_json}

Parameters to extract:
{wanted}
Rules:
1. Use the incident fields and any previous script outputs (keys ending in _output).
2. Copy values that are stated; infer hostnames, ports or service names only from the data.
3. If a value is not available, use null. Never invent values.
4. Respect the type: string as text, integer as a number, boolean as true/false, path as an OS path.
5. No keys other than the parameter names.

Output: {{"param_name": value, ...}}"#
    )
}

pub(crate) fn parse_params(text: &str, params: &[ScriptParam]) -> Result<ParamValues, ResolutionError> {
    let mut values: ParamValues = parse_json_object(text).map_err(|e| {
        tracing::warn!(error = %e, raw = %text, "parameter response rejected");
        ResolutionError::ExtractionFailure(format!("unusable parameters from model: {e}"))
    })?;
    values.retain(|k, _| params.iter().any(|p| &p.param_name == k));
    Ok(values)
}

pub(crate) fn hyde_prompt(incident_text: &str) -> String {
    format!(
        r#"You write standard operating procedures for an operations team.
Write a concise procedure that would resolve the incident below: one title line,
one line describing the issue, then the remediation steps, one per line.
Plain text only.

Incident: "{incident_text}""#
    )
}

pub(crate) fn structure_prompt(text: &str) -> String {
    format!(
        r#"You convert operations runbooks into structured procedures.
Read the document below and return its title, the issue it addresses and its steps in order.
Keep each step description short and imperative. Do not add steps that are not in the document.

Document:
"""
{text}
"""

Respond with JSON only, in exactly this shape:
{{"title": "string", "issue": "string", "steps": [{{"description": "string"}}]}}"#
    )
}

/// Steps without a description are dropped.
pub(crate) fn parse_structured_procedure(text: &str) -> anyhow::Result<Procedure> {
    let parsed: StructuredProcedure = parse_json_object(text).map_err(|e| {
        tracing::warn!(error = %e, raw = %text, "SOP structure response rejected");
        anyhow::anyhow!("unusable SOP structure from model: {e}")
    })?;
    let title = parsed.title.trim();
    if title.is_empty() {
        anyhow::bail!("model returned an SOP without a title");
    }
    Ok(Procedure {
        id: String::new(),
        title: title.to_string(),
        issue: parsed.issue.trim().to_string(),
        tags: Vec::new(),
        steps: parsed
            .steps
            .into_iter()
            .filter_map(|s| {
                let description = s.description?.trim().to_string();
                (!description.is_empty()).then_some(ProcedureStep {
                    description,
                    script_name: None,
                    script_id: None,
                })
            })
            .collect(),
    })
}

#[async_trait]
impl PlanGenerator for LlmPlanner {
    #[tracing::instrument(level = "info", skip_all, fields(candidates = candidates.len()))]
    async fn generate_plan(
        &self,
        query: &str,
        candidates: &[ScoredProcedure],
    ) -> Result<Plan, ResolutionError> {
        let prompt = plan_prompt(query, candidates);
        let text = self
            .client
            .generate(&self.plan_model, &prompt)
            .await
            .map_err(upstream)?;
        let plan = parse_plan(&text)?;
        tracing::info!(steps = plan.steps.len(), "plan generated");
        Ok(plan)
    }
}

#[async_trait]
impl ParameterExtractor for LlmPlanner {
    #[tracing::instrument(level = "info", skip_all, fields(params = params.len()))]
    async fn extract(
        &self,
        context: &ResolutionContext,
        params: &[ScriptParam],
    ) -> Result<ParamValues, ResolutionError> {
        if params.is_empty() {
            return Ok(ParamValues::new());
        }
        let prompt = params_prompt(context, params);
        let text = self
            .client
            .generate(&self.params_model, &prompt)
            .await
            .map_err(upstream)?;
        parse_params(&text, params)
    }
}

#[async_trait]
impl HydeWriter for LlmPlanner {
    #[tracing::instrument(level = "info", skip_all)]
    async fn hypothetical_procedure(&self, incident_text: &str) -> Result<String, ResolutionError> {
        let text = self
            .client
            .generate(&self.hyde_model, &hyde_prompt(incident_text))
            .await
            .map_err(upstream)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ResolutionError::TransientUpstream(
                "model returned an empty hypothetical procedure".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}

#[async_trait]
impl ProcedureStructurer for LlmPlanner {
    #[tracing::instrument(level = "info", skip_all, fields(chars = text.len()))]
    async fn structure_procedure(&self, text: &str) -> anyhow::Result<Procedure> {
        let raw = self
            .client
            .generate(&self.plan_model, &structure_prompt(text))
            .await?;
        let procedure = parse_structured_procedure(&raw)?;
        tracing::info!(title = %procedure.title, steps = procedure.steps.len(), "SOP structured");
        Ok(procedure)
    }
}
