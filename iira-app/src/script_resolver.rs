//! Binds plan steps to registered scripts by fuzzy name similarity.

use crate::model::PlanStep;
use iira_tools::Script;
use serde::Serialize;
use similar::TextDiff;

pub const NOT_FOUND: &str = "Not Found";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "binding", rename_all = "snake_case")]
pub enum StepBinding {
    /// The step names no tool.
    Manual,
    /// The step names a tool but no script is close enough.
    Unmatched { best_score: f64 },
    Bound {
        script_id: i64,
        script_name: String,
        score: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedStep {
    pub description: String,
    pub tool: Option<String>,
    #[serde(flatten)]
    pub binding: StepBinding,
}

impl ResolvedStep {
    pub fn script_name(&self) -> Option<&str> {
        match &self.binding {
            StepBinding::Bound { script_name, .. } => Some(script_name),
            _ => None,
        }
    }

    /// Id as recorded in a trace: the script id, `"Not Found"`, or nothing
    /// for a manual step.
    pub fn script_id_label(&self) -> Option<String> {
        match &self.binding {
            StepBinding::Manual => None,
            StepBinding::Unmatched { .. } => Some(NOT_FOUND.to_string()),
            StepBinding::Bound { script_id, .. } => Some(script_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScriptResolver {
    threshold: f64,
}

impl ScriptResolver {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn resolve(&self, steps: &[PlanStep], scripts: &[Script]) -> Vec<ResolvedStep> {
        steps
            .iter()
            .map(|step| ResolvedStep {
                description: step.description.clone(),
                tool: step.tool_name().map(str::to_string),
                binding: match step.tool_name() {
                    None => StepBinding::Manual,
                    Some(tool) => self.bind(tool, scripts),
                },
            })
            .collect()
    }

    /// Best script for `tool`. Ties go to the earlier script in `scripts`.
    pub fn bind(&self, tool: &str, scripts: &[Script]) -> StepBinding {
        let mut best: Option<(&Script, f64)> = None;
        for script in scripts {
            let score = similarity(tool, &script.name);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((script, score));
            }
        }
        match best {
            Some((script, score)) if score >= self.threshold => {
                tracing::debug!(tool, script_name = %script.name, score, "tool bound to script");
                StepBinding::Bound {
                    script_id: script.id,
                    script_name: script.name.clone(),
                    score,
                }
            }
            Some((_, score)) => {
                tracing::info!(tool, best_score = score, "no script close enough to tool");
                StepBinding::Unmatched { best_score: score }
            }
            None => StepBinding::Unmatched { best_score: 0.0 },
        }
    }
}

/// Similarity in `[0, 1]` between a tool name and a script name.
///
/// Case-insensitive sequence-matcher ratio, `2 * matched / (len(a) + len(b))`,
/// so names whose words are reordered still score well. A tool name contained
/// in the script name scores 1.0, compared both as-is and with separators
/// removed.
pub fn similarity(tool: &str, script_name: &str) -> f64 {
    let tool = tool.trim().to_lowercase();
    let name = script_name.trim().to_lowercase();
    if tool.is_empty() || name.is_empty() {
        return 0.0;
    }
    if name.contains(&tool) {
        return 1.0;
    }
    let tool_compact = compact(&tool);
    let name_compact = compact(&name);
    if !tool_compact.is_empty() && name_compact.contains(&tool_compact) {
        return 1.0;
    }
    f64::from(TextDiff::from_chars(tool.as_str(), name.as_str()).ratio())
}

fn compact(s: &str) -> String {
    s.chars().filter(|c| c.is_alphanumeric()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(id: i64, name: &str) -> Script {
        Script {
            id,
            name: name.to_string(),
            description: String::new(),
            tags: vec![],
            content: "#!/bin/sh\n".to_string(),
            script_type: Some("shell_script".to_string()),
            params: vec![],
        }
    }

    fn step(tool: Option<&str>) -> PlanStep {
        PlanStep {
            description: "do it".to_string(),
            tool: tool.map(str::to_string),
        }
    }

    fn registry() -> Vec<Script> {
        vec![
            script(1, "check_disk_usage"),
            script(2, "restart_web_server"),
            script(3, "clear_tmp_files"),
        ]
    }

    #[test]
    fn separator_variant_binds_with_full_score() {
        let out = ScriptResolver::new(0.5).resolve(&[step(Some("restart-webserver"))], &registry());
        assert_eq!(
            out[0].binding,
            StepBinding::Bound {
                script_id: 2,
                script_name: "restart_web_server".to_string(),
                score: 1.0,
            }
        );
    }

    #[test]
    fn substring_beats_closer_edit_distance() {
        // "dusk" shares three of four characters with "disk"; "check_disk_usage"
        // shares all four but is much longer. Containment wins outright.
        let scripts = vec![script(1, "dusk"), script(2, "check_disk_usage")];
        let binding = ScriptResolver::new(0.5).bind("disk", &scripts);
        assert!(matches!(binding, StepBinding::Bound { script_id: 2, .. }));
    }

    #[test]
    fn low_similarity_is_unmatched_with_not_found_label() {
        let out = ScriptResolver::new(0.5).resolve(&[step(Some("page_oncall"))], &registry());
        assert!(matches!(out[0].binding, StepBinding::Unmatched { .. }));
        assert_eq!(out[0].script_id_label().as_deref(), Some(NOT_FOUND));
        assert_eq!(out[0].script_name(), None);
    }

    #[test]
    fn missing_tool_is_manual() {
        let out = ScriptResolver::new(0.5).resolve(&[step(None), step(Some(""))], &registry());
        assert!(out.iter().all(|s| s.binding == StepBinding::Manual));
        assert!(out.iter().all(|s| s.script_id_label().is_none()));
    }

    #[test]
    fn empty_registry_leaves_steps_unmatched() {
        let out = ScriptResolver::new(0.5).resolve(&[step(Some("check_disk"))], &[]);
        assert_eq!(out[0].binding, StepBinding::Unmatched { best_score: 0.0 });
    }

    #[test]
    fn ties_go_to_first_registered_and_are_stable() {
        let scripts = vec![script(5, "restart_nginx_a"), script(6, "restart_nginx_b")];
        let resolver = ScriptResolver::new(0.5);
        for _ in 0..5 {
            assert!(matches!(
                resolver.bind("restart_nginx", &scripts),
                StepBinding::Bound { script_id: 5, .. }
            ));
        }
    }

    #[test]
    fn reordered_words_still_bind() {
        let scripts = vec![
            script(1, "backup_db"),
            script(2, "restart_nginx"),
            script(3, "cleanup_disk"),
        ];
        let resolver = ScriptResolver::new(0.5);
        for (tool, expected) in [("db_backup", 1), ("nginx_restart", 2), ("disk_cleanup", 3)] {
            match resolver.bind(tool, &scripts) {
                StepBinding::Bound { script_id, score, .. } => {
                    assert_eq!(script_id, expected, "{tool}");
                    assert!(score > 0.5 && score < 1.0, "{tool} scored {score}");
                }
                other => panic!("{tool} did not bind: {other:?}"),
            }
        }
    }

    #[test]
    fn ratio_counts_matched_characters_over_total_length() {
        // "backup" is the longest shared run: 2 * 6 / 18.
        assert!((similarity("db_backup", "backup_db") - 2.0 / 3.0).abs() < 1e-6);
        // "restart": 2 * 7 / 26.
        assert!((similarity("nginx_restart", "restart_nginx") - 14.0 / 26.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_is_case_insensitive() {
        assert_eq!(similarity("Check_Disk", "check_disk_usage"), 1.0);
        assert!(similarity("abc", "xyz") < 0.5);
        assert_eq!(similarity("", "anything"), 0.0);
    }
}
