use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::types::AgentKind;

/// One unit as produced by a planner, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedUnit {
    #[serde(alias = "step_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Task payload handed to the executor.
    #[serde(alias = "task")]
    pub description: String,
    #[serde(default, alias = "agent_type")]
    pub kind: AgentKind,
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
}

impl PlannedUnit {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: description.into(),
            kind: AgentKind::default(),
            depends_on: vec![],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: AgentKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// A planner's full answer: optional reasoning plus the unit list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(alias = "units")]
    pub steps: Vec<PlannedUnit>,
}

fn json_block() -> &'static Regex {
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    BLOCK.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid plan block regex"))
}

impl Plan {
    /// Parse a plan from raw model output.
    ///
    /// Accepts bare JSON, or JSON embedded in surrounding prose / code fences
    /// (the outermost `{...}` block is used).
    pub fn from_model_output(text: &str) -> Result<Self> {
        match serde_json::from_str::<Plan>(text.trim()) {
            Ok(plan) => Ok(plan),
            Err(direct) => {
                let block = json_block().find(text).ok_or_else(|| {
                    EngineError::Planning(format!("no JSON plan in output: {direct}"))
                })?;
                debug!(error = %direct, "Plan is not bare JSON, using embedded block");
                serde_json::from_str::<Plan>(block.as_str())
                    .map_err(|e| EngineError::Planning(format!("malformed plan JSON: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let text = r#"{"analysis": "two steps", "steps": [
            {"id": "a", "description": "do a"},
            {"id": "b", "description": "do b", "depends_on": ["a"], "kind": "code"}
        ]}"#;
        let plan = Plan::from_model_output(text).unwrap();
        assert_eq!(plan.analysis.as_deref(), Some("two steps"));
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].depends_on, vec!["a"]);
        assert_eq!(plan.steps[1].kind, AgentKind::Code);
        assert_eq!(plan.steps[0].kind, AgentKind::General);
    }

    #[test]
    fn accepts_original_field_names() {
        let text = r#"{"steps": [{"step_id": "s1", "name": "Search", "task": "look",
            "agent_type": "research", "depends_on": []}]}"#;
        let plan = Plan::from_model_output(text).unwrap();
        assert_eq!(plan.steps[0].id, "s1");
        assert_eq!(plan.steps[0].description, "look");
        assert_eq!(plan.steps[0].kind, AgentKind::Research);
    }

    #[test]
    fn extracts_json_from_prose() {
        let text = "Here is the plan:\n```json\n{\"steps\": [{\"id\": \"x\", \"description\": \"y\"}]}\n```\nGood luck.";
        let plan = Plan::from_model_output(text).unwrap();
        assert_eq!(plan.steps[0].id, "x");
    }

    #[test]
    fn rejects_output_without_json() {
        let err = Plan::from_model_output("I cannot plan this.").unwrap_err();
        assert!(matches!(err, EngineError::Planning(_)));
    }

    #[test]
    fn builder_defaults_name_to_id() {
        let unit = PlannedUnit::new("c", "combine").depends_on(["a", "b"]);
        assert_eq!(unit.name, "c");
        assert_eq!(unit.depends_on, vec!["a", "b"]);
    }
}
