use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::types::{AgentKind, SummaryStyle};

/// Top-level Taskweave configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub swarm: SwarmConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub agents: AgentProfiles,
    #[serde(default)]
    pub log: LogConfig,
}

/// How a `Skipped` dependency is treated when computing the ready set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkipPolicy {
    /// Skipped blocks dependents; skips propagate transitively.
    #[default]
    Block,
    /// Skipped counts as resolved, so downstream units may still run.
    Resolve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_concurrency")]
    pub max_concurrency: usize,
    /// Per-call timeout (none = unbounded).
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
    #[serde(default)]
    pub skip_policy: SkipPolicy,
    /// Consolidate completed unit outputs into a final result.
    #[serde(default = "default_true")]
    pub auto_consolidate: bool,
    /// Plans with more units than this are rejected.
    #[serde(default = "default_max_planning_steps")]
    pub max_planning_steps: usize,
    /// Max chars of each dependency output injected into a dependent's task.
    #[serde(default = "default_dependency_context_chars")]
    pub dependency_context_chars: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_workflow_concurrency(),
            call_timeout_secs: None,
            skip_policy: SkipPolicy::default(),
            auto_consolidate: true,
            max_planning_steps: default_max_planning_steps(),
            dependency_context_chars: default_dependency_context_chars(),
        }
    }
}

fn default_workflow_concurrency() -> usize { 4 }
fn default_max_planning_steps() -> usize { 10 }
fn default_dependency_context_chars() -> usize { 500 }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "default_swarm_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_true")]
    pub consolidate: bool,
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
    /// Kind used for tasks submitted without one.
    #[serde(default)]
    pub default_kind: AgentKind,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_swarm_concurrency(),
            consolidate: true,
            call_timeout_secs: None,
            default_kind: AgentKind::default(),
        }
    }
}

fn default_swarm_concurrency() -> usize { 5 }

/// Unit in which summary sizes and budgets are measured.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    /// BPE tokens (cl100k_base).
    #[default]
    Tokens,
    /// Unicode scalar values.
    Chars,
}

impl SizeUnit {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::Chars => "characters",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default)]
    pub style: SummaryStyle,
    #[serde(default = "default_size_budget")]
    pub size_budget: usize,
    #[serde(default)]
    pub size_unit: SizeUnit,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            style: SummaryStyle::default(),
            size_budget: default_size_budget(),
            size_unit: SizeUnit::default(),
        }
    }
}

fn default_size_budget() -> usize { 2000 }

/// Model and limits used for one agent kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub model: String,
    #[serde(default)]
    pub thinking_budget: u32,
    /// Overrides the engine-wide per-call timeout for this kind.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub enable_search: bool,
}

impl AgentProfile {
    pub fn new(model: impl Into<String>, thinking_budget: u32) -> Self {
        Self {
            model: model.into(),
            thinking_budget,
            timeout_secs: None,
            enable_search: false,
        }
    }

    pub fn with_search(mut self) -> Self {
        self.enable_search = true;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

const LARGE_MODEL: &str = "gemini-2.5-pro";
const FAST_MODEL: &str = "gemini-2.5-flash";

/// One profile per [`AgentKind`]. Named fields keep the mapping exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfiles {
    #[serde(default = "default_code_profile")]
    pub code: AgentProfile,
    #[serde(default = "default_research_profile")]
    pub research: AgentProfile,
    #[serde(default = "default_analysis_profile")]
    pub analysis: AgentProfile,
    #[serde(default = "default_creative_profile")]
    pub creative: AgentProfile,
    #[serde(default = "default_general_profile")]
    pub general: AgentProfile,
}

impl AgentProfiles {
    pub fn profile(&self, kind: AgentKind) -> &AgentProfile {
        match kind {
            AgentKind::Code => &self.code,
            AgentKind::Research => &self.research,
            AgentKind::Analysis => &self.analysis,
            AgentKind::Creative => &self.creative,
            AgentKind::General => &self.general,
        }
    }

    /// Effective per-call timeout for `kind`: the profile's own, else `fallback`.
    pub fn timeout_for(&self, kind: AgentKind, fallback: Option<u64>) -> Option<Duration> {
        self.profile(kind)
            .timeout_secs
            .or(fallback)
            .map(Duration::from_secs)
    }
}

impl Default for AgentProfiles {
    fn default() -> Self {
        Self {
            code: default_code_profile(),
            research: default_research_profile(),
            analysis: default_analysis_profile(),
            creative: default_creative_profile(),
            general: default_general_profile(),
        }
    }
}

fn default_code_profile() -> AgentProfile { AgentProfile::new(LARGE_MODEL, 8192) }
fn default_research_profile() -> AgentProfile { AgentProfile::new(FAST_MODEL, 2048).with_search() }
fn default_analysis_profile() -> AgentProfile { AgentProfile::new(LARGE_MODEL, 4096) }
fn default_creative_profile() -> AgentProfile { AgentProfile::new(FAST_MODEL, 1024) }
fn default_general_profile() -> AgentProfile { AgentProfile::new(FAST_MODEL, 1024) }

/// Tracing filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "taskweave=info,warn".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EngineError::ConfigNotFound(path.display().to_string()))?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| EngineError::Config(e.to_string()))?;
        if let Err(e) = config.validate() {
            warn!(error = %e, "Rejected config");
            return Err(e);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow.max_concurrency == 0 {
            return Err(EngineError::Config(
                "workflow.max_concurrency must be >= 1".into(),
            ));
        }
        if self.swarm.max_concurrency == 0 {
            return Err(EngineError::Config("swarm.max_concurrency must be >= 1".into()));
        }
        if self.workflow.max_planning_steps == 0 {
            return Err(EngineError::Config(
                "workflow.max_planning_steps must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
