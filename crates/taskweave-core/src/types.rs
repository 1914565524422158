use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a single execution unit.
///
/// Transitions only move forward: `Pending -> Running -> {Completed, Failed}`,
/// or `Pending -> Skipped` when a dependency can never resolve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one swarm task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// Never started because the run was cancelled first.
    Cancelled,
}

/// Terminal status of a swarm run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SwarmStatus {
    Completed,
    Cancelled,
}

/// Category of work a unit or task belongs to.
///
/// Each kind maps to exactly one [`AgentProfile`](crate::config::AgentProfile)
/// in [`AgentProfiles`](crate::config::AgentProfiles).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Code,
    Research,
    Analysis,
    Creative,
    #[default]
    General,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Research => "research",
            Self::Analysis => "analysis",
            Self::Creative => "creative",
            Self::General => "general",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request handed to the external executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Unit or task id this call belongs to.
    pub id: String,
    pub kind: AgentKind,
    /// The task payload, including any dependency context.
    pub task: String,
    /// Shared context for the whole run (e.g. a handoff summary).
    pub context: Option<String>,
    /// Cancelled when the surrounding run is cancelled. Executors that
    /// support cooperative cancellation should watch it.
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(id: impl Into<String>, kind: AgentKind, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            task: task.into(),
            context: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }
}

/// Successful output of one executor call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub output: String,
    pub tokens_used: Option<u64>,
}

impl ExecutionOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            tokens_used: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Requester,
    Responder,
}

/// One turn of a conversation or result history, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationTurn {
    pub fn requester(content: impl Into<String>) -> Self {
        Self {
            role: Role::Requester,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn responder(content: impl Into<String>) -> Self {
        Self {
            role: Role::Responder,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Abstractive strategy requested from the summarizer backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStyle {
    /// Headline facts only.
    #[default]
    Concise,
    /// Technical specifics and explicit decisions preserved.
    Detailed,
    /// Fixed section layout: decisions, open items, artifacts.
    Structured,
    /// Centered on the current task state.
    TaskFocused,
}

impl fmt::Display for SummaryStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Concise => "concise",
            Self::Detailed => "detailed",
            Self::Structured => "structured",
            Self::TaskFocused => "task_focused",
        };
        f.write_str(s)
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A workflow built its graph and started executing.
    WorkflowStarted {
        workflow_id: String,
        goal: String,
        units: usize,
    },
    /// A unit moved from one status to another.
    StepStatusChanged {
        workflow_id: String,
        unit_id: String,
        from: UnitStatus,
        to: UnitStatus,
    },
    /// A workflow reached its terminal status.
    WorkflowFinished {
        workflow_id: String,
        status: WorkflowStatus,
        elapsed_ms: u64,
    },
    /// A swarm submitted its tasks.
    SwarmStarted { swarm_id: String, tasks: usize },
    /// A swarm task finished.
    SwarmTaskFinished {
        swarm_id: String,
        task_id: String,
        status: TaskStatus,
        latency_ms: u64,
    },
    /// A swarm reached its terminal status.
    SwarmFinished {
        swarm_id: String,
        status: SwarmStatus,
        succeeded: usize,
        failed: usize,
    },
    /// A context summary was produced.
    SummaryProduced {
        style: SummaryStyle,
        original_size: usize,
        summary_size: usize,
        truncated: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_status_terminal() {
        assert!(!UnitStatus::Pending.is_terminal());
        assert!(!UnitStatus::Running.is_terminal());
        assert!(UnitStatus::Completed.is_terminal());
        assert!(UnitStatus::Failed.is_terminal());
        assert!(UnitStatus::Skipped.is_terminal());
    }

    #[test]
    fn agent_kind_serde_lowercase() {
        let kind: AgentKind = serde_json::from_str("\"research\"").unwrap();
        assert_eq!(kind, AgentKind::Research);
        assert_eq!(serde_json::to_string(&AgentKind::Code).unwrap(), "\"code\"");
        assert_eq!(AgentKind::default(), AgentKind::General);
    }

    #[test]
    fn summary_style_serde() {
        let style: SummaryStyle = serde_json::from_str("\"task_focused\"").unwrap();
        assert_eq!(style, SummaryStyle::TaskFocused);
        assert_eq!(SummaryStyle::Structured.to_string(), "structured");
    }

    #[test]
    fn workflow_status_terminal() {
        assert!(!WorkflowStatus::Created.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::PartiallyCompleted.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert_eq!(
            WorkflowStatus::PartiallyCompleted.to_string(),
            "partially_completed"
        );
    }

    #[test]
    fn conversation_turn_constructors() {
        let turn = ConversationTurn::requester("hi");
        assert_eq!(turn.role, Role::Requester);
        assert!(turn.timestamp.is_some());
        assert_eq!(ConversationTurn::responder("ok").role, Role::Responder);
    }
}
