use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskweave_core::plan::PlannedUnit;
use taskweave_core::types::{AgentKind, UnitStatus};

/// One unit of work inside a [`DependencyGraph`](super::DependencyGraph).
///
/// `id`, `description`, `kind`, and `dependencies` are fixed at creation.
/// `status`, `result`, and `error` change only through the graph's
/// transition methods, so outside code gets read-only access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUnit {
    id: String,
    name: String,
    description: String,
    kind: AgentKind,
    dependencies: Vec<String>,
    pub(crate) status: UnitStatus,
    pub(crate) result: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) tokens_used: Option<u64>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
}

impl ExecutionUnit {
    /// Create a pending unit with no dependencies.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: description.into(),
            kind: AgentKind::default(),
            dependencies: vec![],
            status: UnitStatus::Pending,
            result: None,
            error: None,
            tokens_used: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Set the human-readable name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the agent kind.
    pub fn with_kind(mut self, kind: AgentKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the dependency ids. Duplicates are dropped, order is kept.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.clear();
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// Output, set once when the unit completes.
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    /// Failure message, set once when the unit fails.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn tokens_used(&self) -> Option<u64> {
        self.tokens_used
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }
}

impl From<PlannedUnit> for ExecutionUnit {
    fn from(planned: PlannedUnit) -> Self {
        let mut unit = ExecutionUnit::new(planned.id, planned.description)
            .with_kind(planned.kind)
            .depends_on(planned.depends_on);
        // Planners often omit names; the id stands in
        if !planned.name.is_empty() {
            unit.name = planned.name;
        }
        unit
    }
}
