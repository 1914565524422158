use thiserror::Error;

use crate::types::UnitStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    // Structural errors: the plan is rejected before anything runs
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Duplicate unit id: {0}")]
    DuplicateUnit(String),

    #[error("Unit '{unit}' must start pending, found {status}")]
    NotPending { unit: String, status: UnitStatus },

    #[error("Plan contains no units")]
    EmptyPlan,

    #[error("Plan has {count} units, limit is {max}")]
    TooManyUnits { count: usize, max: usize },

    #[error("Plan is invalid: {0}")]
    PlanInvalid(Box<EngineError>),

    #[error("Planning failed: {0}")]
    Planning(String),

    // Execution errors: local to one unit or task
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Call timed out after {timeout_ms}ms: {unit}")]
    Timeout { unit: String, timeout_ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    // Invariant violations: bugs in the engine itself
    #[error("Invalid transition for unit '{unit}': {from} -> {to}")]
    InvalidTransition {
        unit: String,
        from: UnitStatus,
        to: UnitStatus,
    },

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    #[error("Engine invariant violated: {0}")]
    EngineInvariant(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Wrap a structural error raised while validating a plan.
    pub fn plan_invalid(inner: EngineError) -> Self {
        Self::PlanInvalid(Box::new(inner))
    }

    /// Structural errors reject a plan before any unit executes.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. }
                | Self::UnknownDependency { .. }
                | Self::DuplicateUnit(_)
                | Self::NotPending { .. }
                | Self::EmptyPlan
                | Self::TooManyUnits { .. }
                | Self::PlanInvalid(_)
                | Self::Planning(_)
        )
    }

    /// Invariant violations indicate an engine bug and must never be swallowed.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::UnknownUnit(_) | Self::EngineInvariant(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
