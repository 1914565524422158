pub mod consolidation;
pub mod graph;
pub mod handoff;
pub mod patterns;
pub mod scheduler;
pub mod summarizer;
pub mod swarm;
pub mod workflow;

pub use consolidation::ConsolidationEngine;
pub use graph::{DependencyGraph, ExecutionUnit, UnitOutcome};
pub use handoff::HandoffContext;
pub use scheduler::{ConcurrencyScheduler, JobOutcome, JobSource, RunReport};
pub use summarizer::{ContextSummarizer, HandoffNotes, Summary};
pub use swarm::{SwarmExecutor, SwarmResult, SwarmTask, TaskOutcome};
pub use workflow::{Workflow, WorkflowEngine};
