//! Taskweave: dependency-aware workflows and bounded-concurrency swarms over
//! any long-latency executor.

pub use taskweave_core::config::{self, EngineConfig, LogConfig};
pub use taskweave_core::{error, event, ids, plan, traits, types};
pub use taskweave_core::{EngineError, EventBus, Result};
pub use taskweave_engine::{
    consolidation, graph, handoff, patterns, scheduler, summarizer, swarm, workflow,
};
pub use taskweave_engine::{
    ConcurrencyScheduler, ConsolidationEngine, ContextSummarizer, DependencyGraph, ExecutionUnit,
    HandoffNotes, Summary, SwarmExecutor, SwarmResult, SwarmTask, Workflow, WorkflowEngine,
};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `log.filter`. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
