use futures::future::BoxFuture;

use crate::config::{AgentProfile, SizeUnit};
use crate::error::Result;
use crate::plan::Plan;
use crate::types::*;

/// Planner: turns a goal into a unit list.
pub trait Planner: Send + Sync + 'static {
    /// Produce a plan for `goal`. Failures surface as `EngineError::Planning`.
    fn plan<'a>(&'a self, goal: &'a str, context: Option<&'a str>) -> BoxFuture<'a, Result<Plan>>;
}

/// Executor: performs one unit of work (model call, tool run, ...).
///
/// May take arbitrarily long. Implementations that can stop early should
/// watch `request.cancel`.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        request: ExecutionRequest,
        profile: AgentProfile,
    ) -> BoxFuture<'_, Result<ExecutionOutput>>;
}

/// Consolidator: synthesizes several outputs into one artifact.
pub trait Consolidator: Send + Sync + 'static {
    fn consolidate(
        &self,
        outputs: Vec<String>,
        instructions: String,
    ) -> BoxFuture<'_, Result<String>>;
}

/// Everything a summarizer backend needs to produce a summary.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    /// Fully rendered instruction prompt, including the formatted history.
    pub prompt: String,
    pub turns: Vec<ConversationTurn>,
    pub style: SummaryStyle,
    pub size_budget: usize,
    pub size_unit: SizeUnit,
}

/// Summarizer backend: abstractive summarization of a turn history.
pub trait SummarizerBackend: Send + Sync + 'static {
    fn summarize_text(&self, request: SummaryRequest) -> BoxFuture<'_, Result<String>>;
}
