//! Composite orchestration patterns built on the workflow and swarm engines.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use taskweave_core::config::AgentProfiles;
use taskweave_core::error::{EngineError, Result};
use taskweave_core::traits::Executor;
use taskweave_core::types::{AgentKind, ExecutionRequest, SwarmStatus};

use crate::graph::ExecutionUnit;
use crate::scheduler::call_with_timeout;
use crate::swarm::{SwarmExecutor, SwarmResult, SwarmTask};
use crate::workflow::{Workflow, WorkflowEngine};

/// Marker a reviewer emits once the output meets every criterion.
pub const CONVERGED_MARKER: &str = "SATISFACTORY";

/// Two-unit workflow: a research unit, then a code unit that receives the
/// research output as dependency context.
pub async fn research_then_code(
    engine: &WorkflowEngine,
    research_query: &str,
    coding_task: &str,
    context: Option<&str>,
    cancel: CancellationToken,
) -> Result<Workflow> {
    let units = vec![
        ExecutionUnit::new("research", research_query)
            .with_name("Research")
            .with_kind(AgentKind::Research),
        ExecutionUnit::new("code", coding_task)
            .with_name("Implement")
            .with_kind(AgentKind::Code)
            .depends_on(["research"]),
    ];
    engine
        .execute_units(coding_task, context, units, cancel)
        .await
}

#[derive(Debug, Clone)]
pub struct MapReduceResult {
    pub map: SwarmResult,
    /// Consolidated output of the successful map tasks.
    pub reduced: Option<String>,
    pub reduce_error: Option<String>,
}

impl MapReduceResult {
    pub fn items_processed(&self) -> usize {
        self.map.total
    }

    pub fn items_successful(&self) -> usize {
        self.map.succeeded_count
    }
}

/// Fill `{item}` placeholders in a map template.
pub fn render_map_task(template: &str, item: &str) -> String {
    template.replace("{item}", item)
}

/// Run `map_template` once per item as a swarm, then reduce the successful
/// outputs with `reduce_task` as consolidation instructions.
///
/// The swarm must have a consolidator configured.
pub async fn map_reduce(
    swarm: &SwarmExecutor,
    items: &[String],
    map_template: &str,
    reduce_task: &str,
    kind: AgentKind,
    max_concurrency: usize,
    cancel: CancellationToken,
) -> Result<MapReduceResult> {
    let consolidation = swarm.consolidation().ok_or_else(|| {
        EngineError::Config("map_reduce requires a consolidator on the swarm".into())
    })?;

    let tasks = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            SwarmTask::new(format!("item_{:03}", i + 1), render_map_task(map_template, item))
                .with_kind(kind)
        })
        .collect();

    let map = swarm.run(tasks, max_concurrency, false, cancel).await?;
    info!(
        items = map.total,
        succeeded = map.succeeded_count,
        "Map phase finished"
    );

    let mut result = MapReduceResult {
        map,
        reduced: None,
        reduce_error: None,
    };
    if result.map.status == SwarmStatus::Cancelled {
        return Ok(result);
    }

    match consolidation
        .consolidate(result.map.successful_outputs(), reduce_task)
        .await
    {
        Ok(reduced) => result.reduced = reduced,
        Err(e) => {
            warn!(error = %e, "Reduce phase failed");
            result.reduce_error = Some(e.to_string());
        }
    }
    Ok(result)
}

/// One executor call of a refinement loop.
#[derive(Debug, Clone)]
pub struct RefinementStep {
    pub iteration: usize,
    pub task: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Refinement {
    pub steps: Vec<RefinementStep>,
    /// Whether a reviewer declared the output satisfactory.
    pub converged: bool,
}

impl Refinement {
    /// Latest successful output.
    pub fn final_output(&self) -> Option<&str> {
        self.steps.iter().rev().find_map(|s| s.output.as_deref())
    }
}

fn review_task(previous: &str, criteria: &str) -> String {
    format!(
        "Review and improve this output against the criteria.\n\n\
         PREVIOUS OUTPUT:\n{}\n\n\
         REFINEMENT CRITERIA:\n{}\n\n\
         Either return an improved output or reply \"{}\" if it meets every criterion.",
        previous, criteria, CONVERGED_MARKER
    )
}

/// Sequential refine loop: the first call runs `task`, every later call
/// reviews the previous output against `criteria`.
///
/// Stops after `max_iterations`, on the first failed call, on cancellation,
/// or as soon as an output contains [`CONVERGED_MARKER`].
pub async fn iterative_refinement(
    executor: &dyn Executor,
    profiles: &AgentProfiles,
    kind: AgentKind,
    task: &str,
    criteria: &str,
    max_iterations: usize,
    cancel: CancellationToken,
) -> Result<Refinement> {
    if max_iterations == 0 {
        return Err(EngineError::Config("max_iterations must be >= 1".into()));
    }

    let profile = profiles.profile(kind);
    let timeout = profiles.timeout_for(kind, None);
    let mut refinement = Refinement::default();
    let mut previous: Option<String> = None;

    for iteration in 1..=max_iterations {
        if cancel.is_cancelled() {
            info!(iteration, "Refinement cancelled");
            break;
        }

        let prompt = match &previous {
            None => task.to_string(),
            Some(prev) => review_task(prev, criteria),
        };
        let id = format!("refine_{}", iteration);
        let mut request = ExecutionRequest::new(id.clone(), kind, prompt.clone());
        request.cancel = cancel.child_token();

        match call_with_timeout(&id, timeout, executor.execute(request, profile.clone())).await {
            Ok(out) => {
                let converged = out.output.to_uppercase().contains(CONVERGED_MARKER);
                refinement.steps.push(RefinementStep {
                    iteration,
                    task: prompt,
                    output: Some(out.output.clone()),
                    error: None,
                });
                if converged {
                    info!(iteration, "Refinement converged");
                    refinement.converged = true;
                    break;
                }
                previous = Some(out.output);
            }
            Err(e) => {
                warn!(iteration, error = %e, "Refinement iteration failed");
                refinement.steps.push(RefinementStep {
                    iteration,
                    task: prompt,
                    output: None,
                    error: Some(e.to_string()),
                });
                break;
            }
        }
    }

    Ok(refinement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use taskweave_core::config::EngineConfig;
    use taskweave_core::types::{UnitStatus, WorkflowStatus};
    use taskweave_test_utils::{CountingConsolidator, MockExecutor, MockPlanner};

    #[tokio::test]
    async fn test_research_then_code_hands_off_findings() {
        let executor = Arc::new(MockExecutor::new().with_response("research", "use tokio"));
        let engine = WorkflowEngine::new(
            Arc::new(MockPlanner::failing("unused")),
            executor.clone(),
            &EngineConfig::default(),
        );

        let wf = research_then_code(
            &engine,
            "async runtimes",
            "write the server",
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        let code = executor.request_for("code").unwrap();
        assert_eq!(code.kind, AgentKind::Code);
        assert!(code.task.contains("## research\nuse tokio"));
        assert_eq!(executor.request_for("research").unwrap().kind, AgentKind::Research);
    }

    #[tokio::test]
    async fn test_research_failure_skips_code() {
        let executor = Arc::new(MockExecutor::new().failing("research"));
        let engine = WorkflowEngine::new(
            Arc::new(MockPlanner::failing("unused")),
            executor.clone(),
            &EngineConfig::default(),
        );

        let wf = research_then_code(&engine, "q", "t", None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(wf.unit("code").unwrap().status(), UnitStatus::Skipped);
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_map_reduce() {
        let consolidator = Arc::new(CountingConsolidator::new());
        let executor = Arc::new(MockExecutor::new().failing("item_002"));
        let swarm = SwarmExecutor::new(executor.clone(), &EngineConfig::default())
            .with_consolidator(consolidator.clone());
        let items: Vec<String> = ["a.rs", "b.rs", "c.rs"].iter().map(|s| s.to_string()).collect();

        let result = map_reduce(
            &swarm,
            &items,
            "Review {item}",
            "Merge the reviews",
            AgentKind::Analysis,
            2,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.items_processed(), 3);
        assert_eq!(result.items_successful(), 2);
        assert!(result.reduced.unwrap().starts_with("consolidated(2)"));
        assert_eq!(consolidator.last_instructions().as_deref(), Some("Merge the reviews"));
        assert_eq!(executor.request_for("item_003").unwrap().task, "Review c.rs");
    }

    #[tokio::test]
    async fn test_map_reduce_requires_consolidator() {
        let swarm = SwarmExecutor::new(Arc::new(MockExecutor::new()), &EngineConfig::default());
        let err = map_reduce(
            &swarm,
            &["x".to_string()],
            "{item}",
            "r",
            AgentKind::General,
            1,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_refinement_converges() {
        let executor = MockExecutor::new()
            .with_response("refine_1", "draft")
            .with_response("refine_2", "better draft")
            .with_response("refine_3", "Satisfactory as is");

        let result = iterative_refinement(
            &executor,
            &AgentProfiles::default(),
            AgentKind::Creative,
            "write a haiku",
            "5-7-5 syllables",
            5,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.converged);
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.steps[0].task, "write a haiku");
        assert!(result.steps[1].task.contains("PREVIOUS OUTPUT:\ndraft"));
        assert!(result.steps[1].task.contains("5-7-5 syllables"));
        assert_eq!(result.final_output(), Some("Satisfactory as is"));
    }

    #[tokio::test]
    async fn test_refinement_stops_on_failure() {
        let executor = MockExecutor::new()
            .with_response("refine_1", "draft")
            .failing("refine_2");

        let result = iterative_refinement(
            &executor,
            &AgentProfiles::default(),
            AgentKind::General,
            "task",
            "criteria",
            5,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!result.converged);
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps[1].error.is_some());
        assert_eq!(result.final_output(), Some("draft"));
        assert_eq!(executor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_refinement_respects_max_iterations() {
        let executor = MockExecutor::new();
        let result = iterative_refinement(
            &executor,
            &AgentProfiles::default(),
            AgentKind::General,
            "task",
            "criteria",
            2,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.steps.len(), 2);
        assert!(!result.converged);
    }
}
