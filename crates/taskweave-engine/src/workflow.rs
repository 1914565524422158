use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskweave_core::config::{AgentProfiles, EngineConfig, WorkflowConfig};
use taskweave_core::error::{EngineError, Result};
use taskweave_core::event::EventBus;
use taskweave_core::ids::{IdGenerator, SequentialIds};
use taskweave_core::traits::{Consolidator, Executor, Planner};
use taskweave_core::types::{
    EngineEvent, ExecutionOutput, ExecutionRequest, UnitStatus, WorkflowStatus,
};

use crate::consolidation::{workflow_instructions, ConsolidationEngine};
use crate::graph::{DependencyGraph, ExecutionUnit, UnitOutcome};
use crate::handoff::HandoffContext;
use crate::scheduler::{call_with_timeout, ConcurrencyScheduler, JobOutcome, JobSource};

/// One goal-driven execution: its graph plus aggregate results.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub goal: String,
    pub context: Option<String>,
    /// Planner's free-form analysis of the goal, if any.
    pub analysis: Option<String>,
    pub graph: DependencyGraph,
    pub status: WorkflowStatus,
    pub final_result: Option<String>,
    pub consolidation_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Highest number of units observed running at once.
    pub peak_concurrency: usize,
}

impl Workflow {
    pub fn unit(&self, id: &str) -> Option<&ExecutionUnit> {
        self.graph.get(id)
    }

    pub fn units(&self) -> &[ExecutionUnit] {
        self.graph.units()
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.graph.count(status)
    }

    /// `(unit id, output)` of every completed unit, in unit order.
    pub fn completed_outputs(&self) -> Vec<(&str, &str)> {
        self.graph
            .units()
            .iter()
            .filter_map(|u| u.result().map(|out| (u.id(), out)))
            .collect()
    }

    /// Sum of tokens reported by completed units.
    pub fn tokens_used(&self) -> u64 {
        self.graph.units().iter().filter_map(|u| u.tokens_used()).sum()
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Aggregate status of a graph whose run was not cancelled.
///
/// Every unit completed: `Completed`. None completed: `Failed`. Anything in
/// between: `PartiallyCompleted`.
pub fn aggregate_status(graph: &DependencyGraph) -> WorkflowStatus {
    let completed = graph.count(UnitStatus::Completed);
    if completed == graph.len() {
        WorkflowStatus::Completed
    } else if completed == 0 {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::PartiallyCompleted
    }
}

/// Final status once the scheduler has drained without cancellation.
///
/// Units still pending at that point can never run, which means the engine
/// lost track of the graph: that is an `EngineInvariant` error.
fn settled_status(workflow_id: &str, graph: &DependencyGraph) -> Result<WorkflowStatus> {
    let stranded = graph.ids_with_status(UnitStatus::Pending);
    if !stranded.is_empty() {
        error!(workflow_id, stranded = ?stranded, "Workflow stalled with pending units");
        return Err(EngineError::EngineInvariant(format!(
            "workflow {} stalled: units {:?} pending with nothing running",
            workflow_id, stranded
        )));
    }
    Ok(aggregate_status(graph))
}

/// Reject empty, oversized, or structurally broken plans.
///
/// Every rejection is wrapped in `EngineError::PlanInvalid`.
pub fn validate_plan(units: Vec<ExecutionUnit>, config: &WorkflowConfig) -> Result<DependencyGraph> {
    if units.is_empty() {
        return Err(EngineError::plan_invalid(EngineError::EmptyPlan));
    }
    if units.len() > config.max_planning_steps {
        return Err(EngineError::plan_invalid(EngineError::TooManyUnits {
            count: units.len(),
            max: config.max_planning_steps,
        }));
    }
    DependencyGraph::build_with_policy(units, config.skip_policy).map_err(EngineError::plan_invalid)
}

/// A dispatched unit: its id plus the request handed to the executor.
#[derive(Debug, Clone)]
struct UnitJob {
    unit_id: String,
    request: ExecutionRequest,
}

/// Drives a [`DependencyGraph`] from scheduler callbacks.
///
/// Every graph mutation happens here, on the scheduler's coordinating task.
struct GraphDriver<'a> {
    workflow_id: &'a str,
    graph: &'a mut DependencyGraph,
    event_bus: &'a EventBus,
    context: Option<String>,
    excerpt_chars: usize,
    /// Units already handed to the scheduler, so a ready unit is queued once.
    queued: HashSet<String>,
}

impl GraphDriver<'_> {
    fn publish_transition(&self, unit_id: &str, from: UnitStatus, to: UnitStatus) {
        self.event_bus.publish(EngineEvent::StepStatusChanged {
            workflow_id: self.workflow_id.to_string(),
            unit_id: unit_id.to_string(),
            from,
            to,
        });
    }

    fn job_for(&self, unit_id: &str) -> Result<UnitJob> {
        let unit = self
            .graph
            .get(unit_id)
            .ok_or_else(|| EngineError::UnknownUnit(unit_id.to_string()))?;
        let handoff =
            HandoffContext::from_outputs(self.graph.dependency_outputs(unit_id)?, self.excerpt_chars);
        let request = ExecutionRequest::new(unit_id, unit.kind(), handoff.apply(unit.description()))
            .with_context(self.context.clone());
        Ok(UnitJob {
            unit_id: unit_id.to_string(),
            request,
        })
    }

    /// Ready units not yet queued, in unit order.
    fn take_ready(&mut self) -> Result<Vec<UnitJob>> {
        let ready: Vec<String> = self
            .graph
            .ready_set()
            .into_iter()
            .filter(|id| !self.queued.contains(id))
            .collect();

        let mut jobs = Vec::with_capacity(ready.len());
        for id in ready {
            jobs.push(self.job_for(&id)?);
            self.queued.insert(id);
        }
        Ok(jobs)
    }
}

impl JobSource<UnitJob, ExecutionOutput> for GraphDriver<'_> {
    fn on_dispatch(&mut self, job: &UnitJob) -> Result<()> {
        self.graph.mark_running(&job.unit_id)?;
        debug!(workflow_id = %self.workflow_id, unit_id = %job.unit_id, "Unit started");
        self.publish_transition(&job.unit_id, UnitStatus::Pending, UnitStatus::Running);
        Ok(())
    }

    fn on_complete(&mut self, outcome: &JobOutcome<UnitJob, ExecutionOutput>) -> Result<Vec<UnitJob>> {
        let unit_id = outcome.job.unit_id.as_str();
        let elapsed_ms = outcome.elapsed.as_millis() as u64;

        match &outcome.result {
            Ok(out) => {
                self.graph.mark(
                    unit_id,
                    UnitOutcome::Completed {
                        output: out.output.clone(),
                        tokens_used: out.tokens_used,
                    },
                )?;
                info!(workflow_id = %self.workflow_id, unit_id, elapsed_ms, "Unit completed");
                self.publish_transition(unit_id, UnitStatus::Running, UnitStatus::Completed);
            }
            Err(e) => {
                self.graph.mark(unit_id, UnitOutcome::failed(e.to_string()))?;
                warn!(
                    workflow_id = %self.workflow_id,
                    unit_id,
                    elapsed_ms,
                    error = %e,
                    "Unit failed"
                );
                self.publish_transition(unit_id, UnitStatus::Running, UnitStatus::Failed);

                for skipped in self.graph.propagate_skips(unit_id)? {
                    info!(workflow_id = %self.workflow_id, unit_id = %skipped, cause = unit_id, "Unit skipped");
                    self.publish_transition(&skipped, UnitStatus::Pending, UnitStatus::Skipped);
                }
            }
        }

        self.take_ready()
    }
}

/// Plans a goal, runs the resulting graph with bounded parallelism, and
/// optionally consolidates the outputs.
pub struct WorkflowEngine {
    planner: Arc<dyn Planner>,
    executor: Arc<dyn Executor>,
    consolidation: Option<ConsolidationEngine>,
    config: WorkflowConfig,
    profiles: AgentProfiles,
    ids: Arc<dyn IdGenerator>,
    event_bus: Arc<EventBus>,
}

impl WorkflowEngine {
    pub fn new(planner: Arc<dyn Planner>, executor: Arc<dyn Executor>, config: &EngineConfig) -> Self {
        Self {
            planner,
            executor,
            consolidation: None,
            config: config.workflow.clone(),
            profiles: config.agents.clone(),
            ids: Arc::new(SequentialIds::new()),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    /// Enable consolidation of completed outputs into `Workflow::final_result`.
    pub fn with_consolidator(mut self, consolidator: Arc<dyn Consolidator>) -> Self {
        self.consolidation = Some(ConsolidationEngine::new(consolidator));
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    /// Plan `goal` and execute the plan.
    ///
    /// Planning failures and structurally invalid plans are returned as
    /// errors before any unit runs. Unit failures are recorded on the
    /// returned workflow instead.
    pub async fn execute(
        &self,
        goal: &str,
        context: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Workflow> {
        info!(goal, "Planning workflow");
        let plan = self.planner.plan(goal, context).await?;
        debug!(steps = plan.steps.len(), "Plan received");

        let units = plan.steps.into_iter().map(ExecutionUnit::from).collect();
        self.run_units(goal, context, plan.analysis, units, cancel).await
    }

    /// Execute an explicit unit list, bypassing the planner.
    pub async fn execute_units(
        &self,
        goal: &str,
        context: Option<&str>,
        units: Vec<ExecutionUnit>,
        cancel: CancellationToken,
    ) -> Result<Workflow> {
        self.run_units(goal, context, None, units, cancel).await
    }

    pub fn validate(&self, units: Vec<ExecutionUnit>) -> Result<DependencyGraph> {
        validate_plan(units, &self.config)
    }

    async fn run_units(
        &self,
        goal: &str,
        context: Option<&str>,
        analysis: Option<String>,
        units: Vec<ExecutionUnit>,
        cancel: CancellationToken,
    ) -> Result<Workflow> {
        let graph = self.validate(units)?;
        let scheduler = ConcurrencyScheduler::new(self.config.max_concurrency)?.with_cancel(cancel);

        let mut workflow = Workflow {
            id: self.ids.next_id("wf"),
            goal: goal.to_string(),
            context: context.map(str::to_string),
            analysis,
            graph,
            status: WorkflowStatus::Created,
            final_result: None,
            consolidation_error: None,
            started_at: Utc::now(),
            finished_at: None,
            peak_concurrency: 0,
        };

        let start = Instant::now();
        workflow.status = WorkflowStatus::Running;
        info!(
            workflow_id = %workflow.id,
            units = workflow.graph.len(),
            max_concurrency = self.config.max_concurrency,
            "Workflow started"
        );
        self.event_bus.publish(EngineEvent::WorkflowStarted {
            workflow_id: workflow.id.clone(),
            goal: workflow.goal.clone(),
            units: workflow.graph.len(),
        });

        let report = {
            let mut driver = GraphDriver {
                workflow_id: &workflow.id,
                graph: &mut workflow.graph,
                event_bus: &self.event_bus,
                context: workflow.context.clone(),
                excerpt_chars: self.config.dependency_context_chars,
                queued: HashSet::new(),
            };
            let initial = driver.take_ready()?;

            let executor = &self.executor;
            let profiles = &self.profiles;
            let fallback_timeout = self.config.call_timeout_secs;
            scheduler
                .run(initial, &mut driver, |job: &UnitJob, token| {
                    let executor = Arc::clone(executor);
                    let kind = job.request.kind;
                    let profile = profiles.profile(kind).clone();
                    let timeout = profiles.timeout_for(kind, fallback_timeout);
                    let unit_id = job.unit_id.clone();
                    let mut request = job.request.clone();
                    request.cancel = token;
                    async move {
                        call_with_timeout(&unit_id, timeout, executor.execute(request, profile)).await
                    }
                })
                .await?
        };
        workflow.peak_concurrency = report.peak_in_flight;

        workflow.status = if report.cancelled {
            WorkflowStatus::Cancelled
        } else {
            settled_status(&workflow.id, &workflow.graph)?
        };

        if workflow.status != WorkflowStatus::Cancelled && self.config.auto_consolidate {
            self.consolidate(&mut workflow).await;
        }

        workflow.finished_at = Some(Utc::now());
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            workflow_id = %workflow.id,
            status = %workflow.status,
            completed = workflow.count(UnitStatus::Completed),
            failed = workflow.count(UnitStatus::Failed),
            skipped = workflow.count(UnitStatus::Skipped),
            elapsed_ms,
            "Workflow finished"
        );
        self.event_bus.publish(EngineEvent::WorkflowFinished {
            workflow_id: workflow.id.clone(),
            status: workflow.status,
            elapsed_ms,
        });

        Ok(workflow)
    }

    /// Fill `final_result`; a backend failure is recorded, not raised.
    async fn consolidate(&self, workflow: &mut Workflow) {
        let Some(consolidation) = &self.consolidation else {
            return;
        };
        let outputs: Vec<String> = workflow
            .completed_outputs()
            .into_iter()
            .map(|(_, out)| out.to_string())
            .collect();

        match consolidation
            .consolidate(outputs, &workflow_instructions(&workflow.goal))
            .await
        {
            Ok(result) => workflow.final_result = result,
            Err(e) => {
                warn!(workflow_id = %workflow.id, error = %e, "Workflow consolidation failed");
                workflow.consolidation_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use taskweave_core::config::SkipPolicy;
    use taskweave_core::types::AgentKind;
    use taskweave_core::plan::{Plan, PlannedUnit};
    use taskweave_test_utils::{CountingConsolidator, MockExecutor, MockPlanner};

    fn engine(planner: MockPlanner, executor: Arc<MockExecutor>) -> WorkflowEngine {
        WorkflowEngine::new(Arc::new(planner), executor, &EngineConfig::default())
    }

    fn diamond_plan() -> Plan {
        Plan {
            analysis: Some("four steps".into()),
            steps: vec![
                PlannedUnit::new("A", "research a"),
                PlannedUnit::new("B", "research b"),
                PlannedUnit::new("C", "combine").depends_on(["A", "B"]),
                PlannedUnit::new("D", "report").depends_on(["C"]),
            ],
        }
    }

    #[tokio::test]
    async fn test_diamond_completes_in_dependency_order() {
        let executor = Arc::new(MockExecutor::new().with_default_delay_ms(5));
        let engine = engine(MockPlanner::new(diamond_plan()), executor.clone());

        let wf = engine
            .execute("build it", None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.id, "wf_001");
        assert_eq!(wf.analysis.as_deref(), Some("four steps"));
        assert_eq!(wf.count(UnitStatus::Completed), 4);

        let order = executor.call_order();
        let pos = |id: &str| order.iter().position(|c| c == id).unwrap();
        assert!(pos("C") > pos("A") && pos("C") > pos("B"));
        assert!(pos("D") > pos("C"));
        assert!(wf.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_dependents_receive_upstream_output() {
        let executor = Arc::new(
            MockExecutor::new()
                .with_response("A", "alpha findings")
                .with_response("B", "beta findings"),
        );
        let engine = engine(MockPlanner::new(diamond_plan()), executor.clone());
        engine
            .execute("build it", Some("shared"), CancellationToken::new())
            .await
            .unwrap();

        let c = executor.request_for("C").unwrap();
        assert!(c.task.starts_with("combine\n\nContext from previous steps:\n"));
        assert!(c.task.contains("## A\nalpha findings"));
        assert!(c.task.contains("## B\nbeta findings"));
        assert_eq!(c.context.as_deref(), Some("shared"));

        let a = executor.request_for("A").unwrap();
        assert_eq!(a.task, "research a");
    }

    #[tokio::test]
    async fn test_failure_skips_downstream_and_partial_status() {
        let executor = Arc::new(MockExecutor::new().failing("A"));
        let engine = engine(MockPlanner::new(diamond_plan()), executor.clone());
        let mut events = engine.event_bus().subscribe();

        let wf = engine
            .execute("build it", None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(wf.unit("A").unwrap().status(), UnitStatus::Failed);
        assert_eq!(wf.unit("B").unwrap().status(), UnitStatus::Completed);
        assert_eq!(wf.unit("C").unwrap().status(), UnitStatus::Skipped);
        assert_eq!(wf.unit("D").unwrap().status(), UnitStatus::Skipped);
        assert_eq!(wf.status, WorkflowStatus::PartiallyCompleted);
        assert!(executor.request_for("C").is_none());
        assert!(executor.request_for("D").is_none());

        let mut skipped = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::StepStatusChanged {
                unit_id,
                to: UnitStatus::Skipped,
                ..
            } = event
            {
                skipped.push(unit_id);
            }
        }
        assert_eq!(skipped, vec!["C", "D"]);
    }

    #[tokio::test]
    async fn test_all_failed_is_failed() {
        let plan = Plan {
            analysis: None,
            steps: vec![PlannedUnit::new("only", "do it")],
        };
        let executor = Arc::new(MockExecutor::new().failing("only"));
        let wf = engine(MockPlanner::new(plan), executor)
            .execute("g", None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert!(wf.unit("only").unwrap().error().unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_resolve_policy_runs_past_skipped_units() {
        let plan = Plan {
            analysis: None,
            steps: vec![
                PlannedUnit::new("A", "a"),
                PlannedUnit::new("B", "b").depends_on(["A"]),
                PlannedUnit::new("C", "c").depends_on(["B"]),
            ],
        };
        let mut config = EngineConfig::default();
        config.workflow.skip_policy = SkipPolicy::Resolve;
        let executor = Arc::new(MockExecutor::new().failing("A"));
        let engine = WorkflowEngine::new(Arc::new(MockPlanner::new(plan)), executor.clone(), &config);

        let wf = engine.execute("g", None, CancellationToken::new()).await.unwrap();
        assert_eq!(wf.unit("B").unwrap().status(), UnitStatus::Skipped);
        assert_eq!(wf.unit("C").unwrap().status(), UnitStatus::Completed);
        assert_eq!(wf.status, WorkflowStatus::PartiallyCompleted);
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_execution() {
        let plan = Plan {
            analysis: None,
            steps: vec![
                PlannedUnit::new("A", "a").depends_on(["B"]),
                PlannedUnit::new("B", "b").depends_on(["A"]),
            ],
        };
        let executor = Arc::new(MockExecutor::new());
        let err = engine(MockPlanner::new(plan), executor.clone())
            .execute("g", None, CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            EngineError::PlanInvalid(inner) => {
                assert!(matches!(*inner, EngineError::Cycle { .. }))
            }
            other => panic!("expected invalid plan, got {other:?}"),
        }
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let executor = Arc::new(MockExecutor::new());
        let err = engine(MockPlanner::new(Plan::default()), executor)
            .execute("g", None, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::PlanInvalid(inner) => assert!(matches!(*inner, EngineError::EmptyPlan)),
            other => panic!("expected invalid plan, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_plan_rejected() {
        let mut config = EngineConfig::default();
        config.workflow.max_planning_steps = 2;
        let plan = Plan {
            analysis: None,
            steps: (0..3).map(|i| PlannedUnit::new(format!("s{i}"), "x")).collect(),
        };
        let engine = WorkflowEngine::new(
            Arc::new(MockPlanner::new(plan)),
            Arc::new(MockExecutor::new()),
            &config,
        );
        let err = engine.execute("g", None, CancellationToken::new()).await.unwrap_err();
        assert!(err.is_structural());
        assert!(err.to_string().contains("limit is 2"));
    }

    #[tokio::test]
    async fn test_planner_failure_propagates() {
        let executor = Arc::new(MockExecutor::new());
        let err = engine(MockPlanner::failing("model offline"), executor.clone())
            .execute("g", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Planning(_)));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let steps = (0..8)
            .map(|i| PlannedUnit::new(format!("u{i}"), "work"))
            .collect();
        let mut config = EngineConfig::default();
        config.workflow.max_concurrency = 3;
        let executor = Arc::new(MockExecutor::new().with_default_delay_ms(20));
        let engine = WorkflowEngine::new(
            Arc::new(MockPlanner::new(Plan { analysis: None, steps })),
            executor.clone(),
            &config,
        );

        let wf = engine.execute("g", None, CancellationToken::new()).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(executor.peak_concurrency() <= 3);
        assert_eq!(wf.peak_concurrency, 3);
    }

    #[tokio::test]
    async fn test_timeout_fails_unit() {
        let mut config = EngineConfig::default();
        config.workflow.call_timeout_secs = Some(1);
        let plan = Plan {
            analysis: None,
            steps: vec![PlannedUnit::new("slow", "wait"), PlannedUnit::new("fast", "go")],
        };
        let executor = Arc::new(MockExecutor::new().with_delay_ms("slow", 1_500));
        let engine = WorkflowEngine::new(Arc::new(MockPlanner::new(plan)), executor, &config);

        let wf = engine.execute("g", None, CancellationToken::new()).await.unwrap();
        let slow = wf.unit("slow").unwrap();
        assert_eq!(slow.status(), UnitStatus::Failed);
        assert!(slow.error().unwrap().contains("timed out"));
        assert_eq!(wf.status, WorkflowStatus::PartiallyCompleted);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_pending_units() {
        let plan = Plan {
            analysis: None,
            steps: vec![
                PlannedUnit::new("A", "a"),
                PlannedUnit::new("B", "b").depends_on(["A"]),
            ],
        };
        let executor = Arc::new(MockExecutor::new().with_default_delay_ms(50));
        let engine = engine(MockPlanner::new(plan), executor.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let wf = engine.execute("g", None, cancel).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
        assert_eq!(wf.unit("A").unwrap().status(), UnitStatus::Completed);
        assert_eq!(wf.unit("B").unwrap().status(), UnitStatus::Pending);
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_consolidation() {
        let consolidator = Arc::new(CountingConsolidator::new());
        let executor = Arc::new(MockExecutor::new());
        let engine = engine(MockPlanner::new(diamond_plan()), executor)
            .with_consolidator(consolidator.clone());

        let wf = engine.execute("g", None, CancellationToken::new()).await.unwrap();
        assert_eq!(consolidator.call_count(), 1);
        assert!(wf.final_result.unwrap().starts_with("consolidated(4)"));
        assert!(wf.consolidation_error.is_none());
    }

    #[tokio::test]
    async fn test_consolidation_failure_is_recorded() {
        let executor = Arc::new(MockExecutor::new());
        let engine = engine(MockPlanner::new(diamond_plan()), executor)
            .with_consolidator(Arc::new(CountingConsolidator::failing()));

        let wf = engine.execute("g", None, CancellationToken::new()).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(wf.final_result.is_none());
        assert!(wf.consolidation_error.is_some());
    }

    #[tokio::test]
    async fn test_ids_are_per_engine() {
        let a = engine(MockPlanner::new(diamond_plan()), Arc::new(MockExecutor::new()));
        let b = engine(MockPlanner::new(diamond_plan()), Arc::new(MockExecutor::new()));
        let token = CancellationToken::new();

        assert_eq!(a.execute("g", None, token.clone()).await.unwrap().id, "wf_001");
        assert_eq!(a.execute("g", None, token.clone()).await.unwrap().id, "wf_002");
        assert_eq!(b.execute("g", None, token).await.unwrap().id, "wf_001");
    }

    #[test]
    fn test_stranded_pending_units_are_invariant_violation() {
        let units = vec![
            ExecutionUnit::new("X", "x"),
            ExecutionUnit::new("Y", "y").depends_on(["X"]),
        ];
        let mut graph = DependencyGraph::build(units).unwrap();
        // X never reports back, so Y can never become ready
        graph.mark_running("X").unwrap();

        let err = settled_status("wf_001", &graph).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(err.to_string().contains("[\"Y\"]"));
    }

    #[tokio::test]
    async fn test_units_not_pending_rejected_before_execution() {
        let mut running = ExecutionUnit::new("X", "x");
        running.status = UnitStatus::Running;
        let units = vec![running, ExecutionUnit::new("Y", "y").depends_on(["X"])];
        let executor = Arc::new(MockExecutor::new());
        let engine = engine(MockPlanner::new(diamond_plan()), executor.clone());

        let err = engine
            .execute_units("g", None, units, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PlanInvalid(ref inner)
            if matches!(**inner, EngineError::NotPending { .. })));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_tokens_and_profiles_reach_results() {
        let plan = Plan {
            analysis: None,
            steps: vec![
                PlannedUnit::new("r", "look up").with_kind(AgentKind::Research),
                PlannedUnit::new("c", "write").with_kind(AgentKind::Code).depends_on(["r"]),
            ],
        };
        let executor = Arc::new(MockExecutor::new().with_tokens_per_call(40));
        let engine = engine(MockPlanner::new(plan), executor.clone());

        let wf = engine.execute("g", None, CancellationToken::new()).await.unwrap();

        assert_eq!(wf.unit("r").unwrap().tokens_used(), Some(40));
        assert_eq!(wf.tokens_used(), 80);
        let defaults = AgentProfiles::default();
        assert_eq!(
            executor.profiles(),
            vec![defaults.research.clone(), defaults.code.clone()]
        );
        assert!(executor.profiles()[0].enable_search);
    }

    #[test]
    fn test_aggregate_status() {
        let units = vec![ExecutionUnit::new("a", "a"), ExecutionUnit::new("b", "b")];
        let mut graph = DependencyGraph::build(units).unwrap();
        graph.mark_running("a").unwrap();
        graph.mark("a", UnitOutcome::completed("ok")).unwrap();
        graph.mark_running("b").unwrap();
        graph.mark("b", UnitOutcome::failed("no")).unwrap();
        assert_eq!(aggregate_status(&graph), WorkflowStatus::PartiallyCompleted);
    }
}
