use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskweave_core::config::{AgentProfiles, EngineConfig, SwarmConfig};
use taskweave_core::error::{EngineError, Result};
use taskweave_core::event::EventBus;
use taskweave_core::ids::{IdGenerator, SequentialIds};
use taskweave_core::traits::{Consolidator, Executor};
use taskweave_core::types::{
    AgentKind, EngineEvent, ExecutionOutput, ExecutionRequest, SwarmStatus, TaskStatus,
};

use crate::consolidation::{swarm_instructions, ConsolidationEngine};
use crate::scheduler::{call_with_timeout, ConcurrencyScheduler, JobOutcome, JobSource};

/// An independent task submitted to a swarm.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmTask {
    pub id: String,
    pub task: String,
    /// Agent kind; the swarm's default kind when unset.
    pub kind: Option<AgentKind>,
    pub context: Option<String>,
}

impl SwarmTask {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            kind: None,
            context: None,
        }
    }

    pub fn with_kind(mut self, kind: AgentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Final record for one swarm task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: SwarmTask,
    pub kind: AgentKind,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub latency: Duration,
    pub tokens_used: Option<u64>,
    /// Executor calls made for this task across the original run and retries.
    pub attempts: u32,
}

impl TaskOutcome {
    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    fn not_started(task: SwarmTask, kind: AgentKind, attempts: u32) -> Self {
        Self {
            task,
            kind,
            status: TaskStatus::Cancelled,
            output: None,
            error: Some(EngineError::Cancelled.to_string()),
            latency: Duration::ZERO,
            tokens_used: None,
            attempts,
        }
    }
}

/// Result of one swarm run. Outcomes keep submission order.
#[derive(Debug, Clone)]
pub struct SwarmResult {
    pub swarm_id: String,
    pub status: SwarmStatus,
    pub outcomes: Vec<TaskOutcome>,
    pub total: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub cancelled_count: usize,
    pub consolidate_requested: bool,
    pub consolidated_summary: Option<String>,
    pub consolidation_error: Option<String>,
    pub elapsed: Duration,
}

impl SwarmResult {
    fn new(swarm_id: String, status: SwarmStatus, outcomes: Vec<TaskOutcome>) -> Self {
        let count = |s: TaskStatus| outcomes.iter().filter(|o| o.status == s).count();
        Self {
            swarm_id,
            status,
            total: outcomes.len(),
            succeeded_count: count(TaskStatus::Succeeded),
            failed_count: count(TaskStatus::Failed),
            cancelled_count: count(TaskStatus::Cancelled),
            outcomes,
            consolidate_requested: false,
            consolidated_summary: None,
            consolidation_error: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn outcome(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.task.id == task_id)
    }

    /// Outputs of succeeded tasks, in submission order.
    pub fn successful_outputs(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Succeeded)
            .filter_map(|o| o.output.clone())
            .collect()
    }

    /// Tasks that did not succeed (failed or never started), ready to be
    /// submitted again as a new swarm.
    pub fn unsuccessful_tasks(&self) -> Vec<SwarmTask> {
        self.outcomes
            .iter()
            .filter(|o| o.status != TaskStatus::Succeeded)
            .map(|o| o.task.clone())
            .collect()
    }

    pub fn tokens_used(&self) -> u64 {
        self.outcomes.iter().filter_map(|o| o.tokens_used).sum()
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded_count as f64 / self.total as f64
    }
}

/// A submitted task with its position and resolved kind.
#[derive(Debug, Clone)]
struct TaskJob {
    position: usize,
    task: SwarmTask,
    kind: AgentKind,
}

struct SwarmTracker<'a> {
    swarm_id: &'a str,
    event_bus: &'a EventBus,
}

impl JobSource<TaskJob, ExecutionOutput> for SwarmTracker<'_> {
    fn on_complete(&mut self, outcome: &JobOutcome<TaskJob, ExecutionOutput>) -> Result<Vec<TaskJob>> {
        let latency_ms = outcome.elapsed.as_millis() as u64;
        let status = match &outcome.result {
            Ok(_) => {
                debug!(swarm_id = %self.swarm_id, task_id = %outcome.job.task.id, latency_ms, "Swarm task succeeded");
                TaskStatus::Succeeded
            }
            Err(e) => {
                warn!(swarm_id = %self.swarm_id, task_id = %outcome.job.task.id, error = %e, "Swarm task failed");
                TaskStatus::Failed
            }
        };
        self.event_bus.publish(EngineEvent::SwarmTaskFinished {
            swarm_id: self.swarm_id.to_string(),
            task_id: outcome.job.task.id.clone(),
            status,
            latency_ms,
        });
        Ok(Vec::new())
    }
}

/// Runs independent tasks with bounded parallelism.
///
/// One task's failure never affects another. Results come back in
/// submission order regardless of completion order.
pub struct SwarmExecutor {
    executor: Arc<dyn Executor>,
    consolidation: Option<ConsolidationEngine>,
    config: SwarmConfig,
    profiles: AgentProfiles,
    ids: Arc<dyn IdGenerator>,
    event_bus: Arc<EventBus>,
}

impl SwarmExecutor {
    pub fn new(executor: Arc<dyn Executor>, config: &EngineConfig) -> Self {
        Self {
            executor,
            consolidation: None,
            config: config.swarm.clone(),
            profiles: config.agents.clone(),
            ids: Arc::new(SequentialIds::new()),
            event_bus: Arc::new(EventBus::default()),
        }
    }

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

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn consolidation(&self) -> Option<&ConsolidationEngine> {
        self.consolidation.as_ref()
    }

    /// Run `tasks` with the configured concurrency and consolidation flag.
    pub async fn run_default(&self, tasks: Vec<SwarmTask>, cancel: CancellationToken) -> Result<SwarmResult> {
        self.run(tasks, self.config.max_concurrency, self.config.consolidate, cancel)
            .await
    }

    /// Run every task, at most `max_concurrency` at a time.
    pub async fn run(
        &self,
        tasks: Vec<SwarmTask>,
        max_concurrency: usize,
        consolidate: bool,
        cancel: CancellationToken,
    ) -> Result<SwarmResult> {
        self.check_submission(&tasks, consolidate)?;
        let swarm_id = self.ids.next_id("swarm");
        let start = Instant::now();

        info!(swarm_id = %swarm_id, tasks = tasks.len(), max_concurrency, "Swarm started");
        self.event_bus.publish(EngineEvent::SwarmStarted {
            swarm_id: swarm_id.clone(),
            tasks: tasks.len(),
        });

        let jobs = tasks
            .into_iter()
            .enumerate()
            .map(|(position, task)| self.job(position, task))
            .collect();
        let attempts_before = |_: usize| 0u32;
        let (outcomes, cancelled) = self
            .execute_jobs(&swarm_id, jobs, max_concurrency, cancel, attempts_before)
            .await?;
        let outcomes = outcomes
            .into_iter()
            .map(|o| o.ok_or_else(|| EngineError::EngineInvariant("swarm task produced no outcome".into())))
            .collect::<Result<Vec<_>>>()?;

        let status = if cancelled {
            SwarmStatus::Cancelled
        } else {
            SwarmStatus::Completed
        };
        let mut result = SwarmResult::new(swarm_id, status, outcomes);
        result.consolidate_requested = consolidate;
        self.finish(&mut result, start).await;
        Ok(result)
    }

    /// Re-run every task of `previous` that failed.
    ///
    /// Succeeded and cancelled outcomes are carried over unchanged; each
    /// re-run task gets a fresh outcome with its attempt count incremented.
    /// While cancelled tasks remain the result stays `Cancelled`.
    /// Consolidation is redone when the original run requested it.
    pub async fn retry_failed(
        &self,
        previous: &SwarmResult,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<SwarmResult> {
        let start = Instant::now();
        let retry: Vec<TaskJob> = previous
            .outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.status == TaskStatus::Failed)
            .map(|(position, o)| TaskJob {
                position,
                task: o.task.clone(),
                kind: o.kind,
            })
            .collect();

        info!(
            swarm_id = %previous.swarm_id,
            retrying = retry.len(),
            "Retrying failed swarm tasks"
        );

        let prior_attempts = |position: usize| previous.outcomes[position].attempts;
        let (mut fresh, cancelled) = self
            .execute_jobs(&previous.swarm_id, retry, max_concurrency, cancel, prior_attempts)
            .await?;

        // A task the retry never reached keeps its previous outcome.
        let outcomes = previous
            .outcomes
            .iter()
            .enumerate()
            .map(|(position, old)| {
                fresh
                    .get_mut(position)
                    .and_then(Option::take)
                    .filter(|o| o.attempts > old.attempts)
                    .unwrap_or_else(|| old.clone())
            })
            .collect::<Vec<TaskOutcome>>();

        let unfinished = outcomes.iter().any(|o| o.status == TaskStatus::Cancelled);
        let status = if cancelled || unfinished {
            SwarmStatus::Cancelled
        } else {
            SwarmStatus::Completed
        };
        let mut result = SwarmResult::new(previous.swarm_id.clone(), status, outcomes);
        result.consolidate_requested = previous.consolidate_requested;
        self.finish(&mut result, start).await;
        Ok(result)
    }

    fn check_submission(&self, tasks: &[SwarmTask], consolidate: bool) -> Result<()> {
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(EngineError::DuplicateUnit(task.id.clone()));
            }
        }
        if consolidate && self.consolidation.is_none() {
            return Err(EngineError::Config(
                "consolidation requested but no consolidator configured".into(),
            ));
        }
        Ok(())
    }

    fn job(&self, position: usize, task: SwarmTask) -> TaskJob {
        let kind = task.kind.unwrap_or(self.config.default_kind);
        TaskJob {
            position,
            task,
            kind,
        }
    }

    /// Run `jobs` and return one slot per submission position (sized to the
    /// highest position), plus whether the run was cancelled.
    async fn execute_jobs<A>(
        &self,
        swarm_id: &str,
        jobs: Vec<TaskJob>,
        max_concurrency: usize,
        cancel: CancellationToken,
        attempts_before: A,
    ) -> Result<(Vec<Option<TaskOutcome>>, bool)>
    where
        A: Fn(usize) -> u32,
    {
        let scheduler = ConcurrencyScheduler::new(max_concurrency)?.with_cancel(cancel);
        let slots = jobs.iter().map(|j| j.position + 1).max().unwrap_or(0);
        let mut tracker = SwarmTracker {
            swarm_id,
            event_bus: &self.event_bus,
        };

        let executor = &self.executor;
        let profiles = &self.profiles;
        let fallback_timeout = self.config.call_timeout_secs;
        let report = scheduler
            .run(jobs, &mut tracker, |job: &TaskJob, token| {
                let executor = Arc::clone(executor);
                let profile = profiles.profile(job.kind).clone();
                let timeout = profiles.timeout_for(job.kind, fallback_timeout);
                let mut request = ExecutionRequest::new(job.task.id.clone(), job.kind, job.task.task.clone())
                    .with_context(job.task.context.clone());
                request.cancel = token;
                async move {
                    let id = request.id.clone();
                    call_with_timeout(&id, timeout, executor.execute(request, profile)).await
                }
            })
            .await?;

        let mut outcomes: Vec<Option<TaskOutcome>> = vec![None; slots];
        for done in report.outcomes {
            let position = done.job.position;
            let attempts = attempts_before(position) + 1;
            let (status, output, error, tokens_used) = match done.result {
                Ok(out) => (TaskStatus::Succeeded, Some(out.output), None, out.tokens_used),
                Err(e) => (TaskStatus::Failed, None, Some(e.to_string()), None),
            };
            outcomes[position] = Some(TaskOutcome {
                task: done.job.task,
                kind: done.job.kind,
                status,
                output,
                error,
                latency: done.elapsed,
                tokens_used,
                attempts,
            });
        }
        for job in report.not_started {
            let position = job.position;
            outcomes[position] = Some(TaskOutcome::not_started(
                job.task,
                job.kind,
                attempts_before(position),
            ));
        }

        Ok((outcomes, report.cancelled))
    }

    /// Consolidate if requested, then log and publish the final event.
    async fn finish(&self, result: &mut SwarmResult, start: Instant) {
        if result.consolidate_requested && result.status == SwarmStatus::Completed {
            if let Some(consolidation) = &self.consolidation {
                let outputs = result.successful_outputs();
                let instructions = swarm_instructions(outputs.len());
                match consolidation.consolidate(outputs, &instructions).await {
                    Ok(summary) => result.consolidated_summary = summary,
                    Err(e) => {
                        warn!(swarm_id = %result.swarm_id, error = %e, "Swarm consolidation failed");
                        result.consolidation_error = Some(e.to_string());
                    }
                }
            }
        }

        result.elapsed = start.elapsed();
        info!(
            swarm_id = %result.swarm_id,
            status = ?result.status,
            succeeded = result.succeeded_count,
            failed = result.failed_count,
            cancelled = result.cancelled_count,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Swarm finished"
        );
        self.event_bus.publish(EngineEvent::SwarmFinished {
            swarm_id: result.swarm_id.clone(),
            status: result.status,
            succeeded: result.succeeded_count,
            failed: result.failed_count,
        });
    }
}
