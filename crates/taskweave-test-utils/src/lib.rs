//! Scripted mocks and fixtures shared by Taskweave tests.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::NamedTempFile;

use taskweave_core::config::AgentProfile;
use taskweave_core::error::{EngineError, Result};
use taskweave_core::plan::{Plan, PlannedUnit};
use taskweave_core::traits::{Consolidator, Executor, Planner, SummarizerBackend, SummaryRequest};
use taskweave_core::types::{ExecutionOutput, ExecutionRequest};

/// How often a scripted id fails.
#[derive(Debug, Clone, Copy)]
enum Failure {
    Always,
    Times(usize),
}

/// Executor with per-id delays, responses, and failures.
///
/// Records every request and tracks how many calls were in flight at once.
#[derive(Debug, Default)]
pub struct MockExecutor {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    responses: HashMap<String, String>,
    failures: Mutex<HashMap<String, Failure>>,
    tokens_per_call: Option<u64>,
    requests: Mutex<Vec<ExecutionRequest>>,
    profiles: Mutex<Vec<AgentProfile>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to ids without their own delay.
    pub fn with_default_delay_ms(mut self, ms: u64) -> Self {
        self.default_delay = Duration::from_millis(ms);
        self
    }

    pub fn with_delay_ms(mut self, id: &str, ms: u64) -> Self {
        self.delays.insert(id.to_string(), Duration::from_millis(ms));
        self
    }

    /// Output for `id`; others answer `output of <id>`.
    pub fn with_response(mut self, id: &str, output: &str) -> Self {
        self.responses.insert(id.to_string(), output.to_string());
        self
    }

    /// Every call for `id` fails.
    pub fn failing(self, id: &str) -> Self {
        self.lock_failures().insert(id.to_string(), Failure::Always);
        self
    }

    /// The first `times` calls for `id` fail, later ones succeed.
    pub fn failing_times(self, id: &str, times: usize) -> Self {
        self.lock_failures().insert(id.to_string(), Failure::Times(times));
        self
    }

    pub fn with_tokens_per_call(mut self, tokens: u64) -> Self {
        self.tokens_per_call = Some(tokens);
        self
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, Failure>> {
        self.failures.lock().expect("mock failures lock poisoned")
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<ExecutionRequest>> {
        self.requests.lock().expect("mock requests lock poisoned")
    }

    /// Decide (and consume) whether this call for `id` fails.
    fn should_fail(&self, id: &str) -> bool {
        let mut failures = self.lock_failures();
        match failures.get_mut(id) {
            Some(Failure::Always) => true,
            Some(Failure::Times(0)) | None => false,
            Some(Failure::Times(n)) => {
                *n -= 1;
                true
            }
        }
    }

    pub fn call_count(&self) -> usize {
        self.lock_requests().len()
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.lock_requests().iter().filter(|r| r.id == id).count()
    }

    /// Request ids in the order calls started.
    pub fn call_order(&self) -> Vec<String> {
        self.lock_requests().iter().map(|r| r.id.clone()).collect()
    }

    /// Most recent request for `id`.
    pub fn request_for(&self, id: &str) -> Option<ExecutionRequest> {
        self.lock_requests().iter().rev().find(|r| r.id == id).cloned()
    }

    /// Profiles handed over with each call, in call order.
    pub fn profiles(&self) -> Vec<AgentProfile> {
        self.profiles.lock().expect("mock profiles lock poisoned").clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Executor for MockExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
        profile: AgentProfile,
    ) -> BoxFuture<'_, Result<ExecutionOutput>> {
        Box::pin(async move {
            let id = request.id.clone();
            self.lock_requests().push(request);
            self.profiles
                .lock()
                .expect("mock profiles lock poisoned")
                .push(profile);

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = self.delays.get(&id).copied().unwrap_or(self.default_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.should_fail(&id) {
                return Err(EngineError::Execution(format!("scripted failure for {}", id)));
            }
            let text = self
                .responses
                .get(&id)
                .cloned()
                .unwrap_or_else(|| format!("output of {}", id));
            let output = ExecutionOutput::text(text);
            Ok(match self.tokens_per_call {
                Some(tokens) => output.with_tokens(tokens),
                None => output,
            })
        })
    }
}

/// Planner returning a fixed plan, or a fixed planning error.
#[derive(Debug)]
pub struct MockPlanner {
    result: std::result::Result<Plan, String>,
    calls: AtomicUsize,
}

impl MockPlanner {
    pub fn new(plan: Plan) -> Self {
        Self {
            result: Ok(plan),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_units(steps: Vec<PlannedUnit>) -> Self {
        Self::new(Plan {
            analysis: None,
            steps,
        })
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Planner for MockPlanner {
    fn plan<'a>(&'a self, _goal: &'a str, _context: Option<&'a str>) -> BoxFuture<'a, Result<Plan>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().map_err(EngineError::Planning)
        })
    }
}

/// Consolidator answering `consolidated(<n>): a | b | ...`.
#[derive(Debug, Default)]
pub struct CountingConsolidator {
    fail: bool,
    calls: AtomicUsize,
    last_instructions: Mutex<Option<String>>,
}

impl CountingConsolidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_instructions(&self) -> Option<String> {
        self.last_instructions
            .lock()
            .expect("consolidator lock poisoned")
            .clone()
    }
}

impl Consolidator for CountingConsolidator {
    fn consolidate(&self, outputs: Vec<String>, instructions: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self
                .last_instructions
                .lock()
                .expect("consolidator lock poisoned") = Some(instructions);
            if self.fail {
                return Err(EngineError::Execution("consolidator unavailable".into()));
            }
            Ok(format!("consolidated({}): {}", outputs.len(), outputs.join(" | ")))
        })
    }
}

/// Summarizer backend returning a fixed reply.
#[derive(Debug, Default)]
pub struct ScriptedSummarizer {
    reply: Option<String>,
    requests: Mutex<Vec<SummaryRequest>>,
}

impl ScriptedSummarizer {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("summarizer lock poisoned").len()
    }

    pub fn last_request(&self) -> Option<SummaryRequest> {
        self.requests
            .lock()
            .expect("summarizer lock poisoned")
            .last()
            .cloned()
    }
}

impl SummarizerBackend for ScriptedSummarizer {
    fn summarize_text(&self, request: SummaryRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.requests
                .lock()
                .expect("summarizer lock poisoned")
                .push(request);
            self.reply
                .clone()
                .ok_or_else(|| EngineError::Execution("summarizer unavailable".into()))
        })
    }
}

/// Diamond plan: `A`, `B` → `C` → `D`.
pub fn diamond_plan() -> Plan {
    Plan {
        analysis: None,
        steps: vec![
            PlannedUnit::new("A", "research part a"),
            PlannedUnit::new("B", "research part b"),
            PlannedUnit::new("C", "combine findings").depends_on(["A", "B"]),
            PlannedUnit::new("D", "write report").depends_on(["C"]),
        ],
    }
}

/// Write `content` to a temp TOML file; keep the handle alive while in use.
pub fn temp_config(content: &str) -> NamedTempFile {
    let mut tmp = NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write config");
    tmp
}
