use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskweave_core::error::{EngineError, Result};

/// Result of one job, reported exactly once.
#[derive(Debug)]
pub struct JobOutcome<J, T> {
    pub job: J,
    pub result: Result<T>,
    pub elapsed: Duration,
}

/// Supplies follow-up work to the scheduler.
///
/// Both hooks run on the coordinating task, never concurrently with each
/// other, so implementations may mutate shared state (such as a
/// `DependencyGraph`) without locking. An `Err` from either hook aborts the
/// run and drops every in-flight job.
pub trait JobSource<J, T> {
    /// Called right before `job` is handed to the executor.
    fn on_dispatch(&mut self, _job: &J) -> Result<()> {
        Ok(())
    }

    /// Called after each completion; returns jobs that became eligible.
    fn on_complete(&mut self, outcome: &JobOutcome<J, T>) -> Result<Vec<J>>;
}

/// A job source with no follow-up work: every job is known up front.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFollowUps;

impl<J, T> JobSource<J, T> for NoFollowUps {
    fn on_complete(&mut self, _outcome: &JobOutcome<J, T>) -> Result<Vec<J>> {
        Ok(Vec::new())
    }
}

/// What a scheduler run did.
#[derive(Debug)]
pub struct RunReport<J, T> {
    /// Finished jobs, in completion order.
    pub outcomes: Vec<JobOutcome<J, T>>,
    /// Jobs that were ready but never dispatched (only after cancellation).
    pub not_started: Vec<J>,
    pub cancelled: bool,
    /// Highest number of simultaneously in-flight jobs observed.
    pub peak_in_flight: usize,
}

/// Bounded-parallelism driver with continuous (not wave-batched) dispatch.
///
/// Jobs run as futures polled by the calling task, so at most
/// `max_concurrency` executor calls are in flight and a freed slot is
/// refilled as soon as any single job finishes.
#[derive(Debug, Clone)]
pub struct ConcurrencyScheduler {
    max_concurrency: usize,
    cancel: CancellationToken,
}

impl ConcurrencyScheduler {
    pub fn new(max_concurrency: usize) -> Result<Self> {
        if max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be >= 1".into()));
        }
        Ok(Self {
            max_concurrency,
            cancel: CancellationToken::new(),
        })
    }

    /// Use `cancel` as the run's cancellation signal.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `initial_ready` and whatever `source` releases until nothing is
    /// queued or in flight.
    ///
    /// `execute` receives each job plus a child cancellation token. On
    /// cancellation no new job is dispatched; in-flight jobs are drained and
    /// reported, and still-queued jobs come back in `not_started`.
    pub async fn run<J, T, S, E, Fut>(
        &self,
        initial_ready: Vec<J>,
        source: &mut S,
        execute: E,
    ) -> Result<RunReport<J, T>>
    where
        J: Send,
        T: Send,
        S: JobSource<J, T> + Send,
        E: Fn(&J, CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut queue: VecDeque<J> = initial_ready.into();
        let mut in_flight = FuturesUnordered::new();
        let mut outcomes = Vec::new();
        let mut peak_in_flight = 0;
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                info!(
                    in_flight = in_flight.len(),
                    queued = queue.len(),
                    "Run cancelled, draining in-flight jobs"
                );
            }

            while !cancelled && in_flight.len() < self.max_concurrency {
                let Some(job) = queue.pop_front() else {
                    break;
                };
                source.on_dispatch(&job)?;
                let call = execute(&job, self.cancel.child_token());
                in_flight.push(async move {
                    let start = Instant::now();
                    let result = call.await;
                    JobOutcome {
                        job,
                        result,
                        elapsed: start.elapsed(),
                    }
                });
                peak_in_flight = peak_in_flight.max(in_flight.len());
            }

            if in_flight.is_empty() {
                break;
            }

            let next = if cancelled {
                in_flight.next().await
            } else {
                tokio::select! {
                    biased;
                    next = in_flight.next() => next,
                    _ = self.cancel.cancelled() => continue,
                }
            };
            let Some(outcome) = next else {
                break;
            };

            let released = source.on_complete(&outcome)?;
            if !released.is_empty() {
                debug!(released = released.len(), "Jobs became ready");
            }
            queue.extend(released);
            outcomes.push(outcome);
        }

        Ok(RunReport {
            outcomes,
            not_started: queue.into_iter().collect(),
            cancelled,
            peak_in_flight,
        })
    }
}

/// Await `call`, failing with `EngineError::Timeout` once `timeout` elapses.
pub async fn call_with_timeout<T, F>(id: &str, timeout: Option<Duration>, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        None => call.await,
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| EngineError::Timeout {
                unit: id.to_string(),
                timeout_ms: limit.as_millis() as u64,
            })?,
    }
}
