use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of workflow and swarm identifiers.
///
/// Injected into engines so that each engine (and each test) owns its own
/// counter instead of sharing a process-wide one.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self, prefix: &str) -> String;
}

/// Monotonic per-generator counter: `wf_001`, `wf_002`, ...
#[derive(Debug, Default)]
pub struct SequentialIds {
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}_{n:03}")
    }
}

/// Random v4 UUID ids: `wf_<uuid>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", Uuid::new_v4())
    }
}
