use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tracing::debug;

use taskweave_core::config::SkipPolicy;
use taskweave_core::error::{EngineError, Result};
use taskweave_core::types::UnitStatus;

use super::unit::ExecutionUnit;

/// Terminal result reported for a running unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed {
        output: String,
        tokens_used: Option<u64>,
    },
    Failed {
        error: String,
    },
}

impl UnitOutcome {
    pub fn completed(output: impl Into<String>) -> Self {
        Self::Completed {
            output: output.into(),
            tokens_used: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    fn status(&self) -> UnitStatus {
        match self {
            Self::Completed { .. } => UnitStatus::Completed,
            Self::Failed { .. } => UnitStatus::Failed,
        }
    }
}

/// A validated, acyclic set of execution units connected by depends-on edges.
///
/// Units keep their insertion order for every query, so ready sets and
/// reports are deterministic.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    units: Vec<ExecutionUnit>,
    index: HashMap<String, usize>,
    /// Reverse edges: `dependents[i]` lists units that depend on unit `i`.
    dependents: Vec<Vec<usize>>,
    skip_policy: SkipPolicy,
}

impl DependencyGraph {
    /// Build a graph with the default (blocking) skip policy.
    pub fn build(units: Vec<ExecutionUnit>) -> Result<Self> {
        Self::build_with_policy(units, SkipPolicy::default())
    }

    /// Validate `units` and build the graph.
    ///
    /// Fails with `DuplicateUnit`, `NotPending`, `UnknownDependency`, or
    /// `Cycle`; nothing is constructed on failure.
    pub fn build_with_policy(units: Vec<ExecutionUnit>, skip_policy: SkipPolicy) -> Result<Self> {
        let mut index = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            if index.insert(unit.id().to_string(), i).is_some() {
                return Err(EngineError::DuplicateUnit(unit.id().to_string()));
            }
            if unit.status != UnitStatus::Pending {
                return Err(EngineError::NotPending {
                    unit: unit.id().to_string(),
                    status: unit.status,
                });
            }
        }

        let mut dependents = vec![Vec::new(); units.len()];
        for (i, unit) in units.iter().enumerate() {
            for dep in unit.dependencies() {
                let &d = index.get(dep).ok_or_else(|| EngineError::UnknownDependency {
                    unit: unit.id().to_string(),
                    dependency: dep.clone(),
                })?;
                dependents[d].push(i);
            }
        }

        let graph = Self {
            units,
            index,
            dependents,
            skip_policy,
        };
        graph.check_acyclic()?;

        debug!(units = graph.units.len(), ?skip_policy, "Dependency graph built");
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut visited = vec![false; self.units.len()];
        let mut on_stack = vec![false; self.units.len()];
        let mut stack = Vec::new();

        for start in 0..self.units.len() {
            if !visited[start] {
                self.visit(start, &mut visited, &mut on_stack, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        visited: &mut [bool],
        on_stack: &mut [bool],
        stack: &mut Vec<usize>,
    ) -> Result<()> {
        visited[node] = true;
        on_stack[node] = true;
        stack.push(node);

        for dep in self.units[node].dependencies() {
            let d = self.index[dep];
            if on_stack[d] {
                // First revisited node on the stack closes the cycle
                let pos = stack.iter().position(|&n| n == d).unwrap_or(0);
                let mut path: Vec<String> = stack[pos..]
                    .iter()
                    .map(|&n| self.units[n].id().to_string())
                    .collect();
                path.push(self.units[d].id().to_string());
                return Err(EngineError::Cycle { path });
            }
            if !visited[d] {
                self.visit(d, visited, on_stack, stack)?;
            }
        }

        stack.pop();
        on_stack[node] = false;
        Ok(())
    }

    fn resolves(&self, status: UnitStatus) -> bool {
        match self.skip_policy {
            SkipPolicy::Block => status == UnitStatus::Completed,
            SkipPolicy::Resolve => {
                matches!(status, UnitStatus::Completed | UnitStatus::Skipped)
            }
        }
    }

    /// Ids of pending units whose dependencies are all resolved, in unit order.
    pub fn ready_set(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Pending)
            .filter(|u| {
                u.dependencies()
                    .iter()
                    .all(|dep| self.resolves(self.units[self.index[dep]].status))
            })
            .map(|u| u.id().to_string())
            .collect()
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::UnknownUnit(id.to_string()))
    }

    /// Transition `id` from `Pending` to `Running`.
    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        let i = self.position(id)?;
        let unit = &mut self.units[i];
        if unit.status != UnitStatus::Pending {
            return Err(EngineError::InvalidTransition {
                unit: id.to_string(),
                from: unit.status,
                to: UnitStatus::Running,
            });
        }
        unit.status = UnitStatus::Running;
        unit.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record the terminal outcome of a running unit.
    ///
    /// Rejects anything but `Running -> Completed | Failed`, which makes a
    /// second completion for the same unit an error rather than an overwrite.
    pub fn mark(&mut self, id: &str, outcome: UnitOutcome) -> Result<()> {
        let i = self.position(id)?;
        let unit = &mut self.units[i];
        if unit.status != UnitStatus::Running {
            return Err(EngineError::InvalidTransition {
                unit: id.to_string(),
                from: unit.status,
                to: outcome.status(),
            });
        }

        unit.finished_at = Some(Utc::now());
        match outcome {
            UnitOutcome::Completed {
                output,
                tokens_used,
            } => {
                unit.status = UnitStatus::Completed;
                unit.result = Some(output);
                unit.tokens_used = tokens_used;
            }
            UnitOutcome::Failed { error } => {
                unit.status = UnitStatus::Failed;
                unit.error = Some(error);
            }
        }
        Ok(())
    }

    /// Skip every pending unit that can no longer run because `failed_id` failed.
    ///
    /// Walks the transitive closure of dependents. Under `SkipPolicy::Block`
    /// a skipped unit blocks its own dependents, so the walk continues
    /// through it; under `SkipPolicy::Resolve` only direct dependents of the
    /// failed unit are skipped. Returns the skipped ids in visit order.
    pub fn propagate_skips(&mut self, failed_id: &str) -> Result<Vec<String>> {
        let start = self.position(failed_id)?;
        if self.units[start].status != UnitStatus::Failed {
            return Err(EngineError::EngineInvariant(format!(
                "propagate_skips called for '{}' which is {}, not failed",
                failed_id, self.units[start].status
            )));
        }

        let mut skipped = Vec::new();
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            let cause = self.units[current].id().to_string();
            for &dependent in &self.dependents[current] {
                let unit = &mut self.units[dependent];
                if unit.status != UnitStatus::Pending {
                    continue;
                }
                unit.status = UnitStatus::Skipped;
                unit.error = Some(format!("dependency '{}' did not complete", cause));
                unit.finished_at = Some(Utc::now());
                skipped.push(unit.id().to_string());

                if self.skip_policy == SkipPolicy::Block {
                    queue.push_back(dependent);
                }
            }
        }

        if !skipped.is_empty() {
            debug!(failed = failed_id, skipped = ?skipped, "Propagated skips");
        }
        Ok(skipped)
    }

    pub fn get(&self, id: &str) -> Option<&ExecutionUnit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    pub fn status(&self, id: &str) -> Option<UnitStatus> {
        self.get(id).map(|u| u.status)
    }

    /// All units in insertion order.
    pub fn units(&self) -> &[ExecutionUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn skip_policy(&self) -> SkipPolicy {
        self.skip_policy
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    pub fn ids_with_status(&self, status: UnitStatus) -> Vec<String> {
        self.units
            .iter()
            .filter(|u| u.status == status)
            .map(|u| u.id().to_string())
            .collect()
    }

    /// Whether every unit reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.units.iter().all(|u| u.status.is_terminal())
    }

    /// Units grouped by dependency depth: stage 0 holds the roots, stage `n`
    /// units whose deepest dependency sits in stage `n - 1`.
    pub fn stages(&self) -> Vec<Vec<String>> {
        let mut depth = vec![0usize; self.units.len()];
        let mut remaining: Vec<usize> = self.units.iter().map(|u| u.dependencies().len()).collect();
        let mut queue: VecDeque<usize> = (0..self.units.len()).filter(|&i| remaining[i] == 0).collect();

        while let Some(i) = queue.pop_front() {
            for &d in &self.dependents[i] {
                depth[d] = depth[d].max(depth[i] + 1);
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        let mut stages: Vec<Vec<String>> = Vec::new();
        for (i, unit) in self.units.iter().enumerate() {
            if stages.len() <= depth[i] {
                stages.resize_with(depth[i] + 1, Vec::new);
            }
            stages[depth[i]].push(unit.id().to_string());
        }
        stages
    }

    /// `(dependency id, output)` for each completed dependency of `id`, in
    /// dependency order.
    pub fn dependency_outputs(&self, id: &str) -> Result<Vec<(&str, &str)>> {
        let i = self.position(id)?;
        Ok(self.units[i]
            .dependencies()
            .iter()
            .filter_map(|dep| {
                let unit = &self.units[self.index[dep]];
                unit.result().map(|out| (unit.id(), out))
            })
            .collect())
    }
}
