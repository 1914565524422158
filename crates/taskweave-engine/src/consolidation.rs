use std::sync::Arc;

use tracing::{debug, info};

use taskweave_core::error::Result;
use taskweave_core::traits::Consolidator;

/// Instructions used when a swarm asks for a consolidated result.
pub fn swarm_instructions(outputs: usize) -> String {
    format!(
        "Synthesize the following {} independent results into one coherent response. \
         Merge overlapping findings, keep every distinct fact, and resolve contradictions \
         explicitly.",
        outputs
    )
}

/// Instructions used to turn workflow step outputs into a final deliverable.
pub fn workflow_instructions(goal: &str) -> String {
    format!(
        "Consolidate these workflow results into a final deliverable.\n\n\
         GOAL: {}\n\n\
         Synthesize the key findings, keep the deliverables produced by each step, \
         and give a clear final answer to the goal.",
        goal
    )
}

/// Thin policy layer over a [`Consolidator`] backend.
///
/// Zero outputs yield nothing and a single output is returned as-is; the
/// backend is only called when there is something to merge.
#[derive(Clone)]
pub struct ConsolidationEngine {
    backend: Arc<dyn Consolidator>,
}

impl ConsolidationEngine {
    pub fn new(backend: Arc<dyn Consolidator>) -> Self {
        Self { backend }
    }

    /// Merge `outputs` (in the caller's order) into one artifact.
    pub async fn consolidate(
        &self,
        mut outputs: Vec<String>,
        instructions: &str,
    ) -> Result<Option<String>> {
        match outputs.len() {
            0 => {
                debug!("Nothing to consolidate");
                Ok(None)
            }
            1 => Ok(outputs.pop()),
            n => {
                info!(outputs = n, "Consolidating outputs");
                let merged = self
                    .backend
                    .consolidate(outputs, instructions.to_string())
                    .await?;
                Ok(Some(merged))
            }
        }
    }
}

impl std::fmt::Debug for ConsolidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidationEngine").finish_non_exhaustive()
    }
}
