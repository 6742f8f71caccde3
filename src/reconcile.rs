//! Startup normalization of chunks left `in_progress` by a crashed or killed run.

use tracing::info;

use crate::error::Result;
use crate::plan::{ChunkStatus, Plan};
use crate::plan_store::PlanStore;

/// Resets every `in_progress` chunk to `pending` and returns the ids it touched.
///
/// Nothing else changes: completed work stays completed, and failed or blocked
/// chunks wait for an explicit reset.
pub fn reconcile(plan: &mut Plan) -> Vec<String> {
    let mut reset = Vec::new();
    for phase in &mut plan.phases {
        for chunk in &mut phase.chunks {
            if chunk.status == ChunkStatus::InProgress {
                chunk.status = ChunkStatus::Pending;
                chunk.started_at = None;
                reset.push(chunk.id.clone());
            }
        }
    }
    reset
}

/// Loads the plan, reconciles it and saves it before anyone decides anything
/// from it. Running it twice is the same as running it once.
pub fn recover(store: &PlanStore, spec: &str) -> Result<(Plan, Vec<String>)> {
    let mut plan = store.load(spec)?;
    let reset = reconcile(&mut plan);
    if !reset.is_empty() {
        store.save(&mut plan)?;
        info!(spec, chunks = ?reset, "reset interrupted chunks to pending");
    }
    Ok((plan, reset))
}
