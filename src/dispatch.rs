//! Hands chunks to workers and records what comes back.
//!
//! Every plan mutation (claiming, recording) happens inside `PlanStore::update`,
//! and the file claims live behind a lock taken only from inside that section.
//! The agent work itself runs on scoped threads, one per worker worktree.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{info, warn};

use crate::agent::{run_validation, AgentOutcome, AgentRunner, ChunkAssignment};
use crate::config::{DispatchPolicy, ValidationCommand};
use crate::error::{Error, Result};
use crate::git_worktree::{
    commit_all, reset_worktree, ReleaseOutcome, Worktree, WorktreeRegistry, WorktreeRole,
};
use crate::history::{AttemptRecord, CommitRecord, History};
use crate::plan::{Chunk, ChunkRef, ChunkStatus, Plan};
use crate::plan_store::PlanStore;

/// Files claimed by in-flight chunks, keyed by file.
#[derive(Debug, Default)]
pub struct FileClaims {
    owners: HashMap<String, String>,
}

impl FileClaims {
    pub fn is_claimed(&self, file: &str) -> bool {
        self.owners.contains_key(file)
    }

    pub fn owner(&self, file: &str) -> Option<&str> {
        self.owners.get(file).map(String::as_str)
    }

    pub fn claim(&mut self, chunk: &str, files: &[String]) {
        for file in files {
            self.owners.insert(file.clone(), chunk.to_string());
        }
    }

    pub fn release(&mut self, chunk: &str) {
        self.owners.retain(|_, owner| owner != chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Picks up to `limit` pending chunks in plan order whose files clash neither
/// with existing claims nor with each other. Chunks without files never clash.
pub fn select_chunks<'a>(
    plan: &'a Plan,
    claims: &FileClaims,
    limit: usize,
    policy: DispatchPolicy,
) -> Vec<ChunkRef<'a>> {
    let current_phase = match policy {
        DispatchPolicy::FirstEligible => None,
        DispatchPolicy::PhaseAtATime => {
            let open = plan.phases.iter().find(|p| {
                plan.is_eligible(p)
                    && p.chunks.iter().any(|c| {
                        matches!(c.status, ChunkStatus::Pending | ChunkStatus::InProgress)
                    })
            });
            match open {
                Some(phase) => Some(phase.name.as_str()),
                None => return Vec::new(),
            }
        }
    };

    let mut picked = Vec::new();
    let mut batch_files: HashSet<&str> = HashSet::new();

    for candidate in plan.available_chunks() {
        if picked.len() >= limit {
            break;
        }
        if let Some(phase) = current_phase {
            if candidate.phase.name != phase {
                continue;
            }
        }
        let files = &candidate.chunk.files;
        if files
            .iter()
            .any(|f| claims.is_claimed(f) || batch_files.contains(f.as_str()))
        {
            continue;
        }
        batch_files.extend(files.iter().map(String::as_str));
        picked.push(candidate);
    }

    picked
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub chunk: String,
    pub phase: String,
    pub worker: WorktreeRole,
    /// `Pending` means the chunk never really started and goes back in the queue.
    pub status: ChunkStatus,
    pub detail: Option<String>,
    pub commit: Option<String>,
    /// False when the worker's slot must not take more work this run.
    pub reusable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    Paused,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub stopped: Option<StopReason>,
}

impl DispatchSummary {
    pub(crate) fn absorb(&mut self, result: &ChunkResult) {
        match result.status {
            ChunkStatus::Completed => self.completed.push(result.chunk.clone()),
            ChunkStatus::Failed => self.failed.push(result.chunk.clone()),
            ChunkStatus::Blocked => self.blocked.push(result.chunk.clone()),
            ChunkStatus::Pending | ChunkStatus::InProgress => {}
        }
    }
}

pub struct Dispatcher<'a> {
    spec: &'a str,
    store: &'a PlanStore,
    registry: &'a WorktreeRegistry,
    agent: &'a dyn AgentRunner,
    history: History,
    validation: Vec<ValidationCommand>,
    policy: DispatchPolicy,
    interrupted: Arc<AtomicBool>,
    pause_file: Option<PathBuf>,
    claims: Mutex<FileClaims>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        spec: &'a str,
        store: &'a PlanStore,
        registry: &'a WorktreeRegistry,
        agent: &'a dyn AgentRunner,
        history: History,
    ) -> Self {
        Dispatcher {
            spec,
            store,
            registry,
            agent,
            history,
            validation: Vec::new(),
            policy: DispatchPolicy::default(),
            interrupted: Arc::new(AtomicBool::new(false)),
            pause_file: None,
            claims: Mutex::new(FileClaims::default()),
        }
    }

    pub fn with_validation(mut self, commands: Vec<ValidationCommand>) -> Self {
        self.validation = commands;
        self
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    pub fn with_pause_file(mut self, path: PathBuf) -> Self {
        self.pause_file = Some(path);
        self
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> Option<StopReason> {
        if self.is_interrupted() {
            return Some(StopReason::Interrupted);
        }
        match &self.pause_file {
            Some(path) if path.exists() => Some(StopReason::Paused),
            _ => None,
        }
    }

    /// Claims one specific pending chunk for `worker`, runs it and records it.
    pub fn dispatch_one(&self, chunk_id: &str, worker: WorktreeRole) -> Result<ChunkResult> {
        let assignment = self.store.update(self.spec, |plan| {
            let (phase, chunk) = match plan.chunk(chunk_id) {
                Some(c) => (c.phase.name.clone(), c.chunk.clone()),
                None => return Err(Error::UnknownChunk(chunk_id.to_string())),
            };
            if chunk.status != ChunkStatus::Pending {
                return Err(Error::InvalidTransition {
                    from: format!("chunk {} is {}", chunk.id, chunk.status),
                    event: "dispatch".to_string(),
                });
            }
            plan.set_chunk_status(chunk_id, ChunkStatus::InProgress, None)?;
            self.claims.lock().claim(&chunk.id, &chunk.files);
            Ok(self.assignment(phase, chunk, worker))
        })?;

        info!(spec = self.spec, chunk = chunk_id, worker = %worker, "dispatching chunk");
        let result = self.execute(&assignment);
        self.record(&result)?;
        Ok(result)
    }

    /// Runs up to `workers` chunks at a time until nothing is dispatchable,
    /// every slot is retired, or a stop is requested.
    pub fn run_parallel(&self, workers: usize) -> Result<DispatchSummary> {
        let mut free = self.free_worker_slots(workers.max(1))?;
        let mut summary = DispatchSummary::default();
        let (tx, rx) = mpsc::channel::<ChunkResult>();

        thread::scope(|scope| -> Result<()> {
            let mut in_flight = 0usize;
            loop {
                if let Some(reason) = self.stop_requested() {
                    summary.stopped = Some(reason);
                } else if !free.is_empty() {
                    for assignment in self.claim_batch(&mut free)? {
                        info!(
                            spec = self.spec,
                            chunk = %assignment.chunk.id,
                            worker = %assignment.worker,
                            "dispatching chunk"
                        );
                        in_flight += 1;
                        let tx = tx.clone();
                        scope.spawn(move || {
                            let result = self.execute(&assignment);
                            let _ = tx.send(result);
                        });
                    }
                }

                if in_flight == 0 {
                    break;
                }

                let result = rx
                    .recv()
                    .map_err(|_| Error::Git("worker channel closed".to_string()))?;
                in_flight -= 1;
                if self.record(&result)? {
                    summary.absorb(&result);
                }
                if result.reusable {
                    free.push(result.worker);
                } else {
                    warn!(worker = %result.worker, "worker slot retired for this run");
                }
            }
            Ok(())
        })?;

        Ok(summary)
    }

    /// Worker slots to use this run. Slots whose worktree survived an earlier
    /// run (a conflicted merge awaiting manual resolution) are skipped.
    fn free_worker_slots(&self, workers: usize) -> Result<Vec<WorktreeRole>> {
        let mut free = Vec::new();
        let mut n = 1;
        while free.len() < workers {
            let role = WorktreeRole::Worker(n);
            if self.registry.find(self.spec, role)?.is_some() {
                info!(worker = %role, "worktree kept for manual resolution, skipping slot");
            } else {
                free.push(role);
            }
            n += 1;
        }
        // Lowest slot first when popping
        free.reverse();
        Ok(free)
    }

    fn claim_batch(&self, free: &mut Vec<WorktreeRole>) -> Result<Vec<ChunkAssignment>> {
        let limit = free.len();
        let picked: Vec<(String, Chunk)> = self.store.update(self.spec, |plan| {
            let mut claims = self.claims.lock();
            let picked: Vec<_> = select_chunks(plan, &claims, limit, self.policy)
                .into_iter()
                .map(|c| (c.phase.name.clone(), c.chunk.clone()))
                .collect();
            for (_, chunk) in &picked {
                plan.set_chunk_status(&chunk.id, ChunkStatus::InProgress, None)?;
                claims.claim(&chunk.id, &chunk.files);
            }
            Ok(picked)
        })?;

        let mut assignments = Vec::with_capacity(picked.len());
        for (phase, chunk) in picked {
            let worker = free
                .pop()
                .ok_or_else(|| Error::Git("no free worker slot".to_string()))?;
            assignments.push(self.assignment(phase, chunk, worker));
        }
        Ok(assignments)
    }

    fn assignment(
        &self,
        phase: String,
        chunk: Chunk,
        worker: WorktreeRole,
    ) -> ChunkAssignment {
        let attempt = self.history.attempt_count(&chunk.id).unwrap_or(0);
        let previous_failures = self.history.failure_notes(&chunk.id).unwrap_or_default();
        ChunkAssignment {
            spec: self.spec.to_string(),
            phase,
            chunk,
            worker,
            attempt,
            previous_failures,
        }
    }

    /// Runs one chunk in its worktree: agent, validation, commit, and for
    /// parallel workers the merge into staging. Never touches the plan.
    fn execute(&self, assignment: &ChunkAssignment) -> ChunkResult {
        let mut result = ChunkResult {
            chunk: assignment.chunk.id.clone(),
            phase: assignment.phase.clone(),
            worker: assignment.worker,
            status: ChunkStatus::Failed,
            detail: None,
            commit: None,
            reusable: true,
        };

        let worktree = match self.registry.get_or_create(self.spec, assignment.worker) {
            Ok(worktree) => worktree,
            Err(e) => {
                warn!(worker = %assignment.worker, error = %e, "cannot prepare worktree");
                result.status = ChunkStatus::Pending;
                result.detail = Some(e.to_string());
                result.reusable = false;
                return result;
            }
        };

        let outcome = match self.agent.implement(assignment, &worktree) {
            Ok(outcome) => outcome,
            Err(e) => AgentOutcome::Failed(e.to_string()),
        };
        let outcome = match outcome {
            AgentOutcome::Completed => self.verify_and_commit(assignment, &worktree, &mut result),
            other => other,
        };

        match outcome {
            AgentOutcome::Completed => result.status = ChunkStatus::Completed,
            AgentOutcome::Failed(detail) => {
                result.status = ChunkStatus::Failed;
                result.detail = Some(detail);
            }
            AgentOutcome::Blocked(detail) => {
                result.status = ChunkStatus::Blocked;
                result.detail = Some(detail);
            }
        }

        match assignment.worker {
            WorktreeRole::Staging => {
                if result.status != ChunkStatus::Completed {
                    // Back to the last good commit for the next chunk
                    if let Err(e) = reset_worktree(&worktree) {
                        warn!(error = %e, "failed to reset staging worktree");
                    }
                }
            }
            WorktreeRole::Worker(_) => self.finish_worker(&worktree, &mut result),
        }

        result
    }

    fn verify_and_commit(
        &self,
        assignment: &ChunkAssignment,
        worktree: &Worktree,
        result: &mut ChunkResult,
    ) -> AgentOutcome {
        match run_validation(&self.validation, &worktree.path) {
            Ok(None) => {}
            Ok(Some(failure)) => return AgentOutcome::Failed(failure),
            Err(e) => return AgentOutcome::Failed(format!("validation could not run: {}", e)),
        }

        let chunk = &assignment.chunk;
        let message = format!("auto-build: {}\n\n{}", chunk.id, chunk.description);
        match commit_all(worktree, &message) {
            Ok(Some(commit)) => {
                let record = CommitRecord {
                    chunk: chunk.id.clone(),
                    commit: commit.clone(),
                    at: Utc::now(),
                };
                if let Err(e) = self.history.record_commit(&record) {
                    warn!(error = %e, "failed to append commit record");
                }
                result.commit = Some(commit);
                AgentOutcome::Completed
            }
            Ok(None) => AgentOutcome::Completed,
            Err(e) => AgentOutcome::Failed(format!("commit failed: {}", e)),
        }
    }

    fn finish_worker(&self, worktree: &Worktree, result: &mut ChunkResult) {
        if result.status == ChunkStatus::Completed {
            match self.registry.release(worktree, ReleaseOutcome::Merged) {
                Ok(()) => {}
                Err(e) => {
                    // The worktree stays for manual resolution
                    warn!(chunk = %result.chunk, error = %e, "merge into staging failed");
                    result.status = ChunkStatus::Failed;
                    result.detail = Some(e.to_string());
                    result.reusable = false;
                }
            }
        } else if let Err(e) = self.registry.release(worktree, ReleaseOutcome::Discarded) {
            warn!(worker = %result.worker, error = %e, "failed to discard worker worktree");
            result.reusable = false;
        }
    }

    /// Writes a result into the plan. Returns false when the result was left
    /// unrecorded because the run is being interrupted: the chunk stays
    /// `in_progress` and the next start resets it.
    fn record(&self, result: &ChunkResult) -> Result<bool> {
        if self.is_interrupted() && result.status != ChunkStatus::Completed {
            self.claims.lock().release(&result.chunk);
            info!(chunk = %result.chunk, "interrupted, leaving chunk in progress");
            return Ok(false);
        }

        self.store.update(self.spec, |plan| {
            plan.set_chunk_status(&result.chunk, result.status, result.detail.clone())?;
            self.claims.lock().release(&result.chunk);
            Ok(())
        })?;

        match result.status {
            ChunkStatus::Completed => {
                info!(chunk = %result.chunk, phase = %result.phase, "chunk completed")
            }
            status => warn!(
                chunk = %result.chunk,
                phase = %result.phase,
                status = %status,
                detail = result.detail.as_deref().unwrap_or(""),
                "chunk did not complete"
            ),
        }

        if result.status != ChunkStatus::Pending {
            let record = AttemptRecord {
                chunk: result.chunk.clone(),
                worker: result.worker.to_string(),
                outcome: result.status,
                detail: result.detail.clone(),
                at: Utc::now(),
            };
            if let Err(e) = self.history.record_attempt(&record) {
                warn!(error = %e, "failed to append attempt record");
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
