//! Decides where a spec run picks up: planning, worktree setup, the next chunk,
//! or nothing left to do.

use std::fmt;

use crate::error::{Error, Result};
use crate::git_worktree::{WorktreeRegistry, WorktreeRole};
use crate::plan_store::PlanStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeState {
    NeedsPlanning,
    NeedsWorktree,
    ReadyToDispatch { phase: String, chunk: String },
    /// Terminal. No pending chunk is reachable.
    AllComplete,
}

impl fmt::Display for ResumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeState::NeedsPlanning => f.write_str("needs planning"),
            ResumeState::NeedsWorktree => f.write_str("needs a worktree"),
            ResumeState::ReadyToDispatch { phase, chunk } => {
                write!(f, "ready to dispatch {} ({})", chunk, phase)
            }
            ResumeState::AllComplete => f.write_str("all complete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeEvent {
    /// The planning step wrote a valid plan.
    PlanSaved,
    /// `get_or_create` returned the worktree for the planner's role.
    WorktreeReady,
    /// A dispatched chunk's outcome was written to the plan.
    ChunkRecorded,
}

impl fmt::Display for ResumeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeEvent::PlanSaved => f.write_str("plan saved"),
            ResumeEvent::WorktreeReady => f.write_str("worktree ready"),
            ResumeEvent::ChunkRecorded => f.write_str("chunk recorded"),
        }
    }
}

pub struct ResumptionPlanner<'a> {
    store: &'a PlanStore,
    registry: &'a WorktreeRegistry,
    spec: &'a str,
    role: WorktreeRole,
}

impl<'a> ResumptionPlanner<'a> {
    pub fn new(
        store: &'a PlanStore,
        registry: &'a WorktreeRegistry,
        spec: &'a str,
        role: WorktreeRole,
    ) -> Self {
        ResumptionPlanner {
            store,
            registry,
            spec,
            role,
        }
    }

    /// Computes the state from what is on disk. Plan absence wins over
    /// everything; a malformed plan is an error, not a reason to re-plan.
    pub fn evaluate(&self) -> Result<ResumeState> {
        let plan = match self.store.load(self.spec) {
            Ok(plan) => plan,
            Err(e) if e.is_not_found() => return Ok(ResumeState::NeedsPlanning),
            Err(e) => return Err(e),
        };

        if self.registry.find(self.spec, self.role)?.is_none() {
            return Ok(ResumeState::NeedsWorktree);
        }

        Ok(match self.store.find_next_pending(&plan) {
            Some(next) => ResumeState::ReadyToDispatch {
                phase: next.phase.name.clone(),
                chunk: next.chunk.id.clone(),
            },
            None => ResumeState::AllComplete,
        })
    }

    pub fn advance(&self, state: &ResumeState, event: ResumeEvent) -> Result<ResumeState> {
        match (state, event) {
            (ResumeState::AllComplete, _) => Ok(ResumeState::AllComplete),
            (ResumeState::NeedsPlanning, ResumeEvent::PlanSaved)
            | (ResumeState::NeedsWorktree, ResumeEvent::WorktreeReady)
            | (ResumeState::ReadyToDispatch { .. }, ResumeEvent::ChunkRecorded) => self.evaluate(),
            (from, event) => Err(Error::InvalidTransition {
                from: from.to_string(),
                event: event.to_string(),
            }),
        }
    }
}
