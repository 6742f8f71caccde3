//! Crash-safe driver for agent-built specs: a plan of phases and chunks on disk,
//! git worktrees per spec and per worker, and a resumption planner that picks
//! up exactly where the last run stopped.

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod git_worktree;
pub mod history;
pub mod plan;
pub mod plan_store;
pub mod reconcile;
pub mod resume;
pub mod runner;

pub use agent::{AgentOutcome, AgentRunner, CommandAgent};
pub use config::{Config, DispatchPolicy, Layout};
pub use error::{Error, Result};
pub use git_worktree::{ReleaseOutcome, Worktree, WorktreeRegistry, WorktreeRole};
pub use plan::{Chunk, ChunkStatus, Phase, Plan};
pub use plan_store::PlanStore;
pub use resume::{ResumeEvent, ResumeState, ResumptionPlanner};
pub use runner::{RunOptions, RunSummary, Runner};
