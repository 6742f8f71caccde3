//! End-to-end `run` for one spec: prune, recover, then drive the resumption
//! planner until everything dispatchable has been dispatched.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::{AgentOutcome, AgentRunner};
use crate::config::{validate_spec_name, Config, Layout};
use crate::dispatch::{DispatchSummary, Dispatcher, StopReason};
use crate::error::{Error, Result};
use crate::git_worktree::{WorktreeRegistry, WorktreeRole};
use crate::history::History;
use crate::plan::{ChunkStatus, Plan, PlanStats};
use crate::plan_store::PlanStore;
use crate::reconcile::recover;
use crate::resume::{ResumeEvent, ResumeState, ResumptionPlanner};

const BAR_WIDTH: usize = 40;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub spec: String,
    /// 1 runs chunks one at a time in the staging worktree.
    pub workers: usize,
    pub auto_continue: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub state: ResumeState,
    pub reset: Vec<String>,
    pub dispatch: DispatchSummary,
    pub stats: PlanStats,
    /// The operator answered no at the resume prompt.
    pub declined: bool,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if self.stats.failed > 0 {
            1
        } else {
            0
        }
    }
}

type Confirm<'a> = Box<dyn Fn(&str) -> bool + 'a>;

pub struct Runner<'a> {
    config: &'a Config,
    layout: &'a Layout,
    store: &'a PlanStore,
    registry: &'a WorktreeRegistry,
    agent: &'a dyn AgentRunner,
    interrupted: Arc<AtomicBool>,
    confirm: Confirm<'a>,
}

impl<'a> Runner<'a> {
    pub fn new(
        config: &'a Config,
        layout: &'a Layout,
        store: &'a PlanStore,
        registry: &'a WorktreeRegistry,
        agent: &'a dyn AgentRunner,
    ) -> Self {
        Runner {
            config,
            layout,
            store,
            registry,
            agent,
            interrupted: Arc::new(AtomicBool::new(false)),
            confirm: Box::new(ask_continue),
        }
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    pub fn with_confirm(mut self, confirm: impl Fn(&str) -> bool + 'a) -> Self {
        self.confirm = Box::new(confirm);
        self
    }

    pub fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let spec = options.spec.as_str();
        validate_spec_name(spec)?;

        let report = self.registry.prune_stale(spec);
        for error in &report.errors {
            warn!(spec, error = %error, "prune left something behind");
        }

        let planner =
            ResumptionPlanner::new(self.store, self.registry, spec, WorktreeRole::Staging);

        // A malformed plan must surface here, so only absence skips recovery
        let reset = if self.store.path(spec).exists() {
            let (plan, reset) = recover(self.store, spec)?;
            if !reset.is_empty() {
                println!("🔄 Reset {} interrupted chunk(s) to pending", reset.len());
            }
            if !options.auto_continue && resumable(&plan) {
                println!("{}", render_progress(&plan));
                if !(self.confirm)("Continue? [Y/n] ") {
                    return Ok(RunSummary {
                        state: planner.evaluate()?,
                        reset,
                        dispatch: DispatchSummary::default(),
                        stats: plan.stats(),
                        declined: true,
                    });
                }
            }
            reset
        } else {
            Vec::new()
        };

        let dispatcher = Dispatcher::new(
            spec,
            self.store,
            self.registry,
            self.agent,
            History::new(self.layout, spec),
        )
        .with_validation(self.config.validation_commands.clone())
        .with_policy(self.config.dispatch_policy)
        .with_interrupt(self.interrupted.clone())
        .with_pause_file(self.layout.pause_file(spec));

        let mut dispatch = DispatchSummary::default();
        let mut state = planner.evaluate()?;
        info!(spec, state = %state, "resuming");

        loop {
            state = match state {
                ResumeState::AllComplete => break,
                ResumeState::NeedsPlanning => {
                    self.run_planning(spec)?;
                    planner.advance(&state, ResumeEvent::PlanSaved)?
                }
                ResumeState::NeedsWorktree => {
                    let plan = self.store.load(spec)?;
                    if self.store.find_next_pending(&plan).is_none() {
                        // Nothing left to run, so don't create a worktree for it
                        ResumeState::AllComplete
                    } else {
                        let staging = self.registry.get_or_create(spec, WorktreeRole::Staging)?;
                        println!("🌳 Working in {} ({})", staging.path.display(), staging.branch);
                        planner.advance(&state, ResumeEvent::WorktreeReady)?
                    }
                }
                ResumeState::ReadyToDispatch { ref chunk, .. } => {
                    if let Some(reason) = dispatcher.stop_requested() {
                        dispatch.stopped = Some(reason);
                        break;
                    }
                    if options.workers > 1 {
                        let round = dispatcher.run_parallel(options.workers)?;
                        let progressed = !(round.completed.is_empty()
                            && round.failed.is_empty()
                            && round.blocked.is_empty());
                        merge_summary(&mut dispatch, round);
                        if dispatch.stopped.is_some() {
                            break;
                        }
                        if !progressed {
                            return Err(Error::Creation(
                                "no worker could start a chunk; see the log for details".to_string(),
                            ));
                        }
                        planner.evaluate()?
                    } else {
                        println!("🚶 Running chunk {}", chunk);
                        let result = dispatcher.dispatch_one(chunk, WorktreeRole::Staging)?;
                        if result.status == ChunkStatus::Pending {
                            let detail = result
                                .detail
                                .unwrap_or_else(|| "staging worktree unavailable".to_string());
                            return Err(Error::Creation(detail));
                        }
                        if self.interrupted.load(Ordering::SeqCst)
                            && result.status != ChunkStatus::Completed
                        {
                            dispatch.stopped = Some(StopReason::Interrupted);
                            break;
                        }
                        dispatch.absorb(&result);
                        planner.advance(&state, ResumeEvent::ChunkRecorded)?
                    }
                }
            };
        }

        let stats = match self.store.load(spec) {
            Ok(plan) => plan.stats(),
            Err(e) if e.is_not_found() => PlanStats::default(),
            Err(e) => return Err(e),
        };

        Ok(RunSummary {
            state,
            reset,
            dispatch,
            stats,
            declined: false,
        })
    }

    fn run_planning(&self, spec: &str) -> Result<()> {
        let plan_path = self.store.path(spec);
        if let Some(dir) = plan_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        println!("📝 No plan for '{}' yet, starting a planning session...", spec);
        match self
            .agent
            .plan(spec, self.layout.project_dir.as_path(), &plan_path)?
        {
            AgentOutcome::Completed => {}
            AgentOutcome::Failed(detail) | AgentOutcome::Blocked(detail) => {
                return Err(Error::Agent(format!("planning for '{}': {}", spec, detail)));
            }
        }

        // Validates the document, and stamps it with a revision
        let mut plan = self.store.load(spec)?;
        self.store.save(&mut plan)?;
        let stats = plan.stats();
        println!(
            "📋 Plan saved: {} phase(s), {} chunk(s)",
            plan.phases.len(),
            stats.total
        );
        Ok(())
    }
}

fn merge_summary(into: &mut DispatchSummary, round: DispatchSummary) {
    into.completed.extend(round.completed);
    into.failed.extend(round.failed);
    into.blocked.extend(round.blocked);
    if round.stopped.is_some() {
        into.stopped = round.stopped;
    }
}

/// Some work is done and some is still reachable.
fn resumable(plan: &Plan) -> bool {
    let stats = plan.stats();
    stats.completed > 0 && plan.find_next_pending().is_some()
}

fn ask_continue(question: &str) -> bool {
    print!("{}", question);
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    let answer = answer.trim().to_lowercase();
    answer.is_empty() || answer == "y" || answer == "yes"
}

pub fn progress_bar(stats: &PlanStats) -> String {
    let filled = if stats.total == 0 {
        0
    } else {
        stats.completed * BAR_WIDTH / stats.total
    };
    format!(
        "[{}{}] {}/{} ({:.0}%)",
        "█".repeat(filled),
        "░".repeat(BAR_WIDTH - filled),
        stats.completed,
        stats.total,
        stats.percentage()
    )
}

/// Multi-line overview: bar, counts, one line per phase and the next chunk.
pub fn render_progress(plan: &Plan) -> String {
    let stats = plan.stats();
    let mut lines = vec![
        format!("📊 {}", plan.spec),
        format!("   {}", progress_bar(&stats)),
    ];

    let mut counts = Vec::new();
    for (n, label) in [
        (stats.in_progress, "in progress"),
        (stats.pending, "pending"),
        (stats.failed, "failed"),
        (stats.blocked, "blocked"),
    ] {
        if n > 0 {
            counts.push(format!("{} {}", n, label));
        }
    }
    if !counts.is_empty() {
        lines.push(format!("   {}", counts.join(", ")));
    }

    for phase in plan.phase_progress() {
        lines.push(format!(
            "   {} {} ({}/{})",
            phase.state.marker(),
            phase.name,
            phase.completed,
            phase.total
        ));
    }

    match plan.find_next_pending() {
        Some(next) => lines.push(format!(
            "   Next: {} ({}) {}",
            next.chunk.id, next.phase.name, next.chunk.description
        )),
        None if stats.is_complete() => lines.push("   ✅ All chunks completed".to_string()),
        None => lines.push(
            "   Nothing dispatchable; reset failed or blocked chunks to continue".to_string(),
        ),
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ChunkAssignment;
    use crate::git_worktree::tests::setup_test_repo;
    use crate::git_worktree::Worktree;
    use crate::plan::{Chunk, Phase};
    use parking_lot::Mutex;
    use std::cell::Cell;
    use std::fs;
    use std::path::Path;

    /// Writes the given plan when asked to plan, and one file per chunk.
    struct FakeAgent {
        plan: Option<Plan>,
        fail: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeAgent {
        fn new(plan: Option<Plan>) -> Self {
            FakeAgent {
                plan,
                fail: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl AgentRunner for FakeAgent {
        fn plan(&self, _spec: &str, _project_dir: &Path, plan_path: &Path) -> Result<AgentOutcome> {
            self.calls.lock().push("plan".to_string());
            match &self.plan {
                Some(plan) => {
                    fs::write(plan_path, serde_json::to_string_pretty(plan)?)?;
                    Ok(AgentOutcome::Completed)
                }
                None => Ok(AgentOutcome::Failed("no plan produced".to_string())),
            }
        }

        fn implement(
            &self,
            assignment: &ChunkAssignment,
            worktree: &Worktree,
        ) -> Result<AgentOutcome> {
            let id = &assignment.chunk.id;
            self.calls.lock().push(id.clone());
            if self.fail.contains(id) {
                return Ok(AgentOutcome::Failed("tests failed".to_string()));
            }
            fs::write(worktree.path.join(format!("{}.txt", id)), id)?;
            Ok(AgentOutcome::Completed)
        }
    }

    struct Env {
        config: Config,
        layout: Layout,
        store: PlanStore,
        registry: WorktreeRegistry,
    }

    impl Env {
        fn new(repo: &Path) -> Self {
            let config = Config::default();
            let layout = Layout::new(repo, &config);
            let store = PlanStore::new(layout.clone());
            let registry = WorktreeRegistry::open(layout.clone(), Some("main")).unwrap();
            Env {
                config,
                layout,
                store,
                registry,
            }
        }

        fn runner<'a>(&'a self, agent: &'a dyn AgentRunner) -> Runner<'a> {
            Runner::new(&self.config, &self.layout, &self.store, &self.registry, agent)
                .with_confirm(|_| panic!("unexpected prompt"))
        }
    }

    fn options(workers: usize) -> RunOptions {
        RunOptions {
            spec: "demo".to_string(),
            workers,
            auto_continue: true,
        }
    }

    fn demo_plan() -> Plan {
        Plan::new(
            "demo",
            vec![
                Phase::new("backend", vec![Chunk::new("api", "Add api")]),
                Phase::new(
                    "frontend",
                    vec![Chunk::new("ui", "Add ui").with_files(&["ui.txt"])],
                )
                .depends_on(&["backend"]),
            ],
        )
    }

    #[test]
    fn test_progress_bar_width() {
        let stats = PlanStats {
            total: 4,
            completed: 1,
            pending: 3,
            ..PlanStats::default()
        };
        let bar = progress_bar(&stats);
        assert!(bar.starts_with(&format!("[{}{}]", "█".repeat(10), "░".repeat(30))));
        assert!(bar.ends_with("1/4 (25%)"));
        assert!(progress_bar(&PlanStats::default()).contains("0/0"));
    }

    #[test]
    fn test_render_progress_lists_phases_and_next_chunk() {
        let mut plan = demo_plan();
        plan.set_chunk_status("api", ChunkStatus::Completed, None).unwrap();
        let text = render_progress(&plan);
        assert!(text.contains("✓ backend (1/1)"));
        assert!(text.contains("○ frontend (0/1)"));
        assert!(text.contains("Next: ui (frontend)"));

        plan.set_chunk_status("ui", ChunkStatus::Failed, None).unwrap();
        let text = render_progress(&plan);
        assert!(text.contains("1 failed"));
        assert!(text.contains("reset failed or blocked"));
    }

    #[test]
    fn test_run_from_scratch_plans_and_completes() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let agent = FakeAgent::new(Some(demo_plan()));

        let summary = env.runner(&agent).run(&options(1)).unwrap();

        assert_eq!(summary.state, ResumeState::AllComplete);
        assert_eq!(summary.dispatch.completed, vec!["api", "ui"]);
        assert!(summary.stats.is_complete());
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(*agent.calls.lock(), vec!["plan", "api", "ui"]);

        let staging = env.registry.path_for("demo", WorktreeRole::Staging);
        assert!(staging.join("api.txt").exists());
        assert!(staging.join("ui.txt").exists());
    }

    #[test]
    fn test_failed_planning_is_an_error() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let agent = FakeAgent::new(None);

        let result = env.runner(&agent).run(&options(1));
        assert!(matches!(result, Err(Error::Agent(_))));
    }

    #[test]
    fn test_malformed_plan_aborts_run() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let path = env.store.path("demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{\"spec\": \"demo\", \"phases\": [").unwrap();
        let agent = FakeAgent::new(Some(demo_plan()));

        let result = env.runner(&agent).run(&options(1));
        assert!(matches!(result, Err(Error::Malformed { .. })));
        assert!(agent.calls.lock().is_empty());
    }

    #[test]
    fn test_resume_after_crash_redoes_interrupted_chunk() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let mut plan = demo_plan();
        plan.set_chunk_status("api", ChunkStatus::Completed, None).unwrap();
        plan.set_chunk_status("ui", ChunkStatus::InProgress, None).unwrap();
        env.store.save(&mut plan).unwrap();
        let agent = FakeAgent::new(None);

        let summary = env.runner(&agent).run(&options(1)).unwrap();

        assert_eq!(summary.reset, vec!["ui"]);
        assert_eq!(*agent.calls.lock(), vec!["ui"]);
        assert_eq!(summary.state, ResumeState::AllComplete);
    }

    #[test]
    fn test_finished_spec_is_a_no_op() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let mut plan = demo_plan();
        plan.set_chunk_status("api", ChunkStatus::Completed, None).unwrap();
        plan.set_chunk_status("ui", ChunkStatus::Completed, None).unwrap();
        env.store.save(&mut plan).unwrap();
        let agent = FakeAgent::new(None);

        let summary = env.runner(&agent).run(&options(1)).unwrap();

        assert_eq!(summary.state, ResumeState::AllComplete);
        assert!(agent.calls.lock().is_empty());
        assert!(env.registry.find("demo", WorktreeRole::Staging).unwrap().is_none());
    }

    #[test]
    fn test_failed_chunk_sets_exit_code() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let mut agent = FakeAgent::new(Some(demo_plan()));
        agent.fail.push("api".to_string());

        let summary = env.runner(&agent).run(&options(1)).unwrap();

        // The frontend phase waits on the failed backend chunk
        assert_eq!(summary.dispatch.failed, vec!["api"]);
        assert_eq!(summary.state, ResumeState::AllComplete);
        assert_eq!(summary.stats.pending, 1);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_parallel_run_completes_plan() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let agent = FakeAgent::new(Some(demo_plan()));

        let summary = env.runner(&agent).run(&options(3)).unwrap();

        assert_eq!(summary.state, ResumeState::AllComplete);
        assert!(summary.stats.is_complete());
        let staging = env.registry.path_for("demo", WorktreeRole::Staging);
        assert!(staging.join("ui.txt").exists());
    }

    #[test]
    fn test_pause_file_stops_run() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let mut plan = demo_plan();
        env.store.save(&mut plan).unwrap();
        fs::write(env.layout.pause_file("demo"), "").unwrap();
        let agent = FakeAgent::new(None);

        let summary = env.runner(&agent).run(&options(1)).unwrap();

        assert_eq!(summary.dispatch.stopped, Some(StopReason::Paused));
        assert!(agent.calls.lock().is_empty());
    }

    #[test]
    fn test_declining_resume_prompt_stops_before_dispatch() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let mut plan = demo_plan();
        plan.set_chunk_status("api", ChunkStatus::Completed, None).unwrap();
        env.store.save(&mut plan).unwrap();
        let agent = FakeAgent::new(None);
        let asked = Cell::new(false);

        let summary = env
            .runner(&agent)
            .with_confirm(|_| {
                asked.set(true);
                false
            })
            .run(&RunOptions {
                auto_continue: false,
                ..options(1)
            })
            .unwrap();

        assert!(asked.get());
        assert!(summary.declined);
        assert!(agent.calls.lock().is_empty());
    }

    #[test]
    fn test_spec_name_outside_state_dir_is_rejected() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let agent = FakeAgent::new(Some(demo_plan()));

        for spec in ["..", "", "../elsewhere"] {
            let result = env.runner(&agent).run(&RunOptions {
                spec: spec.to_string(),
                ..options(1)
            });
            assert!(matches!(result, Err(Error::InvalidSpec { .. })), "{:?}", spec);
        }
        assert!(agent.calls.lock().is_empty());
        assert!(temp_dir.path().join("README.md").exists());
        assert!(temp_dir.path().join(".git").exists());
    }

    #[test]
    fn test_cyclic_phases_abort_run() {
        let Some(temp_dir) = setup_test_repo() else {
            return;
        };
        let env = Env::new(temp_dir.path());
        let path = env.store.path("demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"spec":"demo","phases":[
                {"name":"a","depends_on":["b"],"chunks":[{"id":"x","description":"x","status":"pending"}]},
                {"name":"b","depends_on":["a"],"chunks":[{"id":"y","description":"y","status":"pending"}]}
            ]}"#,
        )
        .unwrap();
        let agent = FakeAgent::new(Some(demo_plan()));

        let result = env.runner(&agent).run(&options(1));
        assert!(matches!(result, Err(Error::Malformed { .. })));
        assert!(agent.calls.lock().is_empty());
    }
}
