use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, info, warn};

use crate::config::{validate_spec_name, Layout, BRANCH_PREFIX, STATE_DIR};
use crate::error::{Error, Result};
use crate::plan_store::write_atomically;

/// Which slot a worktree fills for its spec.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum WorktreeRole {
    /// The single worktree of sequential mode; parallel workers merge into it.
    Staging,
    Worker(usize),
}

impl fmt::Display for WorktreeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorktreeRole::Staging => f.write_str("staging"),
            WorktreeRole::Worker(n) => write!(f, "worker-{}", n),
        }
    }
}

impl TryFrom<String> for WorktreeRole {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if value == "staging" {
            return Ok(WorktreeRole::Staging);
        }
        value
            .strip_prefix("worker-")
            .and_then(|n| n.parse().ok())
            .map(WorktreeRole::Worker)
            .ok_or_else(|| format!("unknown worktree role '{}'", value))
    }
}

impl From<WorktreeRole> for String {
    fn from(role: WorktreeRole) -> Self {
        role.to_string()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Worktree {
    pub spec: String,
    pub role: WorktreeRole,
    pub path: PathBuf,
    pub branch: String,
    /// Branch this worktree forked from and merges back into.
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Merged,
    Discarded,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WorktreeState {
    pub worktrees: Vec<Worktree>,
}

impl WorktreeState {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| Error::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Config(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(dir)?;
        let contents = serde_json::to_string_pretty(self)?;
        write_atomically(dir, path, contents.as_bytes())
    }

    pub fn get(&self, role: WorktreeRole) -> Option<&Worktree> {
        self.worktrees.iter().find(|w| w.role == role)
    }

    pub fn upsert(&mut self, worktree: Worktree) {
        self.worktrees.retain(|w| w.role != worktree.role);
        self.worktrees.push(worktree);
    }

    pub fn remove(&mut self, role: WorktreeRole) {
        self.worktrees.retain(|w| w.role != role);
    }
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed_records: Vec<String>,
    pub removed_dirs: Vec<PathBuf>,
    pub errors: Vec<String>,
}

fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    debug!(dir = %dir.display(), "git {}", args.join(" "));
    Ok(Command::new("git").current_dir(dir).args(args).output()?)
}

fn git_stdout(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git(dir, args)?;
    if !output.status.success() {
        return Err(Error::Git(format!(
            "git {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Git(format!("non UTF-8 path: {}", path.display())))
}

fn same_path(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a == b
}

pub fn validate_git_repo(dir: &Path) -> Result<()> {
    let output = git(dir, &["rev-parse", "--git-dir"])?;
    if !output.status.success() {
        return Err(Error::Git(format!("{} is not a git repository", dir.display())));
    }
    Ok(())
}

/// Tracked changes only; the state and worktree directories are untracked.
pub fn check_uncommitted_changes(path: &Path) -> Result<()> {
    let status = git_stdout(path, &["status", "--porcelain", "--untracked-files=no"])?;
    if !status.is_empty() {
        return Err(Error::Git(format!(
            "uncommitted changes in {}",
            path.display()
        )));
    }
    Ok(())
}

pub fn get_current_branch(dir: &Path) -> Result<String> {
    git_stdout(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let refname = format!("refs/heads/{}", branch);
    Ok(git(dir, &["rev-parse", "--verify", "--quiet", &refname])?
        .status
        .success())
}

pub fn list_all_worktrees(dir: &Path) -> Result<Vec<ListedWorktree>> {
    let output = git_stdout(dir, &["worktree", "list", "--porcelain"])?;
    Ok(parse_worktree_list(&output))
}

pub fn parse_worktree_list(output: &str) -> Vec<ListedWorktree> {
    let mut worktrees: Vec<ListedWorktree> = Vec::new();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            worktrees.push(ListedWorktree {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            if let Some(current) = worktrees.last_mut() {
                current.branch = Some(branch.to_string());
            }
        }
    }

    worktrees
}

/// Commits everything in the worktree. Returns the new commit, or `None` when
/// there was nothing to commit.
pub fn commit_all(worktree: &Worktree, message: &str) -> Result<Option<String>> {
    git_stdout(&worktree.path, &["add", "-A"])?;

    let staged = git(&worktree.path, &["diff", "--cached", "--quiet"])?;
    if staged.status.success() {
        return Ok(None);
    }

    git_stdout(&worktree.path, &["commit", "-m", message])?;
    let commit = git_stdout(&worktree.path, &["rev-parse", "HEAD"])?;
    Ok(Some(commit))
}

/// Throws away uncommitted work, back to the worktree's last commit.
pub fn reset_worktree(worktree: &Worktree) -> Result<()> {
    git_stdout(&worktree.path, &["reset", "--hard", "HEAD"])?;
    git_stdout(&worktree.path, &["clean", "-fd"])?;
    Ok(())
}

/// Isolated git worktrees per spec, keyed by role.
///
/// Creation, merge and removal all take one lock: they mutate shared refs and
/// the spec's record file.
#[derive(Debug)]
pub struct WorktreeRegistry {
    layout: Layout,
    base_branch: String,
    lock: Mutex<()>,
}

impl WorktreeRegistry {
    pub fn new(layout: Layout, base_branch: &str) -> Self {
        WorktreeRegistry {
            layout,
            base_branch: base_branch.to_string(),
            lock: Mutex::new(()),
        }
    }

    /// Opens the registry for a project, defaulting the base branch to the
    /// currently checked-out one.
    pub fn open(layout: Layout, base_branch: Option<&str>) -> Result<Self> {
        validate_git_repo(&layout.project_dir)?;
        let base_branch = match base_branch {
            Some(branch) => branch.to_string(),
            None => get_current_branch(&layout.project_dir)?,
        };
        let registry = Self::new(layout, &base_branch);
        registry.exclude_state_dirs()?;
        Ok(registry)
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn staging_branch(spec: &str) -> String {
        format!("{}/{}", BRANCH_PREFIX, spec)
    }

    pub fn branch_for(spec: &str, role: WorktreeRole) -> String {
        match role {
            WorktreeRole::Staging => Self::staging_branch(spec),
            WorktreeRole::Worker(n) => format!("{}/{}-worker-{}", BRANCH_PREFIX, spec, n),
        }
    }

    pub fn path_for(&self, spec: &str, role: WorktreeRole) -> PathBuf {
        self.layout.spec_worktrees_dir(spec).join(role.to_string())
    }

    fn base_for(&self, spec: &str, role: WorktreeRole) -> String {
        match role {
            WorktreeRole::Staging => self.base_branch.clone(),
            WorktreeRole::Worker(_) => Self::staging_branch(spec),
        }
    }

    pub fn records(&self, spec: &str) -> Result<WorktreeState> {
        validate_spec_name(spec)?;
        WorktreeState::load(&self.layout.worktrees_file(spec))
    }

    pub fn find(&self, spec: &str, role: WorktreeRole) -> Result<Option<Worktree>> {
        let _guard = self.lock.lock();
        self.find_unlocked(spec, role)
    }

    fn find_unlocked(&self, spec: &str, role: WorktreeRole) -> Result<Option<Worktree>> {
        validate_spec_name(spec)?;
        let path = self.path_for(spec, role);
        let branch = Self::branch_for(spec, role);

        let listed = list_all_worktrees(&self.layout.project_dir)?;
        let present = listed
            .iter()
            .any(|w| same_path(&w.path, &path) && w.branch.as_deref() == Some(branch.as_str()));
        if !present {
            return Ok(None);
        }

        let records_path = self.layout.worktrees_file(spec);
        let mut state = WorktreeState::load(&records_path)?;
        if let Some(record) = state.get(role) {
            return Ok(Some(record.clone()));
        }

        // Git knows the worktree but our record was lost; adopt it.
        let worktree = Worktree {
            spec: spec.to_string(),
            role,
            path,
            branch,
            base_branch: self.base_for(spec, role),
            created_at: Utc::now(),
        };
        state.upsert(worktree.clone());
        state.save(&records_path)?;
        Ok(Some(worktree))
    }

    pub fn get_or_create(&self, spec: &str, role: WorktreeRole) -> Result<Worktree> {
        let _guard = self.lock.lock();
        if let Some(existing) = self.find_unlocked(spec, role)? {
            return Ok(existing);
        }

        let project_dir = &self.layout.project_dir;
        let path = self.path_for(spec, role);
        let branch = Self::branch_for(spec, role);
        let base_branch = self.base_for(spec, role);

        if !branch_exists(project_dir, &base_branch)? {
            return Err(Error::Creation(format!(
                "base branch '{}' does not exist",
                base_branch
            )));
        }
        if path.exists() {
            return Err(Error::Creation(format!(
                "{} already exists but is not a registered worktree",
                path.display()
            )));
        }
        if branch_exists(project_dir, &branch)? {
            return Err(Error::Creation(format!(
                "branch '{}' already exists; delete it or merge it first",
                branch
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let output = git(
            project_dir,
            &["worktree", "add", "-b", &branch, path_str(&path)?, &base_branch],
        )?;
        if !output.status.success() {
            return Err(Error::Creation(format!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let worktree = Worktree {
            spec: spec.to_string(),
            role,
            path,
            branch,
            base_branch,
            created_at: Utc::now(),
        };

        let records_path = self.layout.worktrees_file(spec);
        let mut state = WorktreeState::load(&records_path)?;
        state.upsert(worktree.clone());
        state.save(&records_path)?;

        info!(spec, role = %role, branch = %worktree.branch, "created worktree");
        Ok(worktree)
    }

    /// Merges the worktree's branch into its base, or throws it away.
    ///
    /// A conflicted merge is aborted and the worktree is left in place for
    /// manual resolution. Once the merge has landed, a failed cleanup only
    /// warns; the leftover worktree is reused or pruned later.
    pub fn release(&self, worktree: &Worktree, outcome: ReleaseOutcome) -> Result<()> {
        let _guard = self.lock.lock();
        match outcome {
            ReleaseOutcome::Merged => {
                self.merge_unlocked(worktree)?;
                if let Err(e) = self.remove_unlocked(worktree) {
                    warn!(
                        spec = %worktree.spec,
                        role = %worktree.role,
                        error = %e,
                        "merged but could not remove worktree"
                    );
                }
                Ok(())
            }
            ReleaseOutcome::Discarded => self.remove_unlocked(worktree),
        }
    }

    fn merge_unlocked(&self, worktree: &Worktree) -> Result<()> {
        let listed = list_all_worktrees(&self.layout.project_dir)?;
        let checkout = listed
            .iter()
            .find(|w| w.branch.as_deref() == Some(worktree.base_branch.as_str()))
            .map(|w| w.path.clone())
            .ok_or_else(|| {
                Error::Git(format!(
                    "base branch '{}' is not checked out anywhere",
                    worktree.base_branch
                ))
            })?;

        check_uncommitted_changes(&checkout)?;

        let message = format!("auto-build: merge {}", worktree.branch);
        let output = git(&checkout, &["merge", "--no-ff", &worktree.branch, "-m", &message])?;
        if !output.status.success() {
            let detail = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let _ = git(&checkout, &["merge", "--abort"]);
            warn!(branch = %worktree.branch, into = %worktree.base_branch, "merge aborted");
            return Err(Error::MergeConflict {
                branch: worktree.branch.clone(),
                into: worktree.base_branch.clone(),
                detail: detail.trim().to_string(),
            });
        }

        info!(branch = %worktree.branch, into = %worktree.base_branch, "merged worktree");
        Ok(())
    }

    fn remove_unlocked(&self, worktree: &Worktree) -> Result<()> {
        let project_dir = &self.layout.project_dir;

        if worktree.path.exists() {
            let output = git(
                project_dir,
                &["worktree", "remove", "--force", path_str(&worktree.path)?],
            )?;
            if !output.status.success() {
                return Err(Error::Git(format!(
                    "failed to remove worktree: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        // The branch may already be gone
        let _ = git(project_dir, &["branch", "-D", &worktree.branch]);
        git(project_dir, &["worktree", "prune"])?;

        let records_path = self.layout.worktrees_file(&worktree.spec);
        let mut state = WorktreeState::load(&records_path)?;
        state.remove(worktree.role);
        state.save(&records_path)?;

        info!(spec = %worktree.spec, role = %worktree.role, "removed worktree");
        Ok(())
    }

    /// Drops crash leftovers: records git no longer knows, and directories
    /// under the spec's worktree dir git never registered. Never fails;
    /// problems land in the report.
    pub fn prune_stale(&self, spec: &str) -> PruneReport {
        let mut report = PruneReport::default();
        if let Err(e) = validate_spec_name(spec) {
            warn!(spec, error = %e, "refusing to prune");
            report.errors.push(e.to_string());
            return report;
        }

        let _guard = self.lock.lock();
        let project_dir = &self.layout.project_dir;

        if let Err(e) = git(project_dir, &["worktree", "prune"]) {
            report.errors.push(format!("git worktree prune: {}", e));
        }

        let listed = match list_all_worktrees(project_dir) {
            Ok(listed) => listed,
            Err(e) => {
                warn!(spec, error = %e, "cannot list worktrees, skipping prune");
                report.errors.push(e.to_string());
                return report;
            }
        };
        let is_listed = |path: &Path| listed.iter().any(|w| same_path(&w.path, path));

        let records_path = self.layout.worktrees_file(spec);
        match WorktreeState::load(&records_path) {
            Ok(mut state) => {
                let before = state.worktrees.len();
                state.worktrees.retain(|w| {
                    let keep = is_listed(&w.path);
                    if !keep {
                        report.removed_records.push(w.role.to_string());
                    }
                    keep
                });
                if state.worktrees.len() != before {
                    if let Err(e) = state.save(&records_path) {
                        report.errors.push(e.to_string());
                    }
                }
            }
            Err(e) => report.errors.push(e.to_string()),
        }

        let spec_dir = self.layout.spec_worktrees_dir(spec);
        if let Ok(entries) = fs::read_dir(&spec_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                // Only slots this registry creates are ever removed
                let is_slot = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| {
                        let role = WorktreeRole::try_from(name.to_string()).ok()?;
                        Some(role.to_string() == name)
                    })
                    .unwrap_or(false);
                if !is_slot || !path.is_dir() || is_listed(&path) {
                    continue;
                }
                match fs::remove_dir_all(&path) {
                    Ok(()) => report.removed_dirs.push(path),
                    Err(e) => report
                        .errors
                        .push(format!("failed to remove {}: {}", path.display(), e)),
                }
            }
        }

        for error in &report.errors {
            warn!(spec, "prune: {}", error);
        }
        if !report.removed_records.is_empty() || !report.removed_dirs.is_empty() {
            info!(
                spec,
                records = report.removed_records.len(),
                dirs = report.removed_dirs.len(),
                "pruned stale worktrees"
            );
        }
        report
    }

    /// Files changed on the worktree's branch since it forked from its base.
    pub fn changed_files(&self, worktree: &Worktree) -> Result<Vec<String>> {
        let range = format!("{}...{}", worktree.base_branch, worktree.branch);
        let output = git_stdout(&self.layout.project_dir, &["diff", "--name-status", &range])?;
        Ok(output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    /// Keeps the state and worktree directories out of `git status`.
    fn exclude_state_dirs(&self) -> Result<()> {
        let exclude = git_stdout(
            &self.layout.project_dir,
            &["rev-parse", "--git-path", "info/exclude"],
        )?;
        let exclude = self.layout.project_dir.join(exclude);

        let worktrees_dir = self
            .layout
            .worktrees_dir
            .strip_prefix(&self.layout.project_dir)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        let mut contents = existing.clone();
        for entry in [format!("/{}/", STATE_DIR), format!("/{}/", worktrees_dir)] {
            if entry == "//" || existing.lines().any(|l| l.trim() == entry) {
                continue;
            }
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&entry);
            contents.push('\n');
        }

        if contents != existing {
            if let Some(parent) = exclude.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&exclude, contents)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "git_worktree_tests.rs"]
pub(crate) mod tests;
