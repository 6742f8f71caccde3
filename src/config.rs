use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directory holding all auto-build state inside the user's project.
pub const STATE_DIR: &str = ".auto-build";
pub const PLAN_FILE: &str = "implementation_plan.json";
pub const WORKTREES_FILE: &str = "worktrees.json";
pub const ATTEMPT_HISTORY_FILE: &str = "attempt_history.jsonl";
pub const BUILD_COMMITS_FILE: &str = "build_commits.jsonl";
pub const PAUSE_FILE: &str = "PAUSE";
pub const BRANCH_PREFIX: &str = "auto-build";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Branch the staging worktree forks from. Falls back to the checked-out branch.
    pub base_branch: Option<String>,
    pub worktrees_dir: String,
    pub max_workers: usize,
    pub dispatch_policy: DispatchPolicy,
    pub agent: AgentConfig,
    pub validation_commands: Vec<ValidationCommand>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program and leading arguments; the prompt is appended last.
    pub command: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValidationCommand {
    pub command: String,
    #[serde(default)]
    pub description: String,
}

/// How free workers pick pending chunks in parallel mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Any non-conflicting pending chunk from any eligible phase, in plan order.
    #[default]
    FirstEligible,
    /// Only chunks of the first eligible phase that still has pending work.
    PhaseAtATime,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_branch: None,
            worktrees_dir: ".worktrees".to_string(),
            max_workers: 1,
            dispatch_policy: DispatchPolicy::default(),
            agent: AgentConfig::default(),
            validation_commands: Vec::new(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            command: vec![
                "claude".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "-p".to_string(),
            ],
        }
    }
}

impl Config {
    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join("config.json")
    }

    /// Loads `.auto-build/config.json`; a missing file yields the defaults.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::path(project_dir);
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.command.is_empty() {
            return Err(Error::Config("agent.command must not be empty".to_string()));
        }
        if self.worktrees_dir.trim().is_empty() {
            return Err(Error::Config("worktrees_dir must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Spec names become a directory under the state and worktree dirs and part
/// of a branch name, so they are a single plain path component that is also
/// valid inside a git ref.
pub fn validate_spec_name(spec: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(Error::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        })
    };

    if spec.is_empty() {
        return reject("must not be empty");
    }
    if let Some(c) = spec
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return reject(&format!("character '{}' is not allowed", c));
    }
    if spec.starts_with('.') || spec.starts_with('-') {
        return reject("must start with a letter, digit or '_'");
    }
    if spec.contains("..") {
        return reject("must not contain '..'");
    }
    if spec.ends_with('.') || spec.ends_with(".lock") {
        return reject("must not end with '.' or '.lock'");
    }
    Ok(())
}

/// Resolves every on-disk location used for one project.
#[derive(Debug, Clone)]
pub struct Layout {
    pub project_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl Layout {
    pub fn new(project_dir: impl Into<PathBuf>, config: &Config) -> Self {
        let project_dir = project_dir.into();
        let worktrees_dir = project_dir.join(&config.worktrees_dir);
        Layout {
            project_dir,
            worktrees_dir,
        }
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.project_dir.join(STATE_DIR).join("specs")
    }

    pub fn spec_dir(&self, spec: &str) -> PathBuf {
        self.specs_dir().join(spec)
    }

    pub fn plan_file(&self, spec: &str) -> PathBuf {
        self.spec_dir(spec).join(PLAN_FILE)
    }

    pub fn worktrees_file(&self, spec: &str) -> PathBuf {
        self.spec_dir(spec).join(WORKTREES_FILE)
    }

    pub fn attempt_history_file(&self, spec: &str) -> PathBuf {
        self.spec_dir(spec).join(ATTEMPT_HISTORY_FILE)
    }

    pub fn build_commits_file(&self, spec: &str) -> PathBuf {
        self.spec_dir(spec).join(BUILD_COMMITS_FILE)
    }

    pub fn pause_file(&self, spec: &str) -> PathBuf {
        self.spec_dir(spec).join(PAUSE_FILE)
    }

    pub fn spec_worktrees_dir(&self, spec: &str) -> PathBuf {
        self.worktrees_dir.join(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_spec_names() {
        for ok in ["001-auth", "feature_x", "v1.2"] {
            assert!(validate_spec_name(ok).is_ok(), "{} rejected", ok);
        }
        let rejected = [
            "", ".", "..", "a/b", "../x", "a\\b", "-x", ".hidden", "a..b", "x.lock", "a b",
        ];
        for bad in rejected {
            assert!(
                matches!(validate_spec_name(bad), Err(Error::InvalidSpec { .. })),
                "{:?} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.agent.command[0], "claude");
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join(STATE_DIR)).unwrap();
        fs::write(
            Config::path(temp_dir.path()),
            r#"{
  "max_workers": 3,
  "dispatch_policy": "phase_at_a_time",
  "validation_commands": [
    { "command": "cargo test", "description": "Run tests" }
  ]
}"#,
        )
        .unwrap();

        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.dispatch_policy, DispatchPolicy::PhaseAtATime);
        assert_eq!(config.validation_commands.len(), 1);
        assert_eq!(config.worktrees_dir, ".worktrees");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join(STATE_DIR)).unwrap();
        fs::write(Config::path(temp_dir.path()), r#"{ "agent": { "command": [] } }"#).unwrap();

        let result = Config::load(temp_dir.path());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new("/work/project", &Config::default());
        assert_eq!(
            layout.plan_file("001-auth"),
            PathBuf::from("/work/project/.auto-build/specs/001-auth/implementation_plan.json")
        );
        assert_eq!(
            layout.spec_worktrees_dir("001-auth"),
            PathBuf::from("/work/project/.worktrees/001-auth")
        );
    }
}
