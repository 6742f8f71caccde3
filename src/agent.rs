use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

use crate::config::{Config, ValidationCommand};
use crate::error::{Error, Result};
use crate::git_worktree::{Worktree, WorktreeRole};
use crate::plan::Chunk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed,
    Failed(String),
    /// Waiting on something outside the build; needs an explicit reset.
    Blocked(String),
}

/// Everything a worker needs to hand one chunk to the agent.
#[derive(Debug, Clone)]
pub struct ChunkAssignment {
    pub spec: String,
    pub phase: String,
    pub chunk: Chunk,
    pub worker: WorktreeRole,
    /// Earlier attempts at this chunk recorded in the attempt history.
    pub attempt: usize,
    pub previous_failures: Vec<String>,
}

/// The external coding agent. `plan` must leave a plan document behind;
/// `implement` works inside the given worktree.
pub trait AgentRunner: Send + Sync {
    fn plan(&self, spec: &str, project_dir: &Path, plan_path: &Path) -> Result<AgentOutcome>;

    fn implement(&self, assignment: &ChunkAssignment, worktree: &Worktree) -> Result<AgentOutcome>;
}

/// Runs the configured agent CLI with the prompt as its last argument.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Config("agent command is empty".to_string()));
        }
        Ok(CommandAgent { command })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.agent.command.clone())
    }

    fn invoke(&self, dir: &Path, prompt: &str) -> Result<AgentOutcome> {
        let status = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg(prompt)
            .current_dir(dir)
            .status()?;

        if status.success() {
            Ok(AgentOutcome::Completed)
        } else {
            Ok(AgentOutcome::Failed(format!("agent exited with {}", status)))
        }
    }
}

impl AgentRunner for CommandAgent {
    fn plan(&self, spec: &str, project_dir: &Path, plan_path: &Path) -> Result<AgentOutcome> {
        info!(spec, "running planning session");
        self.invoke(project_dir, &planning_prompt(spec, plan_path))
    }

    fn implement(&self, assignment: &ChunkAssignment, worktree: &Worktree) -> Result<AgentOutcome> {
        info!(
            spec = %assignment.spec,
            chunk = %assignment.chunk.id,
            worker = %assignment.worker,
            "running coding session"
        );
        self.invoke(&worktree.path, &chunk_prompt(assignment))
    }
}

pub fn planning_prompt(spec: &str, plan_path: &Path) -> String {
    let spec_file = plan_path.with_file_name("spec.md");
    let requirements = if spec_file.exists() {
        format!("Read the requirements in {}.", spec_file.display())
    } else {
        format!("The requirements are described by the spec name '{}'.", spec)
    };

    format!(
        r#"You are a project planning expert. {}

Write a detailed implementation plan to {} as JSON. Split the work into phases that
build on each other, and each phase into small chunks that one agent can finish in a
single session.

IMPORTANT GUIDELINES:
1. Phase names are unique; list the names of earlier phases a phase needs in "depends_on"
2. Chunk ids are unique across the WHOLE plan
3. List the files each chunk will create or modify in "files" so parallel workers never touch the same file
4. Every chunk starts with status "pending"

The JSON structure must be:
{{
  "spec": "{}",
  "phases": [
    {{
      "name": "backend",
      "depends_on": [],
      "chunks": [
        {{
          "id": "backend-1",
          "description": "Detailed instructions...",
          "status": "pending",
          "files": ["src/api.rs"]
        }}
      ]
    }}
  ]
}}

CRITICAL: Only write the plan. Do not implement anything."#,
        requirements,
        plan_path.display(),
        spec
    )
}

pub fn chunk_prompt(assignment: &ChunkAssignment) -> String {
    let chunk = &assignment.chunk;
    let files = if chunk.files.is_empty() {
        String::new()
    } else {
        format!("\nFiles you own for this chunk: {}\n", chunk.files.join(", "))
    };

    let recovery = if assignment.attempt == 0 {
        String::new()
    } else {
        let notes = assignment
            .previous_failures
            .iter()
            .map(|n| format!("- {}", n))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "\nThis chunk has been attempted {} time(s) before. Do something different this time.\n{}\n",
            assignment.attempt, notes
        )
    };

    format!(
        "You are working on ONE chunk of the '{}' build (phase '{}').\n\n\
        Chunk ID: {}\n\
        Description: {}\n{}{}\n\
        Work only inside the current directory. Do not edit the implementation plan; \
        the build records your result.\n\n\
        IMPORTANT: Complete ONLY this specific chunk. Once finished, STOP.",
        assignment.spec, assignment.phase, chunk.id, chunk.description, files, recovery
    )
}

/// Runs each validation command in `dir`, stopping at the first failure.
/// Returns a description of the failure, or `None` when all pass.
pub fn run_validation(commands: &[ValidationCommand], dir: &Path) -> Result<Option<String>> {
    for cmd in commands {
        info!(command = %cmd.command, "running validation");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&cmd.command)
            .current_dir(dir)
            .output()?;

        if !output.status.success() {
            let label = if cmd.description.is_empty() {
                cmd.command.clone()
            } else {
                cmd.description.clone()
            };
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            warn!(command = %cmd.command, "validation failed");
            return Ok(Some(format!(
                "validation '{}' failed ({}): {}",
                label,
                output.status,
                tail.join(" | ")
            )));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn assignment(attempt: usize) -> ChunkAssignment {
        ChunkAssignment {
            spec: "001-auth".to_string(),
            phase: "backend".to_string(),
            chunk: Chunk::new("backend-1", "Add login endpoint").with_files(&["src/login.rs"]),
            worker: WorktreeRole::Staging,
            attempt,
            previous_failures: vec!["validation 'tests' failed".to_string()],
        }
    }

    #[test]
    fn test_chunk_prompt_first_attempt() {
        let prompt = chunk_prompt(&assignment(0));
        assert!(prompt.contains("Chunk ID: backend-1"));
        assert!(prompt.contains("Add login endpoint"));
        assert!(prompt.contains("src/login.rs"));
        assert!(!prompt.contains("attempted"));
    }

    #[test]
    fn test_chunk_prompt_includes_recovery_notes() {
        let prompt = chunk_prompt(&assignment(2));
        assert!(prompt.contains("attempted 2 time(s)"));
        assert!(prompt.contains("- validation 'tests' failed"));
    }

    #[test]
    fn test_planning_prompt_names_plan_path() {
        let plan_path = Path::new("/p/.auto-build/specs/001-auth/implementation_plan.json");
        let prompt = planning_prompt("001-auth", plan_path);
        assert!(prompt.contains("/p/.auto-build/specs/001-auth/implementation_plan.json"));
        assert!(prompt.contains("\"spec\": \"001-auth\""));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(CommandAgent::new(vec![]), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_stops_at_first_failure() {
        let temp_dir = TempDir::new().unwrap();
        let commands = vec![
            ValidationCommand {
                command: "true".to_string(),
                description: "ok".to_string(),
            },
            ValidationCommand {
                command: "echo broken >&2; exit 3".to_string(),
                description: "Run tests".to_string(),
            },
            ValidationCommand {
                command: "touch never".to_string(),
                description: String::new(),
            },
        ];

        let failure = run_validation(&commands, temp_dir.path()).unwrap().unwrap();
        assert!(failure.contains("Run tests"));
        assert!(failure.contains("broken"));
        assert!(!temp_dir.path().join("never").exists());
    }

    #[test]
    fn test_validation_passes() {
        let temp_dir = TempDir::new().unwrap();
        let commands = vec![ValidationCommand {
            command: "true".to_string(),
            description: String::new(),
        }];
        assert_eq!(run_validation(&commands, temp_dir.path()).unwrap(), None);
    }
}
