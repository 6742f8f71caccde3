//! Append-only JSON-lines logs kept next to the plan: one record per chunk
//! attempt and one per commit the build makes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Layout;
use crate::error::Result;
use crate::plan::ChunkStatus;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub chunk: String,
    pub worker: String,
    pub outcome: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommitRecord {
    pub chunk: String,
    pub commit: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct History {
    attempts: PathBuf,
    commits: PathBuf,
}

impl History {
    pub fn new(layout: &Layout, spec: &str) -> Self {
        History {
            attempts: layout.attempt_history_file(spec),
            commits: layout.build_commits_file(spec),
        }
    }

    pub fn record_attempt(&self, record: &AttemptRecord) -> Result<()> {
        append_line(&self.attempts, record)
    }

    pub fn record_commit(&self, record: &CommitRecord) -> Result<()> {
        append_line(&self.commits, record)
    }

    pub fn attempts(&self) -> Result<Vec<AttemptRecord>> {
        read_lines(&self.attempts)
    }

    pub fn commits(&self) -> Result<Vec<CommitRecord>> {
        read_lines(&self.commits)
    }

    pub fn attempt_count(&self, chunk: &str) -> Result<usize> {
        Ok(self.attempts()?.iter().filter(|a| a.chunk == chunk).count())
    }

    /// Details of the earlier unsuccessful attempts at a chunk, oldest first.
    pub fn failure_notes(&self, chunk: &str) -> Result<Vec<String>> {
        Ok(self
            .attempts()?
            .into_iter()
            .filter(|a| a.chunk == chunk && a.outcome != ChunkStatus::Completed)
            .filter_map(|a| a.detail)
            .collect())
    }
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Lines that don't parse (say, a torn final write) are skipped.
fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn attempt(chunk: &str, outcome: ChunkStatus, detail: Option<&str>) -> AttemptRecord {
        AttemptRecord {
            chunk: chunk.to_string(),
            worker: "staging".to_string(),
            outcome,
            detail: detail.map(str::to_string),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_attempts_append_and_count() {
        let temp_dir = TempDir::new().unwrap();
        let history = History::new(&Layout::new(temp_dir.path(), &Config::default()), "demo");

        history
            .record_attempt(&attempt("api", ChunkStatus::Failed, Some("tests failed")))
            .unwrap();
        history
            .record_attempt(&attempt("api", ChunkStatus::Completed, None))
            .unwrap();
        history
            .record_attempt(&attempt("ui", ChunkStatus::Completed, None))
            .unwrap();

        assert_eq!(history.attempts().unwrap().len(), 3);
        assert_eq!(history.attempt_count("api").unwrap(), 2);
        assert_eq!(history.failure_notes("api").unwrap(), vec!["tests failed"]);
    }

    #[test]
    fn test_existing_lines_are_preserved() {
        let temp_dir = TempDir::new().unwrap();
        let layout = Layout::new(temp_dir.path(), &Config::default());
        let path = layout.build_commits_file("demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{\"written\":\"by another tool\"}\n").unwrap();

        let history = History::new(&layout, "demo");
        history
            .record_commit(&CommitRecord {
                chunk: "api".to_string(),
                commit: "abc123".to_string(),
                at: Utc::now(),
            })
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("{\"written\":\"by another tool\"}\n"));
        assert_eq!(history.commits().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_logs_are_empty() {
        let temp_dir = TempDir::new().unwrap();
        let history = History::new(&Layout::new(temp_dir.path(), &Config::default()), "demo");
        assert!(history.attempts().unwrap().is_empty());
        assert_eq!(history.attempt_count("api").unwrap(), 0);
    }
}
