use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Expected absence, e.g. no plan written yet. A signal, not a failure.
    #[error("Not found: {what} ({path})")]
    NotFound { what: String, path: PathBuf },

    #[error("Malformed {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Worktree creation failed: {0}")]
    Creation(String),

    #[error("Merge of '{branch}' into '{into}' is not clean: {detail}")]
    MergeConflict {
        branch: String,
        into: String,
        detail: String,
    },

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Cannot apply '{event}' while {from}")]
    InvalidTransition { from: String, event: String },

    #[error("Chunk '{0}' does not exist in the plan")]
    UnknownChunk(String),

    #[error("Agent session failed: {0}")]
    Agent(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid spec name '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Errors contained to a single chunk: the chunk is marked failed and the
    /// run goes on with its siblings.
    pub fn is_per_chunk(&self) -> bool {
        matches!(self, Error::MergeConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
