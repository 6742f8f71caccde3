//! Implementation plan document: phases of chunks with per-chunk status.
//!
//! The plan is the shared truth across process restarts. Phase order and chunk
//! order are authoritative, which keeps every scan over the plan deterministic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Blocked => "blocked",
            ChunkStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "in_progress" => Ok(ChunkStatus::InProgress),
            "completed" => Ok(ChunkStatus::Completed),
            "blocked" => Ok(ChunkStatus::Blocked),
            "failed" => Ok(ChunkStatus::Failed),
            other => Err(format!("unknown chunk status '{}'", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub description: String,
    pub status: ChunkStatus,
    /// Files this chunk expects to touch; used to keep parallel workers apart.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Chunk {
    pub fn new(id: &str, description: &str) -> Self {
        Chunk {
            id: id.to_string(),
            description: description.to_string(),
            status: ChunkStatus::Pending,
            files: Vec::new(),
            started_at: None,
            completed_at: None,
            notes: None,
        }
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_status(mut self, status: ChunkStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Phase {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub chunks: Vec<Chunk>,
}

impl Phase {
    pub fn new(name: &str, chunks: Vec<Chunk>) -> Self {
        Phase {
            name: name.to_string(),
            description: None,
            depends_on: Vec::new(),
            chunks,
        }
    }

    pub fn depends_on(mut self, phases: &[&str]) -> Self {
        self.depends_on = phases.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Completed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Plan {
    pub spec: String,
    /// Bumped by every save so readers can tell documents apart.
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub phases: Vec<Phase>,
}

/// A chunk together with the phase that owns it.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRef<'a> {
    pub phase: &'a Phase,
    pub chunk: &'a Chunk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl PlanStats {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Done,
    InProgress,
    Ready,
    WaitingOnDependencies,
}

impl PhaseState {
    pub fn marker(&self) -> &'static str {
        match self {
            PhaseState::Done => "✓",
            PhaseState::InProgress => "→",
            PhaseState::Ready => "○",
            PhaseState::WaitingOnDependencies => "⊘",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseProgress {
    pub name: String,
    pub completed: usize,
    pub total: usize,
    pub state: PhaseState,
}

impl Plan {
    pub fn new(spec: &str, phases: Vec<Phase>) -> Self {
        Plan {
            spec: spec.to_string(),
            revision: 0,
            updated_at: None,
            phases,
        }
    }

    /// Structural checks serde cannot express. Returns the first problem found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut phase_names = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err("phase with empty name".to_string());
            }
            if !phase_names.insert(phase.name.as_str()) {
                return Err(format!("duplicate phase name '{}'", phase.name));
            }
        }

        let mut chunk_ids = HashSet::new();
        for phase in &self.phases {
            for dep in &phase.depends_on {
                if dep == &phase.name {
                    return Err(format!("phase '{}' depends on itself", phase.name));
                }
                if !phase_names.contains(dep.as_str()) {
                    return Err(format!(
                        "phase '{}' depends on unknown phase '{}'",
                        phase.name, dep
                    ));
                }
            }
            for chunk in &phase.chunks {
                if chunk.id.trim().is_empty() {
                    return Err(format!("chunk with empty id in phase '{}'", phase.name));
                }
                if !chunk_ids.insert(chunk.id.as_str()) {
                    return Err(format!("duplicate chunk id '{}'", chunk.id));
                }
            }
        }

        if let Some(name) = self.dependency_cycle() {
            return Err(format!("phase dependency cycle through '{}'", name));
        }

        Ok(())
    }

    /// A phase on a dependency cycle, if any. Phases on a cycle can never
    /// become eligible. Assumes every dependency names a known phase.
    fn dependency_cycle(&self) -> Option<&str> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let deps: HashMap<&str, &[String]> = self
            .phases
            .iter()
            .map(|p| (p.name.as_str(), p.depends_on.as_slice()))
            .collect();
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for phase in &self.phases {
            if marks.contains_key(phase.name.as_str()) {
                continue;
            }
            // Iterative DFS: (phase, index of next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(phase.name.as_str(), 0)];
            marks.insert(phase.name.as_str(), Mark::Visiting);
            while let Some((name, next)) = stack.pop() {
                let edges = deps.get(name).copied().unwrap_or(&[]);
                let Some(dep) = edges.get(next) else {
                    marks.insert(name, Mark::Done);
                    continue;
                };
                stack.push((name, next + 1));
                match marks.get(dep.as_str()) {
                    Some(Mark::Visiting) => return Some(dep.as_str()),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep.as_str(), Mark::Visiting);
                        stack.push((dep.as_str(), 0));
                    }
                }
            }
        }
        None
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkRef<'_>> {
        self.phases
            .iter()
            .flat_map(|phase| phase.chunks.iter().map(move |chunk| ChunkRef { phase, chunk }))
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<ChunkRef<'_>> {
        self.chunks().find(|c| c.chunk.id == chunk_id)
    }

    fn chunk_mut(&mut self, chunk_id: &str) -> Option<&mut Chunk> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.chunks.iter_mut())
            .find(|c| c.id == chunk_id)
    }

    fn phase_complete(&self, name: &str) -> bool {
        self.phases
            .iter()
            .find(|p| p.name == name)
            .map(Phase::is_complete)
            .unwrap_or(false)
    }

    /// A phase may start once every phase it depends on is fully completed.
    pub fn is_eligible(&self, phase: &Phase) -> bool {
        phase.depends_on.iter().all(|dep| self.phase_complete(dep))
    }

    /// First pending chunk of the first eligible phase, in declared order.
    pub fn find_next_pending(&self) -> Option<ChunkRef<'_>> {
        self.available_chunks().into_iter().next()
    }

    /// Every pending chunk in eligible phases, in declared order.
    pub fn available_chunks(&self) -> Vec<ChunkRef<'_>> {
        self.phases
            .iter()
            .filter(|phase| self.is_eligible(phase))
            .flat_map(|phase| {
                phase
                    .chunks
                    .iter()
                    .filter(|c| c.status == ChunkStatus::Pending)
                    .map(move |chunk| ChunkRef { phase, chunk })
            })
            .collect()
    }

    /// Sets a chunk's status and its timestamps. Returns the previous status.
    pub fn set_chunk_status(
        &mut self,
        chunk_id: &str,
        status: ChunkStatus,
        note: Option<String>,
    ) -> Result<ChunkStatus> {
        let chunk = self
            .chunk_mut(chunk_id)
            .ok_or_else(|| Error::UnknownChunk(chunk_id.to_string()))?;

        let previous = chunk.status;
        chunk.status = status;
        match status {
            ChunkStatus::InProgress => {
                chunk.started_at = Some(Utc::now());
                chunk.completed_at = None;
            }
            ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Blocked => {
                chunk.completed_at = Some(Utc::now());
            }
            ChunkStatus::Pending => {
                chunk.started_at = None;
                chunk.completed_at = None;
            }
        }
        if note.is_some() {
            chunk.notes = note;
        }
        Ok(previous)
    }

    pub fn stats(&self) -> PlanStats {
        let mut stats = PlanStats::default();
        for c in self.chunks() {
            stats.total += 1;
            match c.chunk.status {
                ChunkStatus::Pending => stats.pending += 1,
                ChunkStatus::InProgress => stats.in_progress += 1,
                ChunkStatus::Completed => stats.completed += 1,
                ChunkStatus::Blocked => stats.blocked += 1,
                ChunkStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn phase_progress(&self) -> Vec<PhaseProgress> {
        self.phases
            .iter()
            .map(|phase| {
                let total = phase.chunks.len();
                let completed = phase
                    .chunks
                    .iter()
                    .filter(|c| c.status == ChunkStatus::Completed)
                    .count();
                let state = if completed == total {
                    PhaseState::Done
                } else if !self.is_eligible(phase) {
                    PhaseState::WaitingOnDependencies
                } else if phase.chunks.iter().any(|c| c.status != ChunkStatus::Pending) {
                    PhaseState::InProgress
                } else {
                    PhaseState::Ready
                };
                PhaseProgress {
                    name: phase.name.clone(),
                    completed,
                    total,
                    state,
                }
            })
            .collect()
    }
}
