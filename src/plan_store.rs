use chrono::Utc;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::{validate_spec_name, Layout};
use crate::error::{Error, Result};
use crate::plan::{ChunkRef, ChunkStatus, Plan};

/// Owns every plan document under `.auto-build/specs/`.
///
/// All writes in this process go through one lock, and every write replaces the
/// file with a rename so readers only ever see a complete document.
#[derive(Debug)]
pub struct PlanStore {
    layout: Layout,
    write_lock: Mutex<()>,
}

impl PlanStore {
    pub fn new(layout: Layout) -> Self {
        PlanStore {
            layout,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self, spec: &str) -> PathBuf {
        self.layout.plan_file(spec)
    }

    /// True iff a plan is present and passes validation.
    pub fn exists(&self, spec: &str) -> bool {
        self.load(spec).is_ok()
    }

    pub fn load(&self, spec: &str) -> Result<Plan> {
        validate_spec_name(spec)?;
        let path = self.path(spec);
        if !path.exists() {
            return Err(Error::NotFound {
                what: format!("implementation plan for '{}'", spec),
                path,
            });
        }

        let contents = fs::read_to_string(&path)?;
        let plan: Plan = serde_json::from_str(&contents).map_err(|e| Error::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if plan.spec != spec {
            return Err(Error::Malformed {
                path,
                reason: format!("plan belongs to spec '{}'", plan.spec),
            });
        }
        plan.validate()
            .map_err(|reason| Error::Malformed { path, reason })?;

        Ok(plan)
    }

    /// Persists the whole plan, bumping its revision.
    pub fn save(&self, plan: &mut Plan) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write(plan)
    }

    /// Read-modify-write under the store's lock. The closure's plan is saved
    /// only when it returns `Ok`.
    pub fn update<T>(&self, spec: &str, f: impl FnOnce(&mut Plan) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut plan = self.load(spec)?;
        let value = f(&mut plan)?;
        self.write(&mut plan)?;
        Ok(value)
    }

    pub fn set_status(
        &self,
        spec: &str,
        chunk_id: &str,
        status: ChunkStatus,
        note: Option<String>,
    ) -> Result<ChunkStatus> {
        self.update(spec, |plan| plan.set_chunk_status(chunk_id, status, note))
    }

    pub fn find_next_pending<'a>(&self, plan: &'a Plan) -> Option<ChunkRef<'a>> {
        plan.find_next_pending()
    }

    fn write(&self, plan: &mut Plan) -> Result<()> {
        validate_spec_name(&plan.spec)?;
        let path = self.path(&plan.spec);
        let dir = path
            .parent()
            .ok_or_else(|| Error::Config(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(dir)?;

        plan.revision += 1;
        plan.updated_at = Some(Utc::now());
        let contents = serde_json::to_string_pretty(plan)?;

        write_atomically(dir, &path, contents.as_bytes())?;
        debug!(spec = %plan.spec, revision = plan.revision, "saved plan");
        Ok(())
    }
}

/// Writes to a temp file in `dir` and renames it over `path`.
pub(crate) fn write_atomically(dir: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::plan::{Chunk, Phase};
    use tempfile::TempDir;

    fn store_in(temp_dir: &TempDir) -> PlanStore {
        PlanStore::new(Layout::new(temp_dir.path(), &Config::default()))
    }

    fn sample_plan() -> Plan {
        Plan::new(
            "demo",
            vec![Phase::new(
                "backend",
                vec![Chunk::new("api", "Add endpoints").with_files(&["src/api.rs"])],
            )],
        )
    }

    #[test]
    fn test_absent_plan_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        assert!(!store.exists("demo"));
        assert!(store.load("demo").unwrap_err().is_not_found());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let mut plan = sample_plan();
        store.save(&mut plan).unwrap();
        assert_eq!(plan.revision, 1);

        assert!(store.exists("demo"));
        let loaded = store.load("demo").unwrap();
        assert_eq!(loaded, plan);
        assert_eq!(loaded.phases[0].chunks[0].files, vec!["src/api.rs"]);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let mut plan = sample_plan();
        store.save(&mut plan).unwrap();
        store.save(&mut plan).unwrap();

        let dir = store.path("demo").parent().unwrap().to_path_buf();
        let names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["implementation_plan.json".to_string()]);
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let path = store.path("demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ \"spec\": \"demo\", \"phases\": [").unwrap();

        assert!(!store.exists("demo"));
        assert!(matches!(store.load("demo"), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_unknown_status_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let path = store.path("demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"spec":"demo","phases":[{"name":"p","chunks":[{"id":"a","description":"x","status":"done"}]}]}"#,
        )
        .unwrap();

        assert!(matches!(store.load("demo"), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let path = store.path("demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"spec":"demo","phases":[{"name":"p","chunks":[{"id":"a","status":"pending"}]}]}"#,
        )
        .unwrap();

        assert!(matches!(store.load("demo"), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_duplicate_chunk_id_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let path = store.path("demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"spec":"demo","phases":[
                {"name":"one","chunks":[{"id":"a","description":"x","status":"pending"}]},
                {"name":"two","chunks":[{"id":"a","description":"y","status":"pending"}]}
            ]}"#,
        )
        .unwrap();

        match store.load("demo") {
            Err(Error::Malformed { reason, .. }) => assert!(reason.contains("duplicate chunk id")),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_cyclic_phase_dependencies_are_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let path = store.path("demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"spec":"demo","phases":[
                {"name":"a","depends_on":["b"],"chunks":[{"id":"x","description":"x","status":"pending"}]},
                {"name":"b","depends_on":["a"],"chunks":[{"id":"y","description":"y","status":"pending"}]}
            ]}"#,
        )
        .unwrap();

        assert!(!store.exists("demo"));
        match store.load("demo") {
            Err(Error::Malformed { reason, .. }) => assert!(reason.contains("dependency cycle")),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_spec_names_outside_specs_dir_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        for spec in ["", "..", "a/b", "../../etc"] {
            assert!(
                matches!(store.load(spec), Err(Error::InvalidSpec { .. })),
                "{:?}",
                spec
            );
            let mut plan = sample_plan();
            plan.spec = spec.to_string();
            assert!(matches!(store.save(&mut plan), Err(Error::InvalidSpec { .. })));
            assert_eq!(plan.revision, 0);
        }
        assert!(!temp_dir.path().join(".auto-build").exists());
    }

    #[test]
    fn test_set_status_persists() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let mut plan = sample_plan();
        store.save(&mut plan).unwrap();

        let previous = store
            .set_status("demo", "api", ChunkStatus::Failed, Some("merge conflict".into()))
            .unwrap();
        assert_eq!(previous, ChunkStatus::Pending);

        let loaded = store.load("demo").unwrap();
        let chunk = &loaded.phases[0].chunks[0];
        assert_eq!(chunk.status, ChunkStatus::Failed);
        assert_eq!(chunk.notes.as_deref(), Some("merge conflict"));
        assert_eq!(loaded.revision, 2);
    }

    #[test]
    fn test_failed_update_does_not_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let mut plan = sample_plan();
        store.save(&mut plan).unwrap();

        let result = store.set_status("demo", "missing", ChunkStatus::Completed, None);
        assert!(matches!(result, Err(Error::UnknownChunk(_))));
        assert_eq!(store.load("demo").unwrap().revision, 1);
    }
}
