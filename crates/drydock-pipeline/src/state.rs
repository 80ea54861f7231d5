//! Persisted run state for stage-by-stage execution.
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/runs/<run_id>.json   one PipelineRun per file
//! <state_dir>/CURRENT              id of the most recently saved run
//! ```
//!
//! Every write goes to a temp file in the same directory and is renamed into
//! place, so a crash never leaves a half-written run behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use drydock_core::{DrydockError, PipelineRun, Result};
use tempfile::NamedTempFile;

const CURRENT_FILE: &str = "CURRENT";

pub struct RunStateStore {
    root: PathBuf,
}

impl RunStateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Save `run` and make it the current run.
    pub fn save(&self, run: &PipelineRun) -> Result<PathBuf> {
        let path = self.run_path(run.id());
        let json = serde_json::to_vec_pretty(run)?;
        Self::write_atomic(&self.runs_dir(), &path, &json)?;
        Self::write_atomic(&self.root, &self.root.join(CURRENT_FILE), run.id().as_bytes())?;
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> Result<PipelineRun> {
        let path = self.run_path(run_id);
        let raw = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DrydockError::config(format!("no saved run '{run_id}' in {}", self.root.display()))
            } else {
                DrydockError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Id of the most recently saved run, if any.
    pub fn current_id(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(id) => Ok(Some(id.trim().to_string()).filter(|id| !id.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The current run. Missing state means no `build` has been run yet.
    pub fn load_current(&self) -> Result<PipelineRun> {
        match self.current_id()? {
            Some(id) => self.load(&id),
            None => Err(DrydockError::config(format!(
                "no run in progress under {}; start one with `drydock build`",
                self.root.display()
            ))),
        }
    }

    /// Saved run ids, oldest file first.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.runs_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let modified = entry.metadata()?.modified()?;
                runs.push((modified, stem.to_string()));
            }
        }
        runs.sort();
        Ok(runs.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::{ErrorClass, RunStatus, StageKind, Trigger};

    fn make_store() -> (tempfile::TempDir, RunStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path().join(".drydock"));
        (dir, store)
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (_dir, store) = make_store();
        let mut run = PipelineRun::new(Trigger::new("abc", vec![]));
        run.start().unwrap();
        run.begin_stage(StageKind::Build).unwrap();
        run.end_stage(StageKind::Build).unwrap();

        store.save(&run).unwrap();
        let loaded = store.load_current().unwrap();
        assert_eq!(loaded, run);
        assert_eq!(loaded.status(), RunStatus::Running);
    }

    #[test]
    fn test_save_overwrites_and_moves_current() {
        let (_dir, store) = make_store();
        let mut first = PipelineRun::new(Trigger::new("abc", vec![]));
        store.save(&first).unwrap();
        first.start().unwrap();
        store.save(&first).unwrap();

        let second = PipelineRun::new(Trigger::new("def", vec![]));
        store.save(&second).unwrap();

        assert_eq!(store.current_id().unwrap().as_deref(), Some(second.id()));
        assert_eq!(store.load(first.id()).unwrap().status(), RunStatus::Running);
        assert_eq!(store.list().unwrap().len(), 2);

        // no temp files left behind
        let stray = fs::read_dir(store.root().join("runs"))
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) != Some("json")
            })
            .count();
        assert_eq!(stray, 0);
    }

    #[test]
    fn test_missing_state_is_configuration_error() {
        let (_dir, store) = make_store();
        assert_eq!(store.current_id().unwrap(), None);
        let err = store.load_current().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(err.to_string().contains("drydock build"));
        assert!(store.list().unwrap().is_empty());
    }
}
