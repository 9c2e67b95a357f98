//! On-disk layout of an execution: the workspace owns zero or more sessions;
//! each session freezes a DAG, persists its configuration, and (on finish)
//! refreshes a view directory of symlinks pointing at its execution
//! directories.
//!
//! ```text
//! <workspace>/
//!   .canary/
//!     cache/          # cached TestSpecs, timing, generator state
//!     sessions/<id>/
//!       specs.json    # frozen DAG
//!       config.json   # resolved configuration
//!       results/      # per-case execution directories
//!       batches/      # per-batch logs and resource-pool snapshots
//!   <view>/           # symlinks into the latest session's results/
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::case::TestCase;
use crate::spec::TestSpec;

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session '{0}' not found")]
    SessionNotFound(String),
}

pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn canary_dir(&self) -> PathBuf {
        self.root.join(".canary")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.canary_dir().join("cache")
    }

    fn sessions_dir(&self) -> PathBuf {
        self.canary_dir().join("sessions")
    }

    pub fn view_dir(&self, view_name: &str) -> PathBuf {
        self.root.join(view_name)
    }

    fn lock_path(&self) -> PathBuf {
        self.canary_dir().join(".lock")
    }

    /// Acquire the advisory workspace lock for the duration of `f`. Two
    /// concurrent `canary` invocations against the same workspace never race
    /// on session creation or view refresh.
    fn with_lock<T>(&self, f: impl FnOnce() -> WorkspaceResult<T>) -> WorkspaceResult<T> {
        std::fs::create_dir_all(self.canary_dir())?;
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock.write()?;
        f()
    }

    /// Freeze a new session: assigns an id, writes `specs.json`, creates the
    /// per-case `results/` directory.
    pub fn create_session(&self, specs: &[TestSpec]) -> WorkspaceResult<Session> {
        self.with_lock(|| {
            let id = uuid::Uuid::new_v4().to_string();
            let dir = self.sessions_dir().join(&id);
            std::fs::create_dir_all(dir.join("results"))?;
            std::fs::create_dir_all(dir.join("batches"))?;

            let session = Session {
                id,
                dir,
                workspace_root: self.root.clone(),
            };
            session.save_specs(specs)?;
            Ok(session)
        })
    }

    pub fn load_session(&self, id: &str) -> WorkspaceResult<Session> {
        let dir = self.sessions_dir().join(id);
        if !dir.exists() {
            return Err(WorkspaceError::SessionNotFound(id.to_string()));
        }
        Ok(Session {
            id: id.to_string(),
            dir,
            workspace_root: self.root.clone(),
        })
    }

    /// The id of the most recently created session, by directory mtime.
    pub fn latest_session_id(&self) -> WorkspaceResult<Option<String>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(None);
        }
        let mut latest: Option<(std::time::SystemTime, String)> = None;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let modified = entry.metadata()?.modified()?;
            let name = entry.file_name().to_string_lossy().to_string();
            if latest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                latest = Some((modified, name));
            }
        }
        Ok(latest.map(|(_, name)| name))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SpecsFile {
    specs: Vec<TestSpec>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

pub struct Session {
    pub id: String,
    pub dir: PathBuf,
    pub workspace_root: PathBuf,
}

impl Session {
    fn specs_path(&self) -> PathBuf {
        self.dir.join("specs.json")
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn batches_dir(&self) -> PathBuf {
        self.dir.join("batches")
    }

    /// Root directory under which this session's case execution directories
    /// live, e.g. `<session>/results/<relpath>/<case_name>`.
    pub fn results_root(&self) -> PathBuf {
        self.dir.join("results")
    }

    pub fn exec_dir_for(&self, relpath: &str, case_name: &str) -> PathBuf {
        self.results_root().join(relpath).join(case_name)
    }

    fn save_specs(&self, specs: &[TestSpec]) -> WorkspaceResult<()> {
        let file = SpecsFile {
            specs: specs.to_vec(),
            extra: serde_json::Map::new(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(self.specs_path(), json)?;
        Ok(())
    }

    /// Load the frozen DAG. Unknown top-level keys round-trip through
    /// `extra` for forward compatibility.
    pub fn load_specs(&self) -> WorkspaceResult<Vec<TestSpec>> {
        let content = std::fs::read_to_string(self.specs_path())?;
        let file: SpecsFile = serde_json::from_str(&content)?;
        Ok(file.specs)
    }

    pub fn save_config(&self, config: &crate::config::Config) -> WorkspaceResult<()> {
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(self.config_path(), json)?;
        Ok(())
    }

    /// Flush final statuses and refresh the view to point at this session's
    /// `results/` directories. Sessions are immutable after finish.
    pub fn finish(&self, cases: &[TestCase], view_name: &str) -> WorkspaceResult<()> {
        let workspace = Workspace::open(self.workspace_root.clone());
        workspace.with_lock(|| {
            let view = workspace.view_dir(view_name);
            for case in cases {
                let Some(relpath) = case.exec_dir.strip_prefix(self.results_root()).ok() else {
                    continue;
                };
                let link_path = view.join(relpath);
                if let Some(parent) = link_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                refresh_symlink(&link_path, &case.exec_dir)?;
            }
            Ok(())
        })
    }
}

#[cfg(unix)]
fn refresh_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    if link.exists() || link.symlink_metadata().is_ok() {
        std::fs::remove_file(link).ok();
    }
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn refresh_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    if link.exists() {
        std::fs::remove_file(link).ok();
    }
    std::fs::copy(target, link).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{EnvModifiers, ExpectedOutcome, TestSpecId, WorkingDirHints};
    use std::collections::{BTreeMap, HashMap, HashSet};

    fn spec(name: &str) -> TestSpec {
        TestSpec {
            id: TestSpecId(name.into()),
            name: name.into(),
            family: name.into(),
            keywords: HashSet::new(),
            parameters: BTreeMap::new(),
            dependencies: Vec::new(),
            timeout: None,
            runtime_estimate: None,
            resource_request: HashMap::new(),
            working_dir: WorkingDirHints::default(),
            env: EnvModifiers::default(),
            enabled: true,
            expected: ExpectedOutcome::default(),
            command: vec![],
            masked: false,
            mask_reason: None,
            is_composite_base: false,
        }
    }

    #[test]
    fn session_round_trips_specs() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path());
        let specs = vec![spec("a"), spec("b")];

        let session = workspace.create_session(&specs).unwrap();
        let loaded = session.load_specs().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, specs[0].id);
    }

    #[test]
    fn finish_refreshes_view_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path());
        let specs = vec![spec("a")];
        let session = workspace.create_session(&specs).unwrap();

        let exec_dir = session.exec_dir_for("", "a");
        std::fs::create_dir_all(&exec_dir).unwrap();

        let case = TestCase::new(&specs[0], exec_dir.clone());
        session.finish(&[case], "TestResults").unwrap();

        let link = workspace.view_dir("TestResults").join("a");
        assert!(link.symlink_metadata().is_ok());
    }

    #[test]
    fn latest_session_id_picks_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path());
        let s1 = workspace.create_session(&[spec("a")]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let s2 = workspace.create_session(&[spec("a")]).unwrap();

        assert_eq!(workspace.latest_session_id().unwrap(), Some(s2.id));
        let _ = s1;
    }
}
