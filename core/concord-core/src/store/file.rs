//! File-backed lease store.
//!
//! # Layout
//!
//! ```text
//! {state_dir}/
//! ├── sessions/{session_id}.json
//! ├── claims/{md5(project)}/{md5(file_key)}.json
//! ├── workflow/{kind}-{session_id}.json
//! └── {kind}-state.json          # legacy machine-level workflow file
//! ```
//!
//! # Defensive Design
//!
//! - Missing files read as absent records.
//! - Empty or unparseable files surface as `CorruptState` for that key only.
//! - Writes go through a temp file in the same directory and a rename, so a
//!   concurrent reader never sees a partial record.
//!
//! # Legacy Migration
//!
//! Older installs kept one workflow file per kind for the whole machine, which
//! let terminals bleed gate state into each other. On a per-session miss we
//! look at the legacy file: if it is younger than `legacy_max_age` (by mtime)
//! and unowned or owned by the caller, it is adopted into the per-session path
//! and removed. Stale or corrupt legacy files are deleted; files owned by
//! another session are left alone.

use chrono::{DateTime, Duration, Utc};
use fs_err as fs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{LeaseStore, SweepStats};
use crate::error::{CoordError, Result};
use crate::paths::project_key;
use crate::types::{FileClaim, SessionRecord, WorkflowKind, WorkflowState};

pub struct FileStore {
    root: PathBuf,
    legacy_max_age: Duration,
}

impl FileStore {
    pub fn new(root: &Path, legacy_max_age: Duration) -> Result<Self> {
        for dir in ["sessions", "claims", "workflow"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|err| CoordError::backend(format!("create {}", path.display()), err))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            legacy_max_age,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root
            .join("sessions")
            .join(format!("{}.json", session_id))
    }

    fn claim_dir(&self, project_path: &str) -> PathBuf {
        self.root.join("claims").join(project_key(project_path))
    }

    fn claim_path(&self, file_path: &str, project_path: &str) -> PathBuf {
        self.claim_dir(project_path)
            .join(format!("{:x}.json", md5::compute(file_path)))
    }

    fn workflow_path(&self, kind: WorkflowKind, session_id: &str) -> PathBuf {
        self.root
            .join("workflow")
            .join(format!("{}-{}.json", kind.as_str(), session_id))
    }

    pub fn legacy_workflow_path(&self, kind: WorkflowKind) -> PathBuf {
        self.root.join(format!("{}-state.json", kind.as_str()))
    }

    fn migrate_legacy_workflow(
        &self,
        kind: WorkflowKind,
        session_id: &str,
    ) -> Result<Option<WorkflowState>> {
        let legacy = self.legacy_workflow_path(kind);
        let age = match file_age(&legacy) {
            Some(age) => age,
            None => return Ok(None),
        };

        if age >= self.legacy_max_age {
            debug!(path = %legacy.display(), "Removing stale legacy workflow file");
            remove_if_exists(&legacy)?;
            return Ok(None);
        }

        let mut state: WorkflowState = match read_json(&legacy) {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(error = %err, path = %legacy.display(), "Discarding corrupt legacy workflow file");
                remove_if_exists(&legacy)?;
                return Ok(None);
            }
        };

        if !state.owning_session.is_empty() && state.owning_session != session_id {
            return Ok(None);
        }

        state.owning_session = session_id.to_string();
        self.save_workflow(session_id, &state)?;
        remove_if_exists(&legacy)?;
        info!(
            kind = kind.as_str(),
            session = %session_id,
            "Migrated legacy workflow state"
        );
        Ok(Some(state))
    }
}

impl LeaseStore for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        read_json(&self.session_path(session_id))
    }

    fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        write_json_atomic(&self.session_path(&record.session_id), record)
    }

    fn list_sessions(&self, project_path: &str) -> Result<Vec<SessionRecord>> {
        let mut sessions = Vec::new();
        for path in json_files(&self.root.join("sessions"))? {
            match read_json::<SessionRecord>(&path) {
                Ok(Some(record)) if record.project_path == project_path => sessions.push(record),
                Ok(_) => {}
                Err(err) => debug!(error = %err, "Skipping unreadable session record"),
            }
        }
        Ok(sessions)
    }

    fn get_claim(&self, file_path: &str, project_path: &str) -> Result<Option<FileClaim>> {
        let claim: Option<FileClaim> = read_json(&self.claim_path(file_path, project_path))?;
        // Hash collisions are theoretical, but a record for another key is not ours.
        Ok(claim.filter(|c| c.file_path == file_path && c.project_path == project_path))
    }

    fn upsert_claim(&self, claim: &FileClaim) -> Result<()> {
        let dir = self.claim_dir(&claim.project_path);
        fs::create_dir_all(&dir)
            .map_err(|err| CoordError::backend(format!("create {}", dir.display()), err))?;
        write_json_atomic(&self.claim_path(&claim.file_path, &claim.project_path), claim)
    }

    fn list_claims_by(&self, session_id: &str) -> Result<Vec<FileClaim>> {
        let mut claims = Vec::new();
        for project_dir in subdirs(&self.root.join("claims"))? {
            for path in json_files(&project_dir)? {
                match read_json::<FileClaim>(&path) {
                    Ok(Some(claim)) if claim.claimed_by == session_id => claims.push(claim),
                    Ok(_) => {}
                    Err(err) => debug!(error = %err, "Skipping unreadable claim record"),
                }
            }
        }
        Ok(claims)
    }

    fn load_workflow(
        &self,
        kind: WorkflowKind,
        session_id: &str,
    ) -> Result<Option<WorkflowState>> {
        match read_json(&self.workflow_path(kind, session_id))? {
            Some(state) => Ok(Some(state)),
            None => self.migrate_legacy_workflow(kind, session_id),
        }
    }

    fn save_workflow(&self, session_id: &str, state: &WorkflowState) -> Result<()> {
        write_json_atomic(&self.workflow_path(state.kind, session_id), state)
    }

    fn clear_workflow(&self, kind: WorkflowKind, session_id: &str) -> Result<()> {
        remove_if_exists(&self.workflow_path(kind, session_id))
    }

    fn sweep(&self, cutoff: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();

        for path in json_files(&self.root.join("sessions"))? {
            sweep_file(&path, cutoff, &mut stats.sessions_removed, &mut stats.errors);
        }
        for path in json_files(&self.root.join("workflow"))? {
            sweep_file(&path, cutoff, &mut stats.workflows_removed, &mut stats.errors);
        }
        for kind in WorkflowKind::all() {
            let legacy = self.legacy_workflow_path(kind);
            if legacy.exists() {
                sweep_file(&legacy, cutoff, &mut stats.workflows_removed, &mut stats.errors);
            }
        }
        if let Ok(entries) = fs::read_dir(self.root.join("identity")) {
            for entry in entries.flatten() {
                let mut ignored = 0;
                sweep_file(&entry.path(), cutoff, &mut ignored, &mut stats.errors);
            }
        }

        // Claims go by content: released long ago, or claimant silent since cutoff.
        for project_dir in subdirs(&self.root.join("claims"))? {
            for path in json_files(&project_dir)? {
                let removable = match read_json::<FileClaim>(&path) {
                    Ok(Some(claim)) => match claim.released_at {
                        Some(released_at) => released_at < cutoff,
                        None => self
                            .get_session(&claim.claimed_by)
                            .ok()
                            .flatten()
                            .map_or(claim.claimed_at < cutoff, |s| s.last_heartbeat < cutoff),
                    },
                    Ok(None) => false,
                    Err(_) => true,
                };
                if removable {
                    match remove_if_exists(&path) {
                        Ok(()) => stats.claims_removed += 1,
                        Err(err) => stats.errors.push(err.to_string()),
                    }
                }
            }
        }

        Ok(stats)
    }
}

fn sweep_file(path: &Path, cutoff: DateTime<Utc>, counter: &mut u32, errors: &mut Vec<String>) {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified),
        Err(_) => return,
    };
    if modified >= cutoff {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => *counter += 1,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => errors.push(err.to_string()),
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let modified: DateTime<Utc> = modified.into();
    Some(Utc::now().signed_duration_since(modified))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(CoordError::backend(
                format!("read {}", path.display()),
                err,
            ))
        }
    };

    if content.trim().is_empty() {
        return Err(CoordError::corrupt(path.display().to_string(), "empty file"));
    }

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| CoordError::corrupt(path.display().to_string(), err))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).map_err(|source| CoordError::Json {
        context: format!("serialize {}", path.display()),
        source,
    })?;

    let parent_dir = path
        .parent()
        .ok_or_else(|| CoordError::backend(path.display().to_string(), "no parent directory"))?;
    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|err| CoordError::backend("create temp file", err))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|err| CoordError::backend("write temp file", err))?;
    temp_file
        .flush()
        .map_err(|err| CoordError::backend("flush temp file", err))?;
    temp_file
        .persist(path)
        .map_err(|err| CoordError::backend(format!("persist {}", path.display()), err.error))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CoordError::backend(format!("remove {}", path.display()), err)),
    }
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CoordError::backend(format!("list {}", dir.display()), err)),
    };
    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect())
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CoordError::backend(format!("list {}", dir.display()), err)),
    };
    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect())
}
