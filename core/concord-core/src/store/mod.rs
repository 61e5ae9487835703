//! Lease store: the only channel between invocations.
//!
//! Every component reads and writes shared state through [`LeaseStore`]. The
//! interface is deliberately narrow (keyed reads and idempotent upserts) so a
//! backend with stronger guarantees can replace the current ones without
//! touching callers.
//!
//! # Backends
//!
//! - [`FileStore`]: one JSON file per key under the state directory, written
//!   with temp file + rename. Default.
//! - [`SqliteStore`]: a shared SQLite database with `sessions`, `file_claims`
//!   and `workflow_state` tables, keyed on the natural keys.
//!
//! # Error Contract
//!
//! Backends return [`CoordError::BackendUnavailable`] when they cannot read or
//! write at all and [`CoordError::CorruptState`] when one record is malformed.
//! Neither is fatal to the caller; see the individual components for the
//! permissive default each one falls back to.
//!
//! [`CoordError::BackendUnavailable`]: crate::error::CoordError::BackendUnavailable
//! [`CoordError::CorruptState`]: crate::error::CoordError::CorruptState

mod file;
mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::types::{FileClaim, SessionRecord, WorkflowKind, WorkflowState};

pub trait LeaseStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    // ── Sessions ──────────────────────────────────────────────────────────
    fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    fn upsert_session(&self, record: &SessionRecord) -> Result<()>;
    fn list_sessions(&self, project_path: &str) -> Result<Vec<SessionRecord>>;

    // ── File claims ───────────────────────────────────────────────────────
    fn get_claim(&self, file_path: &str, project_path: &str) -> Result<Option<FileClaim>>;
    fn upsert_claim(&self, claim: &FileClaim) -> Result<()>;
    fn list_claims_by(&self, session_id: &str) -> Result<Vec<FileClaim>>;

    // ── Workflow state ────────────────────────────────────────────────────
    fn load_workflow(&self, kind: WorkflowKind, session_id: &str)
        -> Result<Option<WorkflowState>>;
    fn save_workflow(&self, session_id: &str, state: &WorkflowState) -> Result<()>;
    fn clear_workflow(&self, kind: WorkflowKind, session_id: &str) -> Result<()>;

    // ── Maintenance ───────────────────────────────────────────────────────
    /// Removes records whose last write is older than `cutoff`.
    fn sweep(&self, cutoff: DateTime<Utc>) -> Result<SweepStats>;
}

/// Results from a sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub sessions_removed: u32,
    pub claims_removed: u32,
    pub workflows_removed: u32,
    pub errors: Vec<String>,
}

/// Opens the configured backend rooted at `state_dir`.
pub fn open_store(config: &StoreConfig, state_dir: &Path) -> Result<Box<dyn LeaseStore>> {
    match config.backend {
        StoreBackend::File => Ok(Box::new(FileStore::new(
            state_dir,
            config.legacy_max_age(),
        )?)),
        StoreBackend::Sqlite => {
            let path = config
                .sqlite_path
                .clone()
                .unwrap_or_else(|| state_dir.join("concord.db"));
            Ok(Box::new(SqliteStore::new(path)?))
        }
    }
}
