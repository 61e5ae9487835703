//! SQLite-backed lease store for terminals that share one database.
//!
//! Three tables keyed on natural keys; every write is an upsert so concurrent
//! invocations converge (last writer wins). Timestamps are stored as
//! fixed-width RFC 3339 strings so they compare correctly as text.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::PathBuf;

use super::{LeaseStore, SweepStats};
use crate::error::{CoordError, Result};
use crate::types::{FileClaim, SessionRecord, WorkflowKind, WorkflowState};

const BUSY_TIMEOUT_MS: i64 = 5000;

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| CoordError::backend("create database directory", err))?;
        }
        let store = Self { path };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    project TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    last_heartbeat TEXT NOT NULL,
                    working_on TEXT
                 );
                 CREATE INDEX IF NOT EXISTS sessions_project ON sessions(project);
                 CREATE TABLE IF NOT EXISTS file_claims (
                    file_path TEXT NOT NULL,
                    project TEXT NOT NULL,
                    claimed_by TEXT NOT NULL,
                    claimed_at TEXT NOT NULL,
                    released_at TEXT,
                    PRIMARY KEY (file_path, project)
                 );
                 CREATE INDEX IF NOT EXISTS file_claims_claimed_by ON file_claims(claimed_by);
                 CREATE TABLE IF NOT EXISTS workflow_state (
                    kind TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    last_activity TEXT NOT NULL,
                    PRIMARY KEY (kind, session_id)
                 );
                 COMMIT;",
            )
            .map_err(|err| CoordError::backend("initialize schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| CoordError::backend(format!("open {}", self.path.display()), err))?;
        // Timeout first: switching to WAL can itself hit a lock.
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)
            .map_err(|err| CoordError::backend("set busy_timeout", err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| CoordError::backend("enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| CoordError::backend("set synchronous", err))?;
        Ok(conn)
    }
}

impl LeaseStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, project, started_at, last_heartbeat, working_on \
                 FROM sessions WHERE id = ?1",
                params![session_id],
                RawSession::from_row,
            )
            .optional()
            .map_err(|err| CoordError::backend("query session", err))
        })?;
        row.map(RawSession::into_record).transpose()
    }

    fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, project, started_at, last_heartbeat, working_on) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(id) DO UPDATE SET \
                    project = excluded.project, \
                    last_heartbeat = MAX(sessions.last_heartbeat, excluded.last_heartbeat), \
                    working_on = COALESCE(excluded.working_on, sessions.working_on)",
                params![
                    record.session_id,
                    record.project_path,
                    format_ts(record.started_at),
                    format_ts(record.last_heartbeat),
                    record.working_on
                ],
            )
            .map_err(|err| CoordError::backend("upsert session", err))?;
            Ok(())
        })
    }

    fn list_sessions(&self, project_path: &str) -> Result<Vec<SessionRecord>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, project, started_at, last_heartbeat, working_on \
                     FROM sessions WHERE project = ?1 ORDER BY last_heartbeat DESC",
                )
                .map_err(|err| CoordError::backend("prepare sessions query", err))?;
            let rows = stmt
                .query_map(params![project_path], RawSession::from_row)
                .map_err(|err| CoordError::backend("query sessions", err))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| CoordError::backend("decode session row", err))
        })?;

        // One malformed row must not hide the others.
        Ok(rows
            .into_iter()
            .filter_map(|raw| raw.into_record().ok())
            .collect())
    }

    fn get_claim(&self, file_path: &str, project_path: &str) -> Result<Option<FileClaim>> {
        let row = self.with_connection(|conn| {
            conn.query_row(
                "SELECT file_path, project, claimed_by, claimed_at, released_at \
                 FROM file_claims WHERE file_path = ?1 AND project = ?2",
                params![file_path, project_path],
                RawClaim::from_row,
            )
            .optional()
            .map_err(|err| CoordError::backend("query claim", err))
        })?;
        row.map(RawClaim::into_claim).transpose()
    }

    fn upsert_claim(&self, claim: &FileClaim) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO file_claims (file_path, project, claimed_by, claimed_at, released_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(file_path, project) DO UPDATE SET \
                    claimed_by = excluded.claimed_by, \
                    claimed_at = excluded.claimed_at, \
                    released_at = excluded.released_at",
                params![
                    claim.file_path,
                    claim.project_path,
                    claim.claimed_by,
                    format_ts(claim.claimed_at),
                    claim.released_at.map(format_ts)
                ],
            )
            .map_err(|err| CoordError::backend("upsert claim", err))?;
            Ok(())
        })
    }

    fn list_claims_by(&self, session_id: &str) -> Result<Vec<FileClaim>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT file_path, project, claimed_by, claimed_at, released_at \
                     FROM file_claims WHERE claimed_by = ?1",
                )
                .map_err(|err| CoordError::backend("prepare claims query", err))?;
            let rows = stmt
                .query_map(params![session_id], RawClaim::from_row)
                .map_err(|err| CoordError::backend("query claims", err))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| CoordError::backend("decode claim row", err))
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|raw| raw.into_claim().ok())
            .collect())
    }

    fn load_workflow(
        &self,
        kind: WorkflowKind,
        session_id: &str,
    ) -> Result<Option<WorkflowState>> {
        let payload: Option<String> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT payload FROM workflow_state WHERE kind = ?1 AND session_id = ?2",
                params![kind.as_str(), session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| CoordError::backend("query workflow state", err))
        })?;

        payload
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|err| {
                    CoordError::corrupt(format!("workflow_state/{}/{}", kind.as_str(), session_id), err)
                })
            })
            .transpose()
    }

    fn save_workflow(&self, session_id: &str, state: &WorkflowState) -> Result<()> {
        let payload = serde_json::to_string(state).map_err(|source| CoordError::Json {
            context: "serialize workflow state".to_string(),
            source,
        })?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workflow_state (kind, session_id, payload, last_activity) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(kind, session_id) DO UPDATE SET \
                    payload = excluded.payload, \
                    last_activity = excluded.last_activity",
                params![
                    state.kind.as_str(),
                    session_id,
                    payload,
                    format_ts(state.last_activity)
                ],
            )
            .map_err(|err| CoordError::backend("upsert workflow state", err))?;
            Ok(())
        })
    }

    fn clear_workflow(&self, kind: WorkflowKind, session_id: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM workflow_state WHERE kind = ?1 AND session_id = ?2",
                params![kind.as_str(), session_id],
            )
            .map_err(|err| CoordError::backend("delete workflow state", err))?;
            Ok(())
        })
    }

    fn sweep(&self, cutoff: DateTime<Utc>) -> Result<SweepStats> {
        let cutoff = format_ts(cutoff);
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| CoordError::backend("begin sweep", err))?;
            let claims_removed = tx
                .execute(
                    "DELETE FROM file_claims WHERE \
                        (released_at IS NOT NULL AND released_at < ?1) \
                        OR (released_at IS NULL AND NOT EXISTS ( \
                            SELECT 1 FROM sessions \
                            WHERE sessions.id = file_claims.claimed_by \
                              AND sessions.last_heartbeat >= ?1) \
                            AND claimed_at < ?1)",
                    params![cutoff],
                )
                .map_err(|err| CoordError::backend("sweep claims", err))?;
            let sessions_removed = tx
                .execute(
                    "DELETE FROM sessions WHERE last_heartbeat < ?1",
                    params![cutoff],
                )
                .map_err(|err| CoordError::backend("sweep sessions", err))?;
            let workflows_removed = tx
                .execute(
                    "DELETE FROM workflow_state WHERE last_activity < ?1",
                    params![cutoff],
                )
                .map_err(|err| CoordError::backend("sweep workflow state", err))?;
            tx.commit()
                .map_err(|err| CoordError::backend("commit sweep", err))?;

            Ok(SweepStats {
                sessions_removed: sessions_removed as u32,
                claims_removed: claims_removed as u32,
                workflows_removed: workflows_removed as u32,
                errors: Vec::new(),
            })
        })
    }
}

struct RawSession {
    id: String,
    project: String,
    started_at: String,
    last_heartbeat: String,
    working_on: Option<String>,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project: row.get(1)?,
            started_at: row.get(2)?,
            last_heartbeat: row.get(3)?,
            working_on: row.get(4)?,
        })
    }

    fn into_record(self) -> Result<SessionRecord> {
        let key = format!("sessions/{}", self.id);
        Ok(SessionRecord {
            started_at: parse_ts(&key, &self.started_at)?,
            last_heartbeat: parse_ts(&key, &self.last_heartbeat)?,
            session_id: self.id,
            project_path: self.project,
            working_on: self.working_on,
        })
    }
}

struct RawClaim {
    file_path: String,
    project: String,
    claimed_by: String,
    claimed_at: String,
    released_at: Option<String>,
}

impl RawClaim {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_path: row.get(0)?,
            project: row.get(1)?,
            claimed_by: row.get(2)?,
            claimed_at: row.get(3)?,
            released_at: row.get(4)?,
        })
    }

    fn into_claim(self) -> Result<FileClaim> {
        let key = format!("file_claims/{}", self.file_path);
        let released_at = match self.released_at.as_deref() {
            Some(raw) => Some(parse_ts(&key, raw)?),
            None => None,
        };
        Ok(FileClaim {
            claimed_at: parse_ts(&key, &self.claimed_at)?,
            released_at,
            file_path: self.file_path,
            project_path: self.project,
            claimed_by: self.claimed_by,
        })
    }
}

fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(key: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| CoordError::corrupt(key, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;
    use chrono::Duration;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let store = SqliteStore::new(temp_dir.path().join("concord.db")).expect("db init");
        (temp_dir, store)
    }

    fn session(id: &str, at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            project_path: "/repo".to_string(),
            started_at: at,
            last_heartbeat: at,
            working_on: Some("refactor parser".to_string()),
        }
    }

    #[test]
    fn connections_use_wal_with_a_long_busy_timeout() {
        let (_dir, store) = open_temp();
        let conn = store.open().expect("open");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode.to_lowercase(), "wal");
        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(timeout, 5000);
        let synchronous: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .expect("synchronous");
        assert_eq!(synchronous, 1);
    }

    #[test]
    fn upserts_and_fetches_sessions() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        store.upsert_session(&session("aaaa1111", now)).expect("upsert");

        let loaded = store.get_session("aaaa1111").expect("get").expect("row");
        assert_eq!(loaded.project_path, "/repo");
        assert_eq!(loaded.working_on.as_deref(), Some("refactor parser"));
        assert_eq!(format_ts(loaded.last_heartbeat), format_ts(now));
    }

    #[test]
    fn session_upsert_never_moves_heartbeat_backwards() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        store.upsert_session(&session("aaaa1111", now)).expect("upsert");
        store
            .upsert_session(&session("aaaa1111", now - Duration::minutes(10)))
            .expect("upsert older");

        let loaded = store.get_session("aaaa1111").expect("get").expect("row");
        assert_eq!(format_ts(loaded.last_heartbeat), format_ts(now));
        assert_eq!(format_ts(loaded.started_at), format_ts(now));
    }

    #[test]
    fn session_upsert_keeps_label_when_omitted() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        store.upsert_session(&session("aaaa1111", now)).expect("upsert");
        let mut unlabeled = session("aaaa1111", now + Duration::seconds(40));
        unlabeled.working_on = None;
        store.upsert_session(&unlabeled).expect("upsert");

        let loaded = store.get_session("aaaa1111").expect("get").expect("row");
        assert_eq!(loaded.working_on.as_deref(), Some("refactor parser"));
    }

    #[test]
    fn claims_overwrite_on_takeover() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        let mut claim = FileClaim {
            file_path: "src/lib.rs".to_string(),
            project_path: "/repo".to_string(),
            claimed_by: "aaaa1111".to_string(),
            claimed_at: now,
            released_at: None,
        };
        store.upsert_claim(&claim).expect("claim");
        claim.claimed_by = "bbbb2222".to_string();
        store.upsert_claim(&claim).expect("takeover");

        let loaded = store
            .get_claim("src/lib.rs", "/repo")
            .expect("get")
            .expect("row");
        assert_eq!(loaded.claimed_by, "bbbb2222");
        assert!(store.list_claims_by("aaaa1111").expect("list").is_empty());
        assert_eq!(store.list_claims_by("bbbb2222").expect("list").len(), 1);
    }

    #[test]
    fn corrupt_workflow_payload_is_reported() {
        let (_dir, store) = open_temp();
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO workflow_state (kind, session_id, payload, last_activity) \
                     VALUES ('delegation', 'aaaa1111', 'not json', '2026-01-01T00:00:00Z')",
                    [],
                )
                .map_err(|err| CoordError::backend("seed", err))?;
                Ok(())
            })
            .expect("seed");

        let err = store
            .load_workflow(WorkflowKind::Delegation, "aaaa1111")
            .unwrap_err();
        assert!(err.is_corrupt_state());
    }

    #[test]
    fn sweeps_old_rows() {
        let (_dir, store) = open_temp();
        let old = Utc::now() - Duration::hours(30);
        store.upsert_session(&session("aaaa1111", old)).expect("old session");
        store
            .upsert_session(&session("bbbb2222", Utc::now()))
            .expect("fresh session");
        store
            .save_workflow(
                "aaaa1111",
                &WorkflowState {
                    kind: WorkflowKind::Orchestration,
                    active: true,
                    task_type: TaskType::Unknown,
                    phase: "plan_pending".to_string(),
                    activated_at: old,
                    last_activity: old,
                    owning_session: "aaaa1111".to_string(),
                },
            )
            .expect("workflow");
        store
            .upsert_claim(&FileClaim {
                file_path: "a.rs".to_string(),
                project_path: "/repo".to_string(),
                claimed_by: "aaaa1111".to_string(),
                claimed_at: old,
                released_at: None,
            })
            .expect("claim");

        let stats = store
            .sweep(Utc::now() - Duration::hours(24))
            .expect("sweep");
        assert_eq!(stats.sessions_removed, 1);
        assert_eq!(stats.workflows_removed, 1);
        assert_eq!(stats.claims_removed, 1);
        assert!(store.get_session("bbbb2222").expect("get").is_some());
    }
}
