//! Persisted record types shared by every store backend.
//!
//! On-disk format is JSON with RFC 3339 timestamps. Unknown fields are
//! tolerated and missing optional fields default, so older records keep
//! loading after additive changes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One session's liveness record. Liveness is never stored as a flag; it is
/// derived from `last_heartbeat` against a caller-supplied threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub project_path: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub working_on: Option<String>,
}

impl SessionRecord {
    /// True iff the last heartbeat is strictly younger than `threshold`.
    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) < threshold
    }
}

/// An advisory claim on one file within one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileClaim {
    pub file_path: String,
    pub project_path: String,
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
}

impl FileClaim {
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

/// Which gate a workflow record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Orchestration,
    Delegation,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Orchestration => "orchestration",
            WorkflowKind::Delegation => "delegation",
        }
    }

    pub fn all() -> [WorkflowKind; 2] {
        [WorkflowKind::Orchestration, WorkflowKind::Delegation]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Implementation,
    Research,
    #[default]
    Unknown,
}

/// Persisted gate state for one (kind, session) pair.
///
/// `phase` is stored by name so the store stays independent of each gate's
/// phase enum; a name the gate does not recognise reads as corrupt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub kind: WorkflowKind,
    pub active: bool,
    #[serde(default)]
    pub task_type: TaskType,
    pub phase: String,
    pub activated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub owning_session: String,
}

impl WorkflowState {
    /// True once `last_activity` is at least `ttl` old.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.last_activity) >= ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(last_heartbeat: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: "test".to_string(),
            project_path: "/test".to_string(),
            started_at: last_heartbeat,
            last_heartbeat,
            working_on: None,
        }
    }

    #[test]
    fn test_is_fresh_recent_record() {
        let now = Utc::now();
        let record = make_record(now - Duration::seconds(10));
        assert!(record.is_fresh(now, Duration::minutes(5)));
    }

    #[test]
    fn test_is_fresh_boundary_is_stale() {
        // Exactly at threshold is NOT fresh (strict <)
        let now = Utc::now();
        let record = make_record(now - Duration::minutes(5));
        assert!(!record.is_fresh(now, Duration::minutes(5)));
    }

    #[test]
    fn test_zero_threshold_is_never_fresh() {
        let now = Utc::now();
        let record = make_record(now);
        assert!(!record.is_fresh(now, Duration::zero()));
    }

    #[test]
    fn test_workflow_state_tolerates_missing_task_type() {
        let raw = r#"{
            "kind": "delegation",
            "active": true,
            "phase": "active",
            "activated_at": "2026-01-31T00:00:00Z",
            "last_activity": "2026-01-31T00:10:00Z",
            "owning_session": "abc12345"
        }"#;
        let state: WorkflowState = serde_json::from_str(raw).expect("parse");
        assert_eq!(state.task_type, TaskType::Unknown);
        assert_eq!(state.kind, WorkflowKind::Delegation);
    }
}
