//! Liveness registry: which sessions are alive right now.
//!
//! Liveness is never stored. Each session writes `last_heartbeat`, and
//! readers compare it with their own threshold, so one record serves the
//! claim protocol (short window) and the peer listing (longer window) alike.
//!
//! This is the only writer of `last_heartbeat`, and it never moves it
//! backwards even when a caller's clock is behind the stored value.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::LeaseStore;
use crate::types::SessionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Written,
    /// Last heartbeat is within the debounce window; nothing was written.
    Debounced,
    /// No record for this session yet.
    Unregistered,
}

pub struct LivenessRegistry<'a> {
    store: &'a dyn LeaseStore,
    clock: &'a dyn Clock,
    debounce: Duration,
}

impl<'a> LivenessRegistry<'a> {
    pub fn new(store: &'a dyn LeaseStore, clock: &'a dyn Clock, debounce: Duration) -> Self {
        Self {
            store,
            clock,
            debounce,
        }
    }

    /// Creates or refreshes the session's record.
    ///
    /// `started_at` survives re-registration, and `working_on` is kept when
    /// `label` is `None`.
    pub fn register(
        &self,
        session_id: &str,
        project_path: &str,
        label: Option<&str>,
    ) -> Result<SessionRecord> {
        let now = self.clock.now();
        let existing = self.load(session_id)?;

        let record = match existing {
            Some(prev) => SessionRecord {
                session_id: session_id.to_string(),
                project_path: project_path.to_string(),
                started_at: prev.started_at,
                last_heartbeat: prev.last_heartbeat.max(now),
                working_on: label.map(str::to_string).or(prev.working_on),
            },
            None => SessionRecord {
                session_id: session_id.to_string(),
                project_path: project_path.to_string(),
                started_at: now,
                last_heartbeat: now,
                working_on: label.map(str::to_string),
            },
        };

        self.store.upsert_session(&record)?;
        debug!(session = %session_id, project = %project_path, "Registered session");
        Ok(record)
    }

    pub fn heartbeat(&self, session_id: &str) -> Result<HeartbeatOutcome> {
        let now = self.clock.now();
        let Some(mut record) = self.load(session_id)? else {
            return Ok(HeartbeatOutcome::Unregistered);
        };

        if now.signed_duration_since(record.last_heartbeat) < self.debounce {
            return Ok(HeartbeatOutcome::Debounced);
        }

        record.last_heartbeat = record.last_heartbeat.max(now);
        self.store.upsert_session(&record)?;
        Ok(HeartbeatOutcome::Written)
    }

    /// True iff the session has a heartbeat strictly younger than `threshold`.
    /// Any read failure counts as not active.
    pub fn is_active(&self, session_id: &str, threshold: Duration) -> bool {
        self.last_seen(session_id)
            .is_some_and(|seen| self.clock.now().signed_duration_since(seen) < threshold)
    }

    pub fn last_seen(&self, session_id: &str) -> Option<DateTime<Utc>> {
        match self.store.get_session(session_id) {
            Ok(record) => record.map(|r| r.last_heartbeat),
            Err(err) => {
                debug!(error = %err, session = %session_id, "Session unreadable; treating as inactive");
                None
            }
        }
    }

    /// Other live sessions on the same project.
    pub fn active_peers(
        &self,
        project_path: &str,
        exclude: &str,
        threshold: Duration,
    ) -> Result<Vec<SessionRecord>> {
        let now = self.clock.now();
        let mut peers: Vec<SessionRecord> = self
            .store
            .list_sessions(project_path)?
            .into_iter()
            .filter(|s| s.session_id != exclude && s.is_fresh(now, threshold))
            .collect();
        peers.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(peers)
    }

    /// Corrupt records read as absent so the next write replaces them.
    fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        match self.store.get_session(session_id) {
            Err(err) if err.is_corrupt_state() => {
                warn!(error = %err, session = %session_id, "Replacing corrupt session record");
                Ok(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::FileStore;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, FileStore, ManualClock) {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path(), Duration::hours(4)).unwrap();
        let clock = ManualClock::new(Utc::now());
        (temp, store, clock)
    }

    #[test]
    fn test_registration_is_idempotent() {
        let (_temp, store, clock) = fixture();
        let registry = LivenessRegistry::new(&store, &clock, Duration::seconds(30));

        let first = registry.register("sess-a", "/repo", Some("auth")).unwrap();
        let second = registry.register("sess-a", "/repo", None).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list_sessions("/repo").unwrap().len(), 1);
        assert_eq!(second.working_on.as_deref(), Some("auth"));
    }

    #[test]
    fn test_reregistration_keeps_started_at() {
        let (_temp, store, clock) = fixture();
        let registry = LivenessRegistry::new(&store, &clock, Duration::seconds(30));

        let first = registry.register("sess-a", "/repo", None).unwrap();
        clock.advance(Duration::minutes(3));
        let second = registry.register("sess-a", "/repo", None).unwrap();

        assert_eq!(second.started_at, first.started_at);
        assert_eq!(second.last_heartbeat, first.last_heartbeat + Duration::minutes(3));
    }

    #[test]
    fn test_heartbeat_never_moves_backwards() {
        let (_temp, store, clock) = fixture();
        let registry = LivenessRegistry::new(&store, &clock, Duration::zero());
        let start = clock.now();

        registry.register("sess-a", "/repo", None).unwrap();
        clock.set(start - Duration::minutes(10));
        registry.register("sess-a", "/repo", None).unwrap();
        registry.heartbeat("sess-a").unwrap();

        let record = store.get_session("sess-a").unwrap().unwrap();
        assert_eq!(record.last_heartbeat, start);
    }

    #[test]
    fn test_heartbeat_is_debounced() {
        let (_temp, store, clock) = fixture();
        let registry = LivenessRegistry::new(&store, &clock, Duration::seconds(30));

        assert_eq!(registry.heartbeat("ghost").unwrap(), HeartbeatOutcome::Unregistered);

        registry.register("sess-a", "/repo", None).unwrap();
        clock.advance(Duration::seconds(10));
        assert_eq!(registry.heartbeat("sess-a").unwrap(), HeartbeatOutcome::Debounced);

        clock.advance(Duration::seconds(25));
        assert_eq!(registry.heartbeat("sess-a").unwrap(), HeartbeatOutcome::Written);
        let record = store.get_session("sess-a").unwrap().unwrap();
        assert_eq!(record.last_heartbeat, clock.now());
    }

    #[test]
    fn test_is_active_monotonic_in_threshold() {
        let thresholds = [
            Duration::zero(),
            Duration::minutes(1),
            Duration::minutes(5),
            Duration::hours(1),
        ];
        let ages = [
            Duration::zero(),
            Duration::seconds(30),
            Duration::minutes(1),
            Duration::minutes(4),
            Duration::minutes(5),
            Duration::minutes(30),
            Duration::hours(2),
        ];

        for age in ages {
            let (_temp, store, clock) = fixture();
            let registry = LivenessRegistry::new(&store, &clock, Duration::seconds(30));
            registry.register("sess-a", "/repo", None).unwrap();
            clock.advance(age);

            let results: Vec<bool> = thresholds
                .iter()
                .map(|t| registry.is_active("sess-a", *t))
                .collect();
            for pair in results.windows(2) {
                assert!(
                    !pair[0] || pair[1],
                    "is_active not monotonic for age {age}: {results:?}"
                );
            }
            assert!(!results[0], "zero threshold must never be active");
        }
    }

    #[test]
    fn test_unknown_or_corrupt_session_is_inactive() {
        let (temp, store, clock) = fixture();
        let registry = LivenessRegistry::new(&store, &clock, Duration::seconds(30));
        assert!(!registry.is_active("nobody", Duration::hours(1)));

        std::fs::write(temp.path().join("sessions/broken.json"), "{").unwrap();
        assert!(!registry.is_active("broken", Duration::hours(1)));

        // Registration replaces the corrupt record.
        registry.register("broken", "/repo", None).unwrap();
        assert!(registry.is_active("broken", Duration::hours(1)));
    }

    #[test]
    fn test_active_peers_excludes_self_and_stale() {
        let (_temp, store, clock) = fixture();
        let registry = LivenessRegistry::new(&store, &clock, Duration::seconds(30));

        registry.register("old", "/repo", None).unwrap();
        clock.advance(Duration::minutes(20));
        registry.register("me", "/repo", None).unwrap();
        registry.register("peer", "/repo", Some("billing")).unwrap();
        registry.register("elsewhere", "/other", None).unwrap();

        let peers = registry
            .active_peers("/repo", "me", Duration::minutes(15))
            .unwrap();
        let ids: Vec<&str> = peers.iter().map(|p| p.session_id.as_str()).collect();
        assert_eq!(ids, vec!["peer"]);
    }
}
