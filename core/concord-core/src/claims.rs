//! Advisory file claims between concurrent sessions.
//!
//! Per (file, project) the protocol is a two-state machine:
//! `Unclaimed -> ClaimedBy(S) -> Unclaimed`. Claiming is last-writer-wins with
//! no compare-and-swap; two sessions racing on the same unclaimed file can
//! both believe they hold it. That is accepted: claims warn, they do not lock.
//!
//! A claim held by a session whose heartbeat is older than the claim
//! threshold is abandoned and gets taken over on the next acquisition.

use chrono::{DateTime, Duration, Utc};
use concord_hook_protocol::Decision;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ConflictPolicy;
use crate::error::Result;
use crate::liveness::LivenessRegistry;
use crate::paths::file_key;
use crate::store::LeaseStore;
use crate::types::FileClaim;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimStatus {
    Unclaimed,
    ClaimedBy {
        session_id: String,
        claimed_at: DateTime<Utc>,
    },
}

/// Result of [`ClaimProtocol::acquire_or_warn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired,
    /// Requester already held it; `claimed_at` was refreshed.
    Renewed,
    TookOver { previous_owner: String },
    /// A live session holds the claim; nothing was written.
    Conflict {
        owner: String,
        working_on: Option<String>,
        policy: ConflictPolicy,
    },
    /// The store could not be read or written; the edit goes ahead unclaimed.
    Unavailable,
}

pub struct ClaimProtocol<'a> {
    store: &'a dyn LeaseStore,
    clock: &'a dyn Clock,
    liveness: &'a LivenessRegistry<'a>,
    stale_after: Duration,
}

impl<'a> ClaimProtocol<'a> {
    pub fn new(
        store: &'a dyn LeaseStore,
        clock: &'a dyn Clock,
        liveness: &'a LivenessRegistry<'a>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            liveness,
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Read-only view of the claim. Released and corrupt claims read as
    /// unclaimed.
    pub fn check_claim(&self, file_path: &str, project_path: &str) -> Result<ClaimStatus> {
        let key = file_key(file_path, project_path);
        Ok(match self.load(&key, project_path)? {
            Some(claim) if !claim.is_released() => ClaimStatus::ClaimedBy {
                session_id: claim.claimed_by,
                claimed_at: claim.claimed_at,
            },
            _ => ClaimStatus::Unclaimed,
        })
    }

    /// Unconditionally records `requester` as the holder.
    pub fn claim(&self, file_path: &str, project_path: &str, requester: &str) -> Result<()> {
        let claim = FileClaim {
            file_path: file_key(file_path, project_path),
            project_path: project_path.to_string(),
            claimed_by: requester.to_string(),
            claimed_at: self.clock.now(),
            released_at: None,
        };
        self.store.upsert_claim(&claim)
    }

    pub fn acquire_or_warn(
        &self,
        file_path: &str,
        project_path: &str,
        requester: &str,
        policy: ConflictPolicy,
    ) -> ClaimOutcome {
        let status = match self.check_claim(file_path, project_path) {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, file = %file_path, "Claim check failed; allowing edit");
                return ClaimOutcome::Unavailable;
            }
        };

        let outcome = match status {
            ClaimStatus::Unclaimed => ClaimOutcome::Acquired,
            ClaimStatus::ClaimedBy { session_id, .. } if session_id == requester => {
                ClaimOutcome::Renewed
            }
            ClaimStatus::ClaimedBy { session_id, .. } => {
                if self.liveness.is_active(&session_id, self.stale_after) {
                    let working_on = self
                        .store
                        .get_session(&session_id)
                        .ok()
                        .flatten()
                        .and_then(|s| s.working_on);
                    debug!(file = %file_path, owner = %session_id, "File held by active session");
                    return ClaimOutcome::Conflict {
                        owner: session_id,
                        working_on,
                        policy,
                    };
                }
                ClaimOutcome::TookOver {
                    previous_owner: session_id,
                }
            }
        };

        if let Err(err) = self.claim(file_path, project_path, requester) {
            warn!(error = %err, file = %file_path, "Claim write failed; allowing edit");
            return ClaimOutcome::Unavailable;
        }
        if let ClaimOutcome::TookOver { previous_owner } = &outcome {
            info!(
                file = %file_path,
                from = %previous_owner,
                to = %requester,
                "Took over abandoned claim"
            );
        }
        outcome
    }

    /// Releases the claim if `requester` holds it. Returns whether it did.
    pub fn release(&self, file_path: &str, project_path: &str, requester: &str) -> Result<bool> {
        let key = file_key(file_path, project_path);
        match self.load(&key, project_path)? {
            Some(mut claim) if claim.claimed_by == requester && !claim.is_released() => {
                claim.released_at = Some(self.clock.now());
                self.store.upsert_claim(&claim)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Releases every open claim held by the session.
    pub fn release_all(&self, session_id: &str) -> Result<u32> {
        let now = self.clock.now();
        let mut released = 0;
        for mut claim in self.store.list_claims_by(session_id)? {
            if claim.is_released() {
                continue;
            }
            claim.released_at = Some(now);
            self.store.upsert_claim(&claim)?;
            released += 1;
        }
        if released > 0 {
            debug!(session = %session_id, released, "Released claims");
        }
        Ok(released)
    }

    fn load(&self, key: &str, project_path: &str) -> Result<Option<FileClaim>> {
        match self.store.get_claim(key, project_path) {
            Err(err) if err.is_corrupt_state() => {
                warn!(error = %err, file = %key, "Ignoring corrupt claim record");
                Ok(None)
            }
            other => other,
        }
    }
}

impl ClaimOutcome {
    /// What the host should be told about this outcome.
    pub fn to_decision(&self, file_path: &str, stale_after: Duration) -> Decision {
        match self {
            ClaimOutcome::Acquired | ClaimOutcome::Renewed | ClaimOutcome::Unavailable => {
                Decision::Allow
            }
            ClaimOutcome::TookOver { previous_owner } => Decision::advisory(format!(
                "Took over {} from session {} (no heartbeat in the last {}).",
                file_path,
                previous_owner,
                describe_window(stale_after)
            )),
            ClaimOutcome::Conflict {
                owner,
                working_on,
                policy,
            } => {
                let mut message = format!(
                    "{} is claimed by session {}, active within the last {}",
                    file_path,
                    owner,
                    describe_window(stale_after)
                );
                if let Some(label) = working_on {
                    message.push_str(&format!(" (working on: {})", label));
                }
                match policy {
                    ConflictPolicy::Deny => {
                        message.push_str(". Coordinate with that session or wait for it to go idle before rewriting this file.");
                        Decision::deny(message)
                    }
                    ConflictPolicy::Warn => {
                        message.push_str(". Edits may collide.");
                        Decision::advisory(message)
                    }
                }
            }
        }
    }
}

fn describe_window(window: Duration) -> String {
    let secs = window.num_seconds();
    if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::FileStore;
    use tempfile::tempdir;

    const PROJECT: &str = "/repo";

    struct Fixture {
        _temp: tempfile::TempDir,
        store: FileStore,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path(), Duration::hours(4)).unwrap();
        Fixture {
            _temp: temp,
            store,
            clock: ManualClock::new(Utc::now()),
        }
    }

    #[test]
    fn test_unclaimed_file_is_acquired() {
        let fx = fixture();
        let liveness = LivenessRegistry::new(&fx.store, &fx.clock, Duration::seconds(30));
        let claims = ClaimProtocol::new(&fx.store, &fx.clock, &liveness, Duration::minutes(5));

        let outcome = claims.acquire_or_warn("/repo/src/lib.rs", PROJECT, "a", ConflictPolicy::Deny);
        assert_eq!(outcome, ClaimOutcome::Acquired);
        assert_eq!(
            claims.check_claim("src/lib.rs", PROJECT).unwrap(),
            ClaimStatus::ClaimedBy {
                session_id: "a".to_string(),
                claimed_at: fx.clock.now(),
            }
        );
    }

    #[test]
    fn test_reacquire_by_holder_is_idempotent() {
        let fx = fixture();
        let liveness = LivenessRegistry::new(&fx.store, &fx.clock, Duration::seconds(30));
        let claims = ClaimProtocol::new(&fx.store, &fx.clock, &liveness, Duration::minutes(5));

        claims.acquire_or_warn("src/lib.rs", PROJECT, "a", ConflictPolicy::Deny);
        fx.clock.advance(Duration::minutes(1));
        let outcome = claims.acquire_or_warn("src/lib.rs", PROJECT, "a", ConflictPolicy::Deny);

        assert_eq!(outcome, ClaimOutcome::Renewed);
        match claims.check_claim("src/lib.rs", PROJECT).unwrap() {
            ClaimStatus::ClaimedBy { claimed_at, .. } => assert_eq!(claimed_at, fx.clock.now()),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_active_owner_blocks_destructive_write() {
        let fx = fixture();
        let liveness = LivenessRegistry::new(&fx.store, &fx.clock, Duration::seconds(30));
        let claims = ClaimProtocol::new(&fx.store, &fx.clock, &liveness, Duration::minutes(5));

        liveness.register("a", PROJECT, Some("auth refactor")).unwrap();
        claims.acquire_or_warn("src/auth.rs", PROJECT, "a", ConflictPolicy::Deny);

        fx.clock.advance(Duration::minutes(2));
        let outcome = claims.acquire_or_warn("src/auth.rs", PROJECT, "b", ConflictPolicy::Deny);
        let decision = outcome.to_decision("src/auth.rs", claims.stale_after());

        match decision {
            Decision::Deny { reason } => {
                assert!(reason.contains("session a"), "{reason}");
                assert!(reason.contains("5 minutes"), "{reason}");
                assert!(reason.contains("auth refactor"), "{reason}");
            }
            other => panic!("expected deny, got {other:?}"),
        }
        // The holder is unchanged.
        match claims.check_claim("src/auth.rs", PROJECT).unwrap() {
            ClaimStatus::ClaimedBy { session_id, .. } => assert_eq!(session_id, "a"),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_active_owner_only_warns_soft_edit() {
        let fx = fixture();
        let liveness = LivenessRegistry::new(&fx.store, &fx.clock, Duration::seconds(30));
        let claims = ClaimProtocol::new(&fx.store, &fx.clock, &liveness, Duration::minutes(5));

        liveness.register("a", PROJECT, None).unwrap();
        claims.claim("src/auth.rs", PROJECT, "a").unwrap();

        let outcome = claims.acquire_or_warn("src/auth.rs", PROJECT, "b", ConflictPolicy::Warn);
        assert!(matches!(
            outcome.to_decision("src/auth.rs", claims.stale_after()),
            Decision::Advisory { .. }
        ));
    }

    #[test]
    fn test_stale_owner_is_taken_over() {
        let fx = fixture();
        let liveness = LivenessRegistry::new(&fx.store, &fx.clock, Duration::seconds(30));
        let claims = ClaimProtocol::new(&fx.store, &fx.clock, &liveness, Duration::minutes(5));

        liveness.register("a", PROJECT, None).unwrap();
        claims.claim("src/auth.rs", PROJECT, "a").unwrap();

        fx.clock.advance(Duration::minutes(6));
        let outcome = claims.acquire_or_warn("src/auth.rs", PROJECT, "b", ConflictPolicy::Deny);

        assert_eq!(
            outcome,
            ClaimOutcome::TookOver {
                previous_owner: "a".to_string()
            }
        );
        assert!(matches!(
            outcome.to_decision("src/auth.rs", claims.stale_after()),
            Decision::Advisory { .. }
        ));
        match claims.check_claim("src/auth.rs", PROJECT).unwrap() {
            ClaimStatus::ClaimedBy { session_id, .. } => assert_eq!(session_id, "b"),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_unregistered_owner_counts_as_stale() {
        let fx = fixture();
        let liveness = LivenessRegistry::new(&fx.store, &fx.clock, Duration::seconds(30));
        let claims = ClaimProtocol::new(&fx.store, &fx.clock, &liveness, Duration::minutes(5));

        claims.claim("notes.md", PROJECT, "ghost").unwrap();
        let outcome = claims.acquire_or_warn("notes.md", PROJECT, "b", ConflictPolicy::Deny);
        assert!(matches!(outcome, ClaimOutcome::TookOver { .. }));
    }

    #[test]
    fn test_release_and_release_all() {
        let fx = fixture();
        let liveness = LivenessRegistry::new(&fx.store, &fx.clock, Duration::seconds(30));
        let claims = ClaimProtocol::new(&fx.store, &fx.clock, &liveness, Duration::minutes(5));

        claims.claim("a.rs", PROJECT, "a").unwrap();
        claims.claim("b.rs", PROJECT, "a").unwrap();
        claims.claim("c.rs", PROJECT, "other").unwrap();

        assert!(!claims.release("a.rs", PROJECT, "other").unwrap());
        assert!(claims.release("a.rs", PROJECT, "a").unwrap());
        assert_eq!(claims.check_claim("a.rs", PROJECT).unwrap(), ClaimStatus::Unclaimed);

        assert_eq!(claims.release_all("a").unwrap(), 1);
        assert_eq!(claims.check_claim("b.rs", PROJECT).unwrap(), ClaimStatus::Unclaimed);
        assert_ne!(claims.check_claim("c.rs", PROJECT).unwrap(), ClaimStatus::Unclaimed);
    }

    #[test]
    fn test_describe_window() {
        assert_eq!(describe_window(Duration::minutes(5)), "5 minutes");
        assert_eq!(describe_window(Duration::minutes(1)), "1 minute");
        assert_eq!(describe_window(Duration::seconds(90)), "90s");
    }
}
