//! Probabilistic cleanup of old coordination state.
//!
//! There is no long-running process to own housekeeping, so every invocation
//! rolls a die and roughly one in `one_in` sweeps the store. A sweep removes
//! session records, workflow state and identity files older than
//! `max_age_hours`, plus claims that were released or abandoned before then.

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::error::Result;
use crate::store::{LeaseStore, SweepStats};

/// Sweeps with probability `1 / config.one_in`. Returns stats when it ran.
pub fn maybe_sweep(
    store: &dyn LeaseStore,
    config: &SweepConfig,
    now: DateTime<Utc>,
) -> Option<SweepStats> {
    maybe_sweep_with(store, config, now, &mut rand::thread_rng())
}

pub fn maybe_sweep_with<R: Rng>(
    store: &dyn LeaseStore,
    config: &SweepConfig,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<SweepStats> {
    if config.one_in == 0 || rng.gen_range(0..config.one_in) != 0 {
        return None;
    }
    match sweep(store, config, now) {
        Ok(stats) => Some(stats),
        Err(err) => {
            warn!(error = %err, "Sweep failed");
            None
        }
    }
}

/// Unconditional sweep.
pub fn sweep(
    store: &dyn LeaseStore,
    config: &SweepConfig,
    now: DateTime<Utc>,
) -> Result<SweepStats> {
    let cutoff = now - config.max_age();
    let stats = store.sweep(cutoff)?;

    if stats.sessions_removed + stats.claims_removed + stats.workflows_removed > 0 {
        info!(
            backend = store.backend_name(),
            sessions = stats.sessions_removed,
            claims = stats.claims_removed,
            workflows = stats.workflows_removed,
            "Swept stale coordination state"
        );
    } else {
        debug!(backend = store.backend_name(), "Sweep found nothing to remove");
    }
    for err in &stats.errors {
        warn!(error = %err, "Sweep error");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use crate::types::SessionRecord;
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    #[test]
    fn test_zero_disables_sweep() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path(), Duration::hours(4)).unwrap();
        let config = SweepConfig {
            one_in: 0,
            max_age_hours: 24,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert!(maybe_sweep_with(&store, &config, Utc::now(), &mut rng).is_none());
        }
    }

    #[test]
    fn test_one_in_one_always_sweeps() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path(), Duration::hours(4)).unwrap();
        let config = SweepConfig {
            one_in: 1,
            max_age_hours: 24,
        };
        let mut rng = StdRng::seed_from_u64(7);
        assert!(maybe_sweep_with(&store, &config, Utc::now(), &mut rng).is_some());
    }

    #[test]
    fn test_sweep_rate_is_roughly_one_in_n() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path(), Duration::hours(4)).unwrap();
        let config = SweepConfig::default();
        let mut rng = StdRng::seed_from_u64(42);

        let runs = (0..10_000)
            .filter(|_| maybe_sweep_with(&store, &config, Utc::now(), &mut rng).is_some())
            .count();
        assert!((50..=200).contains(&runs), "ran {runs} times");
    }

    #[test]
    fn test_sweep_keeps_recent_sessions() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path(), Duration::hours(4)).unwrap();
        let now = Utc::now();
        store
            .upsert_session(&SessionRecord {
                session_id: "recent".to_string(),
                project_path: "/repo".to_string(),
                started_at: now,
                last_heartbeat: now,
                working_on: None,
            })
            .unwrap();

        let stats = sweep(&store, &SweepConfig::default(), now).unwrap();
        assert_eq!(stats.sessions_removed, 0);
        assert!(store.get_session("recent").unwrap().is_some());
    }
}
