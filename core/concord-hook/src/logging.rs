//! File logging for the hook binary.
//!
//! stdout belongs to the host protocol, so logs go to a daily-rotated file
//! under `~/.concord/logs`. `CONCORD_DEBUG_LOG=1` forces debug level;
//! otherwise `RUST_LOG` applies, defaulting to `info`.

use concord_core::config::concord_home;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "CONCORD_DEBUG_LOG";
const LOG_PREFIX: &str = "concord-hook";

/// Installs the global subscriber. The returned guard flushes buffered lines
/// on drop and must live until `main` returns. Without a usable log directory
/// logging is skipped entirely.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    if let Err(err) = fs_err::create_dir_all(&dir) {
        eprintln!("concord-hook: logging disabled: {}", err);
        return None;
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("log")
        .max_log_files(7)
        .build(&dir)
        .ok()?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .try_init()
        .ok()?;

    Some(guard)
}

fn log_dir() -> Option<PathBuf> {
    concord_home().ok().map(|home| home.join("logs"))
}

fn env_filter() -> EnvFilter {
    if debug_forced(std::env::var(DEBUG_ENV).ok().as_deref()) {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn debug_forced(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_values() {
        for value in ["1", "true", "YES", " yes "] {
            assert!(debug_forced(Some(value)), "{value}");
        }
        for value in ["0", "false", "", "debug"] {
            assert!(!debug_forced(Some(value)), "{value}");
        }
        assert!(!debug_forced(None));
    }
}
