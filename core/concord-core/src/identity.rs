//! Session and project identity for a single invocation.
//!
//! Every hook invocation is a fresh process, so the session token has to be
//! rebuilt from the outside each time. Resolution order:
//!
//! 1. Token supplied by the host in the hook payload
//! 2. `CONCORD_SESSION_ID` environment variable
//! 3. Token file persisted for the parent process (`identity/ppid-<pid>`),
//!    reused only while it is younger than 24 hours
//! 4. A fresh random token, persisted to the file from step 3
//!
//! External tokens are shortened to 8–16 alphanumeric characters so they are
//! usable as file names and readable in conflict messages.

use chrono::{DateTime, Duration, Utc};
use fs_err as fs;
use rand::Rng;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::paths::{normalize_path, project_root_for};

pub const SESSION_ENV: &str = "CONCORD_SESSION_ID";
pub const PROJECT_ENV: &str = "CONCORD_PROJECT_DIR";
/// Optional human label shown to peers ("billing refactor").
pub const LABEL_ENV: &str = "CONCORD_SESSION_LABEL";
const HOST_PROJECT_ENV: &str = "CLAUDE_PROJECT_DIR";

const MIN_TOKEN_LEN: usize = 8;
const MAX_TOKEN_LEN: usize = 16;
const HASHED_TOKEN_LEN: usize = 12;
const TOKEN_FILE_MAX_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Host,
    Environment,
    Persisted,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub project_path: String,
    pub source: IdentitySource,
    pub label: Option<String>,
}

/// Derives the kernel token from an externally supplied one.
pub fn derive_token(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_TOKEN_LEN)
        .collect();
    if cleaned.len() >= MIN_TOKEN_LEN {
        return cleaned.to_lowercase();
    }
    let digest = format!("{:x}", md5::compute(raw));
    digest[..HASHED_TOKEN_LEN].to_string()
}

fn generate_token() -> String {
    let value: u64 = rand::thread_rng().gen::<u64>() & 0xffff_ffff_ffff;
    format!("{:012x}", value)
}

pub struct IdentityResolver {
    identity_dir: PathBuf,
    env_token: Option<String>,
    ppid: Option<u32>,
    label: Option<String>,
}

impl IdentityResolver {
    pub fn new(state_dir: &Path, env_token: Option<String>, ppid: Option<u32>) -> Self {
        Self {
            identity_dir: state_dir.join("identity"),
            env_token: env_token.filter(|t| !t.trim().is_empty()),
            ppid,
            label: None,
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        self
    }

    /// Resolver using this process's environment and parent PID.
    pub fn from_env(state_dir: &Path) -> Self {
        Self::new(state_dir, env::var(SESSION_ENV).ok(), current_ppid())
            .with_label(env::var(LABEL_ENV).ok())
    }

    pub fn resolve(
        &self,
        host_token: Option<&str>,
        cwd: Option<&str>,
        now: DateTime<Utc>,
    ) -> SessionIdentity {
        let (session_id, source) = self.resolve_session_id(host_token, now);
        SessionIdentity {
            session_id,
            project_path: resolve_project_path(cwd),
            source,
            label: self.label.clone(),
        }
    }

    pub fn resolve_session_id(
        &self,
        host_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> (String, IdentitySource) {
        if let Some(token) = host_token.filter(|t| !t.trim().is_empty()) {
            return (derive_token(token), IdentitySource::Host);
        }
        if let Some(token) = &self.env_token {
            return (derive_token(token), IdentitySource::Environment);
        }

        let token_file = self.token_file();
        if let Some(path) = &token_file {
            if let Some(token) = read_fresh_token(path, now) {
                // Rewrite so the max-age window counts from last use.
                if let Err(err) = persist_token(path, &token) {
                    debug!(error = %err, path = %path.display(), "Failed to refresh session token");
                }
                return (token, IdentitySource::Persisted);
            }
        }

        let token = generate_token();
        if let Some(path) = &token_file {
            if let Err(err) = persist_token(path, &token) {
                // Non-fatal: the next invocation just generates again.
                warn!(error = %err, path = %path.display(), "Failed to persist session token");
            }
        }
        debug!(session = %token, "Generated session token");
        (token, IdentitySource::Generated)
    }

    fn token_file(&self) -> Option<PathBuf> {
        self.ppid
            .map(|pid| self.identity_dir.join(format!("ppid-{}", pid)))
    }
}

fn read_fresh_token(path: &Path, now: DateTime<Utc>) -> Option<String> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let modified: DateTime<Utc> = modified.into();
    if now.signed_duration_since(modified) >= Duration::hours(TOKEN_FILE_MAX_AGE_HOURS) {
        return None;
    }
    let token = fs::read_to_string(path).ok()?.trim().to_string();
    let valid = (MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token.len())
        && token.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(token)
}

fn persist_token(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, token)
}

/// Resolves the active project root for this invocation.
///
/// Explicit environment overrides win over the host's cwd; the chosen
/// directory is then widened to its enclosing git repository.
pub fn resolve_project_path(hook_cwd: Option<&str>) -> String {
    let candidate = project_candidate(
        env::var(PROJECT_ENV).ok().as_deref(),
        env::var(HOST_PROJECT_ENV).ok().as_deref(),
        hook_cwd,
    )
    .or_else(|| {
        env::current_dir()
            .ok()
            .map(|p| p.to_string_lossy().to_string())
    })
    .unwrap_or_else(|| "/".to_string());

    let root = project_root_for(Path::new(&normalize_path(&candidate)));
    normalize_path(&root.to_string_lossy())
}

/// First non-blank of the project override, the host's project dir and the
/// hook cwd.
fn project_candidate(
    concord: Option<&str>,
    host: Option<&str>,
    hook_cwd: Option<&str>,
) -> Option<String> {
    [concord, host, hook_cwd]
        .into_iter()
        .flatten()
        .find(|p| !p.trim().is_empty())
        .map(str::to_string)
}

pub fn current_ppid() -> Option<u32> {
    #[cfg(unix)]
    {
        // SAFETY: getppid() has no failure modes and always returns a valid PID.
        #[allow(unsafe_code)]
        Some(unsafe { libc::getppid() } as u32)
    }
    #[cfg(not(unix))]
    {
        None
    }
}
