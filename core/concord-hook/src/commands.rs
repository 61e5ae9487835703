//! Operator subcommands. Unlike `handle`, these report failures.

use concord_core::config::default_state_dir;
use concord_core::{IdentityResolver, Kernel, SessionIdentity};
use serde_json::json;
use std::io;
use std::path::PathBuf;

use crate::handle::{open_kernel, write_json, HookError};

pub fn status(session_id: Option<&str>, cwd: Option<&str>) -> Result<(), HookError> {
    let (kernel, identity) = open_for(session_id, cwd)?;
    write_json(io::stdout().lock(), &kernel.status(&identity))
}

pub fn release(file: &str, session_id: Option<&str>, cwd: Option<&str>) -> Result<(), HookError> {
    let (kernel, identity) = open_for(session_id, cwd)?;
    let released = kernel.release(&identity, file)?;
    write_json(
        io::stdout().lock(),
        &json!({
            "file": file,
            "session_id": identity.session_id,
            "released": released,
        }),
    )
}

pub fn cleanup() -> Result<(), HookError> {
    let state_dir = default_state_dir()?;
    let project = current_dir_string();
    let kernel = open_kernel(&project, &state_dir)?;
    let stats = kernel.sweep()?;
    write_json(
        io::stdout().lock(),
        &json!({
            "backend": kernel.store().backend_name(),
            "sessions_removed": stats.sessions_removed,
            "claims_removed": stats.claims_removed,
            "workflows_removed": stats.workflows_removed,
            "errors": stats.errors,
        }),
    )
}

fn open_for(
    session_id: Option<&str>,
    cwd: Option<&str>,
) -> Result<(Kernel, SessionIdentity), HookError> {
    let state_dir = default_state_dir()?;
    let resolver = IdentityResolver::from_env(&state_dir);
    let identity = resolver.resolve(session_id, cwd, chrono::Utc::now());
    let kernel = open_kernel(&identity.project_path, &state_dir)?;
    Ok((kernel, identity))
}

fn current_dir_string() -> String {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("/"))
        .to_string_lossy()
        .to_string()
}
