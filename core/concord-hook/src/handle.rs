//! Event handler for host hooks.
//!
//! Reads one JSON payload from stdin, resolves the session, lets the kernel
//! decide and prints the host-facing response.
//!
//! ```text
//! empty stdin          → no output
//! unparseable payload  → no output (logged)
//! no event name        → no output
//! store unavailable    → no output (logged)
//! Allow                → no output
//! Deny / Advisory      → one JSON object on stdout
//! ```
//!
//! Only a stdin that cannot be read at all is reported as a failure.

use chrono::Utc;
use concord_core::config::default_state_dir;
use concord_core::{CoordError, IdentityResolver, Kernel, KernelConfig};
use concord_hook_protocol::{HookInput, HookResponse, MAX_INPUT_BYTES};
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Failed to read stdin: {0}")]
    Stdin(#[source] io::Error),

    #[error("Failed to write output: {0}")]
    Output(#[source] io::Error),

    #[error("Failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoordError),
}

pub fn run() -> Result<(), HookError> {
    let Some(raw) = read_input(io::stdin().lock())? else {
        return Ok(());
    };

    let state_dir = match default_state_dir() {
        Ok(dir) => dir,
        Err(err) => {
            tracing::warn!(error = %err, "No state directory; allowing");
            return Ok(());
        }
    };
    let resolver = IdentityResolver::from_env(&state_dir);

    match respond(&raw, &state_dir, &resolver) {
        Some(response) => write_json(io::stdout().lock(), &response),
        None => Ok(()),
    }
}

/// Reads at most [`MAX_INPUT_BYTES`]. Oversized, empty or non-UTF-8 input
/// yields `None`.
fn read_input<R: Read>(reader: R) -> Result<Option<String>, HookError> {
    let mut input = String::new();
    match reader
        .take(MAX_INPUT_BYTES as u64 + 1)
        .read_to_string(&mut input)
    {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::InvalidData => {
            tracing::warn!(error = %err, "Hook input is not UTF-8; ignoring");
            return Ok(None);
        }
        Err(err) => return Err(HookError::Stdin(err)),
    }

    if input.len() > MAX_INPUT_BYTES {
        tracing::warn!(limit = MAX_INPUT_BYTES, "Hook input too large; ignoring");
        return Ok(None);
    }
    if input.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(input))
}

fn respond(raw: &str, state_dir: &Path, resolver: &IdentityResolver) -> Option<HookResponse> {
    let hook_input: HookInput = match serde_json::from_str(raw) {
        Ok(input) => input,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to parse hook input; allowing");
            return None;
        }
    };

    let Some(event) = hook_input.to_event() else {
        tracing::debug!("Skipping payload without hook_event_name");
        return None;
    };

    let identity = resolver.resolve(
        hook_input.session_id.as_deref(),
        hook_input.cwd.as_deref(),
        Utc::now(),
    );

    let kernel = match open_kernel(&identity.project_path, state_dir) {
        Ok(kernel) => kernel,
        Err(err) => {
            tracing::warn!(error = %err, event = %event.name(), "Kernel unavailable; allowing");
            return None;
        }
    };

    let decision = kernel.handle(&event, &identity);
    tracing::debug!(
        event = %event.name(),
        session = %identity.session_id,
        source = ?identity.source,
        decision = ?decision,
        "Handled hook event"
    );
    HookResponse::from_decision(event.name(), &decision)
}

/// Loads the project's config, falling back to defaults when it is malformed.
pub fn load_config(project_path: &str) -> KernelConfig {
    match KernelConfig::load(Some(Path::new(project_path))) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Ignoring unusable config; using defaults");
            KernelConfig::default()
        }
    }
}

/// Opens the kernel for a project. A pattern that fails to compile drops the
/// whole config back to defaults, keeping only the store section.
pub fn open_kernel(project_path: &str, state_dir: &Path) -> Result<Kernel, CoordError> {
    let config = load_config(project_path);
    let store = config.store.clone();
    match Kernel::open(config, state_dir) {
        Err(err @ CoordError::InvalidPattern { .. }) => {
            tracing::warn!(error = %err, "Ignoring config with invalid pattern; using defaults");
            Kernel::open(
                KernelConfig {
                    store,
                    ..KernelConfig::default()
                },
                state_dir,
            )
        }
        other => other,
    }
}

pub fn write_json<W: Write, T: serde::Serialize>(mut out: W, value: &T) -> Result<(), HookError> {
    let encoded = serde_json::to_string(value)?;
    writeln!(out, "{}", encoded).map_err(HookError::Output)?;
    out.flush().map_err(HookError::Output)
}
