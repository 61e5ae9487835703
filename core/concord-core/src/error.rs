//! Error types for concord-core operations.
//!
//! None of these are meant to reach the host as failures. Callers in the
//! kernel map every variant to the most permissive outcome for the component
//! that hit it; the error exists so the degraded path can be logged.

use std::path::PathBuf;

/// All errors that can occur in concord-core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    // ─────────────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Lease store unavailable: {context}: {details}")]
    BackendUnavailable { context: String, details: String },

    #[error("Corrupt state record {key}: {details}")]
    CorruptState { key: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid pattern in {set}: {pattern}: {source}")]
    InvalidPattern {
        set: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CoordError {
    pub fn backend(context: impl Into<String>, details: impl std::fmt::Display) -> Self {
        CoordError::BackendUnavailable {
            context: context.into(),
            details: details.to_string(),
        }
    }

    pub fn corrupt(key: impl Into<String>, details: impl std::fmt::Display) -> Self {
        CoordError::CorruptState {
            key: key.into(),
            details: details.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CoordError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for malformed persisted records, which callers treat as absent.
    pub fn is_corrupt_state(&self) -> bool {
        matches!(self, CoordError::CorruptState { .. })
    }
}

/// Convenience type alias for Results using CoordError.
pub type Result<T> = std::result::Result<T, CoordError>;
