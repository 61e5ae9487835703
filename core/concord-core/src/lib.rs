//! # concord-core
//!
//! Coordination kernel for stateless agent invocations that share a project.
//!
//! Each hook invocation is a fresh process with no memory of the last one.
//! Everything it knows about other sessions, file claims and workflow phase
//! comes from the [`store::LeaseStore`] it opens on startup.
//!
//! ## Design Principles
//!
//! - **Synchronous**: no async runtime. One event is handled start to finish.
//! - **Fail open**: a broken store, a corrupt record or an expired gate never
//!   blocks the user; it degrades to the most permissive decision.
//! - **Patterns as data**: every phrase the gates react to is configuration.
//! - **Advisory**: claims warn and deny on conflict, but they are not locks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use concord_core::{Kernel, KernelConfig, IdentityResolver};
//!
//! let config = KernelConfig::load(None)?;
//! let state_dir = concord_core::config::default_state_dir()?;
//! let kernel = Kernel::open(config, &state_dir)?;
//! let identity = IdentityResolver::from_env(&state_dir).resolve(None, None, kernel.now());
//! let decision = kernel.handle(&event, &identity);
//! ```

pub mod claims;
pub mod classifier;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod kernel;
pub mod liveness;
pub mod paths;
pub mod patterns;
pub mod store;
pub mod types;

pub use claims::{ClaimOutcome, ClaimProtocol, ClaimStatus};
pub use classifier::{Classifier, PatternSet};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConflictPolicy, KernelConfig, PatternSetConfig};
pub use error::{CoordError, Result};
pub use gate::{DelegationPhase, OrchestrationPhase, Phase, PromptOutcome};
pub use identity::{IdentityResolver, IdentitySource, SessionIdentity};
pub use kernel::{Kernel, StatusReport};
pub use liveness::{HeartbeatOutcome, LivenessRegistry};
pub use store::{open_store, FileStore, LeaseStore, SqliteStore, SweepStats};
pub use types::*;
