//! Kernel facade: one hook event in, one decision out.
//!
//! ```text
//! SessionStart      → register, advise about live peers and resumed gates
//! UserPromptSubmit  → heartbeat, run both gates' prompt classifiers
//! PreToolUse        → heartbeat, gate authorization, then file claim
//! PostToolUse       → heartbeat, orchestration approved → executing
//! SessionEnd        → release every claim the session holds
//! anything else     → allow
//! ```
//!
//! Every path degrades to `Allow` when the store misbehaves. A sweep may run
//! after any event.

use chrono::{DateTime, Utc};
use concord_hook_protocol::{tool_file_path, Decision, HookEvent};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::claims::ClaimProtocol;
use crate::cleanup;
use crate::clock::{Clock, SystemClock};
use crate::config::KernelConfig;
use crate::error::Result;
use crate::gate::{
    DelegationGate, DelegationPhase, GateContext, OrchestrationGate, OrchestrationPhase, Phase,
    PromptOutcome,
};
use crate::identity::SessionIdentity;
use crate::liveness::{HeartbeatOutcome, LivenessRegistry};
use crate::paths::file_key;
use crate::store::{open_store, LeaseStore, SweepStats};
use crate::types::{FileClaim, SessionRecord, TaskType};

pub struct Kernel {
    config: KernelConfig,
    store: Box<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    orchestration: OrchestrationGate,
    delegation: DelegationGate,
}

/// Snapshot of one session's coordination state, for `concord-hook status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session_id: String,
    pub project_path: String,
    pub backend: String,
    pub session: Option<SessionRecord>,
    pub active_peers: Vec<SessionRecord>,
    pub open_claims: Vec<FileClaim>,
    pub orchestration_phase: String,
    pub orchestration_task: TaskType,
    pub delegation_phase: String,
}

impl Kernel {
    /// Builds a kernel; fails only if a configured pattern does not compile.
    pub fn new(
        config: KernelConfig,
        store: Box<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let orchestration = OrchestrationGate::from_config(&config.orchestration)?;
        let delegation = DelegationGate::from_config(&config.delegation)?;
        Ok(Self {
            config,
            store,
            clock,
            orchestration,
            delegation,
        })
    }

    /// Opens the configured store under `state_dir` with the system clock.
    pub fn open(config: KernelConfig, state_dir: &Path) -> Result<Self> {
        let store = open_store(&config.store, state_dir)?;
        Self::new(config, store, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn LeaseStore {
        self.store.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn handle(&self, event: &HookEvent, identity: &SessionIdentity) -> Decision {
        let decision = match event {
            HookEvent::SessionStart => self.on_session_start(identity),
            HookEvent::SessionEnd => self.on_session_end(identity),
            HookEvent::UserPromptSubmit { prompt } => {
                self.touch(identity);
                self.on_prompt(identity, prompt)
            }
            HookEvent::PreToolUse {
                tool_name,
                tool_input,
            } => {
                self.touch(identity);
                self.on_pre_tool_use(identity, tool_name, tool_input)
            }
            HookEvent::PostToolUse {
                tool_name,
                tool_input,
            } => {
                self.touch(identity);
                self.on_post_tool_use(identity, tool_name, tool_input);
                Decision::Allow
            }
            HookEvent::Unknown { event_name } => {
                debug!(event = %event_name, "Ignoring unhandled event");
                Decision::Allow
            }
        };

        cleanup::maybe_sweep(self.store(), &self.config.sweep, self.now());
        decision
    }

    pub fn status(&self, identity: &SessionIdentity) -> StatusReport {
        let liveness = self.liveness();
        let ctx = self.gate_context(identity);
        let orchestration = self.orchestration.view(&ctx);

        StatusReport {
            session_id: identity.session_id.clone(),
            project_path: identity.project_path.clone(),
            backend: self.store.backend_name().to_string(),
            session: self.store.get_session(&identity.session_id).ok().flatten(),
            active_peers: liveness
                .active_peers(
                    &identity.project_path,
                    &identity.session_id,
                    self.config.liveness.stale_after(),
                )
                .unwrap_or_default(),
            open_claims: self
                .store
                .list_claims_by(&identity.session_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|c| !c.is_released())
                .collect(),
            orchestration_phase: orchestration.phase.name().to_string(),
            orchestration_task: orchestration.task_type,
            delegation_phase: self.delegation.view(&ctx).phase.name().to_string(),
        }
    }

    /// Releases one claim held by this session.
    pub fn release(&self, identity: &SessionIdentity, file_path: &str) -> Result<bool> {
        let liveness = self.liveness();
        self.claims(&liveness)
            .release(file_path, &identity.project_path, &identity.session_id)
    }

    /// Runs a sweep now, regardless of the configured odds.
    pub fn sweep(&self) -> Result<SweepStats> {
        cleanup::sweep(self.store(), &self.config.sweep, self.now())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Event handlers
    // ─────────────────────────────────────────────────────────────────────

    fn on_session_start(&self, identity: &SessionIdentity) -> Decision {
        let liveness = self.liveness();
        if let Err(err) = liveness.register(
            &identity.session_id,
            &identity.project_path,
            identity.label.as_deref(),
        ) {
            warn!(error = %err, "Session registration failed; continuing unregistered");
        }

        let mut decision = Decision::Allow;

        match liveness.active_peers(
            &identity.project_path,
            &identity.session_id,
            self.config.liveness.stale_after(),
        ) {
            Ok(peers) if !peers.is_empty() => {
                decision = decision.merge(Decision::advisory(self.describe_peers(&peers)));
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "Could not list peers"),
        }

        // A resumed session may still have a gate running.
        let ctx = self.gate_context(identity);
        let orchestration = self.orchestration.view(&ctx);
        if orchestration.is_active() {
            decision = decision.merge(Decision::advisory(orchestration.phase.guidance()));
        }
        let delegation = self.delegation.view(&ctx);
        if delegation.is_active() {
            decision = decision.merge(Decision::advisory(delegation.phase.guidance()));
        }

        decision
    }

    fn on_session_end(&self, identity: &SessionIdentity) -> Decision {
        let liveness = self.liveness();
        if let Err(err) = self.claims(&liveness).release_all(&identity.session_id) {
            warn!(error = %err, session = %identity.session_id, "Failed to release claims");
        }
        Decision::Allow
    }

    fn on_prompt(&self, identity: &SessionIdentity, prompt: &str) -> Decision {
        let ctx = self.gate_context(identity);
        let orchestration = match self.orchestration.on_prompt(&ctx, prompt) {
            PromptOutcome::Advanced { to, .. } => Decision::advisory(to.guidance()),
            PromptOutcome::Cancelled => Decision::advisory(OrchestrationPhase::INACTIVE.guidance()),
            PromptOutcome::Unchanged => Decision::Allow,
        };
        let delegation = match self.delegation.on_prompt(&ctx, prompt) {
            PromptOutcome::Advanced { to, .. } => Decision::advisory(to.guidance()),
            PromptOutcome::Cancelled => Decision::advisory(DelegationPhase::INACTIVE.guidance()),
            PromptOutcome::Unchanged => Decision::Allow,
        };
        orchestration.merge(delegation)
    }

    fn on_pre_tool_use(
        &self,
        identity: &SessionIdentity,
        tool_name: &str,
        tool_input: &Value,
    ) -> Decision {
        let ctx = self.gate_context(identity);
        let gates = self
            .orchestration
            .authorize(&ctx, tool_name, tool_input)
            .merge(self.delegation.authorize(&ctx, tool_name, tool_input));
        if gates.is_deny() {
            return gates;
        }
        gates.merge(self.claim_for_tool(identity, tool_name, tool_input))
    }

    fn on_post_tool_use(&self, identity: &SessionIdentity, tool_name: &str, tool_input: &Value) {
        let ctx = self.gate_context(identity);
        self.orchestration.on_tool_used(&ctx, tool_name, tool_input);
    }

    fn claim_for_tool(
        &self,
        identity: &SessionIdentity,
        tool_name: &str,
        tool_input: &Value,
    ) -> Decision {
        let claims_config = &self.config.claims;
        if !claims_config.enabled || !claims_config.is_tracked(tool_name) {
            return Decision::Allow;
        }
        let Some(path) = tool_file_path(tool_input) else {
            return Decision::Allow;
        };

        let liveness = self.liveness();
        let claims = self.claims(&liveness);
        let outcome = claims.acquire_or_warn(
            path,
            &identity.project_path,
            &identity.session_id,
            claims_config.policy_for(tool_name),
        );
        outcome.to_decision(&file_key(path, &identity.project_path), claims.stale_after())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────

    /// Heartbeat, registering first if this session was never seen.
    fn touch(&self, identity: &SessionIdentity) {
        let liveness = self.liveness();
        match liveness.heartbeat(&identity.session_id) {
            Ok(HeartbeatOutcome::Unregistered) => {
                if let Err(err) = liveness.register(
                    &identity.session_id,
                    &identity.project_path,
                    identity.label.as_deref(),
                ) {
                    warn!(error = %err, "Session registration failed; continuing unregistered");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Heartbeat failed"),
        }
    }

    fn describe_peers(&self, peers: &[SessionRecord]) -> String {
        let now = self.now();
        let mut lines = vec!["Other sessions are active on this project:".to_string()];
        for peer in peers {
            let mut line = format!("- {}", peer.session_id);
            if let Some(label) = &peer.working_on {
                line.push_str(&format!(" (working on: {})", label));
            }
            let idle = now.signed_duration_since(peer.last_heartbeat).num_minutes().max(0);
            line.push_str(&format!(", last seen {}m ago", idle));

            let held = self
                .store
                .list_claims_by(&peer.session_id)
                .map(|claims| {
                    claims
                        .iter()
                        .filter(|c| !c.is_released() && c.project_path == peer.project_path)
                        .count()
                })
                .unwrap_or(0);
            if held > 0 {
                line.push_str(&format!(", holding {} file(s)", held));
            }
            lines.push(line);
        }
        lines.push("Coordinate before editing the same files.".to_string());
        lines.join("\n")
    }

    fn liveness(&self) -> LivenessRegistry<'_> {
        LivenessRegistry::new(
            self.store.as_ref(),
            self.clock.as_ref(),
            self.config.liveness.heartbeat_debounce(),
        )
    }

    fn claims<'a>(&'a self, liveness: &'a LivenessRegistry<'a>) -> ClaimProtocol<'a> {
        ClaimProtocol::new(
            self.store.as_ref(),
            self.clock.as_ref(),
            liveness,
            self.config.claims.stale_after(),
        )
    }

    fn gate_context<'a>(&'a self, identity: &'a SessionIdentity) -> GateContext<'a> {
        GateContext {
            store: self.store.as_ref(),
            session_id: &identity.session_id,
            project_path: &identity.project_path,
            now: self.now(),
        }
    }
}
