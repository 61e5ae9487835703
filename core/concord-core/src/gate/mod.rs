//! Workflow permission gates.
//!
//! A gate is a small forward-only state machine persisted per (kind, session).
//! Prompts move it: a cancellation phrase resets it, an activation phrase
//! starts it, and each active phase has a pattern set that advances it to the
//! next phase. Tool calls are checked against the current phase.
//!
//! # Failure Semantics
//!
//! Everything that goes wrong reads as "gate inactive": a missing record, a
//! corrupt one, one past its TTL, one owned by another session, one naming a
//! phase this build does not know, or a store that cannot be reached. A gate
//! that cannot tell what phase it is in never blocks anything.
//!
//! TTL is evaluated lazily on read; expired records are removed on the way.

pub mod delegation;
pub mod orchestration;

pub use delegation::{DelegationGate, DelegationPhase};
pub use orchestration::{OrchestrationGate, OrchestrationPhase};

use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, PatternSet};
use crate::store::LeaseStore;
use crate::types::{TaskType, WorkflowKind, WorkflowState};

/// An ordered phase list. `Ord` must follow workflow order.
pub trait Phase: Copy + Eq + Ord + Debug + Send + Sync + 'static {
    /// The phase a gate is in when it has no usable record.
    const INACTIVE: Self;

    /// Phase entered on activation.
    const FIRST_ACTIVE: Self;

    fn name(&self) -> &'static str;
    fn from_name(name: &str) -> Option<Self>;

    /// The next phase in order, if any.
    fn next(&self) -> Option<Self>;

    /// Text shown to the agent when the gate enters this phase.
    fn guidance(&self) -> &'static str;
}

/// Everything a gate needs for one call.
#[derive(Clone, Copy)]
pub struct GateContext<'a> {
    pub store: &'a dyn LeaseStore,
    pub session_id: &'a str,
    pub project_path: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome<P> {
    Unchanged,
    Advanced { from: P, to: P },
    Cancelled,
}

/// Current view of a gate for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateView<P> {
    pub phase: P,
    pub task_type: TaskType,
}

impl<P: Phase> GateView<P> {
    pub fn inactive() -> Self {
        Self {
            phase: P::INACTIVE,
            task_type: TaskType::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != P::INACTIVE
    }
}

pub type AnswerHeuristic = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Advances out of `from` into `from.next()`.
pub struct Advance<P> {
    pub from: P,
    pub set: PatternSet,
    /// Extra match rule tried after `set`. Still subject to `set`'s negatives.
    pub heuristic: Option<AnswerHeuristic>,
}

impl<P> Advance<P> {
    pub fn new(from: P, set: PatternSet) -> Self {
        Self {
            from,
            set,
            heuristic: None,
        }
    }

    fn matches(&self, text: &str) -> bool {
        if self.set.matches(text) {
            return true;
        }
        match &self.heuristic {
            Some(heuristic) => !self.set.is_vetoed(text) && heuristic(text),
            None => false,
        }
    }
}

/// The generic engine shared by every gate instance.
pub struct WorkflowGate<P: Phase> {
    kind: WorkflowKind,
    ttl: Duration,
    activation: PatternSet,
    cancel: PatternSet,
    advances: Vec<Advance<P>>,
    task_types: Option<Classifier<TaskType>>,
    enabled: bool,
}

impl<P: Phase> WorkflowGate<P> {
    pub fn new(
        kind: WorkflowKind,
        ttl: Duration,
        activation: PatternSet,
        cancel: PatternSet,
    ) -> Self {
        Self {
            kind,
            ttl,
            activation,
            cancel,
            advances: Vec::new(),
            task_types: None,
            enabled: true,
        }
    }

    /// A disabled gate never activates and reads as inactive, whatever is stored.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn advance(mut self, advance: Advance<P>) -> Self {
        self.advances.push(advance);
        self
    }

    pub fn task_types(mut self, classifier: Classifier<TaskType>) -> Self {
        self.task_types = Some(classifier);
        self
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    /// Loads the session's gate. Any failure reads as inactive.
    pub fn view(&self, ctx: &GateContext<'_>) -> GateView<P> {
        self.load(ctx)
            .map(|(state, phase)| GateView {
                phase,
                task_type: state.task_type,
            })
            .unwrap_or_else(GateView::inactive)
    }

    pub fn on_prompt(&self, ctx: &GateContext<'_>, text: &str) -> PromptOutcome<P> {
        if !self.enabled {
            return PromptOutcome::Unchanged;
        }
        let loaded = self.load(ctx);

        if self.cancel.matches(text) {
            if loaded.is_none() {
                return PromptOutcome::Unchanged;
            }
            if let Err(err) = ctx.store.clear_workflow(self.kind, ctx.session_id) {
                warn!(error = %err, kind = self.kind.as_str(), "Failed to clear workflow state");
                return PromptOutcome::Unchanged;
            }
            info!(kind = self.kind.as_str(), session = %ctx.session_id, "Workflow cancelled");
            return PromptOutcome::Cancelled;
        }

        let Some((mut state, phase)) = loaded else {
            return self.try_activate(ctx, text);
        };

        let next = self
            .advances
            .iter()
            .find(|a| a.from == phase && a.matches(text))
            .and_then(|_| phase.next());

        state.last_activity = ctx.now;
        if let Some(to) = next {
            state.phase = to.name().to_string();
        }
        if let Err(err) = ctx.store.save_workflow(ctx.session_id, &state) {
            warn!(error = %err, kind = self.kind.as_str(), "Failed to save workflow state");
            return PromptOutcome::Unchanged;
        }

        match next {
            Some(to) => {
                info!(
                    kind = self.kind.as_str(),
                    from = phase.name(),
                    to = to.name(),
                    "Workflow advanced"
                );
                PromptOutcome::Advanced { from: phase, to }
            }
            None => PromptOutcome::Unchanged,
        }
    }

    /// Moves forward to `target` if the gate is active and behind it.
    pub fn advance_to(&self, ctx: &GateContext<'_>, target: P) -> bool {
        let Some((mut state, phase)) = self.load(ctx) else {
            return false;
        };
        if phase >= target {
            return false;
        }
        state.phase = target.name().to_string();
        state.last_activity = ctx.now;
        match ctx.store.save_workflow(ctx.session_id, &state) {
            Ok(()) => {
                info!(
                    kind = self.kind.as_str(),
                    from = phase.name(),
                    to = target.name(),
                    "Workflow advanced"
                );
                true
            }
            Err(err) => {
                warn!(error = %err, kind = self.kind.as_str(), "Failed to save workflow state");
                false
            }
        }
    }

    fn try_activate(&self, ctx: &GateContext<'_>, text: &str) -> PromptOutcome<P> {
        if !self.activation.matches(text) {
            return PromptOutcome::Unchanged;
        }

        let task_type = self
            .task_types
            .as_ref()
            .and_then(|c| c.classify(text))
            .unwrap_or_default();
        let state = WorkflowState {
            kind: self.kind,
            active: true,
            task_type,
            phase: P::FIRST_ACTIVE.name().to_string(),
            activated_at: ctx.now,
            last_activity: ctx.now,
            owning_session: ctx.session_id.to_string(),
        };
        if let Err(err) = ctx.store.save_workflow(ctx.session_id, &state) {
            warn!(error = %err, kind = self.kind.as_str(), "Failed to save workflow state");
            return PromptOutcome::Unchanged;
        }

        info!(
            kind = self.kind.as_str(),
            session = %ctx.session_id,
            task_type = ?task_type,
            "Workflow activated"
        );
        PromptOutcome::Advanced {
            from: P::INACTIVE,
            to: P::FIRST_ACTIVE,
        }
    }

    /// Returns the active state and its phase, or `None` for every flavour of
    /// "not active".
    fn load(&self, ctx: &GateContext<'_>) -> Option<(WorkflowState, P)> {
        if !self.enabled {
            return None;
        }
        let state = match ctx.store.load_workflow(self.kind, ctx.session_id) {
            Ok(Some(state)) => state,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, kind = self.kind.as_str(), "Workflow state unreadable; gate inactive");
                return None;
            }
        };

        if !state.active || state.owning_session != ctx.session_id {
            return None;
        }

        if state.is_expired(ctx.now, self.ttl) {
            debug!(kind = self.kind.as_str(), session = %ctx.session_id, "Workflow state expired");
            if let Err(err) = ctx.store.clear_workflow(self.kind, ctx.session_id) {
                debug!(error = %err, "Failed to remove expired workflow state");
            }
            return None;
        }

        match P::from_name(&state.phase) {
            Some(phase) if phase != P::INACTIVE => Some((state, phase)),
            Some(_) => None,
            None => {
                warn!(
                    kind = self.kind.as_str(),
                    phase = %state.phase,
                    "Unknown workflow phase; gate inactive"
                );
                None
            }
        }
    }
}
