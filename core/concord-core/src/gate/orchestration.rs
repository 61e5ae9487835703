//! Orchestration gate: recon, interview, plan, approval, then execution.
//!
//! While the gate is active and the plan is not yet approved, spawning an
//! implementation sub-agent is denied. Research tasks are never gated since
//! they produce no changes to approve.

use concord_hook_protocol::Decision;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::{Advance, GateContext, GateView, Phase, PromptOutcome, WorkflowGate};
use crate::classifier::{Classifier, PatternSet};
use crate::config::OrchestrationConfig;
use crate::error::Result;
use crate::types::{TaskType, WorkflowKind};

const DEFAULT_SUBAGENT: &str = "general-purpose";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OrchestrationPhase {
    Inactive,
    ReconPending,
    InterviewPending,
    PlanPending,
    Approved,
    Executing,
}

impl Phase for OrchestrationPhase {
    const INACTIVE: Self = OrchestrationPhase::Inactive;
    const FIRST_ACTIVE: Self = OrchestrationPhase::ReconPending;

    fn name(&self) -> &'static str {
        match self {
            OrchestrationPhase::Inactive => "inactive",
            OrchestrationPhase::ReconPending => "recon_pending",
            OrchestrationPhase::InterviewPending => "interview_pending",
            OrchestrationPhase::PlanPending => "plan_pending",
            OrchestrationPhase::Approved => "approved",
            OrchestrationPhase::Executing => "executing",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "inactive" => Some(OrchestrationPhase::Inactive),
            "recon_pending" => Some(OrchestrationPhase::ReconPending),
            "interview_pending" => Some(OrchestrationPhase::InterviewPending),
            "plan_pending" => Some(OrchestrationPhase::PlanPending),
            "approved" => Some(OrchestrationPhase::Approved),
            "executing" => Some(OrchestrationPhase::Executing),
            _ => None,
        }
    }

    fn next(&self) -> Option<Self> {
        match self {
            OrchestrationPhase::Inactive => Some(OrchestrationPhase::ReconPending),
            OrchestrationPhase::ReconPending => Some(OrchestrationPhase::InterviewPending),
            OrchestrationPhase::InterviewPending => Some(OrchestrationPhase::PlanPending),
            OrchestrationPhase::PlanPending => Some(OrchestrationPhase::Approved),
            OrchestrationPhase::Approved => Some(OrchestrationPhase::Executing),
            OrchestrationPhase::Executing => None,
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            OrchestrationPhase::Inactive => "Orchestration ended.",
            OrchestrationPhase::ReconPending => {
                "Orchestration started (phase: recon). Explore the codebase and summarize what you find. \
                 Implementation agents stay blocked until the plan is approved."
            }
            OrchestrationPhase::InterviewPending => {
                "Orchestration phase: interview. Ask the user the clarifying questions you need before planning."
            }
            OrchestrationPhase::PlanPending => {
                "Orchestration phase: plan. Write the implementation plan and ask the user to approve it."
            }
            OrchestrationPhase::Approved => {
                "Plan approved. Implementation agents may now be spawned."
            }
            OrchestrationPhase::Executing => "Executing the approved plan.",
        }
    }
}

/// Two or more enumerated lines ("1.", "-", "a)") read like interview answers.
static RE_ENUMERATED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(\d+[.)]|[a-z][.)]|[-*•])\s+\S").unwrap());

fn looks_like_answers(text: &str, max_chars: usize) -> bool {
    text.chars().count() <= max_chars && RE_ENUMERATED_LINE.find_iter(text).count() >= 2
}

pub struct OrchestrationGate {
    engine: WorkflowGate<OrchestrationPhase>,
    spawn_tools: Vec<String>,
    implementation_agents: PatternSet,
}

impl OrchestrationGate {
    pub fn from_config(config: &OrchestrationConfig) -> Result<Self> {
        let interview_set =
            PatternSet::compile("orchestration.interview_complete", &config.interview_complete)?;
        let mut interview = Advance::new(OrchestrationPhase::InterviewPending, interview_set);
        if config.answer_heuristic {
            let max_chars = config.answer_heuristic_max_chars;
            interview.heuristic =
                Some(Box::new(move |text: &str| looks_like_answers(text, max_chars)));
        }

        let task_types = Classifier::new()
            .rule(
                TaskType::Implementation,
                PatternSet::compile("orchestration.implementation_task", &config.implementation_task)?,
            )
            .rule(
                TaskType::Research,
                PatternSet::compile("orchestration.research_task", &config.research_task)?,
            );

        let engine = WorkflowGate::new(
            WorkflowKind::Orchestration,
            config.ttl(),
            PatternSet::compile("orchestration.activation", &config.activation)?,
            PatternSet::compile("orchestration.cancel", &config.cancel)?,
        )
        .advance(Advance::new(
            OrchestrationPhase::ReconPending,
            PatternSet::compile("orchestration.recon_complete", &config.recon_complete)?,
        ))
        .advance(interview)
        .advance(Advance::new(
            OrchestrationPhase::PlanPending,
            PatternSet::compile("orchestration.plan_approved", &config.plan_approved)?,
        ))
        .task_types(task_types)
        .enabled(config.enabled);

        Ok(Self {
            engine,
            spawn_tools: config.spawn_tools.clone(),
            implementation_agents: PatternSet::from_patterns(
                "orchestration.implementation_agents",
                &config.implementation_agents,
            )?,
        })
    }

    pub fn view(&self, ctx: &GateContext<'_>) -> GateView<OrchestrationPhase> {
        self.engine.view(ctx)
    }

    pub fn on_prompt(
        &self,
        ctx: &GateContext<'_>,
        text: &str,
    ) -> PromptOutcome<OrchestrationPhase> {
        self.engine.on_prompt(ctx, text)
    }

    pub fn authorize(
        &self,
        ctx: &GateContext<'_>,
        tool_name: &str,
        tool_input: &Value,
    ) -> Decision {
        if !self.spawns_implementation_agent(tool_name, tool_input) {
            return Decision::Allow;
        }

        let view = self.engine.view(ctx);
        if !view.is_active()
            || view.task_type == TaskType::Research
            || view.phase >= OrchestrationPhase::Approved
        {
            return Decision::Allow;
        }

        debug!(phase = view.phase.name(), tool = %tool_name, "Blocking implementation agent");
        Decision::deny(format!(
            "Orchestration is in the {} phase. Implementation agents are blocked until the user \
             approves the plan. Finish the current phase, or ask the user to cancel orchestration.",
            view.phase.name()
        ))
    }

    /// A spawn that actually ran after approval moves the gate to executing.
    pub fn on_tool_used(
        &self,
        ctx: &GateContext<'_>,
        tool_name: &str,
        tool_input: &Value,
    ) -> Option<OrchestrationPhase> {
        if !self.spawns_implementation_agent(tool_name, tool_input) {
            return None;
        }
        if self.engine.view(ctx).phase != OrchestrationPhase::Approved {
            return None;
        }
        self.engine
            .advance_to(ctx, OrchestrationPhase::Executing)
            .then_some(OrchestrationPhase::Executing)
    }

    fn spawns_implementation_agent(&self, tool_name: &str, tool_input: &Value) -> bool {
        if !self.spawn_tools.iter().any(|t| t == tool_name) {
            return false;
        }
        if self.implementation_agents.is_empty() {
            return true;
        }
        let subagent = tool_input
            .get("subagent_type")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SUBAGENT);
        self.implementation_agents.matches(subagent)
    }
}
