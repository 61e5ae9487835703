//! Delegation gate: while active, the main agent may plan and coordinate but
//! not edit code or run tests itself.
//!
//! Direct file mutation (edit tools, and shell commands that write files) and
//! test runs are denied unless every target path is on the allowlist. The
//! allowlist covers plans, notes and configuration by default.

use concord_hook_protocol::{tool_command, tool_file_path, Decision};
use serde_json::Value;
use tracing::debug;

use super::{GateContext, GateView, Phase, PromptOutcome, WorkflowGate};
use crate::classifier::PatternSet;
use crate::config::DelegationConfig;
use crate::error::Result;
use crate::paths::file_key;
use crate::patterns::{mask_quoted, shell_write_targets};
use crate::types::WorkflowKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DelegationPhase {
    Inactive,
    Active,
}

impl Phase for DelegationPhase {
    const INACTIVE: Self = DelegationPhase::Inactive;
    const FIRST_ACTIVE: Self = DelegationPhase::Active;

    fn name(&self) -> &'static str {
        match self {
            DelegationPhase::Inactive => "inactive",
            DelegationPhase::Active => "active",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "inactive" => Some(DelegationPhase::Inactive),
            "active" => Some(DelegationPhase::Active),
            _ => None,
        }
    }

    fn next(&self) -> Option<Self> {
        match self {
            DelegationPhase::Inactive => Some(DelegationPhase::Active),
            DelegationPhase::Active => None,
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            DelegationPhase::Inactive => "Delegation mode off.",
            DelegationPhase::Active => {
                "Delegation mode on. Hand implementation and test runs to sub-agents; \
                 direct edits are limited to plans, notes and configuration."
            }
        }
    }
}

pub struct DelegationGate {
    engine: WorkflowGate<DelegationPhase>,
    mutation_tools: Vec<String>,
    shell_tools: Vec<String>,
    test_commands: PatternSet,
    allowlist: PatternSet,
}

impl DelegationGate {
    pub fn from_config(config: &DelegationConfig) -> Result<Self> {
        let engine = WorkflowGate::new(
            WorkflowKind::Delegation,
            config.ttl(),
            PatternSet::compile("delegation.activation", &config.activation)?,
            PatternSet::compile("delegation.cancel", &config.cancel)?,
        )
        .enabled(config.enabled);
        Ok(Self {
            engine,
            mutation_tools: config.mutation_tools.clone(),
            shell_tools: config.shell_tools.clone(),
            test_commands: PatternSet::from_patterns(
                "delegation.test_commands",
                &config.test_commands,
            )?,
            allowlist: PatternSet::from_patterns("delegation.allowlist", &config.allowlist)?,
        })
    }

    pub fn view(&self, ctx: &GateContext<'_>) -> GateView<DelegationPhase> {
        self.engine.view(ctx)
    }

    pub fn on_prompt(&self, ctx: &GateContext<'_>, text: &str) -> PromptOutcome<DelegationPhase> {
        self.engine.on_prompt(ctx, text)
    }

    pub fn authorize(
        &self,
        ctx: &GateContext<'_>,
        tool_name: &str,
        tool_input: &Value,
    ) -> Decision {
        let is_mutation = self.mutation_tools.iter().any(|t| t == tool_name);
        let is_shell = self.shell_tools.iter().any(|t| t == tool_name);
        if !is_mutation && !is_shell {
            return Decision::Allow;
        }
        if !self.engine.view(ctx).is_active() {
            return Decision::Allow;
        }

        if is_mutation {
            return match tool_file_path(tool_input) {
                Some(path) if self.is_allowlisted(path, ctx.project_path) => Decision::Allow,
                Some(path) => deny_edit(tool_name, &file_key(path, ctx.project_path)),
                None => deny_edit(tool_name, "an unspecified file"),
            };
        }

        let Some(command) = tool_command(tool_input) else {
            return Decision::Allow;
        };
        if self.test_commands.matches(&mask_quoted(command)) {
            debug!(command = %command, "Blocking test run under delegation");
            return Decision::deny(
                "Delegation mode is on: test runs belong to a sub-agent. Delegate the test run, \
                 or ask the user to turn delegation off.",
            );
        }
        let blocked: Vec<String> = shell_write_targets(command)
            .into_iter()
            .filter(|target| !self.is_allowlisted(target, ctx.project_path))
            .collect();
        if blocked.is_empty() {
            return Decision::Allow;
        }
        debug!(command = %command, targets = ?blocked, "Blocking shell write under delegation");
        Decision::deny(format!(
            "Delegation mode is on: this command writes {}. Delegate the change to a sub-agent, \
             or ask the user to turn delegation off.",
            blocked.join(", ")
        ))
    }

    fn is_allowlisted(&self, path: &str, project_path: &str) -> bool {
        self.allowlist.matches(path) || self.allowlist.matches(&file_key(path, project_path))
    }
}

fn deny_edit(tool_name: &str, target: &str) -> Decision {
    Decision::deny(format!(
        "Delegation mode is on: {} on {} is blocked. Delegate the change to a sub-agent, \
         or ask the user to turn delegation off.",
        tool_name, target
    ))
}
