//! Hook payload and decision types for Concord.
//!
//! This crate is shared by the kernel and the CLI so the host contract lives
//! in one place. The host sends one JSON object per event on stdin; the kernel
//! answers with a [`Decision`], which [`HookResponse`] renders back into the
//! host's hook output format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_INPUT_BYTES: usize = 1024 * 1024; // 1MB

/// Raw hook payload as delivered by the host.
///
/// Unknown fields are ignored: the host adds fields between releases and an
/// unrecognised key must never turn into a rejected event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Parsed hook event. Only the events the kernel acts on get their own variant.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    SessionStart,
    SessionEnd,
    UserPromptSubmit { prompt: String },
    PreToolUse { tool_name: String, tool_input: Value },
    PostToolUse { tool_name: String, tool_input: Value },
    Unknown { event_name: String },
}

impl HookEvent {
    pub fn name(&self) -> &str {
        match self {
            HookEvent::SessionStart => "SessionStart",
            HookEvent::SessionEnd => "SessionEnd",
            HookEvent::UserPromptSubmit { .. } => "UserPromptSubmit",
            HookEvent::PreToolUse { .. } => "PreToolUse",
            HookEvent::PostToolUse { .. } => "PostToolUse",
            HookEvent::Unknown { event_name } => event_name,
        }
    }
}

impl HookInput {
    /// Maps the raw payload to a [`HookEvent`]. Returns `None` when the payload
    /// carries no event name at all.
    pub fn to_event(&self) -> Option<HookEvent> {
        let name = self.hook_event_name.as_deref()?;
        let tool_name = || self.tool_name.clone().unwrap_or_default();
        let tool_input = || self.tool_input.clone().unwrap_or(Value::Null);

        let event = match name {
            "SessionStart" => HookEvent::SessionStart,
            "SessionEnd" => HookEvent::SessionEnd,
            "UserPromptSubmit" => HookEvent::UserPromptSubmit {
                prompt: self.prompt.clone().unwrap_or_default(),
            },
            "PreToolUse" => HookEvent::PreToolUse {
                tool_name: tool_name(),
                tool_input: tool_input(),
            },
            "PostToolUse" => HookEvent::PostToolUse {
                tool_name: tool_name(),
                tool_input: tool_input(),
            },
            other => HookEvent::Unknown {
                event_name: other.to_string(),
            },
        };
        Some(event)
    }
}

/// The kernel's answer for one invocation. The host decides how to render or
/// enforce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny { reason: String },
    Advisory { message: String },
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.into(),
        }
    }

    pub fn advisory(message: impl Into<String>) -> Self {
        Decision::Advisory {
            message: message.into(),
        }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Decision::Deny { .. })
    }

    fn severity(&self) -> u8 {
        match self {
            Decision::Allow => 0,
            Decision::Advisory { .. } => 1,
            Decision::Deny { .. } => 2,
        }
    }

    /// Combines two decisions: deny beats advisory beats allow. Two advisories
    /// (or two denials) are joined so neither message is lost.
    pub fn merge(self, other: Decision) -> Decision {
        match (self, other) {
            (Decision::Deny { reason: a }, Decision::Deny { reason: b }) => Decision::Deny {
                reason: format!("{}\n{}", a, b),
            },
            (Decision::Advisory { message: a }, Decision::Advisory { message: b }) => {
                Decision::Advisory {
                    message: format!("{}\n{}", a, b),
                }
            }
            (a, b) => {
                if b.severity() > a.severity() {
                    b
                } else {
                    a
                }
            }
        }
    }
}

/// Host-facing hook output.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookSpecificOutput {
    pub hook_event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
}

impl HookResponse {
    /// Renders a decision for the given event. `Allow` renders nothing so the
    /// host falls through to its normal permission flow.
    pub fn from_decision(event_name: &str, decision: &Decision) -> Option<Self> {
        match decision {
            Decision::Allow => None,
            Decision::Deny { reason } if event_name == "PreToolUse" => Some(HookResponse {
                hook_specific_output: Some(HookSpecificOutput {
                    hook_event_name: event_name.to_string(),
                    permission_decision: Some("deny".to_string()),
                    permission_decision_reason: Some(reason.clone()),
                    additional_context: None,
                }),
                system_message: None,
            }),
            Decision::Deny { reason } => Some(HookResponse {
                hook_specific_output: None,
                system_message: Some(reason.clone()),
            }),
            Decision::Advisory { message }
                if matches!(event_name, "UserPromptSubmit" | "SessionStart") =>
            {
                Some(HookResponse {
                    hook_specific_output: Some(HookSpecificOutput {
                        hook_event_name: event_name.to_string(),
                        permission_decision: None,
                        permission_decision_reason: None,
                        additional_context: Some(message.clone()),
                    }),
                    system_message: None,
                })
            }
            Decision::Advisory { message } => Some(HookResponse {
                hook_specific_output: None,
                system_message: Some(message.clone()),
            }),
        }
    }
}

/// Pulls the target file path out of a tool's input, if it names one.
pub fn tool_file_path(tool_input: &Value) -> Option<&str> {
    ["file_path", "notebook_path", "path"]
        .iter()
        .find_map(|key| tool_input.get(*key).and_then(Value::as_str))
        .filter(|path| !path.trim().is_empty())
}

/// Pulls the shell command out of a tool's input, if it carries one.
pub fn tool_command(tool_input: &Value) -> Option<&str> {
    tool_input.get("command").and_then(Value::as_str)
}
