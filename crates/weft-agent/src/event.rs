//! Conversation events
//!
//! Every change to a conversation is an [`Event`] appended to its log. Events
//! are immutable once appended; derived state is a fold over them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::gate::Risk;

/// Stable conversation identifier
pub type ConversationId = Uuid;

/// Position of an event in its conversation's log, starting at 0
pub type Seq = u64;

/// A single appended log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: Seq,
    pub conversation_id: ConversationId,
    pub timestamp: DateTime<Utc>,
    /// The event that caused this one, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Seq>,
    pub kind: EventKind,
}

impl Event {
    /// Whether this event ends the conversation
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// A tool call planned by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Input from the user
    UserMessage { text: String },
    /// An agent turn; `tool_calls` is the full batch it planned, in order
    AgentMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    /// The next planned call, classified and awaiting dispatch or confirmation
    ActionProposed {
        tool_call_id: String,
        tool: String,
        arguments: Value,
        risk: Risk,
        requires_confirmation: bool,
    },
    ActionApproved,
    ActionRejected {
        tool_call_id: String,
        tool: String,
        reason: String,
        #[serde(default)]
        timed_out: bool,
    },
    /// Outcome of dispatching an action
    Observation {
        tool_call_id: String,
        tool: String,
        result: ObservationResult,
    },
    ConversationPaused,
    ConversationResumed,
    ConversationFinished { reason: FinishReason },
    ConversationError { kind: ErrorKind, detail: String },
    /// Replaces the model-visible events in `first_seq..=last_seq`
    Summary {
        first_seq: Seq,
        last_seq: Seq,
        text: String,
    },
}

impl EventKind {
    /// Short name used in logs and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::UserMessage { .. } => "user_message",
            EventKind::AgentMessage { .. } => "agent_message",
            EventKind::ActionProposed { .. } => "action_proposed",
            EventKind::ActionApproved => "action_approved",
            EventKind::ActionRejected { .. } => "action_rejected",
            EventKind::Observation { .. } => "observation",
            EventKind::ConversationPaused => "conversation_paused",
            EventKind::ConversationResumed => "conversation_resumed",
            EventKind::ConversationFinished { .. } => "conversation_finished",
            EventKind::ConversationError { .. } => "conversation_error",
            EventKind::Summary { .. } => "summary",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ConversationFinished { .. } | EventKind::ConversationError { .. }
        )
    }

    /// Whether the event is part of what the model sees
    pub fn is_model_visible(&self) -> bool {
        matches!(
            self,
            EventKind::UserMessage { .. }
                | EventKind::AgentMessage { .. }
                | EventKind::ActionRejected { .. }
                | EventKind::Observation { .. }
                | EventKind::Summary { .. }
        )
    }

    /// Pause/resume markers, which never change what the agent does next
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            EventKind::ConversationPaused | EventKind::ConversationResumed
        )
    }
}

/// Result carried by an [`EventKind::Observation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ObservationResult {
    Success { payload: Value },
    Failure { kind: FailureKind, message: String },
}

impl ObservationResult {
    pub fn success(payload: Value) -> Self {
        Self::Success { payload }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Render the result as text for the model
    pub fn to_text(&self) -> String {
        match self {
            Self::Success {
                payload: Value::String(s),
            } => s.clone(),
            Self::Success { payload } => payload.to_string(),
            Self::Failure { kind, message } => format!("{kind}: {message}"),
        }
    }
}

/// Why a dispatch did not produce a successful observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Arguments did not match the input schema; the tool never ran
    Validation,
    /// The tool returned a value that does not match its output schema
    ContractViolation,
    UnknownTool,
    /// The executor reported an error or panicked
    Executor,
    /// The process stopped while the tool was running
    Interrupted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation error",
            FailureKind::ContractViolation => "contract violation",
            FailureKind::UnknownTool => "unknown tool",
            FailureKind::Executor => "tool error",
            FailureKind::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    AgentFinished,
    Cancelled,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::AgentFinished => f.write_str("agent finished"),
            FinishReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderFailure,
    Cancelled,
    MaxIterations,
    Stuck,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ProviderFailure => "provider failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::MaxIterations => "max iterations reached",
            ErrorKind::Stuck => "stuck",
            ErrorKind::Storage => "storage failure",
        };
        f.write_str(s)
    }
}
