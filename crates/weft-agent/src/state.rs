//! Conversation state derived from the event log

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventKind, Seq, ToolCall};
use crate::gate::Risk;

/// Execution status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    WaitingForConfirmation,
    Paused,
    Finished,
    Errored,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Finished | ExecutionStatus::Errored)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Idle => "idle",
            ExecutionStatus::Running => "running",
            ExecutionStatus::WaitingForConfirmation => "waiting for confirmation",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Finished => "finished",
            ExecutionStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// The single proposed action that has not been resolved yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Sequence number of the `ActionProposed` event; the action reference
    /// used by approve/reject
    pub seq: Seq,
    pub call: ToolCall,
    pub risk: Risk,
    pub requires_confirmation: bool,
    pub approved: bool,
}

impl PendingAction {
    /// Whether a human decision is still outstanding
    pub fn awaiting_decision(&self) -> bool {
        self.requires_confirmation && !self.approved
    }
}

/// Fold of a conversation's events.
///
/// Folding only yields resting statuses; [`ExecutionStatus::Running`] is set by
/// the engine while it is actively stepping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub status: ExecutionStatus,
    pub pending: Option<PendingAction>,
    /// Calls from the latest agent turn that have not been proposed yet
    pub planned: VecDeque<ToolCall>,
    /// The agent owes a response to the latest user message, observation or rejection
    pub awaiting_agent: bool,
    /// Human-readable reason once terminal
    pub terminal_reason: Option<String>,
}

impl ConversationState {
    /// Replay events from the start of a log
    pub fn fold<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut state = Self::default();
        for event in events {
            state.apply(event);
        }
        state
    }

    /// Apply one event
    pub fn apply(&mut self, event: &Event) {
        match &event.kind {
            EventKind::UserMessage { .. } => {
                self.awaiting_agent = true;
            }
            EventKind::AgentMessage { tool_calls, .. } => {
                self.awaiting_agent = false;
                self.planned = tool_calls.iter().cloned().collect();
            }
            EventKind::ActionProposed {
                tool_call_id,
                tool,
                arguments,
                risk,
                requires_confirmation,
            } => {
                if let Some(pos) = self.planned.iter().position(|c| &c.id == tool_call_id) {
                    self.planned.remove(pos);
                }
                self.pending = Some(PendingAction {
                    seq: event.seq,
                    call: ToolCall::new(tool_call_id, tool, arguments.clone()),
                    risk: *risk,
                    requires_confirmation: *requires_confirmation,
                    approved: !requires_confirmation,
                });
                if *requires_confirmation && self.status != ExecutionStatus::Paused {
                    self.status = ExecutionStatus::WaitingForConfirmation;
                }
            }
            EventKind::ActionApproved => {
                if let Some(pending) = &mut self.pending {
                    pending.approved = true;
                }
                self.leave_waiting();
            }
            EventKind::ActionRejected { .. } => {
                self.pending = None;
                // The agent decides again with the rejection in view
                self.planned.clear();
                self.awaiting_agent = true;
                self.leave_waiting();
            }
            EventKind::Observation { .. } => {
                self.pending = None;
                self.awaiting_agent = true;
            }
            EventKind::ConversationPaused => {
                if !self.status.is_terminal() {
                    self.status = ExecutionStatus::Paused;
                }
            }
            EventKind::ConversationResumed => {
                if self.status == ExecutionStatus::Paused {
                    self.status = self.resting_status();
                }
            }
            EventKind::ConversationFinished { reason } => {
                self.status = ExecutionStatus::Finished;
                self.terminal_reason = Some(reason.to_string());
            }
            EventKind::ConversationError { kind, detail } => {
                self.status = ExecutionStatus::Errored;
                self.terminal_reason = Some(format!("{}: {}", kind, detail));
            }
            EventKind::Summary { .. } => {}
        }
    }

    /// Whether running the conversation would do anything
    pub fn has_pending_work(&self) -> bool {
        self.pending.is_some() || !self.planned.is_empty() || self.awaiting_agent
    }

    /// The action awaiting a human decision, if any
    pub fn awaiting_decision(&self) -> Option<&PendingAction> {
        self.pending.as_ref().filter(|p| p.awaiting_decision())
    }

    fn resting_status(&self) -> ExecutionStatus {
        if self.awaiting_decision().is_some() {
            ExecutionStatus::WaitingForConfirmation
        } else {
            ExecutionStatus::Idle
        }
    }

    fn leave_waiting(&mut self) {
        if self.status == ExecutionStatus::WaitingForConfirmation {
            self.status = ExecutionStatus::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorKind, FailureKind, FinishReason, ObservationResult};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    struct Builder {
        id: Uuid,
        events: Vec<Event>,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                id: Uuid::new_v4(),
                events: Vec::new(),
            }
        }

        fn push(&mut self, kind: EventKind, parent: Option<Seq>) -> Seq {
            let seq = self.events.len() as Seq;
            self.events.push(Event {
                seq,
                conversation_id: self.id,
                timestamp: Utc::now(),
                parent,
                kind,
            });
            seq
        }

        fn state(&self) -> ConversationState {
            ConversationState::fold(&self.events)
        }
    }

    fn call(id: &str, tool: &str) -> ToolCall {
        ToolCall::new(id, tool, json!({"path": id}))
    }

    fn proposed(c: &ToolCall, requires_confirmation: bool) -> EventKind {
        EventKind::ActionProposed {
            tool_call_id: c.id.clone(),
            tool: c.name.clone(),
            arguments: c.arguments.clone(),
            risk: if requires_confirmation { Risk::High } else { Risk::Low },
            requires_confirmation,
        }
    }

    #[test]
    fn test_initial_state_is_idle() {
        let state = ConversationState::default();
        assert_eq!(state.status, ExecutionStatus::Idle);
        assert!(!state.has_pending_work());
    }

    #[test]
    fn test_user_message_creates_work() {
        let mut b = Builder::new();
        b.push(EventKind::UserMessage { text: "hi".into() }, None);
        let state = b.state();
        assert_eq!(state.status, ExecutionStatus::Idle);
        assert!(state.awaiting_agent);
        assert!(state.has_pending_work());
    }

    #[test]
    fn test_batch_is_consumed_in_order() {
        let mut b = Builder::new();
        b.push(EventKind::UserMessage { text: "go".into() }, None);
        let (c1, c2) = (call("c1", "list_dir"), call("c2", "read_file"));
        b.push(
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![c1.clone(), c2.clone()],
            },
            None,
        );
        assert_eq!(b.state().planned.len(), 2);
        assert!(!b.state().awaiting_agent);

        let p = b.push(proposed(&c1, false), None);
        let state = b.state();
        assert_eq!(state.planned.front(), Some(&c2));
        assert_eq!(state.pending.as_ref().map(|p| p.seq), Some(p));
        assert!(state.pending.as_ref().is_some_and(|p| p.approved));

        b.push(
            EventKind::Observation {
                tool_call_id: "c1".into(),
                tool: "list_dir".into(),
                result: ObservationResult::success(json!([])),
            },
            Some(p),
        );
        let state = b.state();
        assert!(state.pending.is_none());
        assert_eq!(state.planned.len(), 1);
    }

    #[test]
    fn test_confirmation_wait_and_rejection_drops_batch() {
        let mut b = Builder::new();
        b.push(EventKind::UserMessage { text: "clean".into() }, None);
        let (c1, c2) = (call("c1", "delete_file"), call("c2", "delete_file"));
        b.push(
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![c1.clone(), c2],
            },
            None,
        );
        let p = b.push(proposed(&c1, true), None);
        let state = b.state();
        assert_eq!(state.status, ExecutionStatus::WaitingForConfirmation);
        assert_eq!(state.awaiting_decision().map(|a| a.seq), Some(p));

        b.push(
            EventKind::ActionRejected {
                tool_call_id: "c1".into(),
                tool: "delete_file".into(),
                reason: "not authorized".into(),
                timed_out: false,
            },
            Some(p),
        );
        let state = b.state();
        assert_eq!(state.status, ExecutionStatus::Idle);
        assert!(state.pending.is_none());
        assert!(state.planned.is_empty());
        assert!(state.awaiting_agent);
    }

    #[test]
    fn test_pause_while_waiting_resumes_to_waiting() {
        let mut b = Builder::new();
        b.push(EventKind::UserMessage { text: "x".into() }, None);
        let c1 = call("c1", "delete_file");
        b.push(
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![c1.clone()],
            },
            None,
        );
        b.push(proposed(&c1, true), None);
        b.push(EventKind::ConversationPaused, None);
        assert_eq!(b.state().status, ExecutionStatus::Paused);
        b.push(EventKind::ConversationResumed, None);
        assert_eq!(b.state().status, ExecutionStatus::WaitingForConfirmation);
    }

    #[test]
    fn test_approval_clears_wait() {
        let mut b = Builder::new();
        let c1 = call("c1", "delete_file");
        b.push(
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![c1.clone()],
            },
            None,
        );
        let p = b.push(proposed(&c1, true), None);
        b.push(EventKind::ActionApproved, Some(p));
        let state = b.state();
        assert_eq!(state.status, ExecutionStatus::Idle);
        assert!(state.pending.as_ref().is_some_and(|p| p.approved));
        assert!(state.awaiting_decision().is_none());
    }

    #[test]
    fn test_terminal_events() {
        let mut b = Builder::new();
        b.push(
            EventKind::ConversationFinished {
                reason: FinishReason::AgentFinished,
            },
            None,
        );
        assert_eq!(b.state().status, ExecutionStatus::Finished);

        let mut b = Builder::new();
        b.push(
            EventKind::ConversationError {
                kind: ErrorKind::ProviderFailure,
                detail: "503".into(),
            },
            None,
        );
        let state = b.state();
        assert_eq!(state.status, ExecutionStatus::Errored);
        assert_eq!(state.terminal_reason.as_deref(), Some("provider failure: 503"));
        // Pausing a terminal conversation changes nothing
        b.push(EventKind::ConversationPaused, None);
        assert_eq!(b.state().status, ExecutionStatus::Errored);
    }

    #[test]
    fn test_fold_is_deterministic() {
        let mut b = Builder::new();
        b.push(EventKind::UserMessage { text: "a".into() }, None);
        let c1 = call("c1", "list_dir");
        b.push(
            EventKind::AgentMessage {
                text: "t".into(),
                tool_calls: vec![c1.clone()],
            },
            None,
        );
        let p = b.push(proposed(&c1, false), None);
        b.push(
            EventKind::Observation {
                tool_call_id: "c1".into(),
                tool: "list_dir".into(),
                result: ObservationResult::failure(FailureKind::Executor, "boom"),
            },
            Some(p),
        );
        assert_eq!(b.state(), b.state());

        let json = serde_json::to_string(&b.events).unwrap();
        let replayed: Vec<Event> = serde_json::from_str(&json).unwrap();
        assert_eq!(ConversationState::fold(&replayed), b.state());
    }
}
