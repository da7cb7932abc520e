//! Detects an agent repeating the same action without progress

use serde_json::Value;

use crate::event::{Event, EventKind, ObservationResult};

/// Flags a conversation whose last `threshold` actions since the latest user
/// message were the same call producing the same result.
#[derive(Debug, Clone, Copy)]
pub struct StuckDetector {
    threshold: usize,
}

impl StuckDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(2),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_stuck(&self, events: &[Event]) -> bool {
        let start = events
            .iter()
            .rposition(|e| matches!(e.kind, EventKind::UserMessage { .. }))
            .unwrap_or(0);
        let recent = &events[start..];

        let mut rounds: Vec<(&str, &Value, &ObservationResult)> = Vec::new();
        for event in recent {
            let EventKind::Observation {
                tool_call_id,
                tool,
                result,
            } = &event.kind
            else {
                continue;
            };
            let arguments = recent.iter().rev().find_map(|e| match &e.kind {
                EventKind::ActionProposed {
                    tool_call_id: id,
                    arguments,
                    ..
                } if id == tool_call_id && e.seq < event.seq => Some(arguments),
                _ => None,
            });
            if let Some(arguments) = arguments {
                rounds.push((tool.as_str(), arguments, result));
            }
        }

        if rounds.len() < self.threshold {
            return false;
        }
        let tail = &rounds[rounds.len() - self.threshold..];
        tail.windows(2).all(|pair| pair[0] == pair[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Seq, ToolCall};
    use crate::gate::Risk;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn build(kinds: Vec<EventKind>) -> Vec<Event> {
        kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| Event {
                seq: i as Seq,
                conversation_id: Uuid::nil(),
                timestamp: Utc::now(),
                parent: None,
                kind,
            })
            .collect()
    }

    fn round(id: &str, path: &str, payload: Value) -> Vec<EventKind> {
        vec![
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![ToolCall::new(id, "list_dir", json!({"path": path}))],
            },
            EventKind::ActionProposed {
                tool_call_id: id.into(),
                tool: "list_dir".into(),
                arguments: json!({"path": path}),
                risk: Risk::Low,
                requires_confirmation: false,
            },
            EventKind::Observation {
                tool_call_id: id.into(),
                tool: "list_dir".into(),
                result: ObservationResult::success(payload),
            },
        ]
    }

    fn user() -> EventKind {
        EventKind::UserMessage {
            text: "list files".into(),
        }
    }

    #[test]
    fn test_identical_rounds_are_stuck() {
        let mut kinds = vec![user()];
        for i in 0..3 {
            kinds.extend(round(&format!("c{}", i), ".", json!(["a"])));
        }
        let events = build(kinds);
        assert!(StuckDetector::new(3).is_stuck(&events));
        assert!(!StuckDetector::new(4).is_stuck(&events));
    }

    #[test]
    fn test_changing_results_are_progress() {
        let mut kinds = vec![user()];
        for i in 0..4 {
            kinds.extend(round(&format!("c{}", i), ".", json!([i])));
        }
        assert!(!StuckDetector::new(3).is_stuck(&build(kinds)));
    }

    #[test]
    fn test_user_message_resets_window() {
        let mut kinds = vec![user()];
        for i in 0..2 {
            kinds.extend(round(&format!("c{}", i), ".", json!(["a"])));
        }
        kinds.push(user());
        kinds.extend(round("c9", ".", json!(["a"])));
        assert!(!StuckDetector::new(2).is_stuck(&build(kinds)));
    }
}
