//! Agent step: one model call turned into a decision

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use weft_ai::{Content, Context, Message, ModelAdapter, RetryConfig, RetryDecision, Usage};

use crate::event::{Event, EventKind, ToolCall};

/// What the agent decided to do
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// No tool calls; the conversation is done
    Final { text: String },
    /// One or more tool calls, to be run in order
    Actions { text: String, calls: Vec<ToolCall> },
}

/// Why a step produced no outcome
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("model call failed after {attempts} attempt(s): {message}")]
    ProviderFailure { attempts: u32, message: String },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("cancelled")]
    Cancelled,
}

/// Calls the model adapter with retry and parses its answer
#[derive(Clone)]
pub struct AgentStep {
    adapter: Arc<dyn ModelAdapter>,
    retry: RetryConfig,
    system_prompt: Option<String>,
}

impl AgentStep {
    pub fn new(adapter: Arc<dyn ModelAdapter>, retry: RetryConfig) -> Self {
        Self {
            adapter,
            retry,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    /// Build the request for a condensed view
    pub fn context(&self, view: &[Event], tools: Vec<weft_ai::Tool>) -> Context {
        Context {
            system_prompt: self.system_prompt.clone(),
            messages: to_messages(view),
            tools,
        }
    }

    /// Run one step. Transient failures are retried with exponential backoff;
    /// cancellation is observed during the call and between attempts.
    pub async fn run(
        &self,
        view: &[Event],
        tools: Vec<weft_ai::Tool>,
        cancel: &CancellationToken,
    ) -> Result<(StepOutcome, Usage), StepError> {
        let context = self.context(view, tools);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                result = self.adapter.complete(&context, cancel.clone()) => result,
            };

            let error = match result {
                Ok(response) => {
                    return Ok((parse_response(&response.message), response.usage));
                }
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let message = error.to_string();
            match RetryDecision::from(&error) {
                RetryDecision::ContextOverflow => return Err(StepError::ContextOverflow(message)),
                RetryDecision::Retry if attempt < max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    tracing::warn!(
                        "Model call failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt,
                        max_attempts,
                        message,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(StepError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                _ => {
                    return Err(StepError::ProviderFailure {
                        attempts: attempt,
                        message,
                    });
                }
            }
        }
    }
}

/// Classify a model message. Anything that is not a well-formed batch of
/// tool calls is treated as a final answer carrying the raw text.
pub fn parse_response(message: &Message) -> StepOutcome {
    let Message::Assistant { content, .. } = message else {
        return StepOutcome::Final {
            text: raw_text(message),
        };
    };

    let mut calls = Vec::new();
    for block in content {
        let Content::ToolCall {
            id,
            name,
            arguments,
        } = block
        else {
            continue;
        };

        let arguments = match arguments {
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(parsed) => parsed,
                Err(_) => {
                    return StepOutcome::Final {
                        text: raw_text(message),
                    };
                }
            },
            other => other.clone(),
        };
        if name.trim().is_empty() || !arguments.is_object() {
            return StepOutcome::Final {
                text: raw_text(message),
            };
        }

        let id = if id.is_empty() {
            format!("call_{}", uuid::Uuid::new_v4().simple())
        } else {
            id.clone()
        };
        calls.push(ToolCall::new(id, name.clone(), arguments));
    }

    let text = message.text();
    if calls.is_empty() {
        StepOutcome::Final { text }
    } else {
        StepOutcome::Actions { text, calls }
    }
}

fn raw_text(message: &Message) -> String {
    let text = message.text();
    if !text.is_empty() {
        return text;
    }
    serde_json::to_string(message.content()).unwrap_or_default()
}

const SKIPPED_RESULT: &str = "Skipped: this call was not executed";

/// Format a condensed view as model messages.
///
/// Every tool call gets exactly one result, placed before any later user
/// message. A user message or summary that lands while a call is still
/// awaiting its result is held back until that result is in. Calls whose
/// result never appears in the view (dropped after a rejection, condensed
/// away, or cut off by the next turn) are answered as skipped.
pub fn to_messages(view: &[Event]) -> Vec<Message> {
    let answered: HashSet<&str> = view
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::Observation { tool_call_id, .. }
            | EventKind::ActionRejected { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();
    let mut history = History::new(answered);

    for event in view {
        match &event.kind {
            EventKind::UserMessage { text } => history.push_user(Message::user(text)),
            EventKind::AgentMessage { text, tool_calls } => {
                history.close_turn();
                let mut content = Vec::new();
                if !text.is_empty() {
                    content.push(Content::text(text));
                }
                for call in tool_calls {
                    content.push(Content::tool_call(&call.id, &call.name, call.arguments.clone()));
                    history.open.push((call.id.clone(), call.name.clone()));
                }
                history.messages.push(Message::assistant(content));
            }
            EventKind::Observation {
                tool_call_id,
                tool,
                result,
            } => {
                if history.is_open(tool_call_id) {
                    history.answer(tool_call_id, tool, result.to_text(), !result.is_success());
                } else {
                    // Its call was condensed away or already closed
                    history.push_user(Message::user(format!(
                        "[Tool result ({})]: {}",
                        tool,
                        result.to_text()
                    )));
                }
            }
            EventKind::ActionRejected {
                tool_call_id,
                tool,
                reason,
                timed_out,
            } => {
                let text = if *timed_out {
                    format!("Action rejected: confirmation timed out ({})", reason)
                } else {
                    format!("Action rejected by user: {}", reason)
                };
                if history.is_open(tool_call_id) {
                    history.answer(tool_call_id, tool, text, true);
                    // The rest of the batch was dropped with this rejection
                    history.close_turn();
                } else {
                    history.push_user(Message::user(format!("[Tool rejected ({})]: {}", tool, text)));
                }
            }
            EventKind::Summary { text, .. } => history.push_user(Message::user(format!(
                "<context-summary>\n{}\n</context-summary>",
                text
            ))),
            _ => {}
        }
    }

    history.finish()
}

/// Message builder that keeps tool results adjacent to their calls
struct History<'a> {
    messages: Vec<Message>,
    /// Calls of the latest assistant turn still waiting for a result
    open: Vec<(String, String)>,
    /// User-role messages waiting for the open calls to be answered
    held: Vec<Message>,
    /// Call ids that have a result somewhere in the view
    answered: HashSet<&'a str>,
}

impl<'a> History<'a> {
    fn new(answered: HashSet<&'a str>) -> Self {
        Self {
            messages: Vec::new(),
            open: Vec::new(),
            held: Vec::new(),
            answered,
        }
    }

    fn is_open(&self, id: &str) -> bool {
        self.open.iter().any(|(open, _)| open == id)
    }

    fn answer(&mut self, id: &str, tool: &str, text: String, is_error: bool) {
        self.open.retain(|(open, _)| open != id);
        self.messages.push(Message::tool_result(
            id,
            tool,
            vec![Content::text(text)],
            is_error,
        ));
        if self.open.is_empty() {
            self.messages.append(&mut self.held);
        }
    }

    fn push_user(&mut self, message: Message) {
        // Open calls with no result anywhere ahead will never be answered
        let (pending, lost): (Vec<_>, Vec<_>) = self
            .open
            .drain(..)
            .partition(|(id, _)| self.answered.contains(id.as_str()));
        self.open = pending;
        self.skip(lost);

        if self.open.is_empty() {
            self.messages.push(message);
        } else {
            self.held.push(message);
        }
    }

    /// Answer every open call as skipped and release held messages
    fn close_turn(&mut self) {
        let open = std::mem::take(&mut self.open);
        self.skip(open);
        self.messages.append(&mut self.held);
    }

    fn skip(&mut self, calls: Vec<(String, String)>) {
        for (id, tool) in calls {
            self.messages.push(Message::tool_result(
                id,
                tool,
                vec![Content::text(SKIPPED_RESULT)],
                true,
            ));
        }
    }

    fn finish(mut self) -> Vec<Message> {
        self.close_turn();
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ObservationResult, Seq};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use uuid::Uuid;
    use weft_ai::ModelResponse;

    struct ScriptedAdapter {
        script: Mutex<VecDeque<weft_ai::Result<ModelResponse>>>,
        calls: Mutex<Vec<Context>>,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<weft_ai::Result<ModelResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ModelAdapter for ScriptedAdapter {
        async fn complete(
            &self,
            context: &Context,
            _cancel: CancellationToken,
        ) -> weft_ai::Result<ModelResponse> {
            self.calls.lock().push(context.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ModelResponse::new(Message::assistant(vec![Content::text("done")]))))
        }
    }

    struct HangingAdapter;

    #[async_trait]
    impl ModelAdapter for HangingAdapter {
        async fn complete(
            &self,
            _context: &Context,
            _cancel: CancellationToken,
        ) -> weft_ai::Result<ModelResponse> {
            std::future::pending().await
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn reply(content: Vec<Content>) -> weft_ai::Result<ModelResponse> {
        Ok(ModelResponse::new(Message::assistant(content)))
    }

    fn events(kinds: Vec<EventKind>) -> Vec<Event> {
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

    #[test]
    fn test_parse_final_message() {
        let outcome = parse_response(&Message::assistant(vec![Content::text("All done.")]));
        assert_eq!(
            outcome,
            StepOutcome::Final {
                text: "All done.".into()
            }
        );
    }

    #[test]
    fn test_parse_actions_in_order() {
        let outcome = parse_response(&Message::assistant(vec![
            Content::text("Checking"),
            Content::tool_call("c1", "list_dir", json!({"path": "."})),
            Content::tool_call("c2", "read_file", json!("{\"path\": \"a\"}")),
        ]));
        match outcome {
            StepOutcome::Actions { text, calls } => {
                assert_eq!(text, "Checking");
                assert_eq!(calls[0], ToolCall::new("c1", "list_dir", json!({"path": "."})));
                assert_eq!(calls[1], ToolCall::new("c2", "read_file", json!({"path": "a"})));
            }
            other => panic!("expected actions, got {:?}", other),
        }
    }

    #[test]
    fn test_unclassifiable_responses_become_final_raw_text() {
        let bad_json = Message::assistant(vec![
            Content::text("oops"),
            Content::tool_call("c1", "list_dir", json!("{not json")),
        ]);
        assert_eq!(
            parse_response(&bad_json),
            StepOutcome::Final {
                text: "oops".into()
            }
        );

        let nameless = Message::assistant(vec![Content::tool_call("c1", " ", json!({}))]);
        match parse_response(&nameless) {
            StepOutcome::Final { text } => assert!(text.contains("tool_call")),
            other => panic!("expected final, got {:?}", other),
        }

        let array_args = Message::assistant(vec![Content::tool_call("c1", "x", json!([1]))]);
        assert!(matches!(parse_response(&array_args), StepOutcome::Final { .. }));

        assert_eq!(
            parse_response(&Message::user("echo")),
            StepOutcome::Final {
                text: "echo".into()
            }
        );
    }

    #[test]
    fn test_missing_call_id_is_generated() {
        let outcome = parse_response(&Message::assistant(vec![Content::tool_call(
            "",
            "list_dir",
            json!({}),
        )]));
        match outcome {
            StepOutcome::Actions { calls, .. } => assert!(calls[0].id.starts_with("call_")),
            other => panic!("expected actions, got {:?}", other),
        }
    }

    #[test]
    fn test_messages_answer_every_call() {
        let view = events(vec![
            EventKind::UserMessage {
                text: "clean up".into(),
            },
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![
                    ToolCall::new("c1", "list_dir", json!({})),
                    ToolCall::new("c2", "delete_file", json!({"path": "a"})),
                    ToolCall::new("c3", "delete_file", json!({"path": "b"})),
                ],
            },
            EventKind::Observation {
                tool_call_id: "c1".into(),
                tool: "list_dir".into(),
                result: ObservationResult::success(json!(["a", "b"])),
            },
            EventKind::ActionRejected {
                tool_call_id: "c2".into(),
                tool: "delete_file".into(),
                reason: "not authorized".into(),
                timed_out: false,
            },
        ]);

        let messages = to_messages(&view);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role(), "user");
        assert_eq!(messages[1].tool_calls().len(), 3);
        match &messages[3] {
            Message::ToolResult {
                tool_call_id,
                is_error,
                ..
            } => {
                assert_eq!(tool_call_id, "c2");
                assert!(is_error);
                assert!(messages[3].text().contains("not authorized"));
            }
            other => panic!("expected tool result, got {:?}", other),
        }
        match &messages[4] {
            Message::ToolResult { tool_call_id, .. } => assert_eq!(tool_call_id, "c3"),
            other => panic!("expected skipped result, got {:?}", other),
        }
        assert_eq!(messages[4].text(), SKIPPED_RESULT);
    }

    #[test]
    fn test_orphaned_result_becomes_user_text() {
        let view = events(vec![
            EventKind::Summary {
                first_seq: 1,
                last_seq: 3,
                text: "listed the root".into(),
            },
            EventKind::Observation {
                tool_call_id: "gone".into(),
                tool: "list_dir".into(),
                result: ObservationResult::success(json!("a.txt")),
            },
        ]);
        let messages = to_messages(&view);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role(), "user");
        assert_eq!(messages[1].text(), "[Tool result (list_dir)]: a.txt");
    }

    #[test]
    fn test_summary_becomes_tagged_user_message() {
        let view = events(vec![EventKind::Summary {
            first_seq: 0,
            last_seq: 4,
            text: "did things".into(),
        }]);
        let messages = to_messages(&view);
        assert_eq!(
            messages[0].text(),
            "<context-summary>\ndid things\n</context-summary>"
        );
    }

    fn results_for<'a>(messages: &'a [Message], id: &str) -> Vec<&'a Message> {
        messages
            .iter()
            .filter(|m| matches!(m, Message::ToolResult { tool_call_id, .. } if tool_call_id == id))
            .collect()
    }

    #[test]
    fn test_message_sent_while_call_pending_follows_its_result() {
        let view = events(vec![
            EventKind::UserMessage {
                text: "delete a".into(),
            },
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![ToolCall::new("d1", "delete_file", json!({"path": "a"}))],
            },
            EventKind::UserMessage {
                text: "also b please".into(),
            },
            EventKind::Observation {
                tool_call_id: "d1".into(),
                tool: "delete_file".into(),
                result: ObservationResult::success(json!({"deleted": "a"})),
            },
        ]);

        let messages = to_messages(&view);
        let roles: Vec<&str> = messages.iter().map(|m| m.role()).collect();
        assert_eq!(roles, ["user", "assistant", "tool_result", "user"]);

        let results = results_for(&messages, "d1");
        assert_eq!(results.len(), 1);
        assert_ne!(results[0].text(), SKIPPED_RESULT);
        assert_eq!(messages[3].text(), "also b please");
    }

    #[test]
    fn test_summary_after_unanswered_call_is_preceded_by_skip() {
        let view = events(vec![
            EventKind::UserMessage {
                text: "look around".into(),
            },
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![ToolCall::new("c1", "list_dir", json!({}))],
            },
            EventKind::Summary {
                first_seq: 2,
                last_seq: 6,
                text: "listed files".into(),
            },
            EventKind::AgentMessage {
                text: "done".into(),
                tool_calls: vec![],
            },
        ]);

        let messages = to_messages(&view);
        let roles: Vec<&str> = messages.iter().map(|m| m.role()).collect();
        assert_eq!(roles, ["user", "assistant", "tool_result", "user", "assistant"]);
        assert_eq!(messages[2].text(), SKIPPED_RESULT);
        assert!(messages[3].text().starts_with("<context-summary>"));
    }

    #[test]
    fn test_summary_waits_for_result_kept_in_tail() {
        let view = events(vec![
            EventKind::AgentMessage {
                text: String::new(),
                tool_calls: vec![
                    ToolCall::new("c1", "list_dir", json!({})),
                    ToolCall::new("c2", "list_dir", json!({"path": "src"})),
                ],
            },
            EventKind::Summary {
                first_seq: 1,
                last_seq: 1,
                text: "listed root".into(),
            },
            EventKind::Observation {
                tool_call_id: "c2".into(),
                tool: "list_dir".into(),
                result: ObservationResult::success(json!(["lib.rs"])),
            },
        ]);

        let messages = to_messages(&view);
        let roles: Vec<&str> = messages.iter().map(|m| m.role()).collect();
        assert_eq!(roles, ["assistant", "tool_result", "tool_result", "user"]);
        assert_eq!(results_for(&messages, "c1")[0].text(), SKIPPED_RESULT);
        assert_eq!(results_for(&messages, "c2").len(), 1);
        assert!(messages[3].text().contains("listed root"));
    }

    #[tokio::test]
    async fn test_context_carries_system_prompt_and_tools() {
        let adapter = ScriptedAdapter::new(vec![]);
        let step = AgentStep::new(adapter.clone(), fast_retry(1))
            .with_system_prompt(Some("be careful".into()));
        let tools = vec![weft_ai::Tool::new("list_dir", "List", json!({"type": "object"}))];

        step.run(&events(vec![]), tools, &CancellationToken::new())
            .await
            .unwrap();

        let calls = adapter.calls.lock();
        assert_eq!(calls[0].system_prompt.as_deref(), Some("be careful"));
        assert_eq!(calls[0].tools[0].name, "list_dir");
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let adapter = ScriptedAdapter::new(vec![
            Err(weft_ai::Error::Transport("connection reset".into())),
            reply(vec![Content::text("ok")]),
        ]);
        let step = AgentStep::new(adapter.clone(), fast_retry(3));

        let (outcome, _) = step
            .run(&events(vec![]), vec![], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Final { text: "ok".into() });
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let adapter = ScriptedAdapter::new(vec![
            Err(weft_ai::Error::RateLimited { retry_after: None }),
            Err(weft_ai::Error::RateLimited { retry_after: None }),
            Err(weft_ai::Error::RateLimited { retry_after: None }),
            reply(vec![Content::text("too late")]),
        ]);
        let step = AgentStep::new(adapter.clone(), fast_retry(3));

        let err = step
            .run(&events(vec![]), vec![], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::ProviderFailure { attempts: 3, .. }));
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let adapter = ScriptedAdapter::new(vec![Err(weft_ai::Error::Auth("bad key".into()))]);
        let step = AgentStep::new(adapter.clone(), fast_retry(5));

        let err = step
            .run(&events(vec![]), vec![], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::ProviderFailure { attempts: 1, .. }));
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_context_overflow_is_reported() {
        let adapter = ScriptedAdapter::new(vec![Err(weft_ai::Error::api(
            "invalid_request_error",
            "prompt is too long",
        ))]);
        let step = AgentStep::new(adapter, fast_retry(3));
        let err = step
            .run(&events(vec![]), vec![], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::ContextOverflow(_)));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_model_call() {
        let step = AgentStep::new(Arc::new(HangingAdapter), fast_retry(3));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = step.run(&events(vec![]), vec![], &cancel).await.unwrap_err();
        assert_eq!(err, StepError::Cancelled);
    }
}
