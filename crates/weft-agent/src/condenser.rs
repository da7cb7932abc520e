//! Context condensation for long conversations
//!
//! When the model-visible part of a log grows past the configured budget, the
//! condenser keeps the first and last events verbatim and replaces everything
//! in between with a summary. Summaries are persisted as events, so a later
//! condensation builds on the previous summary instead of re-reading what it
//! already covers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use weft_ai::{Context, Message, ModelAdapter};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Seq};

/// Configuration for context condensation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondensationPolicy {
    /// Whether condensation is enabled
    pub enabled: bool,
    /// Maximum number of events in the model's view
    pub max_events: usize,
    /// Leading events always kept verbatim
    pub keep_first: usize,
    /// Trailing events always kept verbatim
    pub keep_last: usize,
}

impl Default for CondensationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events: 120,
            keep_first: 4,
            keep_last: 20,
        }
    }
}

impl CondensationPolicy {
    /// Reject budgets that cannot hold the events they promise to keep
    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(Error::Config(
                "condenser max_events must be at least 1".to_string(),
            ));
        }
        if self.keep_first + self.keep_last > self.max_events {
            return Err(Error::Config(format!(
                "condenser keeps {} leading and {} trailing events, more than max_events = {}",
                self.keep_first, self.keep_last, self.max_events
            )));
        }
        Ok(())
    }
}

/// A summary the engine should append to the log
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryDraft {
    pub first_seq: Seq,
    pub last_seq: Seq,
    pub text: String,
}

impl SummaryDraft {
    pub fn into_kind(self) -> EventKind {
        EventKind::Summary {
            first_seq: self.first_seq,
            last_seq: self.last_seq,
            text: self.text,
        }
    }
}

/// Output of a condensation pass
#[derive(Debug, Clone)]
pub struct Condensation {
    /// Events to show the model
    pub view: Vec<Event>,
    /// New summary to persist, if one was produced
    pub summary: Option<SummaryDraft>,
}

/// Produces summary text for elided events
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `events`, folding in `previous` when an earlier summary exists.
    /// `events` never contains summary events.
    async fn summarize(&self, previous: Option<&str>, events: &[Event]) -> Result<String>;
}

/// Condenses event logs under a [`CondensationPolicy`]
#[derive(Clone)]
pub struct Condenser {
    policy: CondensationPolicy,
    summarizer: Arc<dyn Summarizer>,
}

impl Condenser {
    /// Create a condenser, rejecting an impossible policy
    pub fn new(policy: CondensationPolicy, summarizer: Arc<dyn Summarizer>) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy, summarizer })
    }

    pub fn policy(&self) -> &CondensationPolicy {
        &self.policy
    }

    /// Build the model's view of `events`, condensing if it exceeds the budget.
    pub async fn condense(&self, events: &[Event]) -> Result<Condensation> {
        let view = model_view(events);
        if !self.policy.enabled {
            return Ok(Condensation {
                view,
                summary: None,
            });
        }
        self.condense_to(view, self.policy.max_events).await
    }

    /// Condense even if the view fits, halving it. Used after the model
    /// reported a context overflow.
    pub async fn force(&self, events: &[Event]) -> Result<Condensation> {
        let view = model_view(events);
        let floor = self.policy.keep_first + self.policy.keep_last + 1;
        let budget = (view.len() / 2).max(floor);
        if budget >= view.len() {
            return Err(Error::condensation(format!(
                "only {} events in view, nothing left to condense",
                view.len()
            )));
        }
        self.condense_to(view, budget).await
    }

    async fn condense_to(&self, view: Vec<Event>, budget: usize) -> Result<Condensation> {
        if view.len() <= budget {
            return Ok(Condensation {
                view,
                summary: None,
            });
        }

        let keep_first = self.policy.keep_first;
        let keep_last = self.policy.keep_last;

        // An existing summary must stay in the elided range so it gets carried forward
        let mut head_len = keep_first.min(view.len());
        if let Some(pos) = view[..head_len].iter().position(is_summary) {
            head_len = pos;
        }
        let target = (budget / 2).max(keep_first + keep_last + 1).min(budget);
        let tail_len = target
            .saturating_sub(head_len + 1)
            .max(keep_last)
            .min(view.len() - head_len);

        let middle = &view[head_len..view.len() - tail_len];
        let head = &view[..head_len];
        let tail = &view[view.len() - tail_len..];

        let previous = middle.iter().find(|e| is_summary(e));
        let raw: Vec<Event> = middle.iter().filter(|e| !is_summary(e)).cloned().collect();

        if head_len + 1 + tail_len > budget {
            tracing::debug!(
                "No room for a summary, eliding {} events without one",
                middle.len()
            );
            return Ok(Condensation {
                view: head.iter().chain(tail).cloned().collect(),
                summary: None,
            });
        }

        let Some(last_raw) = raw.last() else {
            // Only the previous summary sits between head and tail
            return Ok(Condensation {
                view: head.iter().chain(previous).chain(tail).cloned().collect(),
                summary: None,
            });
        };

        let (previous_text, previous_first) = match previous.map(|e| &e.kind) {
            Some(EventKind::Summary {
                first_seq, text, ..
            }) => (Some(text.as_str()), Some(*first_seq)),
            _ => (None, None),
        };

        tracing::info!(
            "Condensing {} events ({} in view, budget {})",
            raw.len(),
            view.len(),
            budget
        );
        let text = self.summarizer.summarize(previous_text, &raw).await?;

        let draft = SummaryDraft {
            first_seq: previous_first.unwrap_or(raw[0].seq),
            last_seq: last_raw.seq,
            text,
        };
        let synthetic = Event {
            seq: draft.first_seq,
            conversation_id: last_raw.conversation_id,
            timestamp: Utc::now(),
            parent: None,
            kind: draft.clone().into_kind(),
        };

        let mut condensed = Vec::with_capacity(head_len + 1 + tail_len);
        condensed.extend_from_slice(head);
        condensed.push(synthetic);
        condensed.extend_from_slice(tail);

        Ok(Condensation {
            view: condensed,
            summary: Some(draft),
        })
    }
}

fn is_summary(event: &Event) -> bool {
    matches!(event.kind, EventKind::Summary { .. })
}

/// Model-visible events with the latest persisted summary standing in for
/// the range it covers.
pub fn model_view(events: &[Event]) -> Vec<Event> {
    let visible = events
        .iter()
        .filter(|e| e.kind.is_model_visible() && !is_summary(e));

    let latest = events.iter().rev().find(|e| is_summary(e));
    let Some(summary) = latest else {
        return visible.cloned().collect();
    };
    let (first_seq, last_seq) = match &summary.kind {
        EventKind::Summary {
            first_seq,
            last_seq,
            ..
        } => (*first_seq, *last_seq),
        _ => return visible.cloned().collect(),
    };

    let mut view = Vec::new();
    let mut inserted = false;
    for event in visible {
        if (first_seq..=last_seq).contains(&event.seq) {
            continue;
        }
        if event.seq > last_seq && !inserted {
            view.push(summary.clone());
            inserted = true;
        }
        view.push(event.clone());
    }
    if !inserted {
        view.push(summary.clone());
    }
    view
}

// --- Summarization prompts ---

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
You are a specialized summarization model. Your task is to create a comprehensive \
yet concise summary of an agent conversation. This summary will replace the original \
events in the agent's context, so it must capture all essential information \
needed to continue the task effectively.";

const SUMMARIZATION_PROMPT: &str = "\
Please provide a detailed summary of this conversation so far. The summary should:

1. **Goal**: What is the user's primary objective?
2. **Progress**: What has been accomplished so far? List the actions taken and their results.
3. **Key Decisions**: What important decisions were made, and which actions were rejected?
4. **Next Steps**: What was the agent about to do next?
5. **Critical Context**: Any important constraints, preferences, or context that would be lost.

Format your response as a structured summary using the headers above. Be thorough but concise.

<conversation>
{conversation}
</conversation>";

const UPDATE_SUMMARIZATION_PROMPT: &str = "\
Below is an existing summary of an earlier portion of this conversation, followed by \
new events that occurred after that summary. Please create an updated, comprehensive \
summary that integrates both.

<previous-summary>
{previous_summary}
</previous-summary>

The updated summary should:

1. **Goal**: What is the user's primary objective? (update if it has evolved)
2. **Progress**: What has been accomplished so far? Include both previous and new progress.
3. **Key Decisions**: What important decisions were made, and which actions were rejected?
4. **Next Steps**: What was about to happen next?
5. **Critical Context**: Any important constraints, preferences, or context.

<new-events>
{conversation}
</new-events>";

/// Longest tool result included verbatim in a summarization prompt
const MAX_RESULT_CHARS: usize = 2000;

/// Serialize events to plain text for the summarization prompt.
/// Uses a transcript format so the model does not try to continue the conversation.
fn serialize_events_for_summary(events: &[Event]) -> String {
    let mut out = String::new();

    for event in events {
        match &event.kind {
            EventKind::UserMessage { text } => {
                out.push_str("[User]: ");
                out.push_str(text);
                out.push('\n');
            }
            EventKind::AgentMessage { text, tool_calls } => {
                if !text.is_empty() {
                    out.push_str("[Assistant]: ");
                    out.push_str(text);
                    out.push('\n');
                }
                if !tool_calls.is_empty() {
                    let calls: Vec<String> = tool_calls
                        .iter()
                        .map(|c| format!("{}({})", c.name, c.arguments))
                        .collect();
                    out.push_str("[Assistant tool calls]: ");
                    out.push_str(&calls.join("; "));
                    out.push('\n');
                }
            }
            EventKind::Observation { tool, result, .. } => {
                let label = if result.is_success() {
                    format!("[Tool result ({})]: ", tool)
                } else {
                    format!("[Tool error ({})]: ", tool)
                };
                out.push_str(&label);
                let text = result.to_text();
                if text.chars().count() > MAX_RESULT_CHARS {
                    out.extend(text.chars().take(MAX_RESULT_CHARS));
                    out.push_str("...(truncated)");
                } else {
                    out.push_str(&text);
                }
                out.push('\n');
            }
            EventKind::ActionRejected { tool, reason, .. } => {
                out.push_str(&format!("[Tool rejected ({})]: {}\n", tool, reason));
            }
            _ => {}
        }
    }

    out
}

/// Summarizes with the conversation's model adapter
pub struct LlmSummarizer {
    adapter: Arc<dyn ModelAdapter>,
}

impl LlmSummarizer {
    pub fn new(adapter: Arc<dyn ModelAdapter>) -> Self {
        Self { adapter }
    }

    fn prompt(previous: Option<&str>, events: &[Event]) -> String {
        let conversation = serialize_events_for_summary(events);
        match previous {
            Some(previous) => UPDATE_SUMMARIZATION_PROMPT
                .replace("{previous_summary}", previous)
                .replace("{conversation}", &conversation),
            None => SUMMARIZATION_PROMPT.replace("{conversation}", &conversation),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, previous: Option<&str>, events: &[Event]) -> Result<String> {
        let mut context = Context::with_system(SUMMARIZATION_SYSTEM_PROMPT);
        context.push(Message::user(Self::prompt(previous, events)));

        let response = self
            .adapter
            .complete(&context, CancellationToken::new())
            .await
            .map_err(|e| Error::condensation(format!("summarization call failed: {}", e)))?;

        let text = response.message.text();
        if text.trim().is_empty() {
            return Err(Error::condensation("summarization returned no text"));
        }
        Ok(text)
    }
}
