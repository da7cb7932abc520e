//! Model adapter abstraction
//!
//! A [`ModelAdapter`] is the black box the engine calls to get the model's next
//! turn. Provider protocols live outside this workspace; they only need to map
//! their failures onto [`Error`] so the engine can tell transient failures from
//! terminal ones.

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{Context, Error, Message, Result, Usage};

/// A completed model turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The assistant message produced by the model
    pub message: Message,
    /// Token usage reported for this call
    #[serde(default)]
    pub usage: Usage,
}

impl ModelResponse {
    /// Wrap an assistant message with empty usage
    pub fn new(message: Message) -> Self {
        Self {
            message,
            usage: Usage::default(),
        }
    }
}

/// Adapter to a language model provider
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Request the next assistant turn for `context`.
    ///
    /// Implementations should return [`Error::Aborted`] promptly once `cancel`
    /// fires; the engine also stops waiting on its own.
    async fn complete(&self, context: &Context, cancel: CancellationToken) -> Result<ModelResponse>;
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first call
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay after a given failed attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Check if an error message describes a transient failure.
///
/// String fallback for adapters that wrap provider errors into
/// [`Error::UnexpectedResponse`] or similar.
pub fn is_retryable_error(error: &str) -> bool {
    // Rate limit errors
    if error.contains("429") || error.contains("rate limit") || error.contains("Rate limit") {
        return true;
    }
    // Transient network errors
    if error.contains("timeout") || error.contains("Timeout") {
        return true;
    }
    if error.contains("connection") || error.contains("Connection") {
        return true;
    }
    // Server errors (5xx)
    if error.contains("500")
        || error.contains("502")
        || error.contains("503")
        || error.contains("504")
    {
        return true;
    }
    error.contains("overloaded") || error.contains("Overloaded")
}

/// Compiled regex patterns for detecting context overflow errors across providers.
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)content.?too.?large",
        r"(?i)prompt.?too.?long",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)maximum.?number.?of.?tokens",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        // "max_tokens" only when followed by overflow language (not config errors)
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)input.?token.?limit",
        r"(?i)context.?overflow",
        r"(?i)sequence.?too.?long",
        r"(?i)context.?size.?exceed",
        r"(?i)n_ctx",
        r"(?i)total.?tokens?.?exceed",
        r"(?i)max_prompt_tokens",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// HTTP 400 references in error strings ("400 Bad Request", "HTTP 400", "status: 400").
static HTTP_400_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:status|http|error)[:\s]*400\b|\b400\s+bad\s+request").ok()
});

/// Check if an error message indicates a context overflow / too many tokens
pub fn is_context_overflow(error: &str) -> bool {
    if HTTP_400_PATTERN
        .as_ref()
        .is_some_and(|re| re.is_match(error))
    {
        let lower = error.to_lowercase();
        if lower.contains("token") || lower.contains("context") || lower.contains("length") {
            return true;
        }
    }

    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}

impl From<&Error> for RetryDecision {
    fn from(error: &Error) -> Self {
        let message = error.to_string();
        if error.is_context_overflow() || is_context_overflow(&message) {
            RetryDecision::ContextOverflow
        } else if error.is_retryable() || is_retryable_error(&message) {
            RetryDecision::Retry
        } else {
            RetryDecision::Fail
        }
    }
}

/// How a caller should react to a failed model call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient failure, try again after backoff
    Retry,
    /// The request no longer fits the model's context window
    ContextOverflow,
    /// Terminal failure
    Fail,
}
