//! Error types for weft-agent

use thiserror::Error;

use crate::event::{ConversationId, Seq};
use crate::state::ExecutionStatus;

/// Result type alias using weft-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model adapter layer
    #[error(transparent)]
    Ai(#[from] weft_ai::Error),

    /// Reading or writing persisted logs failed
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding a log record failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid engine or conversation configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A persisted log is corrupt or out of order
    #[error("Log integrity violation in conversation {conversation_id}: {detail}")]
    LogIntegrity {
        conversation_id: ConversationId,
        detail: String,
    },

    /// A tool with this name is already registered
    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    /// No tool with this name is registered
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A tool schema could not be compiled
    #[error("Invalid schema for tool '{tool}': {detail}")]
    InvalidSchema { tool: String, detail: String },

    /// No conversation with this id exists
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// A conversation with this id is already loaded or stored
    #[error("Conversation already exists: {0}")]
    ConversationExists(ConversationId),

    /// The operation is not allowed in the conversation's current status
    #[error("Cannot {operation} while conversation is {status}")]
    InvalidState {
        operation: &'static str,
        status: ExecutionStatus,
    },

    /// The action reference does not name the action awaiting confirmation
    #[error("No action awaiting confirmation at seq {0}")]
    NoPendingAction(Seq),

    /// Summarizing elided history failed
    #[error("Condensation error: {0}")]
    Condensation(String),

    /// The conversation task is no longer running
    #[error("Conversation task stopped")]
    Closed,
}

impl Error {
    /// Build a condensation error from anything displayable
    pub fn condensation(detail: impl std::fmt::Display) -> Self {
        Error::Condensation(detail.to_string())
    }

    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_context_overflow(),
            _ => false,
        }
    }
}
