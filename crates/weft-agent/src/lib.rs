//! weft-agent: event-sourced conversation engine
//!
//! Every conversation is an append-only log of events. Derived state is a
//! fold over the log, so a conversation can be paused, persisted and resumed
//! in another process. The engine drives an agent through tool calls, holding
//! risky ones for human confirmation, and condenses long histories before
//! each model call.

pub mod condenser;
pub mod config;
mod conversation;
pub mod engine;
pub mod error;
pub mod event;
pub mod gate;
pub mod handle;
pub mod log;
pub mod notifier;
pub mod registry;
pub mod state;
pub mod step;
pub mod store;
pub mod stuck;
pub mod tool;

pub use condenser::{CondensationPolicy, Condenser, LlmSummarizer, Summarizer};
pub use config::{ConversationConfig, EngineConfig};
pub use engine::Engine;
pub use error::{Error, Result};
pub use event::{
    ConversationId, ErrorKind, Event, EventKind, FailureKind, FinishReason, ObservationResult,
    Seq, ToolCall,
};
pub use gate::{ConfirmationGate, ConfirmationPolicy, Risk, Verdict};
pub use handle::ConversationHandle;
pub use log::EventLog;
pub use notifier::{EventStream, Notifier, WebhookConfig, WebhookSink};
pub use registry::ToolRegistry;
pub use state::{ConversationState, ExecutionStatus, PendingAction};
pub use step::{AgentStep, StepError, StepOutcome};
pub use store::{JsonlStore, LogStore, MemoryStore};
pub use tool::{Action, Executor, ToolDescriptor, ToolResult};
