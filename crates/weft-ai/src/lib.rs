//! weft-ai: Model adapter contract
//!
//! This crate defines the message types exchanged with a language model, the
//! [`ModelAdapter`] trait a provider integration implements, and the error
//! taxonomy the engine uses to decide whether a failed call is worth retrying.

pub mod adapter;
pub mod error;
pub mod types;

pub use adapter::{
    ModelAdapter, ModelResponse, RetryConfig, RetryDecision, is_context_overflow, is_retryable_error,
};
pub use error::{Error, Result};
pub use types::*;
