//! Tool contract and descriptors

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::gate::Risk;

/// A validated request to run a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub declared_risk: Risk,
}

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Structured payload, checked against the tool's output schema
    pub payload: Value,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            is_error: false,
        }
    }

    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self::ok(Value::String(text.into()))
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            payload: Value::String(message.into()),
            is_error: true,
        }
    }

    /// Get the payload as display text
    pub fn text_content(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Runs actions for one tool
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the action. Long-running executors should watch `cancel`.
    async fn execute(&self, action: &Action, cancel: CancellationToken) -> ToolResult;
}

/// Type alias for a shared executor
pub type BoxedExecutor = Arc<dyn Executor>;

/// Maps arguments to a declared risk
pub type RiskFn = Arc<dyn Fn(&Value) -> Risk + Send + Sync>;

/// Everything the registry needs to know about a tool
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub(crate) risk: RiskFn,
    pub(crate) executor: BoxedExecutor,
}

impl ToolDescriptor {
    /// Describe a tool with a fixed low risk
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        output_schema: Value,
        executor: impl Executor + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema,
            risk: Arc::new(|_| Risk::Low),
            executor: Arc::new(executor),
        }
    }

    /// Declare a fixed risk for every call
    pub fn with_risk(mut self, risk: Risk) -> Self {
        self.risk = Arc::new(move |_| risk);
        self
    }

    /// Declare risk as a function of the arguments
    pub fn with_risk_fn(mut self, f: impl Fn(&Value) -> Risk + Send + Sync + 'static) -> Self {
        self.risk = Arc::new(f);
        self
    }

    /// Risk declared for these arguments
    pub fn classify(&self, arguments: &Value) -> Risk {
        (self.risk)(arguments)
    }

    /// Convert to the schema advertised to the model
    pub fn to_api_tool(&self) -> weft_ai::Tool {
        weft_ai::Tool::new(&self.name, &self.description, self.input_schema.clone())
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
