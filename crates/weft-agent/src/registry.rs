//! Tool registry and dispatch
//!
//! The registry owns the name → tool mapping, compiles each tool's schemas once
//! at registration, and turns every way a tool can fail into an
//! [`ObservationResult`] instead of an error the engine has to handle.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::{FailureKind, ObservationResult};
use crate::gate::Risk;
use crate::tool::{Action, BoxedExecutor, Executor, ToolDescriptor};

struct Entry {
    descriptor: ToolDescriptor,
    input: Arc<jsonschema::Validator>,
    output: Arc<jsonschema::Validator>,
}

/// Registered tools, in registration order
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<Entry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fully constructed tool.
    ///
    /// Fails if the name is taken or either schema does not compile.
    pub fn register(&self, descriptor: ToolDescriptor) -> Result<()> {
        let input = compile(&descriptor.name, &descriptor.input_schema)?;
        let output = compile(&descriptor.name, &descriptor.output_schema)?;

        let mut tools = self.tools.write();
        if tools.iter().any(|e| e.descriptor.name == descriptor.name) {
            return Err(Error::DuplicateTool(descriptor.name));
        }
        tracing::debug!("Registered tool '{}'", descriptor.name);
        tools.push(Entry {
            descriptor,
            input,
            output,
        });
        Ok(())
    }

    /// Replace a tool's executor. Dispatches already running keep the old one.
    pub fn swap_executor(&self, name: &str, executor: impl Executor + 'static) -> Result<()> {
        let mut tools = self.tools.write();
        let entry = tools
            .iter_mut()
            .find(|e| e.descriptor.name == name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;
        entry.descriptor.executor = Arc::new(executor);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().iter().any(|e| e.descriptor.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .iter()
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// The live tool set as advertised to the model
    pub fn schemas(&self) -> Vec<weft_ai::Tool> {
        self.tools
            .read()
            .iter()
            .map(|e| e.descriptor.to_api_tool())
            .collect()
    }

    /// Declared risk of calling `name` with `arguments`, or `None` for unknown tools
    pub fn classify(&self, name: &str, arguments: &Value) -> Option<Risk> {
        self.tools
            .read()
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| e.descriptor.classify(arguments))
    }

    /// Validate and run an action, converting every failure into an observation.
    pub async fn dispatch(&self, action: Action, cancel: CancellationToken) -> ObservationResult {
        let found = {
            let tools = self.tools.read();
            tools
                .iter()
                .find(|e| e.descriptor.name == action.tool_name)
                .map(|e| {
                    (
                        Arc::clone(&e.descriptor.executor),
                        Arc::clone(&e.input),
                        Arc::clone(&e.output),
                    )
                })
        };
        let Some((executor, input, output)) = found else {
            return ObservationResult::failure(
                FailureKind::UnknownTool,
                format!("Tool '{}' is not registered", action.tool_name),
            );
        };

        if let Some(message) = validate_with_validator(&action.arguments, &input) {
            tracing::debug!("Rejected arguments for '{}': {}", action.tool_name, message);
            return ObservationResult::failure(FailureKind::Validation, message);
        }

        let result = match run_executor(&executor, &action, cancel).await {
            Ok(result) => result,
            Err(panic) => {
                tracing::warn!("Tool '{}' panicked: {}", action.tool_name, panic);
                return ObservationResult::failure(
                    FailureKind::Executor,
                    format!("Tool panicked: {}", panic),
                );
            }
        };

        if result.is_error {
            return ObservationResult::failure(FailureKind::Executor, result.text_content());
        }

        match coerce_output(result.payload, &output) {
            Ok(payload) => ObservationResult::success(payload),
            Err(message) => {
                tracing::error!(
                    tool = %action.tool_name,
                    "Tool returned output violating its schema: {}",
                    message
                );
                ObservationResult::failure(FailureKind::ContractViolation, message)
            }
        }
    }
}

async fn run_executor(
    executor: &BoxedExecutor,
    action: &Action,
    cancel: CancellationToken,
) -> std::result::Result<crate::tool::ToolResult, String> {
    AssertUnwindSafe(executor.execute(action, cancel))
        .catch_unwind()
        .await
        .map_err(|panic| {
            if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        })
}

fn compile(tool: &str, schema: &Value) -> Result<Arc<jsonschema::Validator>> {
    jsonschema::validator_for(schema)
        .map(Arc::new)
        .map_err(|e| Error::InvalidSchema {
            tool: tool.to_string(),
            detail: e.to_string(),
        })
}

/// Accept the payload as-is, or a JSON document encoded in a string payload.
fn coerce_output(payload: Value, validator: &jsonschema::Validator) -> std::result::Result<Value, String> {
    let Some(message) = validate_with_validator(&payload, validator) else {
        return Ok(payload);
    };
    if let Value::String(raw) = &payload {
        if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
            if validator.is_valid(&parsed) {
                return Ok(parsed);
            }
        }
    }
    Err(message.replace("Tool argument validation failed", "Tool output validation failed"))
}

/// Validate a value using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(value: &Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(ToolResult);

    #[async_trait]
    impl Executor for Fixed {
        async fn execute(&self, _action: &Action, _cancel: CancellationToken) -> ToolResult {
            self.0.clone()
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Executor for Counting {
        async fn execute(&self, action: &Action, _cancel: CancellationToken) -> ToolResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            ToolResult::ok(json!({"entries": [action.arguments["path"].clone()]}))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Executor for Panicking {
        async fn execute(&self, _action: &Action, _cancel: CancellationToken) -> ToolResult {
            panic!("disk on fire")
        }
    }

    fn path_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    fn entries_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "entries": { "type": "array" } },
            "required": ["entries"]
        })
    }

    fn descriptor(name: &str, executor: impl Executor + 'static) -> ToolDescriptor {
        ToolDescriptor::new(name, "test tool", path_schema(), entries_schema(), executor)
    }

    fn action(tool: &str, arguments: Value) -> Action {
        Action {
            tool_call_id: "call_1".into(),
            tool_name: tool.into(),
            arguments,
            declared_risk: Risk::Low,
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("list_dir", Fixed(ToolResult::text("x"))))
            .unwrap();
        let err = registry
            .register(descriptor("list_dir", Fixed(ToolResult::text("y"))))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTool(name) if name == "list_dir"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_invalid_schema() {
        let registry = ToolRegistry::new();
        let bad = ToolDescriptor::new(
            "bad",
            "bad schema",
            json!({"type": "not_a_real_type"}),
            json!({}),
            Fixed(ToolResult::text("x")),
        );
        assert!(matches!(
            registry.register(bad),
            Err(Error::InvalidSchema { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_schemas_follow_registration_order() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("b", Fixed(ToolResult::text("x"))))
            .unwrap();
        registry
            .register(descriptor("a", Fixed(ToolResult::text("x"))))
            .unwrap();
        let names: Vec<_> = registry.schemas().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_validation_error_before_side_effects() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("list_dir", Counting(Arc::clone(&calls))))
            .unwrap();

        let result = registry
            .dispatch(action("list_dir", json!({"path": 42})), CancellationToken::new())
            .await;

        match result {
            ObservationResult::Failure { kind, message } => {
                assert_eq!(kind, FailureKind::Validation);
                assert!(message.contains("/path"));
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_successful_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("list_dir", Counting(Arc::clone(&calls))))
            .unwrap();

        let result = registry
            .dispatch(action("list_dir", json!({"path": "/tmp"})), CancellationToken::new())
            .await;
        assert_eq!(result, ObservationResult::success(json!({"entries": ["/tmp"]})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_output_schema_violation() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("list_dir", Fixed(ToolResult::ok(json!({"wrong": true})))))
            .unwrap();
        let result = registry
            .dispatch(action("list_dir", json!({"path": "."})), CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            ObservationResult::Failure {
                kind: FailureKind::ContractViolation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_output_coerced_from_json_string() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor(
                "list_dir",
                Fixed(ToolResult::text(r#"{"entries": ["a"]}"#)),
            ))
            .unwrap();
        let result = registry
            .dispatch(action("list_dir", json!({"path": "."})), CancellationToken::new())
            .await;
        assert_eq!(result, ObservationResult::success(json!({"entries": ["a"]})));
    }

    #[tokio::test]
    async fn test_panic_becomes_observation() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("boom", Panicking)).unwrap();
        let result = registry
            .dispatch(action("boom", json!({"path": "."})), CancellationToken::new())
            .await;
        match result {
            ObservationResult::Failure { kind, message } => {
                assert_eq!(kind, FailureKind::Executor);
                assert!(message.contains("disk on fire"));
            }
            other => panic!("expected executor failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_result_and_unknown_tool() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("fails", Fixed(ToolResult::error("permission denied"))))
            .unwrap();

        let result = registry
            .dispatch(action("fails", json!({"path": "."})), CancellationToken::new())
            .await;
        assert_eq!(
            result,
            ObservationResult::failure(FailureKind::Executor, "permission denied")
        );

        let result = registry
            .dispatch(action("missing", json!({})), CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            ObservationResult::Failure {
                kind: FailureKind::UnknownTool,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_swap_executor() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("list_dir", Fixed(ToolResult::ok(json!({"entries": [1]})))))
            .unwrap();
        registry
            .swap_executor("list_dir", Fixed(ToolResult::ok(json!({"entries": [2]}))))
            .unwrap();
        let result = registry
            .dispatch(action("list_dir", json!({"path": "."})), CancellationToken::new())
            .await;
        assert_eq!(result, ObservationResult::success(json!({"entries": [2]})));

        assert!(matches!(
            registry.swap_executor("nope", Fixed(ToolResult::text("x"))),
            Err(Error::UnknownTool(_))
        ));
    }
}
