//! Locally-registered tools exposed to the model during a turn.
//!
//! A [`ToolSpec`] pairs the declaration advertised to the model (name,
//! description, JSON-schema parameters) with an async invoke callback. The
//! [`ToolRegistry`] is shared behind a lock so the tool set can be swapped
//! while a session is live; transports snapshot the declarations at turn
//! start and resolve callbacks at invocation time.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// The tool whose calls materialize as executable code cells. Transports
/// never invoke its callback: they forward the call to the conversation
/// engine and relay the executed cell's outputs.
pub const CODE_TOOL: &str = "run_code";

/// Async tool callback: JSON arguments in, text out.
pub type ToolFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// One tool the model may call.
#[derive(Clone)]
pub struct ToolSpec {
    /// Tool name as advertised to the model.
    pub name: String,
    /// Human/model-readable description.
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: Value,
    /// The local callback.
    pub invoke: ToolFn,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl ToolSpec {
    /// Build a tool from a declaration and an async callback.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            invoke: Arc::new(move |args| Box::pin(f(args))),
        }
    }

    /// The declaration shape sent to the model (no callback).
    pub fn declaration(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

/// The set of tools available to the current and future turns.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tool. Replacement takes effect for subsequent
    /// invocations, including within a live session.
    pub fn register(&mut self, tool: ToolSpec) {
        debug!(tool = %tool.name, "tool registered");
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Remove a tool by name.
    pub fn remove(&mut self, name: &str) -> Option<ToolSpec> {
        self.tools.remove(name)
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Tool names, unordered.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Declarations for all registered tools, for session configuration.
    pub fn declarations(&self) -> Vec<Value> {
        self.tools.values().map(|t| t.declaration()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Shared registry handle. Swappable while a session is live.
pub type SharedToolRegistry = Arc<parking_lot::RwLock<ToolRegistry>>;

/// Create a new shared registry.
pub fn shared_registry() -> SharedToolRegistry {
    Arc::new(parking_lot::RwLock::new(ToolRegistry::new()))
}

/// Resolve and run a tool, folding every failure (unknown tool, bad
/// arguments, callback error) into a text payload the model can read.
/// Protocol flow never breaks on tool failure.
pub async fn invoke_tool(registry: &SharedToolRegistry, name: &str, args: Value) -> String {
    let invoke = {
        let reg = registry.read();
        match reg.get(name) {
            Some(tool) => tool.invoke.clone(),
            None => {
                warn!(tool = %name, "unknown tool invoked");
                return format!("Error: unknown tool '{name}'");
            }
        }
    };
    match invoke(args).await {
        Ok(output) => output,
        Err(err) => {
            warn!(tool = %name, error = %err, "tool invocation failed");
            format!("Error: {err}")
        }
    }
}

/// The built-in `run_code` declaration. Registering it advertises code
/// execution to the model; the conversation engine intercepts the calls,
/// runs the code as a cell through the execution bridge, and answers with
/// that cell's outputs. The callback only backstops a direct invocation
/// that bypassed the engine.
pub fn run_code_tool() -> ToolSpec {
    ToolSpec::new(
        CODE_TOOL,
        "Execute code in the notebook interpreter and return its output.",
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "Code to execute" }
            },
            "required": ["code"]
        }),
        |_args: Value| async { anyhow::bail!("code cells execute in the notebook") },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_tool() -> ToolSpec {
        ToolSpec::new(
            "echo",
            "Echo the input back.",
            json!({"type": "object"}),
            |args: Value| async move {
                Ok(args.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string())
            },
        )
    }

    #[test]
    fn test_register_and_declarations() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool());
        assert_eq!(reg.len(), 1);
        let decls = reg.declarations();
        assert_eq!(decls[0]["name"], "echo");
        assert!(decls[0]["parameters"].is_object());
    }

    #[test]
    fn test_register_replaces_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool());
        let replacement = ToolSpec::new("echo", "v2", json!({}), |_| async { Ok("x".into()) });
        reg.register(replacement);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("echo").unwrap().description, "v2");
    }

    #[tokio::test]
    async fn test_invoke_tool_success() {
        let reg = shared_registry();
        reg.write().register(echo_tool());
        let out = invoke_tool(&reg, "echo", json!({"text": "hi"})).await;
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool_folds_to_text() {
        let reg = shared_registry();
        let out = invoke_tool(&reg, "missing", json!({})).await;
        assert!(out.starts_with("Error: unknown tool"));
    }

    #[tokio::test]
    async fn test_invoke_failure_folds_to_text() {
        let reg = shared_registry();
        reg.write().register(ToolSpec::new(
            "boom",
            "always fails",
            json!({}),
            |_| async { anyhow::bail!("kaput") },
        ));
        let out = invoke_tool(&reg, "boom", json!({})).await;
        assert_eq!(out, "Error: kaput");
    }

    #[tokio::test]
    async fn test_live_swap_during_session() {
        let reg = shared_registry();
        reg.write().register(echo_tool());
        // A transport holding the shared handle sees the swap immediately.
        reg.write().register(ToolSpec::new(
            "echo",
            "swapped",
            json!({}),
            |_| async { Ok("swapped".into()) },
        ));
        let out = invoke_tool(&reg, "echo", json!({"text": "ignored"})).await;
        assert_eq!(out, "swapped");
    }

    #[tokio::test]
    async fn test_run_code_tool_is_declaration_only() {
        let reg = shared_registry();
        reg.write().register(run_code_tool());
        let decls = reg.read().declarations();
        assert_eq!(decls[0]["name"], CODE_TOOL);
        assert_eq!(decls[0]["parameters"]["required"][0], "code");
        // The callback never runs in the normal flow; a direct invocation
        // folds to an error like any other failing tool.
        let out = invoke_tool(&reg, CODE_TOOL, json!({"code": "2+2"})).await;
        assert!(out.starts_with("Error:"));
    }
}
