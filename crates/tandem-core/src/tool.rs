// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tandem_model::{LlmError, ToolDecl, ToolDeclKind};

/// Tool names owned by the subagent controller.  Caller tools must not
/// collide with them.
pub const RESERVED_TOOL_NAMES: &[&str] = &[
    "spawn_agent",
    "send_input",
    "resume_agent",
    "wait",
    "close_agent",
];

/// The input handed to a tool's `execute`.
///
/// Function tools receive their JSON-parsed arguments; custom tools receive
/// the raw text the model produced.
#[derive(Debug, Clone)]
pub enum ToolInput {
    Value(Value),
    Raw(String),
}

impl ToolInput {
    /// The input as a JSON value (raw text becomes a JSON string).
    pub fn into_value(self) -> Value {
        match self {
            ToolInput::Value(v) => v,
            ToolInput::Raw(s) => Value::String(s),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ToolInput::Value(v) => Some(v),
            ToolInput::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            ToolInput::Value(_) => None,
            ToolInput::Raw(s) => Some(s),
        }
    }
}

/// How a tool's input is described to the provider.
#[derive(Debug, Clone)]
pub enum ToolSchema {
    /// JSON Schema for the input object.
    Function { parameters: Value },
    /// Freeform text input, optionally with a grammar hint.  Only providers
    /// that can express custom tools accept these.
    Custom { format: Option<String> },
}

/// A caller-defined executable tool.
///
/// `execute` returns any JSON-serializable value; a returned error becomes a
/// structured error payload fed back to the model — it never aborts the
/// loop.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, input: ToolInput) -> anyhow::Result<Value>;
}

/// An ordered, name-unique set of tools.
#[derive(Default, Clone)]
pub struct ToolSet {
    order: Vec<String>,
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a caller tool.  Duplicate and reserved names are rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), LlmError> {
        let name = tool.name().to_string();
        if RESERVED_TOOL_NAMES.contains(&name.as_str()) {
            return Err(LlmError::invalid_argument(format!(
                "tool name '{name}' is reserved for subagent tools"
            )));
        }
        self.insert(name, tool)
    }

    /// Registration path for the subagent controller's own tools.
    pub(crate) fn register_reserved(&mut self, tool: Arc<dyn Tool>) -> Result<(), LlmError> {
        let name = tool.name().to_string();
        self.insert(name, tool)
    }

    fn insert(&mut self, name: String, tool: Arc<dyn Tool>) -> Result<(), LlmError> {
        if self.tools.contains_key(&name) {
            return Err(LlmError::invalid_argument(format!(
                "duplicate tool name '{name}'"
            )));
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Wire-level declarations in registration order.
    pub fn decls(&self) -> Vec<ToolDecl> {
        self.order
            .iter()
            .map(|name| {
                let tool = &self.tools[name];
                let kind = match tool.schema() {
                    ToolSchema::Function { parameters } => ToolDeclKind::Function { parameters },
                    ToolSchema::Custom { format } => ToolDeclKind::Custom { format },
                };
                ToolDecl {
                    name: name.clone(),
                    description: tool.description().to_string(),
                    kind,
                }
            })
            .collect()
    }
}

/// A function tool built from a name, description, schema, and a closure.
/// Convenient for tests and small embedders; larger tools implement [`Tool`]
/// directly.
pub struct FnTool {
    name: String,
    description: String,
    schema: ToolSchema,
    #[allow(clippy::type_complexity)]
    handler: Arc<
        dyn Fn(ToolInput) -> futures::future::BoxFuture<'static, anyhow::Result<Value>>
            + Send
            + Sync,
    >,
}

impl FnTool {
    pub fn function<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Arc<dyn Tool>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Arc::new(Self {
            name: name.into(),
            description: description.into(),
            schema: ToolSchema::Function { parameters },
            handler: Arc::new(move |input: ToolInput| {
                let handler = Arc::clone(&handler);
                let fut: futures::future::BoxFuture<'static, anyhow::Result<Value>> =
                    Box::pin(async move { handler(input.into_value()).await });
                fut
            }),
        })
    }

    pub fn custom<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        format: Option<String>,
        handler: F,
    ) -> Arc<dyn Tool>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Arc::new(Self {
            name: name.into(),
            description: description.into(),
            schema: ToolSchema::Custom { format },
            handler: Arc::new(move |input: ToolInput| {
                let handler = Arc::clone(&handler);
                let raw = match input {
                    ToolInput::Raw(s) => s,
                    ToolInput::Value(v) => v.to_string(),
                };
                let fut: futures::future::BoxFuture<'static, anyhow::Result<Value>> =
                    Box::pin(async move { handler(raw).await });
                fut
            }),
        })
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> ToolSchema {
        match &self.schema {
            ToolSchema::Function { parameters } => ToolSchema::Function {
                parameters: parameters.clone(),
            },
            ToolSchema::Custom { format } => ToolSchema::Custom {
                format: format.clone(),
            },
        }
    }

    async fn execute(&self, input: ToolInput) -> anyhow::Result<Value> {
        (self.handler)(input).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool(name: &str) -> Arc<dyn Tool> {
        FnTool::function(name, "echoes input", json!({"type": "object"}), |v| async move {
            Ok(v)
        })
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut set = ToolSet::new();
        set.register(echo_tool("echo")).unwrap();
        let err = set.register(echo_tool("echo")).unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::InvalidArgument);
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut set = ToolSet::new();
        for name in RESERVED_TOOL_NAMES {
            let err = set.register(echo_tool(name)).unwrap_err();
            assert_eq!(err.kind(), tandem_model::ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn decls_preserve_registration_order() {
        let mut set = ToolSet::new();
        set.register(echo_tool("b")).unwrap();
        set.register(echo_tool("a")).unwrap();
        let names: Vec<String> = set.decls().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn fn_tool_executes_closure() {
        let tool = echo_tool("echo");
        let out = tool
            .execute(ToolInput::Value(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn custom_tool_receives_raw_text() {
        let tool = FnTool::custom("fmt", "formats", None, |raw| async move {
            Ok(Value::String(raw.to_uppercase()))
        });
        let out = tool.execute(ToolInput::Raw("abc".into())).await.unwrap();
        assert_eq!(out, json!("ABC"));
    }
}
