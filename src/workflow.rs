use anyhow::Context as _;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agent::{ActionKind, AgentContext, AgentError};
use crate::claude::ToolSchema;
use crate::tools;

/// A user-supplied function the reasoning service may call by name.
pub trait Tool: Send + Sync {
    fn invoke(&self, context: &mut AgentContext, args: Value) -> anyhow::Result<Value>;
}

impl<F> Tool for F
where
    F: Fn(&mut AgentContext, Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn invoke(&self, context: &mut AgentContext, args: Value) -> anyhow::Result<Value> {
        self(context, args)
    }
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    tool: Arc<dyn Tool>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        tool: Arc<dyn Tool>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            tool,
        }
    }

    pub fn schema(&self) -> ToolSchema {
        tools::custom_tool_schema(&self.name, &self.description, self.input_schema.clone())
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

pub type Predicate = Box<dyn Fn(&AgentContext, &Value) -> anyhow::Result<bool> + Send + Sync>;
pub type Handler = Box<dyn Fn(&mut AgentContext, &Value) -> anyhow::Result<()> + Send + Sync>;

struct ConditionalHandler {
    predicate: Predicate,
    handler: Handler,
}

/// Custom tools plus predicate-gated handlers that fire after built-in actions.
#[derive(Default)]
pub struct WorkflowEngine {
    tools: Vec<ToolDefinition>,
    handlers: HashMap<ActionKind, Vec<ConditionalHandler>>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering an existing name replaces the previous definition in place.
    pub fn register(&mut self, def: ToolDefinition) {
        debug!(tool = %def.name, "registering tool");
        match self.tools.iter_mut().find(|t| t.name == def.name) {
            Some(slot) => *slot = def,
            None => self.tools.push(def),
        }
    }

    pub fn register_tool<F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) where
        F: Fn(&mut AgentContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(ToolDefinition::new(name, description, input_schema, Arc::new(f)));
    }

    /// Like [`register_tool`](Self::register_tool), with the input schema
    /// derived from `A` and arguments deserialized into `A` before the call.
    pub fn register_typed_tool<A, F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
    ) where
        A: DeserializeOwned + JsonSchema + 'static,
        F: Fn(&mut AgentContext, A) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        self.register_tool(
            name,
            description,
            tools::schema_for::<A>(),
            move |ctx: &mut AgentContext, args: Value| {
                let args: A = serde_json::from_value(args)
                    .with_context(|| format!("invalid arguments for {label}"))?;
                f(ctx, args)
            },
        );
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(ToolDefinition::schema).collect()
    }

    pub fn execute_tool(
        &self,
        ctx: &mut AgentContext,
        name: &str,
        args: Value,
    ) -> Result<Value, AgentError> {
        let def = self
            .tool(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        def.tool
            .invoke(ctx, args)
            .map_err(|e| AgentError::Tool(format!("{name}: {e:#}")))
    }

    pub fn register_conditional_handler<P, H>(&mut self, kind: ActionKind, predicate: P, handler: H)
    where
        P: Fn(&AgentContext, &Value) -> anyhow::Result<bool> + Send + Sync + 'static,
        H: Fn(&mut AgentContext, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.entry(kind).or_default().push(ConditionalHandler {
            predicate: Box::new(predicate),
            handler: Box::new(handler),
        });
    }

    /// Runs every handler for `kind` whose predicate holds. A failing
    /// predicate or handler is logged and the remaining handlers still run.
    pub fn check_conditional_handlers(&self, ctx: &mut AgentContext, kind: ActionKind, action: &Value) {
        let Some(handlers) = self.handlers.get(&kind) else {
            return;
        };
        for (i, h) in handlers.iter().enumerate() {
            match (h.predicate)(ctx, action) {
                Ok(true) => {
                    if let Err(e) = (h.handler)(ctx, action) {
                        warn!(kind = %kind, handler = i, "conditional handler failed: {e:#}");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(kind = %kind, handler = i, "conditional predicate failed: {e:#}"),
            }
        }
    }
}
