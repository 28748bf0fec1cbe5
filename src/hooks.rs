//! Lifecycle hooks around screenshots, actions, tool calls and iterations.
//!
//! Callbacks for one point run in registration order. Observer points ignore
//! return values; `before_action` and `on_tool_call` fold their callbacks over
//! the payload, where `Ok(Some(v))` replaces the payload for every later
//! callback and `Ok(None)` leaves it untouched. The first callback that fails
//! stops its trigger and the error reaches the caller.

use serde_json::Value;
use std::collections::HashMap;

use crate::agent::{ActionResult, AgentContext, AgentError};

pub type ContextHook = Box<dyn Fn(&mut AgentContext) -> anyhow::Result<()> + Send + Sync>;
pub type ScreenshotHook = Box<dyn Fn(&mut AgentContext, &str) -> anyhow::Result<()> + Send + Sync>;
pub type ActionHook =
    Box<dyn Fn(&mut AgentContext, &Value) -> anyhow::Result<Option<Value>> + Send + Sync>;
pub type AfterActionHook =
    Box<dyn Fn(&mut AgentContext, &Value, &ActionResult) -> anyhow::Result<()> + Send + Sync>;
pub type ToolCallHook =
    Box<dyn Fn(&mut AgentContext, &Value) -> anyhow::Result<Option<Value>> + Send + Sync>;
/// Wildcard tool-call hooks also receive the tool name.
pub type AnyToolCallHook =
    Box<dyn Fn(&mut AgentContext, &str, &Value) -> anyhow::Result<Option<Value>> + Send + Sync>;
pub type IterationHook = Box<dyn Fn(&mut AgentContext, usize) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub struct HookPipeline {
    before_screenshot: Vec<ContextHook>,
    after_screenshot: Vec<ScreenshotHook>,
    before_action: Vec<ActionHook>,
    after_action: Vec<AfterActionHook>,
    tool_call: HashMap<String, Vec<ToolCallHook>>,
    any_tool_call: Vec<AnyToolCallHook>,
    iteration_start: Vec<IterationHook>,
    iteration_end: Vec<IterationHook>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("before_screenshot", &self.before_screenshot.len())
            .field("after_screenshot", &self.after_screenshot.len())
            .field("before_action", &self.before_action.len())
            .field("after_action", &self.after_action.len())
            .field("tool_call", &self.tool_call.keys().collect::<Vec<_>>())
            .field("any_tool_call", &self.any_tool_call.len())
            .field("iteration_start", &self.iteration_start.len())
            .field("iteration_end", &self.iteration_end.len())
            .finish()
    }
}

fn hook_error(point: &str, err: anyhow::Error) -> AgentError {
    AgentError::Hook(format!("{point}: {err:#}"))
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.before_screenshot.is_empty()
            && self.after_screenshot.is_empty()
            && self.before_action.is_empty()
            && self.after_action.is_empty()
            && self.tool_call.values().all(Vec::is_empty)
            && self.any_tool_call.is_empty()
            && self.iteration_start.is_empty()
            && self.iteration_end.is_empty()
    }

    // ----- registration -----

    pub fn on_before_screenshot<F>(&mut self, f: F)
    where
        F: Fn(&mut AgentContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before_screenshot.push(Box::new(f));
    }

    pub fn on_after_screenshot<F>(&mut self, f: F)
    where
        F: Fn(&mut AgentContext, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.after_screenshot.push(Box::new(f));
    }

    pub fn on_before_action<F>(&mut self, f: F)
    where
        F: Fn(&mut AgentContext, &Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.before_action.push(Box::new(f));
    }

    pub fn on_after_action<F>(&mut self, f: F)
    where
        F: Fn(&mut AgentContext, &Value, &ActionResult) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.after_action.push(Box::new(f));
    }

    /// Intercepts calls to one tool, built-in or custom.
    pub fn on_tool_call<F>(&mut self, tool: impl Into<String>, f: F)
    where
        F: Fn(&mut AgentContext, &Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.tool_call.entry(tool.into()).or_default().push(Box::new(f));
    }

    /// Intercepts every tool call. Runs after the name-specific hooks of the
    /// same call and sees their replacement arguments.
    pub fn on_any_tool_call<F>(&mut self, f: F)
    where
        F: Fn(&mut AgentContext, &str, &Value) -> anyhow::Result<Option<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.any_tool_call.push(Box::new(f));
    }

    pub fn on_iteration_start<F>(&mut self, f: F)
    where
        F: Fn(&mut AgentContext, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.iteration_start.push(Box::new(f));
    }

    pub fn on_iteration_end<F>(&mut self, f: F)
    where
        F: Fn(&mut AgentContext, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.iteration_end.push(Box::new(f));
    }

    // ----- triggers -----

    pub fn trigger_before_screenshot(&self, ctx: &mut AgentContext) -> Result<(), AgentError> {
        for hook in &self.before_screenshot {
            hook(ctx).map_err(|e| hook_error("before_screenshot", e))?;
        }
        Ok(())
    }

    pub fn trigger_after_screenshot(
        &self,
        ctx: &mut AgentContext,
        image_base64: &str,
    ) -> Result<(), AgentError> {
        for hook in &self.after_screenshot {
            hook(ctx, image_base64).map_err(|e| hook_error("after_screenshot", e))?;
        }
        Ok(())
    }

    pub fn trigger_before_action(
        &self,
        ctx: &mut AgentContext,
        action: Value,
    ) -> Result<Value, AgentError> {
        let mut action = action;
        for hook in &self.before_action {
            if let Some(replacement) =
                hook(ctx, &action).map_err(|e| hook_error("before_action", e))?
            {
                action = replacement;
            }
        }
        Ok(action)
    }

    pub fn trigger_after_action(
        &self,
        ctx: &mut AgentContext,
        action: &Value,
        result: &ActionResult,
    ) -> Result<(), AgentError> {
        for hook in &self.after_action {
            hook(ctx, action, result).map_err(|e| hook_error("after_action", e))?;
        }
        Ok(())
    }

    pub fn trigger_tool_call(
        &self,
        ctx: &mut AgentContext,
        tool: &str,
        args: Value,
    ) -> Result<Value, AgentError> {
        let mut args = args;
        if let Some(hooks) = self.tool_call.get(tool) {
            for hook in hooks {
                if let Some(replacement) =
                    hook(ctx, &args).map_err(|e| hook_error("on_tool_call", e))?
                {
                    args = replacement;
                }
            }
        }
        for hook in &self.any_tool_call {
            if let Some(replacement) =
                hook(ctx, tool, &args).map_err(|e| hook_error("on_tool_call(*)", e))?
            {
                args = replacement;
            }
        }
        Ok(args)
    }

    pub fn trigger_iteration_start(
        &self,
        ctx: &mut AgentContext,
        iteration: usize,
    ) -> Result<(), AgentError> {
        for hook in &self.iteration_start {
            hook(ctx, iteration).map_err(|e| hook_error("iteration_start", e))?;
        }
        Ok(())
    }

    pub fn trigger_iteration_end(
        &self,
        ctx: &mut AgentContext,
        iteration: usize,
    ) -> Result<(), AgentError> {
        for hook in &self.iteration_end {
            hook(ctx, iteration).map_err(|e| hook_error("iteration_end", e))?;
        }
        Ok(())
    }
}
