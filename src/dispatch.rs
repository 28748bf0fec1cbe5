use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::agent::{ActionKind, ActionResult, AgentConfig, AgentContext, AgentError};
use crate::computer::{
    ActionExecutor, ImageFormat, MouseButton, ScreenCapture, ScreenshotSink, ScrollDirection,
};
use crate::geometry::ScreenRegion;
use crate::hooks::HookPipeline;
use crate::workflow::WorkflowEngine;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationMode {
    /// Execute every action.
    #[default]
    Auto,
    /// Ask the [`ConfirmationPolicy`] before each physical action.
    Confirm,
    /// Report success without touching the executor.
    DryRun,
}

impl FromStr for ConfirmationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ConfirmationMode::Auto),
            "confirm" => Ok(ConfirmationMode::Confirm),
            "dry-run" | "dry_run" | "dryrun" => Ok(ConfirmationMode::DryRun),
            other => Err(format!("unknown confirmation mode: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Approval {
    pub granted: bool,
    pub reason: Option<String>,
}

#[async_trait]
pub trait ConfirmationPolicy: Send + Sync {
    async fn approve(&self, context: &AgentContext, action: &BuiltinAction) -> Result<Approval, AgentError>;
}

#[derive(Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ConfirmationPolicy for AutoApprove {
    async fn approve(&self, _context: &AgentContext, _action: &BuiltinAction) -> Result<Approval, AgentError> {
        Ok(Approval {
            granted: true,
            reason: Some("auto approve".to_string()),
        })
    }
}

fn default_move_secs() -> f64 {
    0.5
}

fn default_clicks() -> u32 {
    1
}

fn default_scroll_amount() -> i32 {
    3
}

/// A physical action decoded from a tool call. The tag is the tool name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BuiltinAction {
    MouseMove {
        x: i32,
        y: i32,
        #[serde(default = "default_move_secs")]
        duration: f64,
    },
    Click {
        x: i32,
        y: i32,
        #[serde(default)]
        button: MouseButton,
        #[serde(default = "default_clicks")]
        clicks: u32,
    },
    DoubleClick {
        x: i32,
        y: i32,
    },
    Type {
        text: String,
        #[serde(default)]
        interval: f64,
    },
    Key {
        key: String,
    },
    Scroll {
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: i32,
        #[serde(default)]
        x: Option<i32>,
        #[serde(default)]
        y: Option<i32>,
    },
}

impl BuiltinAction {
    pub fn decode(tool: &str, input: &Value) -> Result<Self, AgentError> {
        let mut obj = match input {
            Value::Object(m) => m.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(AgentError::InvalidInput {
                    tool: tool.to_string(),
                    reason: format!("expected an object, got {other}"),
                })
            }
        };
        obj.insert("action".into(), Value::String(tool.to_string()));
        serde_json::from_value(Value::Object(obj)).map_err(|e| AgentError::InvalidInput {
            tool: tool.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            BuiltinAction::MouseMove { .. } => ActionKind::MouseMove,
            BuiltinAction::Click { .. } => ActionKind::Click,
            BuiltinAction::DoubleClick { .. } => ActionKind::DoubleClick,
            BuiltinAction::Type { .. } => ActionKind::Type,
            BuiltinAction::Key { .. } => ActionKind::Key,
            BuiltinAction::Scroll { .. } => ActionKind::Scroll,
        }
    }

    /// Screen coordinates the action targets. Scrolling only counts when both
    /// coordinates are given.
    pub fn point(&self) -> Option<(i32, i32)> {
        match *self {
            BuiltinAction::MouseMove { x, y, .. }
            | BuiltinAction::Click { x, y, .. }
            | BuiltinAction::DoubleClick { x, y } => Some((x, y)),
            BuiltinAction::Scroll {
                x: Some(x),
                y: Some(y),
                ..
            } => Some((x, y)),
            _ => None,
        }
    }
}

fn secs(s: f64) -> Duration {
    Duration::try_from_secs_f64(s).unwrap_or_default()
}

/// Turns tool calls into [`ActionResult`]s. Owns the physical collaborators
/// and the rate-limit clock, so one dispatcher serves one run at a time.
pub struct ActionDispatcher<E, S>
where
    E: ActionExecutor,
    S: ScreenCapture,
{
    executor: E,
    screen: S,
    screen_region: Option<ScreenRegion>,
    allowed_region: Option<ScreenRegion>,
    safety_delay: Duration,
    rate_limit: Duration,
    mode: ConfirmationMode,
    policy: Arc<dyn ConfirmationPolicy>,
    screenshot_sink: Option<Arc<dyn ScreenshotSink>>,
    last_action: Option<Instant>,
}

impl<E, S> ActionDispatcher<E, S>
where
    E: ActionExecutor,
    S: ScreenCapture,
{
    pub fn new(executor: E, screen: S, cfg: &AgentConfig) -> Self {
        Self {
            executor,
            screen,
            screen_region: cfg.screen_region,
            allowed_region: cfg.allowed_region,
            safety_delay: cfg.safety_delay,
            rate_limit: cfg.rate_limit,
            mode: cfg.confirmation_mode,
            policy: Arc::new(AutoApprove),
            screenshot_sink: None,
            last_action: None,
        }
    }

    pub fn set_policy(&mut self, policy: Arc<dyn ConfirmationPolicy>) {
        self.policy = policy;
    }

    pub fn set_screenshot_sink(&mut self, sink: Arc<dyn ScreenshotSink>) {
        self.screenshot_sink = Some(sink);
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn screen(&self) -> &S {
        &self.screen
    }

    /// Takes a screenshot through the screenshot hooks and remembers it on the
    /// context. Returns the base64 PNG.
    pub async fn capture(
        &self,
        hooks: &HookPipeline,
        ctx: &mut AgentContext,
        step: Option<usize>,
    ) -> Result<String, AgentError> {
        hooks.trigger_before_screenshot(ctx)?;
        let image = self
            .screen
            .capture_base64(self.screen_region, ImageFormat::Png)
            .await?;
        ctx.last_screenshot = Some(image.clone());
        hooks.trigger_after_screenshot(ctx, &image)?;
        debug!(bytes = image.len(), "screenshot captured");

        if let Some(sink) = &self.screenshot_sink {
            if let Err(e) = sink.save(ctx.run_id(), step, &image).await {
                warn!("screenshot sink failed: {}", e);
            }
        }
        Ok(image)
    }

    /// Produces exactly one result for a tool call. Only hook failures come
    /// back as `Err`; everything else is a failed [`ActionResult`].
    pub async fn dispatch(
        &mut self,
        hooks: &HookPipeline,
        workflow: &WorkflowEngine,
        ctx: &mut AgentContext,
        tool: &str,
        input: Value,
    ) -> Result<ActionResult, AgentError> {
        let input = hooks.trigger_tool_call(ctx, tool, input)?;

        if workflow.has_tool(tool) {
            let result = match workflow.execute_tool(ctx, tool, input) {
                Ok(value) => ActionResult::ok(ActionKind::Custom, json!({ "result": value })),
                Err(e) => {
                    warn!(tool, "custom tool failed: {}", e);
                    ActionResult::failed(ActionKind::Custom, e)
                }
            };
            return Ok(result);
        }

        let Some(kind) = ActionKind::builtin(tool) else {
            warn!(tool, "unknown tool requested");
            return Ok(ActionResult::failed(
                ActionKind::Unknown,
                format!("Unknown tool: {tool}"),
            ));
        };

        if kind == ActionKind::Screenshot {
            let step = Some(ctx.iteration());
            return match self.capture(hooks, ctx, step).await {
                Ok(image) => Ok(ActionResult::ok(kind, json!({ "image": image }))),
                Err(e @ AgentError::Hook(_)) => Err(e),
                Err(e) => Ok(ActionResult::failed(kind, e)),
            };
        }

        let payload = hooks.trigger_before_action(ctx, input)?;
        let result = match BuiltinAction::decode(tool, &payload) {
            Ok(action) => self.perform(ctx, &action).await,
            Err(e) => ActionResult::failed(kind, e),
        };
        hooks.trigger_after_action(ctx, &payload, &result)?;
        workflow.check_conditional_handlers(ctx, kind, &payload);
        Ok(result)
    }

    async fn perform(&mut self, ctx: &AgentContext, action: &BuiltinAction) -> ActionResult {
        let kind = action.kind();

        if let (Some(region), Some((x, y))) = (self.allowed_region, action.point()) {
            if !region.contains(x, y) {
                warn!(x, y, ?region, "action outside allowed region");
                return ActionResult::failed(kind, AgentError::OutOfRegion { x, y });
            }
        }

        match self.mode {
            ConfirmationMode::DryRun => {
                info!(action = ?action, "dry run");
                return ActionResult::ok(kind, json!({ "dry_run": true }));
            }
            ConfirmationMode::Confirm => match self.policy.approve(ctx, action).await {
                Ok(approval) if approval.granted => {
                    debug!(action = ?action, "action approved");
                }
                Ok(approval) => {
                    info!(action = ?action, "action declined");
                    let reason = approval.reason.unwrap_or_else(|| "no reason given".into());
                    return ActionResult::failed(kind, AgentError::Declined(reason));
                }
                Err(e) => return ActionResult::failed(kind, e),
            },
            ConfirmationMode::Auto => {}
        }

        self.wait_for_rate_limit().await;

        match self.execute(action).await {
            Ok(data) => {
                if !self.safety_delay.is_zero() {
                    sleep(self.safety_delay).await;
                }
                ActionResult::ok(kind, data)
            }
            Err(e) => {
                warn!(action = ?action, "action failed: {}", e);
                ActionResult::failed(kind, e)
            }
        }
    }

    async fn wait_for_rate_limit(&mut self) {
        if let Some(last) = self.last_action {
            let elapsed = last.elapsed();
            if elapsed < self.rate_limit {
                sleep(self.rate_limit - elapsed).await;
            }
        }
        self.last_action = Some(Instant::now());
    }

    async fn execute(&self, action: &BuiltinAction) -> Result<Value, AgentError> {
        match action {
            BuiltinAction::MouseMove { x, y, duration } => {
                self.executor.mouse_move(*x, *y, secs(*duration)).await
            }
            BuiltinAction::Click {
                x,
                y,
                button,
                clicks,
            } => self.executor.click(*x, *y, *button, *clicks).await,
            BuiltinAction::DoubleClick { x, y } => self.executor.double_click(*x, *y).await,
            BuiltinAction::Type { text, interval } => {
                self.executor.type_text(text, secs(*interval)).await
            }
            BuiltinAction::Key { key } => self.executor.press_key(key).await,
            BuiltinAction::Scroll {
                direction,
                amount,
                x,
                y,
            } => {
                let at = (*x).zip(*y);
                self.executor.scroll(*direction, *amount, at).await
            }
        }
    }
}
