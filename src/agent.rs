use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::claude::{AssistantReply, ContentBlock, Message, MessageRequest, StopReason, ToolSchema};
use crate::computer::{ActionExecutor, ScreenCapture, ScreenshotSink};
use crate::dispatch::{ActionDispatcher, ConfirmationMode, ConfirmationPolicy};
use crate::geometry::ScreenRegion;
use crate::hooks::HookPipeline;
use crate::tools;
use crate::workflow::{ToolDefinition, WorkflowEngine};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a computer use agent. You can see the screen and take actions \
like clicking, typing, and scrolling. Analyze what you see and take \
appropriate actions to achieve the given goal.";

// ========================= Core Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Screenshot,
    MouseMove,
    Click,
    DoubleClick,
    Type,
    Key,
    Scroll,
    /// A user-registered tool.
    Custom,
    /// A tool name nobody registered.
    Unknown,
}

impl ActionKind {
    /// Kind of a built-in tool, by tool name.
    pub fn builtin(tool: &str) -> Option<Self> {
        match tool {
            tools::SCREENSHOT => Some(ActionKind::Screenshot),
            tools::MOUSE_MOVE => Some(ActionKind::MouseMove),
            tools::CLICK => Some(ActionKind::Click),
            tools::DOUBLE_CLICK => Some(ActionKind::DoubleClick),
            tools::TYPE => Some(ActionKind::Type),
            tools::KEY => Some(ActionKind::Key),
            tools::SCROLL => Some(ActionKind::Scroll),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Screenshot => tools::SCREENSHOT,
            ActionKind::MouseMove => tools::MOUSE_MOVE,
            ActionKind::Click => tools::CLICK,
            ActionKind::DoubleClick => tools::DOUBLE_CLICK,
            ActionKind::Type => tools::TYPE,
            ActionKind::Key => tools::KEY,
            ActionKind::Scroll => tools::SCROLL,
            ActionKind::Custom => "custom",
            ActionKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub kind: ActionKind,
    pub error: Option<String>,
    pub data: Option<Value>,
}

impl ActionResult {
    pub fn ok(kind: ActionKind, data: Value) -> Self {
        Self {
            success: true,
            kind,
            error: None,
            data: Some(data),
        }
    }

    pub fn failed(kind: ActionKind, error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            kind,
            error: Some(error.to_string()),
            data: None,
        }
    }
}

/// State shared with hooks, tools and handlers for the length of one run.
/// Callbacks may write `state` and the screenshot fields; the iteration and
/// the action history are read-only outside the loop.
#[derive(Clone, Debug)]
pub struct AgentContext {
    pub state: Map<String, Value>,
    pub last_screenshot: Option<String>,
    /// Text extracted from the last screenshot, e.g. by an OCR hook.
    pub last_screenshot_text: Option<String>,
    run_id: String,
    iteration: usize,
    action_history: Vec<ActionResult>,
}

impl AgentContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            state: Map::new(),
            last_screenshot: None,
            last_screenshot_text: None,
            run_id: run_id.into(),
            iteration: 0,
            action_history: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn action_history(&self) -> &[ActionResult] {
        &self.action_history
    }

    fn set_iteration(&mut self, iteration: usize) {
        debug_assert!(iteration >= self.iteration);
        self.iteration = iteration;
    }

    fn record(&mut self, result: ActionResult) {
        self.action_history.push(result);
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new(nanoid!())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("coordinates ({x}, {y}) outside allowed region")]
    OutOfRegion { x: i32, y: i32 },
    #[error("computer error: {0}")]
    Computer(String),
    #[error("reasoner error: {0}")]
    Reasoner(String),
    #[error("hook error: {0}")]
    Hook(String),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("invalid input for {tool}: {reason}")]
    InvalidInput { tool: String, reason: String },
    #[error("action declined: {0}")]
    Declined(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The model ended its turn on its own.
    Completed,
    /// The iteration budget ran out first.
    Exhausted,
    /// A hook or the reasoning service failed.
    Failed,
    /// The caller stopped stepping a session early.
    Stopped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub result: ActionResult,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnReport {
    pub iteration: usize,
    pub stop_reason: StopReason,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl TurnReport {
    pub fn is_final(&self) -> bool {
        self.stop_reason == StopReason::EndTurn
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub goal: String,
    pub status: RunStatus,
    /// Turns started, including a turn that failed.
    pub iterations: usize,
    pub state: Map<String, Value>,
    pub action_history: Vec<ActionResult>,
    pub error: Option<String>,
    /// Iteration the error happened in; `None` if it happened before the first turn.
    pub failed_iteration: Option<usize>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn respond(&self, request: &MessageRequest<'_>) -> Result<AssistantReply, AgentError>;
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub screen_region: Option<ScreenRegion>,
    pub allowed_region: Option<ScreenRegion>,
    /// Pause after each physical action.
    pub safety_delay: Duration,
    /// Minimum spacing between physical actions.
    pub rate_limit: Duration,
    pub confirmation_mode: ConfirmationMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            max_tokens: 4096,
            screen_region: None,
            allowed_region: None,
            safety_delay: Duration::from_millis(100),
            rate_limit: Duration::from_millis(50),
            confirmation_mode: ConfirmationMode::Auto,
        }
    }
}

pub struct Agent<R, E, S>
where
    R: Reasoner,
    E: ActionExecutor,
    S: ScreenCapture,
{
    reasoner: R,
    dispatcher: ActionDispatcher<E, S>,
    hooks: HookPipeline,
    workflow: WorkflowEngine,
    cfg: AgentConfig,
}

impl<R, E, S> Agent<R, E, S>
where
    R: Reasoner,
    E: ActionExecutor,
    S: ScreenCapture,
{
    pub fn new(reasoner: R, executor: E, screen: S, cfg: AgentConfig) -> Self {
        Self {
            reasoner,
            dispatcher: ActionDispatcher::new(executor, screen, &cfg),
            hooks: HookPipeline::new(),
            workflow: WorkflowEngine::new(),
            cfg,
        }
    }

    pub fn with_confirmation_policy(mut self, policy: Arc<dyn ConfirmationPolicy>) -> Self {
        self.dispatcher.set_policy(policy);
        self
    }

    pub fn with_screenshot_sink(mut self, sink: Arc<dyn ScreenshotSink>) -> Self {
        self.dispatcher.set_screenshot_sink(sink);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn reasoner(&self) -> &R {
        &self.reasoner
    }

    pub fn executor(&self) -> &E {
        self.dispatcher.executor()
    }

    pub fn screen(&self) -> &S {
        self.dispatcher.screen()
    }

    pub fn hooks_mut(&mut self) -> &mut HookPipeline {
        &mut self.hooks
    }

    pub fn workflow_mut(&mut self) -> &mut WorkflowEngine {
        &mut self.workflow
    }

    // ----- registration surface -----

    pub fn register(&mut self, tool: ToolDefinition) -> &mut Self {
        self.workflow.register(tool);
        self
    }

    pub fn register_tool<F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> &mut Self
    where
        F: Fn(&mut AgentContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.workflow.register_tool(name, description, input_schema, f);
        self
    }

    pub fn register_typed_tool<A, F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
    ) -> &mut Self
    where
        A: serde::de::DeserializeOwned + schemars::JsonSchema + 'static,
        F: Fn(&mut AgentContext, A) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.workflow.register_typed_tool(name, description, f);
        self
    }

    pub fn on_before_screenshot<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut AgentContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_before_screenshot(f);
        self
    }

    pub fn on_after_screenshot<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut AgentContext, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_after_screenshot(f);
        self
    }

    pub fn on_before_action<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut AgentContext, &Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.hooks.on_before_action(f);
        self
    }

    pub fn on_after_action<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut AgentContext, &Value, &ActionResult) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.on_after_action(f);
        self
    }

    pub fn on_tool_call<F>(&mut self, tool: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut AgentContext, &Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.hooks.on_tool_call(tool, f);
        self
    }

    pub fn on_any_tool_call<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut AgentContext, &str, &Value) -> anyhow::Result<Option<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.on_any_tool_call(f);
        self
    }

    pub fn on_iteration_start<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut AgentContext, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_iteration_start(f);
        self
    }

    pub fn on_iteration_end<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut AgentContext, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_iteration_end(f);
        self
    }

    /// Registers a handler that runs after every built-in action of `kind`
    /// whose payload satisfies `predicate`.
    pub fn when<P, H>(&mut self, kind: ActionKind, predicate: P, handler: H) -> &mut Self
    where
        P: Fn(&AgentContext, &Value) -> anyhow::Result<bool> + Send + Sync + 'static,
        H: Fn(&mut AgentContext, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.workflow.register_conditional_handler(kind, predicate, handler);
        self
    }

    /// Built-in tool schemas followed by the custom ones.
    pub fn tools(&self) -> Vec<ToolSchema> {
        let mut tools = tools::builtin_tools();
        tools.extend(self.workflow.schemas());
        tools
    }

    // ----- running -----

    /// Runs until the model ends its turn, `max_iterations` turns have been
    /// used, or something fails. Never returns an error; failures are reported
    /// in the [`RunReport`].
    pub async fn run(
        &mut self,
        goal: &str,
        max_iterations: usize,
        system_prompt: Option<&str>,
    ) -> RunReport {
        let mut session = self.start(goal, max_iterations, system_prompt);
        loop {
            match session.next_turn().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        session.into_report()
    }

    /// Starts a run that the caller advances one turn at a time.
    pub fn start(
        &mut self,
        goal: &str,
        max_iterations: usize,
        system_prompt: Option<&str>,
    ) -> RunSession<'_, R, E, S> {
        let run_id = nanoid!();
        info!(run_id = %run_id, model = %self.cfg.model, max_iterations, "starting run");
        RunSession {
            agent: self,
            goal: goal.to_string(),
            system: system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string(),
            max_iterations,
            ctx: AgentContext::new(run_id),
            messages: Vec::new(),
            turns: 0,
            phase: Phase::Init,
            error: None,
        }
    }
}

enum Phase {
    Init,
    Running,
    Done(RunStatus),
}

/// One run of the conversation loop. Owns the message history and the
/// [`AgentContext`]; dropped or turned into a [`RunReport`] when done.
pub struct RunSession<'a, R, E, S>
where
    R: Reasoner,
    E: ActionExecutor,
    S: ScreenCapture,
{
    agent: &'a mut Agent<R, E, S>,
    goal: String,
    system: String,
    max_iterations: usize,
    ctx: AgentContext,
    messages: Vec<Message>,
    turns: usize,
    phase: Phase,
    error: Option<(Option<usize>, AgentError)>,
}

impl<'a, R, E, S> RunSession<'a, R, E, S>
where
    R: Reasoner,
    E: ActionExecutor,
    S: ScreenCapture,
{
    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> Option<RunStatus> {
        match self.phase {
            Phase::Done(status) => Some(status),
            _ => None,
        }
    }

    /// Plays the next turn. `Ok(None)` once the run is over; an `Err` ends
    /// the run and later calls return `Ok(None)`.
    pub async fn next_turn(&mut self) -> Result<Option<TurnReport>, AgentError> {
        match self.phase {
            Phase::Done(_) => return Ok(None),
            Phase::Init => {
                if let Err(e) = self.seed().await {
                    warn!(run_id = %self.ctx.run_id(), "run failed before first turn: {}", e);
                    self.fail(None, e.clone());
                    return Err(e);
                }
                self.phase = Phase::Running;
            }
            Phase::Running => {}
        }

        if self.turns >= self.max_iterations {
            self.exhaust();
            return Ok(None);
        }

        let iteration = self.turns;
        self.turns += 1;
        match self.turn(iteration).await {
            Ok(report) => {
                if report.is_final() {
                    info!(run_id = %self.ctx.run_id(), iteration, "goal reached");
                    self.phase = Phase::Done(RunStatus::Completed);
                } else if self.turns >= self.max_iterations {
                    self.exhaust();
                }
                Ok(Some(report))
            }
            Err(e) => {
                warn!(run_id = %self.ctx.run_id(), iteration, "run failed: {}", e);
                self.fail(Some(iteration), e.clone());
                Err(e)
            }
        }
    }

    pub fn into_report(self) -> RunReport {
        let status = match self.phase {
            Phase::Done(status) => status,
            Phase::Init | Phase::Running => RunStatus::Stopped,
        };
        let (failed_iteration, error) = match self.error {
            Some((at, e)) => (at, Some(e.to_string())),
            None => (None, None),
        };
        RunReport {
            run_id: self.ctx.run_id.clone(),
            goal: self.goal,
            status,
            iterations: self.turns,
            state: self.ctx.state,
            action_history: self.ctx.action_history,
            error,
            failed_iteration,
        }
    }

    fn fail(&mut self, at: Option<usize>, e: AgentError) {
        self.error = Some((at, e));
        self.phase = Phase::Done(RunStatus::Failed);
    }

    fn exhaust(&mut self) {
        info!(run_id = %self.ctx.run_id(), turns = self.turns, "iteration budget exhausted");
        self.phase = Phase::Done(RunStatus::Exhausted);
    }

    async fn seed(&mut self) -> Result<(), AgentError> {
        let agent = &mut *self.agent;
        let image = agent.dispatcher.capture(&agent.hooks, &mut self.ctx, None).await?;
        self.messages.push(Message::user(vec![
            ContentBlock::png(image),
            ContentBlock::text(self.goal.clone()),
        ]));
        Ok(())
    }

    async fn turn(&mut self, iteration: usize) -> Result<TurnReport, AgentError> {
        let agent = &mut *self.agent;
        self.ctx.set_iteration(iteration);
        info!(iteration = iteration + 1, max = self.max_iterations, "turn");
        agent.hooks.trigger_iteration_start(&mut self.ctx, iteration)?;

        let tools = agent.tools();
        let request = MessageRequest {
            model: &agent.cfg.model,
            max_tokens: agent.cfg.max_tokens,
            system: &self.system,
            messages: &self.messages,
            tools: &tools,
        };
        let reply = agent.reasoner.respond(&request).await?;
        let reasoning = reply.reasoning().map(str::to_string);
        let stop_reason = reply.stop_reason.clone();
        info!(iteration, stop_reason = %stop_reason, "reasoner replied");
        if let Some(text) = &reasoning {
            info!(iteration, "reasoning: {}", text.chars().take(150).collect::<String>());
        }

        let assistant = Message::assistant(reply.content);
        let uses: Vec<(String, String, Value)> = if stop_reason == StopReason::ToolUse {
            assistant
                .tool_uses()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect()
        } else {
            Vec::new()
        };
        self.messages.push(assistant);

        let mut tool_calls = Vec::with_capacity(uses.len());
        if stop_reason == StopReason::ToolUse {
            let mut results = Vec::with_capacity(uses.len());
            for (id, name, input) in uses {
                info!(iteration, tool = %name, "executing tool");
                let result = agent
                    .dispatcher
                    .dispatch(&agent.hooks, &agent.workflow, &mut self.ctx, &name, input.clone())
                    .await?;
                info!(iteration, tool = %name, success = result.success, "tool result");
                self.ctx.record(result.clone());
                results.push(tool_result_block(&id, &result));
                tool_calls.push(ToolCall {
                    id,
                    name,
                    input,
                    result,
                });
            }
            self.messages.push(Message::user(results));
        }

        agent.hooks.trigger_iteration_end(&mut self.ctx, iteration)?;
        Ok(TurnReport {
            iteration,
            stop_reason,
            reasoning,
            tool_calls,
        })
    }
}

fn tool_result_block(tool_use_id: &str, result: &ActionResult) -> ContentBlock {
    let content = if result.success {
        let image = match result.kind {
            ActionKind::Screenshot => result
                .data
                .as_ref()
                .and_then(|d| d.get("image"))
                .and_then(Value::as_str),
            _ => None,
        };
        match image {
            Some(image) => vec![ContentBlock::png(image)],
            None => {
                let data = result.data.as_ref().map(Value::to_string).unwrap_or_default();
                vec![ContentBlock::text(format!("Success: {data}"))]
            }
        }
    } else {
        let error = result.error.as_deref().unwrap_or("unknown error");
        vec![ContentBlock::text(format!("Error: {error}"))]
    };
    ContentBlock::ToolResult {
        tool_use_id: tool_use_id.to_string(),
        content,
        is_error: !result.success,
    }
}
