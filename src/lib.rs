pub mod agent;
pub mod browser;
pub mod claude;
pub mod computer;
pub mod dispatch;
pub mod geometry;
pub mod hooks;
pub mod tools;
pub mod workflow;

pub use agent::{
    ActionKind, ActionResult, Agent, AgentConfig, AgentContext, AgentError, Reasoner, RunReport,
    RunSession, RunStatus, ToolCall, TurnReport,
};
pub use browser::{BrowserConfig, ChromiumDesktop};
pub use claude::{ClaudeClient, ClaudeConfig};
pub use computer::{
    ActionExecutor, DiskScreenshotSink, ImageFormat, MouseButton, NoopDesktop, ScreenCapture,
    ScreenshotSink, ScrollDirection,
};
pub use dispatch::{Approval, AutoApprove, BuiltinAction, ConfirmationMode, ConfirmationPolicy};
pub use geometry::ScreenRegion;
pub use hooks::HookPipeline;
pub use workflow::{ToolDefinition, WorkflowEngine};
