use anyhow::bail;
use async_trait::async_trait;
use deskhand::claude::{AssistantReply, ContentBlock, Message, MessageRequest, Role, StopReason};
use deskhand::{
    ActionKind, Agent, AgentConfig, AgentError, ConfirmationMode, NoopDesktop, Reasoner,
    RunStatus,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug)]
struct Seen {
    system: String,
    messages: Vec<Message>,
    tools: Vec<String>,
}

/// Plays back canned replies in order, then repeats `fallback` (or fails).
struct Scripted {
    replies: Mutex<VecDeque<Result<AssistantReply, AgentError>>>,
    fallback: Option<AssistantReply>,
    seen: Mutex<Vec<Seen>>,
}

impl Scripted {
    fn new(replies: Vec<Result<AssistantReply, AgentError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn forever(reply: AssistantReply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    fn calls(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reasoner for Scripted {
    async fn respond(&self, request: &MessageRequest<'_>) -> Result<AssistantReply, AgentError> {
        self.seen.lock().unwrap().push(Seen {
            system: request.system.to_string(),
            messages: request.messages.to_vec(),
            tools: request.tools.iter().map(|t| t.name.clone()).collect(),
        });
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| AgentError::Reasoner("script exhausted".into())),
        }
    }
}

fn tool_use(id: &str, name: &str, input: Value) -> ContentBlock {
    ContentBlock::ToolUse {
        id: id.into(),
        name: name.into(),
        input,
    }
}

fn reply(stop_reason: StopReason, content: Vec<ContentBlock>) -> AssistantReply {
    AssistantReply {
        stop_reason,
        content,
    }
}

fn done() -> Result<AssistantReply, AgentError> {
    Ok(reply(StopReason::EndTurn, vec![ContentBlock::text("All done.")]))
}

fn config() -> AgentConfig {
    AgentConfig {
        safety_delay: Duration::ZERO,
        rate_limit: Duration::ZERO,
        ..Default::default()
    }
}

fn agent(reasoner: Scripted, cfg: AgentConfig) -> Agent<Scripted, NoopDesktop, NoopDesktop> {
    Agent::new(reasoner, NoopDesktop::default(), NoopDesktop::default(), cfg)
}

fn push_event(ctx: &mut deskhand::AgentContext, event: impl Into<String>) {
    let events = ctx
        .state
        .entry("events")
        .or_insert_with(|| json!([]));
    if let Some(list) = events.as_array_mut() {
        list.push(json!(event.into()));
    }
}

#[tokio::test]
async fn every_tool_use_gets_one_result_in_order() {
    let script = Scripted::new(vec![
        Ok(reply(
            StopReason::ToolUse,
            vec![
                ContentBlock::text("Clicking the field, then typing."),
                tool_use("a", "click", json!({ "x": 10, "y": 20 })),
                tool_use("b", "type", json!({ "text": "hi" })),
            ],
        )),
        done(),
    ]);
    let mut agent = agent(script, config());
    let report = agent.run("fill the form", 5, None).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.success());
    assert_eq!(report.iterations, 2);
    assert_eq!(report.action_history.len(), 2);
    assert_eq!(report.action_history[0].kind, ActionKind::Click);
    assert_eq!(report.action_history[1].kind, ActionKind::Type);
    assert_eq!(agent.executor().action_count(), 2);

    let calls = agent.reasoner().calls();
    assert_eq!(calls.len(), 2);

    let first = &calls[0].messages;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].role, Role::User);
    assert!(matches!(first[0].content[0], ContentBlock::Image { .. }));
    assert_eq!(first[0].content[1], ContentBlock::text("fill the form"));

    let second = &calls[1].messages;
    assert_eq!(second.len(), 3);
    assert_eq!(second[1].role, Role::Assistant);
    assert_eq!(second[2].role, Role::User);
    let ids: Vec<_> = second[2]
        .content
        .iter()
        .map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, is_error, .. } => {
                assert!(!is_error);
                tool_use_id.as_str()
            }
            other => panic!("expected tool_result, got {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn iteration_budget_bounds_reasoner_calls() {
    let script = Scripted::forever(reply(
        StopReason::ToolUse,
        vec![tool_use("s", "screenshot", json!({}))],
    ));
    let mut agent = agent(script, config());
    let report = agent.run("never finishes", 3, None).await;

    assert_eq!(agent.reasoner().calls().len(), 3);
    assert_eq!(report.status, RunStatus::Exhausted);
    assert!(!report.success());
    assert_eq!(report.iterations, 3);
    assert_eq!(report.action_history.len(), 3);
    assert!(report.error.is_none());
}

#[tokio::test]
async fn screenshot_tool_result_is_an_image() {
    let script = Scripted::new(vec![
        Ok(reply(StopReason::ToolUse, vec![tool_use("s", "screenshot", json!({}))])),
        done(),
    ]);
    let mut agent = agent(script, config());
    agent.run("look", 2, None).await;

    let calls = agent.reasoner().calls();
    match &calls[1].messages[2].content[0] {
        ContentBlock::ToolResult { content, .. } => {
            assert!(matches!(content[0], ContentBlock::Image { .. }))
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn reasoner_failure_ends_run_with_partial_state() {
    let script = Scripted::new(vec![
        Ok(reply(StopReason::ToolUse, vec![tool_use("a", "key", json!({ "key": "enter" }))])),
        Err(AgentError::Reasoner("503 overloaded".into())),
    ]);
    let mut agent = agent(script, config());
    agent.on_after_action(|ctx, _, _| {
        ctx.state.insert("acted".into(), json!(true));
        Ok(())
    });
    let report = agent.run("press enter", 5, None).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_iteration, Some(1));
    assert!(report.error.as_deref().unwrap_or_default().contains("503 overloaded"));
    assert_eq!(report.action_history.len(), 1);
    assert_eq!(report.state["acted"], json!(true));
}

#[tokio::test]
async fn hook_failure_aborts_without_phantom_history() {
    let script = Scripted::new(vec![
        Ok(reply(StopReason::ToolUse, vec![tool_use("a", "click", json!({ "x": 1, "y": 1 }))])),
        done(),
    ]);
    let mut agent = agent(script, config());
    agent.on_before_action(|_, _| bail!("blocked by guard"));
    let report = agent.run("click", 5, None).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_iteration, Some(0));
    assert!(report.action_history.is_empty());
    assert_eq!(agent.executor().action_count(), 0);
    assert_eq!(agent.reasoner().calls().len(), 1);
}

#[tokio::test]
async fn failing_screenshot_hook_fails_before_first_turn() {
    let mut agent = agent(Scripted::new(vec![done()]), config());
    agent.on_before_screenshot(|_| bail!("camera off"));
    let report = agent.run("anything", 5, None).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_iteration, None);
    assert_eq!(report.iterations, 0);
    assert!(agent.reasoner().calls().is_empty());
}

#[tokio::test]
async fn other_stop_reasons_take_no_action_and_continue() {
    let script = Scripted::new(vec![
        Ok(reply(
            StopReason::MaxTokens,
            vec![tool_use("x", "click", json!({ "x": 1, "y": 1 }))],
        )),
        done(),
    ]);
    let mut agent = agent(script, config());
    agent.on_iteration_end(|ctx, i| {
        push_event(ctx, format!("end:{i}"));
        Ok(())
    });
    let report = agent.run("truncated", 5, None).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.iterations, 2);
    assert!(report.action_history.is_empty());
    assert_eq!(agent.executor().action_count(), 0);
    assert_eq!(report.state["events"], json!(["end:0", "end:1"]));
    // assistant reply appended without a tool_result message
    assert_eq!(agent.reasoner().calls()[1].messages.len(), 2);
}

#[tokio::test]
async fn hooks_fire_in_lifecycle_order() {
    let script = Scripted::new(vec![
        Ok(reply(StopReason::ToolUse, vec![tool_use("a", "click", json!({ "x": 3, "y": 4 }))])),
        done(),
    ]);
    let mut agent = agent(script, config());
    agent
        .on_before_screenshot(|ctx| {
            push_event(ctx, "screenshot");
            Ok(())
        })
        .on_iteration_start(|ctx, i| {
            assert_eq!(ctx.iteration(), i);
            push_event(ctx, format!("start:{i}"));
            Ok(())
        })
        .on_tool_call("click", |ctx, _| {
            push_event(ctx, "tool_call:click");
            Ok(None)
        })
        .on_any_tool_call(|ctx, name, _| {
            push_event(ctx, format!("tool_call:*:{name}"));
            Ok(None)
        })
        .on_before_action(|ctx, _| {
            push_event(ctx, "before_action");
            Ok(None)
        })
        .on_after_action(|ctx, _, result| {
            push_event(ctx, format!("after_action:{}", result.success));
            Ok(())
        })
        .on_iteration_end(|ctx, i| {
            push_event(ctx, format!("end:{i}"));
            Ok(())
        });
    let report = agent.run("click once", 5, None).await;

    assert_eq!(
        report.state["events"],
        json!([
            "screenshot",
            "start:0",
            "tool_call:click",
            "tool_call:*:click",
            "before_action",
            "after_action:true",
            "end:0",
            "start:1",
            "end:1",
        ])
    );
}

#[tokio::test]
async fn tool_call_hook_rewrites_the_action() {
    let script = Scripted::new(vec![
        Ok(reply(StopReason::ToolUse, vec![tool_use("a", "click", json!({ "x": 5, "y": 5 }))])),
        done(),
    ]);
    let mut agent = agent(script, config());
    agent.on_tool_call("click", |_, input| {
        let mut input = input.clone();
        input["x"] = json!(50);
        Ok(Some(input))
    });
    let report = agent.run("click", 5, None).await;

    assert_eq!(report.action_history[0].data.as_ref().unwrap()["x"], json!(50));
}

#[tokio::test]
async fn custom_and_unknown_tools_report_back_to_the_model() {
    let script = Scripted::new(vec![
        Ok(reply(
            StopReason::ToolUse,
            vec![
                tool_use("a", "lookup", json!({ "id": 7 })),
                tool_use("b", "fly", json!({})),
            ],
        )),
        done(),
    ]);
    let mut agent = agent(script, config());
    agent.register_tool("lookup", "Look up a record", json!({ "type": "object" }), |_, args| {
        Ok(json!({ "name": format!("record-{}", args["id"]) }))
    });
    let report = agent.run("lookup", 5, None).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.action_history[0].kind, ActionKind::Custom);
    assert_eq!(report.action_history[1].kind, ActionKind::Unknown);

    let calls = agent.reasoner().calls();
    assert_eq!(calls[0].tools.last().map(String::as_str), Some("lookup"));
    assert_eq!(calls[0].tools[0], "screenshot");

    let results = &calls[1].messages[2].content;
    assert_eq!(
        results[0],
        ContentBlock::ToolResult {
            tool_use_id: "a".into(),
            content: vec![ContentBlock::text(r#"Success: {"result":{"name":"record-7"}}"#)],
            is_error: false,
        }
    );
    assert_eq!(
        results[1],
        ContentBlock::ToolResult {
            tool_use_id: "b".into(),
            content: vec![ContentBlock::text("Error: Unknown tool: fly")],
            is_error: true,
        }
    );
}

#[tokio::test]
async fn system_prompt_defaults_and_can_be_overridden() {
    let mut agent = agent(Scripted::new(vec![done(), done()]), config());
    agent.run("one", 1, None).await;
    agent.run("two", 1, Some("Only use the keyboard.")).await;

    let calls = agent.reasoner().calls();
    assert!(calls[0].system.starts_with("You are a computer use agent."));
    assert_eq!(calls[1].system, "Only use the keyboard.");
}

#[tokio::test]
async fn dry_run_records_actions_without_executing() {
    let script = Scripted::new(vec![
        Ok(reply(
            StopReason::ToolUse,
            vec![
                tool_use("a", "click", json!({ "x": 1, "y": 2 })),
                tool_use("b", "scroll", json!({ "direction": "down" })),
            ],
        )),
        done(),
    ]);
    let cfg = AgentConfig {
        confirmation_mode: ConfirmationMode::DryRun,
        ..config()
    };
    let mut agent = agent(script, cfg);
    let report = agent.run("rehearse", 5, None).await;

    assert_eq!(agent.executor().action_count(), 0);
    assert_eq!(report.action_history.len(), 2);
    for result in &report.action_history {
        assert!(result.success);
        assert_eq!(result.data, Some(json!({ "dry_run": true })));
    }
}

#[tokio::test]
async fn session_steps_one_turn_at_a_time() {
    let script = Scripted::new(vec![
        Ok(reply(
            StopReason::ToolUse,
            vec![
                ContentBlock::text("I will press tab."),
                tool_use("a", "key", json!({ "key": "tab" })),
            ],
        )),
        done(),
    ]);
    let mut agent = agent(script, config());
    let mut session = agent.start("tab once", 5, None);

    let first = session.next_turn().await.unwrap().expect("first turn");
    assert_eq!(first.iteration, 0);
    assert_eq!(first.stop_reason, StopReason::ToolUse);
    assert_eq!(first.reasoning.as_deref(), Some("I will press tab."));
    assert_eq!(first.tool_calls.len(), 1);
    assert_eq!(first.tool_calls[0].id, "a");
    assert!(first.tool_calls[0].result.success);
    assert_eq!(session.context().action_history().len(), 1);
    assert_eq!(session.status(), None);

    let second = session.next_turn().await.unwrap().expect("second turn");
    assert!(second.is_final());
    assert_eq!(session.status(), Some(RunStatus::Completed));
    assert!(session.next_turn().await.unwrap().is_none());

    let report = session.into_report();
    assert!(report.success());
    assert_eq!(report.iterations, 2);
    assert_eq!(report.goal, "tab once");
}

#[tokio::test]
async fn abandoned_session_reports_stopped() {
    let script = Scripted::forever(reply(
        StopReason::ToolUse,
        vec![tool_use("a", "mouse_move", json!({ "x": 1, "y": 1, "duration": 0 }))],
    ));
    let mut agent = agent(script, config());
    let mut session = agent.start("wander", 10, None);
    session.next_turn().await.unwrap();
    let report = session.into_report();

    assert_eq!(report.status, RunStatus::Stopped);
    assert_eq!(report.iterations, 1);
}

#[tokio::test]
async fn conditional_handler_sees_built_in_actions() {
    let script = Scripted::new(vec![
        Ok(reply(
            StopReason::ToolUse,
            vec![
                tool_use("a", "type", json!({ "text": "me@example.com" })),
                tool_use("b", "type", json!({ "text": "hunter2" })),
            ],
        )),
        done(),
    ]);
    let mut agent = agent(script, config());
    agent.when(
        ActionKind::Type,
        |_, action| Ok(action["text"].as_str().is_some_and(|t| t.contains('@'))),
        |ctx, action| {
            ctx.state.insert("email".into(), action["text"].clone());
            Ok(())
        },
    );
    let report = agent.run("log in", 5, None).await;

    assert_eq!(report.state["email"], json!("me@example.com"));
}
