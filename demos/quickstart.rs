use anyhow::Result;
use deskhand::{
    ActionKind, Agent, AgentConfig, BrowserConfig, ChromiumDesktop, ClaudeClient, ClaudeConfig,
    DiskScreenshotSink,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize, JsonSchema)]
struct Note {
    /// What to remember.
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let browser_cfg = BrowserConfig {
        headless: false,
        start_url: Some("https://example.com".into()),
        ..Default::default()
    };
    let desktop = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => ChromiumDesktop::connect(&ws, browser_cfg).await?,
        _ => ChromiumDesktop::launch(browser_cfg).await?,
    };
    let claude = ClaudeClient::new(ClaudeConfig::default())?;

    let runs_dir = std::env::temp_dir().join("deskhand_runs");
    let mut agent = Agent::new(claude, desktop.clone(), desktop, AgentConfig::default())
        .with_screenshot_sink(Arc::new(DiskScreenshotSink::new(&runs_dir)));

    agent
        .on_iteration_start(|_ctx, i| {
            println!("-- turn {}", i + 1);
            Ok(())
        })
        .on_after_action(|ctx, action, result| {
            let n = ctx.state.get("actions").and_then(|v| v.as_u64()).unwrap_or(0);
            ctx.state.insert("actions".into(), json!(n + 1));
            println!("   {action} -> success={}", result.success);
            Ok(())
        })
        .register_typed_tool("remember", "Store a short note for later", |ctx, note: Note| {
            ctx.state.insert("note".into(), json!(note.text));
            Ok(json!({ "stored": true }))
        })
        .when(
            ActionKind::Type,
            |_, action| Ok(action["text"].as_str().is_some_and(|t| t.contains('@'))),
            |ctx, _| {
                ctx.state.insert("typed_email".into(), json!(true));
                Ok(())
            },
        );

    let report = agent
        .run(
            "Find the 'More information' link on the page, click it, and remember the page title.",
            10,
            None,
        )
        .await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("screenshots in {}", runs_dir.join(&report.run_id).display());
    Ok(())
}
