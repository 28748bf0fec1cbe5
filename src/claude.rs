use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use tracing::debug;

use crate::agent::{AgentError, Reasoner};

#[derive(Clone)]
pub struct ClaudeConfig {
    pub api_base: String,          // e.g. "https://api.anthropic.com/v1"
    pub api_key: String,           // env ANTHROPIC_API_KEY
    pub anthropic_version: String, // "2023-06-01"
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".into()),
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            anthropic_version: "2023-06-01".into(),
        }
    }
}

// ========================= Conversation Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String, // "base64"
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "base64".into(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn png(data: impl Into<String>) -> Self {
        Self::base64("image/png", data)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn png(data: impl Into<String>) -> Self {
        ContentBlock::Image {
            source: ImageSource::png(data),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content }
    }

    /// `(id, name, input)` of every tool-use block, in order of appearance.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

/// Why the service stopped generating.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn as_str(&self) -> &str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Other(s) => s,
        }
    }
}

impl From<String> for StopReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::Other(s),
        }
    }
}

impl From<StopReason> for String {
    fn from(r: StopReason) -> Self {
        r.as_str().to_string()
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssistantReply {
    pub stop_reason: StopReason,
    pub content: Vec<ContentBlock>,
}

impl AssistantReply {
    /// First text block of the reply, if any.
    pub fn reasoning(&self) -> Option<&str> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::Text { text } if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Serialize)]
pub struct MessageRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSchema],
}

// ========================= HTTP Client =========================

#[derive(Clone)]
pub struct ClaudeClient {
    http: Client,
    cfg: ClaudeConfig,
}

impl ClaudeClient {
    pub fn new(cfg: ClaudeConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("ANTHROPIC_API_KEY missing");
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    pub async fn create_message(&self, req: &MessageRequest<'_>) -> Result<AssistantReply> {
        let url = format!("{}/messages", self.cfg.api_base.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", &self.cfg.anthropic_version)
            .json(req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Anthropic error {}: {}", status, text);
        }
        let v: Value =
            serde_json::from_str(&text).context("failed to parse Anthropic response JSON")?;
        Self::parse_reply(v)
    }

    fn parse_reply(v: Value) -> Result<AssistantReply> {
        let stop_reason = v
            .get("stop_reason")
            .and_then(|x| x.as_str())
            .map(|s| StopReason::from(s.to_string()))
            .context("missing stop_reason")?;
        let blocks = v
            .get("content")
            .and_then(|x| x.as_array())
            .context("missing content")?;

        let mut content = Vec::with_capacity(blocks.len());
        for b in blocks {
            let kind = b.get("type").and_then(|x| x.as_str()).unwrap_or_default();
            match kind {
                "text" | "image" | "tool_use" | "tool_result" => {
                    let block = serde_json::from_value(b.clone())
                        .with_context(|| format!("malformed {kind} block"))?;
                    content.push(block);
                }
                // thinking, redacted_thinking, server tool blocks...
                other => debug!(block = other, "skipping unsupported content block"),
            }
        }
        Ok(AssistantReply { stop_reason, content })
    }
}

#[async_trait]
impl Reasoner for ClaudeClient {
    async fn respond(&self, request: &MessageRequest<'_>) -> Result<AssistantReply, AgentError> {
        self.create_message(request)
            .await
            .map_err(|e| AgentError::Reasoner(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ClaudeClient {
        ClaudeClient::new(ClaudeConfig {
            api_base: format!("{}/v1", server.uri()),
            api_key: "test-key".into(),
            anthropic_version: "2023-06-01".into(),
        })
        .expect("client")
    }

    fn request<'a>(messages: &'a [Message], tools: &'a [ToolSchema]) -> MessageRequest<'a> {
        MessageRequest {
            model: "claude-test",
            max_tokens: 512,
            system: "be careful",
            messages,
            tools,
        }
    }

    #[test]
    fn new_rejects_empty_key() {
        let cfg = ClaudeConfig {
            api_base: "http://localhost".into(),
            api_key: String::new(),
            anthropic_version: "2023-06-01".into(),
        };
        assert!(ClaudeClient::new(cfg).is_err());
    }

    #[tokio::test]
    async fn create_message_parses_tool_use_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({
                "model": "claude-test",
                "max_tokens": 512,
                "system": "be careful",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "stop_reason": "tool_use",
                "content": [
                    { "type": "thinking", "thinking": "hmm", "signature": "x" },
                    { "type": "text", "text": "Clicking the button." },
                    { "type": "tool_use", "id": "toolu_1", "name": "click", "input": { "x": 10, "y": 20 } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let messages = vec![Message::user(vec![ContentBlock::text("hello")])];
        let reply = client_for(&server)
            .create_message(&request(&messages, &[]))
            .await
            .expect("reply");

        assert_eq!(reply.stop_reason, StopReason::ToolUse);
        assert_eq!(reply.reasoning(), Some("Clicking the button."));
        assert_eq!(reply.content.len(), 2);
        let msg = Message::assistant(reply.content);
        let uses: Vec<_> = msg.tool_uses().collect();
        assert_eq!(uses, vec![("toolu_1", "click", &json!({ "x": 10, "y": 20 }))]);
    }

    #[tokio::test]
    async fn error_status_surfaces_as_reasoner_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .respond(&request(&[], &[]))
            .await
            .expect_err("should fail");
        match err {
            AgentError::Reasoner(msg) => {
                assert!(msg.contains("529"), "{msg}");
                assert!(msg.contains("overloaded"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_without_stop_reason_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "content": [] })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .create_message(&request(&[], &[]))
            .await
            .expect_err("malformed reply");
        assert!(err.to_string().contains("stop_reason"));
    }

    #[test]
    fn tool_result_wire_shape() {
        let ok = ContentBlock::ToolResult {
            tool_use_id: "a".into(),
            content: vec![ContentBlock::png("AAAA")],
            is_error: false,
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({
                "type": "tool_result",
                "tool_use_id": "a",
                "content": [{
                    "type": "image",
                    "source": { "type": "base64", "media_type": "image/png", "data": "AAAA" }
                }]
            })
        );

        let failed = ContentBlock::ToolResult {
            tool_use_id: "b".into(),
            content: vec![ContentBlock::text("Error: boom")],
            is_error: true,
        };
        assert_eq!(serde_json::to_value(&failed).unwrap()["is_error"], json!(true));
    }

    #[test]
    fn unknown_stop_reason_is_preserved() {
        let r: StopReason = serde_json::from_value(json!("pause_turn")).unwrap();
        assert_eq!(r, StopReason::Other("pause_turn".into()));
        assert_eq!(r.to_string(), "pause_turn");
    }
}
