//! Event model of the chat engine.
//!
//! The engine answers a question as an ordered stream of events: text
//! increments, token usage totals, and a terminal `done` or `error`.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Entry point a chat request came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    Web,
    Widget,
    OpenaiApi,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub kb_id: String,
    pub app_type: AppType,
    pub remote_ip: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Data(String),
    Usage(TokenUsage),
    Done,
    Error(String),
}

/// Single-consumer event stream. Dropping it abandons the producer.
pub type ChatEventStream = BoxStream<'static, ChatEvent>;

/// SSE payload emitted by the chat engine:
/// `{"type":"data","content":"..."}`, `{"type":"usage","usage":{...}}`, ...
#[derive(Debug, Deserialize)]
pub struct WireChatEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub error: String,
}

impl WireChatEvent {
    /// Event types the gateway does not consume (references, conversation
    /// ids, ...) and usage frames without totals map to `None`.
    pub fn into_event(self) -> Option<ChatEvent> {
        match self.kind.as_str() {
            "data" => Some(ChatEvent::Data(self.content)),
            "usage" => self.usage.map(ChatEvent::Usage),
            "done" => Some(ChatEvent::Done),
            "error" => {
                let message = if self.content.is_empty() {
                    self.error
                } else {
                    self.content
                };
                Some(ChatEvent::Error(message))
            }
            _ => None,
        }
    }
}
