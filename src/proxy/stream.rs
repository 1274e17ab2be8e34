//! Chat event to OpenAI wire adapters.
//!
//! [`ChunkEncoder`] turns engine events into `chat.completion.chunk` SSE
//! frames. [`CompletionAccumulator`] buffers them into one
//! `chat.completion` object.

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;

use crate::models::chat::{ChatEvent, TokenUsage};
use crate::models::openai::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, Delta, ResponseMessage,
    Usage,
};

pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Id, creation time and model shared by every chunk of one response.
#[derive(Debug, Clone)]
pub struct CompletionIdentity {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl CompletionIdentity {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("chatcmpl-{}", now.timestamp_nanos_opt().unwrap_or_default()),
            created: now.timestamp(),
            model: model.into(),
        }
    }

    fn chunk(&self, choices: Vec<ChunkChoice>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage,
        }
    }
}

/// `data: <json>\n\n`
pub fn sse_frame<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    Ok(Bytes::from(format!("data: {}\n\n", json)))
}

#[derive(Debug)]
pub enum StreamStep {
    /// Frames to forward; keep reading.
    Frames(Vec<Bytes>),
    /// Closing frames; the response is complete.
    Done(Vec<Bytes>),
    /// Abort the stream with this message.
    Failed(String),
    /// Nothing to send.
    Skip,
}

pub struct ChunkEncoder {
    identity: CompletionIdentity,
    include_usage: bool,
    usage: Option<TokenUsage>,
}

impl ChunkEncoder {
    pub fn new(identity: CompletionIdentity, include_usage: bool) -> Self {
        Self {
            identity,
            include_usage,
            usage: None,
        }
    }

    /// Latest usage reported by the engine.
    pub fn usage(&self) -> TokenUsage {
        self.usage.unwrap_or_default()
    }

    pub fn push(&mut self, event: ChatEvent) -> StreamStep {
        match event {
            ChatEvent::Data(content) => {
                let chunk = self.identity.chunk(
                    vec![ChunkChoice {
                        index: 0,
                        delta: Delta {
                            role: Some("assistant".to_string()),
                            content: Some(content),
                        },
                        finish_reason: None,
                    }],
                    None,
                );
                match sse_frame(&chunk) {
                    Ok(frame) => StreamStep::Frames(vec![frame]),
                    Err(e) => StreamStep::Failed(e.to_string()),
                }
            }
            ChatEvent::Usage(usage) => {
                self.usage = Some(usage);
                StreamStep::Skip
            }
            ChatEvent::Done => match self.closing_frames() {
                Ok(frames) => StreamStep::Done(frames),
                Err(e) => StreamStep::Failed(e.to_string()),
            },
            ChatEvent::Error(message) => StreamStep::Failed(message),
        }
    }

    fn closing_frames(&self) -> Result<Vec<Bytes>, serde_json::Error> {
        let mut frames = Vec::with_capacity(3);
        let stop = self.identity.chunk(
            vec![ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some("stop".to_string()),
            }],
            None,
        );
        frames.push(sse_frame(&stop)?);

        if self.include_usage {
            if let Some(usage) = self.usage {
                let usage_chunk = self.identity.chunk(Vec::new(), Some(usage.into()));
                frames.push(sse_frame(&usage_chunk)?);
            }
        }

        frames.push(Bytes::from_static(SSE_DONE.as_bytes()));
        Ok(frames)
    }
}

#[derive(Debug, PartialEq)]
pub enum AccumulatorStep {
    Continue,
    Done,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct CompletionAccumulator {
    content: String,
    usage: Option<TokenUsage>,
}

impl CompletionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage.unwrap_or_default()
    }

    pub fn push(&mut self, event: ChatEvent) -> AccumulatorStep {
        match event {
            ChatEvent::Data(content) => {
                self.content.push_str(&content);
                AccumulatorStep::Continue
            }
            ChatEvent::Usage(usage) => {
                self.usage = Some(usage);
                AccumulatorStep::Continue
            }
            ChatEvent::Done => AccumulatorStep::Done,
            ChatEvent::Error(message) => AccumulatorStep::Failed(message),
        }
    }

    /// `usage` is left out when the engine never reported it.
    pub fn into_response(self, identity: CompletionIdentity) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: identity.id,
            object: "chat.completion".to_string(),
            created: identity.created,
            model: identity.model,
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: self.content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: self.usage.map(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage() -> TokenUsage {
        TokenUsage {
            prompt_tokens: 5,
            completion_tokens: 3,
            total_tokens: 8,
        }
    }

    fn frame_json(frame: &Bytes) -> serde_json::Value {
        let text = std::str::from_utf8(frame).unwrap();
        let body = text.strip_prefix("data: ").unwrap().strip_suffix("\n\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    fn encode_all(include_usage: bool) -> Vec<Bytes> {
        let mut enc = ChunkEncoder::new(CompletionIdentity::new("gpt-4o"), include_usage);
        let mut out = Vec::new();
        for ev in [
            ChatEvent::Data("A".into()),
            ChatEvent::Data("B".into()),
            ChatEvent::Usage(usage()),
            ChatEvent::Done,
        ] {
            match enc.push(ev) {
                StreamStep::Frames(f) | StreamStep::Done(f) => out.extend(f),
                StreamStep::Skip => {}
                StreamStep::Failed(m) => panic!("unexpected failure: {m}"),
            }
        }
        assert_eq!(enc.usage(), usage());
        out
    }

    #[test]
    fn test_stream_with_usage() {
        let frames = encode_all(true);
        assert_eq!(frames.len(), 5);

        let a = frame_json(&frames[0]);
        assert_eq!(a["object"], "chat.completion.chunk");
        assert_eq!(a["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(a["choices"][0]["delta"]["content"], "A");
        assert!(a["choices"][0]["finish_reason"].is_null());
        assert_eq!(frame_json(&frames[1])["choices"][0]["delta"]["content"], "B");

        let stop = frame_json(&frames[2]);
        assert_eq!(stop["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(stop["choices"][0]["finish_reason"], "stop");

        let usage_chunk = frame_json(&frames[3]);
        assert_eq!(usage_chunk["choices"], serde_json::json!([]));
        assert_eq!(usage_chunk["usage"]["total_tokens"], 8);

        assert_eq!(&frames[4][..], SSE_DONE.as_bytes());

        // one identity for the whole response
        assert_eq!(a["id"], usage_chunk["id"]);
        assert_eq!(a["created"], stop["created"]);
    }

    #[test]
    fn test_stream_without_usage_option() {
        let frames = encode_all(false);
        assert_eq!(frames.len(), 4);
        assert_eq!(&frames[3][..], SSE_DONE.as_bytes());
    }

    #[test]
    fn test_error_event_fails_stream() {
        let mut enc = ChunkEncoder::new(CompletionIdentity::new("m"), true);
        assert!(matches!(enc.push(ChatEvent::Error("boom".into())), StreamStep::Failed(m) if m == "boom"));
    }

    #[test]
    fn test_accumulated_completion() {
        let mut acc = CompletionAccumulator::new();
        assert_eq!(acc.push(ChatEvent::Data("A".into())), AccumulatorStep::Continue);
        assert_eq!(acc.push(ChatEvent::Data("B".into())), AccumulatorStep::Continue);
        assert_eq!(acc.push(ChatEvent::Usage(usage())), AccumulatorStep::Continue);
        assert_eq!(acc.push(ChatEvent::Done), AccumulatorStep::Done);

        let resp = acc.into_response(CompletionIdentity::new("gpt-4o"));
        assert_eq!(resp.object, "chat.completion");
        assert_eq!(resp.choices[0].message.content, "AB");
        assert_eq!(resp.choices[0].finish_reason, "stop");
        assert_eq!(resp.usage.unwrap().total_tokens, 8);
    }

    #[test]
    fn test_accumulated_completion_without_usage() {
        let mut acc = CompletionAccumulator::new();
        acc.push(ChatEvent::Data("A".into()));
        assert_eq!(acc.push(ChatEvent::Done), AccumulatorStep::Done);

        let resp = acc.into_response(CompletionIdentity::new("m"));
        assert!(resp.usage.is_none());
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("usage").is_none());
    }

    #[test]
    fn test_identity_format() {
        let id = CompletionIdentity::new("m");
        assert!(id.id.starts_with("chatcmpl-"));
        assert!(id.id["chatcmpl-".len()..].parse::<i64>().is_ok());
        assert!(id.created > 0);
    }
}
