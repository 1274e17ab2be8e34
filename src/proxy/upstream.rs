/// Chat engine client.
/// The engine answers with a `text/event-stream` of JSON events; this module
/// turns that into a [`ChatEventStream`].
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::models::chat::{ChatEvent, ChatEventStream, ChatRequest, WireChatEvent};

/// Producer of chat events for a question. Errors mean the chat could not be
/// started; failures after that arrive as [`ChatEvent::Error`].
#[async_trait]
pub trait ChatEngine: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatEventStream>;
}

pub struct RemoteChatEngine {
    client: ClientWithMiddleware,
    chat_url: String,
}

impl RemoteChatEngine {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        // No total timeout: answers stream for as long as the engine talks.
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            chat_url: format!("{}/internal/v1/chat", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ChatEngine for RemoteChatEngine {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatEventStream> {
        let resp = self
            .client
            .post(&self.chat_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .body(serde_json::to_vec(&req)?)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("chat engine request failed after retries: {}", e);
                anyhow::anyhow!("chat engine unavailable: {}", e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat engine returned {}: {}", status, body.trim());
        }

        Ok(parse_event_stream(resp.bytes_stream().boxed()))
    }
}

struct SseState<E> {
    body: BoxStream<'static, Result<Bytes, E>>,
    buf: Vec<u8>,
    pending: VecDeque<ChatEvent>,
    closed: bool,
}

impl<E> SseState<E> {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.push_line(&line);
        }
    }

    fn push_line(&mut self, line: &[u8]) {
        if let Some(event) = parse_sse_line(&String::from_utf8_lossy(line)) {
            self.pending.push_back(event);
        }
    }
}

/// Parse a byte stream of SSE lines into chat events. Transport errors end
/// the stream with a [`ChatEvent::Error`].
pub fn parse_event_stream<E>(body: BoxStream<'static, Result<Bytes, E>>) -> ChatEventStream
where
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        body,
        buf: Vec::new(),
        pending: VecDeque::new(),
        closed: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            if st.closed {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(&chunk);
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.closed = true;
                    st.pending
                        .push_back(ChatEvent::Error(format!("chat engine stream failed: {}", e)));
                }
                None => {
                    st.closed = true;
                    let tail = std::mem::take(&mut st.buf);
                    st.push_line(&tail);
                }
            }
        }
    })
    .boxed()
}

/// One SSE line. Comments, blank lines, `[DONE]` markers, malformed JSON and
/// event types the gateway does not consume yield `None`.
pub fn parse_sse_line(line: &str) -> Option<ChatEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<WireChatEvent>(data) {
        Ok(wire) => wire.into_event(),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed chat engine event");
            None
        }
    }
}
