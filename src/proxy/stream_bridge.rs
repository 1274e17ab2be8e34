//! Stream bridge: engine events to an SSE response body.
//!
//! [`bridge_events`] spawns a task that reads the engine's event stream,
//! encodes each event and forwards the frames over a bounded channel that
//! backs the response body. The task owns the call's [`AuditGuard`]:
//! - `done`: closing frames are sent, then the call is audited as success
//! - `error` or end of stream without `done`: audited as `internal_error`;
//!   the body ends without an error frame
//! - client disconnect (receiver dropped): reading stops, the engine stream
//!   is dropped and the guard records the disconnect

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::errors::OpenAIErrorKind;
use crate::middleware::audit::{AuditGuard, CallOutcome};
use crate::models::chat::ChatEventStream;
use crate::proxy::stream::{ChunkEncoder, StreamStep};

const CHANNEL_CAPACITY: usize = 64;

pub fn bridge_events(events: ChatEventStream, encoder: ChunkEncoder, guard: AuditGuard) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let outcome = pump(events, encoder, &tx).await;
        match outcome {
            Some(outcome) => guard.finish(outcome).await,
            None => drop(guard),
        }
        // body ends only after the audit row is written
        drop(tx);
    });

    Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx))
}

/// Forward events until a terminal event. `None` means the client went away.
async fn pump(
    mut events: ChatEventStream,
    mut encoder: ChunkEncoder,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Option<CallOutcome> {
    loop {
        let event = tokio::select! {
            biased;
            _ = tx.closed() => return None,
            ev = events.next() => ev,
        };

        let Some(event) = event else {
            tracing::warn!("chat engine stream ended without done event");
            return Some(
                CallOutcome::failure(OpenAIErrorKind::Internal, "stream ended without done event")
                    .with_usage(encoder.usage()),
            );
        };

        match encoder.push(event) {
            StreamStep::Skip => {}
            StreamStep::Frames(frames) => {
                if !send_all(tx, frames).await {
                    return None;
                }
            }
            StreamStep::Done(frames) => {
                if !send_all(tx, frames).await {
                    return None;
                }
                return Some(CallOutcome::success(encoder.usage()));
            }
            StreamStep::Failed(message) => {
                tracing::warn!(error = %message, "chat engine stream failed");
                return Some(
                    CallOutcome::failure(OpenAIErrorKind::Internal, message)
                        .with_usage(encoder.usage()),
                );
            }
        }
    }
}

async fn send_all(tx: &mpsc::Sender<Result<Bytes, std::io::Error>>, frames: Vec<Bytes>) -> bool {
    for frame in frames {
        if tx.send(Ok(frame)).await.is_err() {
            return false;
        }
    }
    true
}
