//! Live job stream relay.
//!
//! One WebSocket per job multiplexes two sources: full-record updates from
//! the store and raw side-channel events from the bus, sent as distinct
//! frame shapes (`{jobId, job}` and `{jobId, event}`). Inbound text frames
//! carry input events from the browser, which are republished on the bus
//! for whoever drives the sandbox.
//!
//! The relay tears down the moment the job reaches a terminal status, the
//! record is evicted, or the peer disconnects, whichever comes first; both
//! subscriptions drop together, so a relay never outlives its job or its
//! transport.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use runbox::{InputEvent, JobEvent, JobRecord};

use crate::routes::AppState;

/// GET /api/run/:jobId/stream (WebSocket upgrade).
pub async fn job_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| relay(socket, state, job_id))
}

async fn relay(mut socket: WebSocket, state: AppState, job_id: String) {
    let Some((snapshot, mut updates)) = state.store.subscribe(&job_id) else {
        tracing::debug!(job_id = %job_id, "stream requested for unknown job");
        let _ = socket.close().await;
        return;
    };
    let mut events = state.bus.subscribe(&job_id);
    let mut events_open = true;

    let (mut sink, mut peer) = socket.split();

    if send_job_frame(&mut sink, &job_id, &snapshot).await.is_err() {
        return;
    }
    if snapshot.status.is_terminal() {
        let _ = sink.close().await;
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(record) => {
                    let terminal = record.status.is_terminal();
                    if send_job_frame(&mut sink, &job_id, &record).await.is_err() {
                        break;
                    }
                    if terminal {
                        let _ = sink.close().await;
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %job_id, skipped, "stream lagged behind job updates");
                }
                // record evicted; nothing further will ever arrive
                Err(RecvError::Closed) => {
                    let _ = sink.close().await;
                    break;
                }
            },
            event = events.recv(), if events_open => match event {
                Ok(event) => {
                    if send_event_frame(&mut sink, &job_id, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %job_id, skipped, "stream lagged behind side-channel events");
                }
                Err(RecvError::Closed) => events_open = false,
            },
            message = peer.next() => match message {
                Some(Ok(Message::Text(text))) => handle_peer_message(&state, &job_id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(job_id = %job_id, %error, "stream transport error");
                    break;
                }
            },
        }
    }
}

async fn send_job_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    job_id: &str,
    record: &JobRecord,
) -> Result<(), axum::Error> {
    let frame = json!({ "jobId": job_id, "job": record }).to_string();
    sink.send(Message::Text(frame.into())).await
}

async fn send_event_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    job_id: &str,
    event: &JobEvent,
) -> Result<(), axum::Error> {
    let frame = json!({ "jobId": job_id, "event": event }).to_string();
    sink.send(Message::Text(frame.into())).await
}

/// Inbound frames: `{type: "input", input: {...}}` republishes the input
/// event on the job's side-channel topic. Anything else is ignored.
fn handle_peer_message(state: &AppState, job_id: &str, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::debug!(job_id = %job_id, "ignoring unparseable stream message");
        return;
    };
    if value.get("type").and_then(|t| t.as_str()) != Some("input") {
        return;
    }
    match value
        .get("input")
        .cloned()
        .map(serde_json::from_value::<InputEvent>)
    {
        Some(Ok(input)) => state.bus.publish(job_id, JobEvent::Input { input }),
        _ => tracing::debug!(job_id = %job_id, "ignoring malformed input event"),
    }
}
