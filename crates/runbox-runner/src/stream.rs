//! Job-stream client feeding input events into running sandboxes.
//!
//! For each claimed job the runner opens a WebSocket onto the job's stream
//! endpoint, picks the `{jobId, event: {type: "input", ...}}` frames out of
//! the relay traffic and hands them to the sandbox's input bridge. The
//! connection reconnects with a short delay until the job's feed is
//! dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use runbox::{InputEvent, InputFeed, InputSource};

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Input source backed by the server's per-job stream endpoint.
#[derive(Debug, Clone)]
pub struct StreamInputSource {
    base_url: String,
}

impl StreamInputSource {
    /// Source connecting to the given server base URL.
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }

    fn stream_url(&self, job_id: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.base_url)
        };
        format!("{ws_base}/api/run/{job_id}/stream")
    }
}

#[async_trait]
impl InputSource for StreamInputSource {
    async fn open(&self, job_id: &str) -> Option<InputFeed> {
        let (tx, rx) = mpsc::channel(64);
        let stop = CancellationToken::new();
        let token = stop.clone();
        let url = self.stream_url(job_id);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            stream_loop(url, job_id, tx, token).await;
        });
        Some(InputFeed::new(rx, stop))
    }
}

async fn stream_loop(
    url: String,
    job_id: String,
    events: mpsc::Sender<InputEvent>,
    stop: CancellationToken,
) {
    while !stop.is_cancelled() {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                tracing::debug!(job_id = %job_id, "input stream connected");
                loop {
                    let message = tokio::select! {
                        () = stop.cancelled() => return,
                        message = ws.next() => message,
                    };
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(input) = parse_input_frame(text.as_str())
                                && events.send(input).await.is_err()
                            {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::debug!(job_id = %job_id, %error, "input stream error");
                            break;
                        }
                    }
                }
            }
            Err(error) => {
                tracing::debug!(job_id = %job_id, %error, "input stream connect failed");
            }
        }

        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Pick the input event out of a relay frame, if it carries one.
fn parse_input_frame(text: &str) -> Option<InputEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let event = value.get("event")?;
    if event.get("type").and_then(|t| t.as_str()) != Some("input") {
        return None;
    }
    serde_json::from_value(event.get("input")?.clone()).ok()
}
