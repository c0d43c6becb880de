// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Azure-style speech backend: duplex push stream with session lifecycle
//! events (`session.started`, hypothesis/phrase results, `speech.cancel`).

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::net;
use super::provider::{
    ProviderError, ProviderEvent, ProviderHealth, ProviderKind, ProviderResult, ProviderStream,
    StreamControl, StreamOptions, TranscriptionProvider,
};
use crate::protocol::stream::TranscriptionKey;

pub struct AzureProvider {
    url: String,
    key: String,
    health: ProviderHealth,
}

impl AzureProvider {
    pub fn new(url: String, key: String) -> Arc<Self> {
        Arc::new(Self { url, key, health: ProviderHealth::default() })
    }

    fn config_frame(key: &TranscriptionKey, opts: &StreamOptions) -> Value {
        let mut frame = json!({
            "type": "speech.config",
            "language": key.transcribe_language().as_str(),
            "format": "simple",
            "sample_rate_hz": opts.sample_rate_hz,
            "profanity": "raw",
        });
        if let Some(target) = key.target_language() {
            frame["translation"] = json!({ "to": [target.as_str()] });
        }
        if opts.fast_start {
            frame["segmentation_silence_ms"] = json!(300);
        }
        frame
    }
}

impl TranscriptionProvider for AzureProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn expected_init_ms(&self) -> u64 {
        1500
    }

    fn create_stream(
        &self,
        key: &TranscriptionKey,
        opts: StreamOptions,
    ) -> BoxFuture<'static, Result<ProviderStream, ProviderError>> {
        let url = self.url.clone();
        let api_key = self.key.clone();
        let config = Self::config_frame(key, &opts);

        Box::pin(async move {
            let mut ws = net::connect(&url, Some(("ocp-apim-subscription-key", &api_key))).await?;

            ws.send(Message::Text(config.to_string().into()))
                .await
                .map_err(|e| net::classify_connect_error(&e))?;

            let (audio_tx, audio_rx) = mpsc::channel::<bytes::Bytes>(64);
            let (event_tx, events) = mpsc::channel::<ProviderEvent>(64);
            let (control_tx, control_rx) = mpsc::unbounded_channel::<StreamControl>();

            tokio::spawn(pump(ws, audio_rx, event_tx, control_rx));

            Ok(ProviderStream { audio_tx, events, control: control_tx })
        })
    }

    fn record_failure(&self, _error: &ProviderError) {
        self.health.record_failure();
    }

    fn record_success(&self) {
        self.health.record_success();
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

async fn pump(
    mut ws: net::WsStream,
    mut audio_rx: mpsc::Receiver<bytes::Bytes>,
    event_tx: mpsc::Sender<ProviderEvent>,
    mut control_rx: mpsc::UnboundedReceiver<StreamControl>,
) {
    loop {
        tokio::select! {
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_event(&text) {
                            let closed = matches!(event, ProviderEvent::Closed | ProviderEvent::Error(_));
                            if event_tx.send(event).await.is_err() || closed {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = event_tx.send(ProviderEvent::Closed).await;
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = event_tx
                            .send(ProviderEvent::Error(ProviderError::Network(e.to_string())))
                            .await;
                        break;
                    }
                    _ => {}
                }
            }
            chunk = audio_rx.recv() => {
                match chunk {
                    Some(pcm) => {
                        if ws.send(Message::Binary(pcm)).await.is_err() {
                            let _ = event_tx
                                .send(ProviderEvent::Error(ProviderError::Network(
                                    "audio write failed".to_owned(),
                                )))
                                .await;
                            break;
                        }
                    }
                    None => break, // stream handle dropped
                }
            }
            ctl = control_rx.recv() => {
                match ctl {
                    Some(StreamControl::Finalize) => {
                        let frame = json!({"type": "speech.flush"});
                        let _ = ws.send(Message::Text(frame.to_string().into())).await;
                    }
                    Some(StreamControl::Close) | None => {
                        let _ = ws.close(None).await;
                        let _ = event_tx.send(ProviderEvent::Closed).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Translate one Azure-dialect frame into a provider event. Frames with no
/// bearing on the stream (`speech.startDetected` etc.) return `None`.
fn parse_event(text: &str) -> Option<ProviderEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();

    match kind {
        "session.started" => Some(ProviderEvent::Ready),
        "speech.hypothesis" | "speech.phrase" => {
            let text = value.get("text").and_then(Value::as_str).unwrap_or_default();
            Some(ProviderEvent::Result(ProviderResult {
                result_id: value
                    .get("result_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                text: text.to_owned(),
                is_final: kind == "speech.phrase",
                speaker_id: value.get("speaker_id").and_then(Value::as_str).map(str::to_owned),
            }))
        }
        "session.stopped" => Some(ProviderEvent::Closed),
        "speech.cancel" => {
            let code = value.get("code").and_then(Value::as_u64).unwrap_or(0);
            let reason =
                value.get("reason").and_then(Value::as_str).unwrap_or("cancelled").to_owned();
            Some(ProviderEvent::Error(classify_cancel(code, reason)))
        }
        "error" => {
            let status = value.get("status").and_then(Value::as_u64).unwrap_or(500) as u16;
            let message =
                value.get("message").and_then(Value::as_str).unwrap_or("error").to_owned();
            Some(ProviderEvent::Error(ProviderError::from_status(status, message)))
        }
        _ => None,
    }
}

/// Azure cancel codes: 1 auth, 2 bad request, 4 rate limit (quota).
fn classify_cancel(code: u64, reason: String) -> ProviderError {
    match code {
        1 => ProviderError::Auth(reason),
        2 => ProviderError::InvalidArgument(reason),
        4 => ProviderError::RateLimit(reason),
        _ => ProviderError::Server(reason),
    }
}

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;
