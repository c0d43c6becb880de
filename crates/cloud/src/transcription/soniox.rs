// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Soniox-style speech backend: message stream with tokenised results. The
//! first server message acknowledges the configuration; afterwards every
//! message carries a `tokens` array mixing interim and final tokens.

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

pub struct SonioxProvider {
    url: String,
    key: String,
    health: ProviderHealth,
}

impl SonioxProvider {
    pub fn new(url: String, key: String) -> Arc<Self> {
        Arc::new(Self { url, key, health: ProviderHealth::default() })
    }

    fn config_frame(&self, key: &TranscriptionKey, opts: &StreamOptions) -> Value {
        let mut frame = json!({
            "api_key": self.key,
            "model": "stt-rt-v2",
            "audio_format": "pcm_s16le",
            "sample_rate": opts.sample_rate_hz,
            "num_channels": 1,
            "language_hints": [key.transcribe_language().as_str()],
            "enable_speaker_diarization": true,
        });
        if let Some(target) = key.target_language() {
            frame["translation"] = json!({
                "type": "one_way",
                "target_language": target.as_str(),
            });
        }
        frame
    }
}

impl TranscriptionProvider for SonioxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Soniox
    }

    fn expected_init_ms(&self) -> u64 {
        600
    }

    fn create_stream(
        &self,
        key: &TranscriptionKey,
        opts: StreamOptions,
    ) -> BoxFuture<'static, Result<ProviderStream, ProviderError>> {
        let url = self.url.clone();
        let config = self.config_frame(key, &opts);

        Box::pin(async move {
            let mut ws = net::connect(&url, None).await?;

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
    // The first inbound message acknowledges the config.
    let mut acked = false;

    loop {
        tokio::select! {
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for event in parse_message(&text, &mut acked) {
                            let stop = matches!(event, ProviderEvent::Closed | ProviderEvent::Error(_));
                            if event_tx.send(event).await.is_err() || stop {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = event_tx.send(ProviderEvent::Closed).await;
                        return;
                    }
                    Some(Err(e)) => {
                        let _ = event_tx
                            .send(ProviderEvent::Error(ProviderError::Network(e.to_string())))
                            .await;
                        return;
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
                            return;
                        }
                    }
                    None => return,
                }
            }
            ctl = control_rx.recv() => {
                match ctl {
                    Some(StreamControl::Finalize) => {
                        let _ = ws.send(Message::Text(r#"{"type":"finalize"}"#.into())).await;
                    }
                    Some(StreamControl::Close) | None => {
                        let _ = ws.close(None).await;
                        let _ = event_tx.send(ProviderEvent::Closed).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Translate one Soniox-dialect message into provider events.
///
/// Final tokens collapse into one final result, interim tokens into one
/// interim result; a message can yield both.
fn parse_message(text: &str, acked: &mut bool) -> Vec<ProviderEvent> {
    let Ok(value) = serde_json::from_str::<Value>(text) else { return Vec::new() };

    if let Some(code) = value.get("error_code").and_then(Value::as_u64) {
        let message = value
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("provider error")
            .to_owned();
        return vec![ProviderEvent::Error(ProviderError::from_status(code as u16, message))];
    }

    let mut events = Vec::new();
    if !*acked {
        *acked = true;
        events.push(ProviderEvent::Ready);
    }

    if let Some(tokens) = value.get("tokens").and_then(Value::as_array) {
        let mut final_text = String::new();
        let mut interim_text = String::new();
        let mut speaker: Option<String> = None;
        for token in tokens {
            let text = token.get("text").and_then(Value::as_str).unwrap_or_default();
            if speaker.is_none() {
                speaker = token.get("speaker").and_then(Value::as_str).map(str::to_owned);
            }
            if token.get("is_final").and_then(Value::as_bool).unwrap_or(false) {
                final_text.push_str(text);
            } else {
                interim_text.push_str(text);
            }
        }
        if !final_text.is_empty() {
            events.push(ProviderEvent::Result(ProviderResult {
                result_id: Uuid::new_v4().to_string(),
                text: final_text,
                is_final: true,
                speaker_id: speaker.clone(),
            }));
        }
        if !interim_text.is_empty() {
            events.push(ProviderEvent::Result(ProviderResult {
                result_id: Uuid::new_v4().to_string(),
                text: interim_text,
                is_final: false,
                speaker_id: speaker,
            }));
        }
    }

    if value.get("finished").and_then(Value::as_bool).unwrap_or(false) {
        events.push(ProviderEvent::Closed);
    }

    events
}

#[cfg(test)]
#[path = "soniox_tests.rs"]
mod tests;
