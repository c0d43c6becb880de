// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Camera and RTMP arbitration plus managed-stream fan-out. The encoder is
//! single-holder per session; a keep-alive loop detects dead streams and the
//! photo path correlates device responses back to the requesting App.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CloudConfig;
use crate::protocol::app::AppOutgoing;
use crate::protocol::glasses::GlassesOutgoing;
use crate::protocol::stream::StreamKey;
use crate::session::UserSession;

/// Why an RTMP request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRefused {
    /// Another App holds the encoder.
    EncoderBusy { holder: String },
    /// The glasses link is down.
    GlassesOffline,
}

impl std::fmt::Display for MediaRefused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncoderBusy { holder } => write!(f, "encoder held by {holder}"),
            Self::GlassesOffline => f.write_str("glasses not connected"),
        }
    }
}

impl std::error::Error for MediaRefused {}

struct RtmpStream {
    stream_id: String,
    owner: String,
    pending_acks: HashSet<String>,
    keepalive: AbortHandle,
}

#[derive(Default)]
struct MediaInner {
    rtmp: Option<RtmpStream>,
    /// `request_id -> package` for in-flight photo requests.
    photos: HashMap<String, String>,
}

/// Per-session media manager.
pub struct MediaManager {
    session: Weak<UserSession>,
    config: Arc<CloudConfig>,
    cancel: CancellationToken,
    inner: Mutex<MediaInner>,
}

impl MediaManager {
    pub fn new(
        session: Weak<UserSession>,
        config: Arc<CloudConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self { session, config, cancel, inner: Mutex::new(MediaInner::default()) }
    }

    // -- RTMP -----------------------------------------------------------------

    /// Acquire the encoder and ask the glasses to start pushing. Returns the
    /// stream id; idempotent for the holder.
    pub async fn request_rtmp(
        &self,
        package: &str,
        rtmp_url: &str,
        video: Option<Value>,
    ) -> Result<String, MediaRefused> {
        let Some(session) = self.session.upgrade() else {
            return Err(MediaRefused::GlassesOffline);
        };

        let stream_id = {
            let mut inner = self.inner.lock().await;
            if let Some(ref rtmp) = inner.rtmp {
                if rtmp.owner == package {
                    return Ok(rtmp.stream_id.clone());
                }
                return Err(MediaRefused::EncoderBusy { holder: rtmp.owner.clone() });
            }

            let stream_id = format!("rtmp-{}", Uuid::new_v4());
            let keepalive = self.spawn_keepalive(stream_id.clone());
            inner.rtmp = Some(RtmpStream {
                stream_id: stream_id.clone(),
                owner: package.to_owned(),
                pending_acks: HashSet::new(),
                keepalive,
            });
            stream_id
        };

        tracing::info!(package = %package, stream_id = %stream_id, "rtmp stream starting");
        if !session
            .send_to_glasses(&GlassesOutgoing::StartRtmpStream {
                stream_id: stream_id.clone(),
                rtmp_url: rtmp_url.to_owned(),
                video,
            })
            .await
        {
            self.clear_rtmp(Some(&stream_id)).await;
            return Err(MediaRefused::GlassesOffline);
        }
        Ok(stream_id)
    }

    /// Stop the stream if the caller owns it.
    pub async fn stop_rtmp(&self, package: &str) {
        let stream_id = {
            let inner = self.inner.lock().await;
            match &inner.rtmp {
                Some(rtmp) if rtmp.owner == package => Some(rtmp.stream_id.clone()),
                _ => None,
            }
        };
        if let Some(stream_id) = stream_id {
            self.stop_stream(&stream_id).await;
        }
    }

    async fn stop_stream(&self, stream_id: &str) {
        if let Some(session) = self.session.upgrade() {
            let _ = session
                .send_to_glasses(&GlassesOutgoing::StopRtmpStream {
                    stream_id: stream_id.to_owned(),
                })
                .await;
        }
        self.clear_rtmp(Some(stream_id)).await;
    }

    async fn clear_rtmp(&self, expected_id: Option<&str>) {
        let mut inner = self.inner.lock().await;
        let matches = match (&inner.rtmp, expected_id) {
            (Some(rtmp), Some(id)) => rtmp.stream_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            if let Some(rtmp) = inner.rtmp.take() {
                rtmp.keepalive.abort();
                tracing::info!(stream_id = %rtmp.stream_id, "rtmp stream cleared");
            }
        }
    }

    fn spawn_keepalive(&self, stream_id: String) -> AbortHandle {
        let weak = self.session.clone();
        let cancel = self.cancel.clone();
        let interval = self.config.keepalive_interval();
        let miss_limit = self.config.keepalive_miss_limit;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = timer.tick() => {}
                }

                let Some(session) = weak.upgrade() else { return };
                let media = &session.media;

                let ack_id = format!("ka-{}", Uuid::new_v4());
                let over_limit = {
                    let mut inner = media.inner.lock().await;
                    match &mut inner.rtmp {
                        Some(rtmp) if rtmp.stream_id == stream_id => {
                            rtmp.pending_acks.insert(ack_id.clone());
                            rtmp.pending_acks.len() as u32 > miss_limit
                        }
                        _ => return, // stream replaced or gone
                    }
                };

                if over_limit {
                    tracing::warn!(stream_id = %stream_id, "rtmp keep-alive acks missed, stopping stream");
                    media.stop_stream(&stream_id).await;
                    media.publish_stream_status(&stream_id, "timeout", None).await;
                    return;
                }

                let _ = session
                    .send_to_glasses(&GlassesOutgoing::KeepRtmpStreamAlive {
                        stream_id: stream_id.clone(),
                        ack_id,
                    })
                    .await;
            }
        });
        handle.abort_handle()
    }

    /// Keep-alive ack from the glasses.
    pub async fn handle_keepalive_ack(&self, ack_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(ref mut rtmp) = inner.rtmp {
            rtmp.pending_acks.remove(ack_id);
        }
    }

    /// Stream status reported by the glasses: forward to the owner and to
    /// managed-stream subscribers.
    pub async fn handle_stream_status(
        &self,
        stream_id: Option<&str>,
        status: &str,
        stats: Option<Value>,
    ) {
        let (owner, stream_id) = {
            let inner = self.inner.lock().await;
            match &inner.rtmp {
                Some(rtmp) => {
                    if stream_id.is_some_and(|id| id != rtmp.stream_id) {
                        return; // stale status for a replaced stream
                    }
                    (rtmp.owner.clone(), rtmp.stream_id.clone())
                }
                None => return,
            }
        };

        if matches!(status, "stopped" | "error") {
            self.clear_rtmp(Some(&stream_id)).await;
        }

        if let Some(session) = self.session.upgrade() {
            let message = AppOutgoing::ManagedStreamStatus {
                stream_id: stream_id.clone(),
                status: status.to_owned(),
                hls_url: stats
                    .as_ref()
                    .and_then(|s| s.get("hls_url"))
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            };
            let _ = session.apps.send_message_to_app(&owner, &message).await;
        }
        self.publish_stream_status(&stream_id, status, None).await;
    }

    /// Fan a status event out to every `managed_stream_status` subscriber.
    async fn publish_stream_status(&self, stream_id: &str, status: &str, hls_url: Option<String>) {
        let Some(session) = self.session.upgrade() else { return };
        let subscribers =
            session.subscriptions.subscribers(&StreamKey::ManagedStreamStatus).await;
        for package in subscribers {
            let _ = session
                .apps
                .send_message_to_app(
                    &package,
                    &AppOutgoing::ManagedStreamStatus {
                        stream_id: stream_id.to_owned(),
                        status: status.to_owned(),
                        hls_url: hls_url.clone(),
                    },
                )
                .await;
        }
    }

    // -- photos ---------------------------------------------------------------

    /// Forward a photo request to the glasses, remembering who asked.
    pub async fn photo_request(
        &self,
        package: &str,
        request_id: &str,
        size: Option<String>,
    ) -> bool {
        let Some(session) = self.session.upgrade() else { return false };

        self.inner.lock().await.photos.insert(request_id.to_owned(), package.to_owned());
        session
            .send_to_glasses(&GlassesOutgoing::PhotoRequest {
                request_id: request_id.to_owned(),
                package_name: package.to_owned(),
                size,
            })
            .await
    }

    /// Photo response from the glasses: route back to the requesting App.
    pub async fn handle_photo_response(
        &self,
        request_id: &str,
        photo_url: Option<String>,
        error: Option<String>,
    ) {
        let package = self.inner.lock().await.photos.remove(request_id);
        let Some(package) = package else {
            tracing::debug!(request_id = %request_id, "photo response with no pending request");
            return;
        };
        if let Some(session) = self.session.upgrade() {
            let _ = session
                .apps
                .send_message_to_app(
                    &package,
                    &AppOutgoing::PhotoResponse {
                        request_id: request_id.to_owned(),
                        photo_url,
                        error,
                    },
                )
                .await;
        }
    }

    // -- snapshot & teardown --------------------------------------------------

    pub async fn rtmp_holder(&self) -> Option<String> {
        self.inner.lock().await.rtmp.as_ref().map(|r| r.owner.clone())
    }

    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(rtmp) = inner.rtmp.take() {
            rtmp.keepalive.abort();
        }
        inner.photos.clear();
    }
}

#[cfg(test)]
#[path = "media_tests.rs"]
mod tests;
