// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound PCM demux: every binary frame from the glasses goes to the
//! transcription manager, into the recent-audio ring, and raw to any App
//! subscribed to `audio_chunk`.

use std::collections::VecDeque;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::protocol::epoch_ms;
use crate::protocol::stream::StreamKey;
use crate::session::UserSession;

/// How much trailing audio the ring keeps.
pub const RECENT_WINDOW: Duration = Duration::from_secs(10);

/// One timestamped PCM chunk from the ring.
#[derive(Debug, Clone)]
pub struct RecentChunk {
    pub pcm: Bytes,
    /// Epoch millis at arrival.
    pub timestamp: u64,
}

/// Bounded sequence of timestamped PCM chunks covering roughly the last ten
/// seconds. Consulted by the out-of-band recent-audio endpoint.
#[derive(Debug, Default)]
pub struct RecentAudioBuffer {
    chunks: VecDeque<RecentChunk>,
}

impl RecentAudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and discard everything older than the window.
    pub fn push(&mut self, pcm: Bytes, timestamp: u64) {
        self.chunks.push_back(RecentChunk { pcm, timestamp });
        let horizon = timestamp.saturating_sub(RECENT_WINDOW.as_millis() as u64);
        while self.chunks.front().is_some_and(|c| c.timestamp < horizon) {
            self.chunks.pop_front();
        }
    }

    /// Chunks currently inside the window, oldest first.
    pub fn chunks(&self) -> Vec<RecentChunk> {
        self.chunks.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Demuxes inbound PCM frames for one session.
pub struct AudioRouter {
    session: Weak<UserSession>,
    recent: Mutex<RecentAudioBuffer>,
}

impl AudioRouter {
    pub fn new(session: Weak<UserSession>) -> Self {
        Self { session, recent: Mutex::new(RecentAudioBuffer::new()) }
    }

    /// Route one inbound binary frame. Encoding is pass-through: 16-bit PCM
    /// mono at the rate the session declared.
    pub async fn route_frame(&self, pcm: Bytes) {
        self.recent.lock().await.push(pcm.clone(), epoch_ms());

        let Some(session) = self.session.upgrade() else { return };

        session.transcription.feed_audio(pcm.clone()).await;

        if session.subscriptions.has_raw_audio_subscribers().await {
            for package in session.subscriptions.subscribers(&StreamKey::AudioChunk).await {
                let _ = session.apps.send_binary_to_app(&package, pcm.clone()).await;
            }
        }
    }

    /// Snapshot of the trailing audio window.
    pub async fn recent_audio(&self) -> Vec<RecentChunk> {
        self.recent.lock().await.chunks()
    }
}

#[cfg(test)]
#[path = "audio_tests.rs"]
mod tests;
