// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session subscription index: which App wants which stream, plus the
//! cached last-values replayed when a matching subscription first appears.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::protocol::glasses::CalendarEvent;
use crate::protocol::stream::{StreamKey, StreamKeyError, TranscriptionKey};

/// Last known device location, cached for replay-on-subscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedLocation {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub timestamp: u64,
}

/// Outcome of a subscription update: which keys are newly present for the
/// App. The caller replays cached values for these.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionDiff {
    pub added: Vec<StreamKey>,
    pub removed: Vec<StreamKey>,
}

/// Per-session `(package, stream key)` index with cached last-values.
#[derive(Default)]
pub struct SubscriptionIndex {
    subs: RwLock<HashMap<String, HashSet<StreamKey>>>,
    last_location: RwLock<Option<CachedLocation>>,
    calendar_events: RwLock<Vec<CalendarEvent>>,
    user_datetime: RwLock<Option<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace an App's subscription set with the parsed form of `raw_keys`.
    ///
    /// All keys are validated before anything is touched: one bad key fails
    /// the whole update and leaves the existing set intact.
    pub async fn update(
        &self,
        package: &str,
        raw_keys: &[String],
    ) -> Result<SubscriptionDiff, StreamKeyError> {
        let mut next = HashSet::with_capacity(raw_keys.len());
        for raw in raw_keys {
            next.insert(StreamKey::parse(raw)?);
        }

        let mut subs = self.subs.write().await;
        let prev = subs.get(package).cloned().unwrap_or_default();
        let added = next.difference(&prev).cloned().collect();
        let removed = prev.difference(&next).cloned().collect();
        if next.is_empty() {
            subs.remove(package);
        } else {
            subs.insert(package.to_owned(), next);
        }
        Ok(SubscriptionDiff { added, removed })
    }

    /// Packages subscribed to the given effective key.
    pub async fn subscribers(&self, key: &StreamKey) -> Vec<String> {
        let subs = self.subs.read().await;
        let mut out: Vec<String> =
            subs.iter().filter(|(_, set)| set.contains(key)).map(|(p, _)| p.clone()).collect();
        out.sort();
        out
    }

    /// Drop all subscriptions for a package (App stopped or removed).
    pub async fn remove(&self, package: &str) {
        self.subs.write().await.remove(package);
    }

    /// Whether any App currently needs the microphone open.
    pub async fn has_media_subscriptions(&self) -> bool {
        let subs = self.subs.read().await;
        subs.values().any(|set| set.iter().any(StreamKey::is_media))
    }

    /// Whether any App is subscribed to raw PCM.
    pub async fn has_raw_audio_subscribers(&self) -> bool {
        let subs = self.subs.read().await;
        subs.values().any(|set| set.contains(&StreamKey::AudioChunk))
    }

    /// The deduplicated set of language streams the transcription manager
    /// must maintain. Duplicates by `(transcribe, translate?)` collapse.
    pub async fn minimal_language_subscriptions(&self) -> Vec<TranscriptionKey> {
        let subs = self.subs.read().await;
        let mut keys: Vec<TranscriptionKey> = subs
            .values()
            .flat_map(|set| set.iter().filter_map(StreamKey::transcription_key))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Snapshot of all subscriptions, for admin views.
    pub async fn snapshot(&self) -> HashMap<String, Vec<String>> {
        let subs = self.subs.read().await;
        subs.iter()
            .map(|(p, set)| {
                let mut keys: Vec<String> = set.iter().map(|k| k.to_string()).collect();
                keys.sort();
                (p.clone(), keys)
            })
            .collect()
    }

    // -- cached last-values ---------------------------------------------------

    pub async fn cache_location(&self, location: CachedLocation) {
        *self.last_location.write().await = Some(location);
    }

    pub async fn last_location(&self) -> Option<CachedLocation> {
        self.last_location.read().await.clone()
    }

    /// Cache a calendar event, replacing any previous one with the same id.
    pub async fn cache_calendar_event(&self, event: CalendarEvent) {
        let mut events = self.calendar_events.write().await;
        events.retain(|e| e.event_id != event.event_id);
        events.push(event);
    }

    pub async fn all_calendar_events(&self) -> Vec<CalendarEvent> {
        self.calendar_events.read().await.clone()
    }

    pub async fn cache_user_datetime(&self, datetime: String) {
        *self.user_datetime.write().await = Some(datetime);
    }

    pub async fn user_datetime(&self) -> Option<String> {
        self.user_datetime.read().await.clone()
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
