// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-language transcript rings consulted by the history endpoint.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Retention horizon for transcript segments.
pub const RETENTION: Duration = Duration::from_secs(30 * 60);

/// One recognised utterance fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub result_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    pub text: String,
    /// Epoch millis.
    pub timestamp: u64,
    pub is_final: bool,
}

/// Per-language segment rings pruned to the last 30 minutes.
#[derive(Default)]
pub struct TranscriptHistory {
    rings: RwLock<HashMap<String, VecDeque<TranscriptSegment>>>,
}

impl TranscriptHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a final segment to its language ring, pruning expired entries.
    /// Interim results are not retained.
    pub async fn append(&self, language: &str, segment: TranscriptSegment, now_ms: u64) {
        if !segment.is_final {
            return;
        }
        let mut rings = self.rings.write().await;
        let ring = rings.entry(language.to_owned()).or_default();
        ring.push_back(segment);
        prune(ring, now_ms);
    }

    /// Segments for one language, oldest first.
    pub async fn segments(&self, language: &str, now_ms: u64) -> Vec<TranscriptSegment> {
        let mut rings = self.rings.write().await;
        match rings.get_mut(language) {
            Some(ring) => {
                prune(ring, now_ms);
                ring.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Languages that currently hold segments.
    pub async fn languages(&self) -> Vec<String> {
        let rings = self.rings.read().await;
        let mut out: Vec<String> = rings.keys().cloned().collect();
        out.sort();
        out
    }
}

fn prune(ring: &mut VecDeque<TranscriptSegment>, now_ms: u64) {
    let horizon = now_ms.saturating_sub(RETENTION.as_millis() as u64);
    while ring.front().is_some_and(|s| s.timestamp < horizon) {
        ring.pop_front();
    }
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
