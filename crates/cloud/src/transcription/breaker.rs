// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide transcription resource policy: the hard stream cap and the
//! rate-limit circuit breaker. One `TranscriptionLimits` is built at startup
//! and handed to every session's manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Why stream creation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefuseReason {
    /// The hard cap on concurrent provider streams is reached.
    StreamCap { max: usize },
    /// The circuit breaker is open after repeated rate-limit failures.
    BreakerOpen { remaining: Duration },
}

impl std::fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StreamCap { max } => write!(f, "stream cap reached ({max})"),
            Self::BreakerOpen { remaining } => {
                write!(f, "circuit breaker open for {} more ms", remaining.as_millis())
            }
        }
    }
}

/// RAII permit for one live provider stream. Dropping it releases the slot.
#[derive(Debug)]
pub struct StreamPermit {
    limits: Arc<TranscriptionLimits>,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.limits.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct BreakerState {
    /// Timestamps of recent rate-limit failures inside the window.
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
}

/// Shared stream accounting and circuit breaker.
#[derive(Debug)]
pub struct TranscriptionLimits {
    active: AtomicUsize,
    max_total: usize,
    breaker_threshold: u32,
    breaker_window: Duration,
    breaker_cooldown: Duration,
    breaker: Mutex<BreakerState>,
}

impl TranscriptionLimits {
    pub fn new(
        max_total: usize,
        breaker_threshold: u32,
        breaker_window: Duration,
        breaker_cooldown: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_total,
            breaker_threshold,
            breaker_window,
            breaker_cooldown,
            breaker: Mutex::new(BreakerState { failures: Vec::new(), opened_at: None }),
        })
    }

    /// Number of live streams across all sessions.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_total(&self) -> usize {
        self.max_total
    }

    /// Try to reserve a stream slot, checking the breaker first.
    pub fn try_acquire(self: &Arc<Self>) -> Result<StreamPermit, RefuseReason> {
        if let Some(remaining) = self.breaker_open_remaining() {
            return Err(RefuseReason::BreakerOpen { remaining });
        }

        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_total {
                return Err(RefuseReason::StreamCap { max: self.max_total });
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(StreamPermit { limits: Arc::clone(self) }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a rate-limit failure; trips the breaker when the threshold is
    /// exceeded within the window.
    pub fn record_rate_limit(&self) {
        let now = Instant::now();
        let Ok(mut state) = self.breaker.lock() else { return };
        state.failures.retain(|t| now.duration_since(*t) < self.breaker_window);
        state.failures.push(now);
        if state.opened_at.is_none() && state.failures.len() as u32 >= self.breaker_threshold {
            tracing::warn!(
                failures = state.failures.len(),
                window_ms = self.breaker_window.as_millis() as u64,
                "transcription circuit breaker opened"
            );
            state.opened_at = Some(now);
        }
    }

    /// If the breaker is open, how long until it closes. Closing happens
    /// automatically after the cool-down.
    pub fn breaker_open_remaining(&self) -> Option<Duration> {
        let Ok(mut state) = self.breaker.lock() else { return None };
        let opened_at = state.opened_at?;
        let elapsed = opened_at.elapsed();
        if elapsed >= self.breaker_cooldown {
            tracing::info!("transcription circuit breaker closed after cool-down");
            state.opened_at = None;
            state.failures.clear();
            None
        } else {
            Some(self.breaker_cooldown - elapsed)
        }
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
