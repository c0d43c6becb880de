// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Speech provider abstraction: a uniform duplex-stream interface over two
//! concrete backends, plus data-driven selection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::protocol::stream::TranscriptionKey;

/// Which backend a stream runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Azure,
    Soniox,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Azure => "azure",
            Self::Soniox => "soniox",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by a provider, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// 401/403: never retried.
    Auth(String),
    /// Client-side 4xx other than 429: never retried.
    InvalidArgument(String),
    /// 429: retried with exponential backoff capped at 60 s.
    RateLimit(String),
    /// 5xx: retried with doubled-linear backoff.
    Server(String),
    /// Transport failure: retried with linear backoff.
    Network(String),
    /// Establishment or read deadline exceeded: retried with linear backoff.
    Timeout(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::InvalidArgument(_))
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::RateLimit(_) => "rate_limit",
            Self::Server(_) => "server",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Map an HTTP-style status to the matching error class.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Auth(message),
            429 => Self::RateLimit(message),
            400..=499 => Self::InvalidArgument(message),
            _ => Self::Server(message),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(m) => write!(f, "auth: {m}"),
            Self::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            Self::RateLimit(m) => write!(f, "rate limit: {m}"),
            Self::Server(m) => write!(f, "server error: {m}"),
            Self::Network(m) => write!(f, "network: {m}"),
            Self::Timeout(m) => write!(f, "timeout: {m}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// One recognition result from a provider.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub result_id: String,
    pub text: String,
    pub is_final: bool,
    pub speaker_id: Option<String>,
}

/// Events emitted on a provider stream's event channel.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The stream accepted its configuration and will take audio.
    Ready,
    Result(ProviderResult),
    Error(ProviderError),
    /// The provider closed the stream cleanly.
    Closed,
}

/// Control messages the manager sends into a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    /// Force providers that buffer (Soniox-style) to emit final results now.
    Finalize,
    Close,
}

/// Handle to one live provider stream.
pub struct ProviderStream {
    /// Bounded PCM input; the manager drops frames when this is full.
    pub audio_tx: mpsc::Sender<Bytes>,
    pub events: mpsc::Receiver<ProviderEvent>,
    pub control: mpsc::UnboundedSender<StreamControl>,
}

/// Per-stream creation options.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub sample_rate_hz: u32,
    /// VAD fast path: shorter init deadline, latency-optimised settings.
    pub fast_start: bool,
}

/// A concrete speech backend.
pub trait TranscriptionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Expected stream initialisation latency, used by fast-path selection.
    fn expected_init_ms(&self) -> u64;

    /// Open a duplex stream for the given language pair.
    fn create_stream(
        &self,
        key: &TranscriptionKey,
        opts: StreamOptions,
    ) -> BoxFuture<'static, Result<ProviderStream, ProviderError>>;

    /// Record a failure against the provider's health.
    fn record_failure(&self, error: &ProviderError);

    /// Record a successful stream establishment.
    fn record_success(&self);

    /// Health predicate consulted by the selector.
    fn is_healthy(&self) -> bool;
}

/// Shared consecutive-failure health tracking for provider impls.
#[derive(Debug, Default)]
pub struct ProviderHealth {
    consecutive_failures: AtomicU32,
}

impl ProviderHealth {
    const UNHEALTHY_AFTER: u32 = 5;

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < Self::UNHEALTHY_AFTER
    }
}

/// Options for provider selection.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub exclude: Vec<ProviderKind>,
    /// Prefer the provider with the lowest expected init latency.
    pub prefer_fast: bool,
}

/// Data-driven provider selection with subscription-key validation.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn TranscriptionProvider>>,
    default: ProviderKind,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn TranscriptionProvider>>, default: ProviderKind) -> Self {
        Self { providers, default }
    }

    /// Validate a subscription key before any stream is created.
    ///
    /// Language tags were syntax-checked at parse time; this catches the
    /// semantically invalid combinations.
    pub fn validate_key(&self, key: &TranscriptionKey) -> Result<(), ProviderError> {
        if let TranscriptionKey::Translation { source, target } = key {
            if source == target {
                return Err(ProviderError::InvalidArgument(format!(
                    "translation source and target are both {source}"
                )));
            }
        }
        Ok(())
    }

    /// Select a provider: the configured default when eligible, otherwise the
    /// first healthy non-excluded one. The fast path instead prefers the
    /// lowest expected init latency among the eligible set.
    pub fn select(&self, opts: &SelectOptions) -> Option<Arc<dyn TranscriptionProvider>> {
        let eligible: Vec<&Arc<dyn TranscriptionProvider>> = self
            .providers
            .iter()
            .filter(|p| !opts.exclude.contains(&p.kind()) && p.is_healthy())
            .collect();

        if opts.prefer_fast {
            return eligible
                .into_iter()
                .min_by_key(|p| p.expected_init_ms())
                .map(Arc::clone);
        }

        eligible
            .iter()
            .find(|p| p.kind() == self.default)
            .or_else(|| eligible.first())
            .map(|p| Arc::clone(*p))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.iter().map(|p| p.kind()).collect()
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
