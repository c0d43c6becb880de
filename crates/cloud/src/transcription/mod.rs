// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session transcription pipeline: maintains exactly the provider
//! streams the current subscriptions imply, gates audio on stream readiness,
//! fails over between providers, and fans results out to subscribed Apps.

pub mod azure;
pub mod breaker;
pub mod history;
pub mod net;
pub mod provider;
pub mod soniox;
pub mod vad;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TranscriptionConfig;
use crate::protocol::app::AppOutgoing;
use crate::protocol::epoch_ms;
use crate::protocol::stream::{StreamKey, TranscriptionKey};
use crate::session::UserSession;

use self::breaker::{StreamPermit, TranscriptionLimits};
use self::history::{TranscriptHistory, TranscriptSegment};
use self::provider::{
    ProviderError, ProviderEvent, ProviderKind, ProviderRegistry, ProviderResult, ProviderStream,
    SelectOptions, StreamControl, StreamOptions,
};
use self::vad::VadAudioBuffer;

/// Lifecycle of one stream instance. ERROR and CLOSED are terminal for the
/// instance id; a replacement gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Initializing = 0,
    Ready = 1,
    Active = 2,
    Error = 3,
    Closed = 4,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::Active,
            3 => Self::Error,
            4 => Self::Closed,
            _ => Self::Initializing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    fn accepts_audio(&self) -> bool {
        matches!(self, Self::Ready | Self::Active)
    }
}

/// Metrics shared between a stream's run task and the manager.
struct StreamShared {
    state: AtomicU8,
    provider: AtomicU8,
    created_at_ms: u64,
    ready_at_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    chunks_in: AtomicU64,
    chunks_out: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl StreamShared {
    fn new(provider: ProviderKind) -> Arc<Self> {
        let now = epoch_ms();
        Arc::new(Self {
            state: AtomicU8::new(StreamState::Initializing as u8),
            provider: AtomicU8::new(provider_to_u8(provider)),
            created_at_ms: now,
            ready_at_ms: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(now),
            chunks_in: AtomicU64::new(0),
            chunks_out: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn touch(&self) {
        self.last_activity_ms.store(epoch_ms(), Ordering::Relaxed);
    }
}

fn provider_to_u8(kind: ProviderKind) -> u8 {
    match kind {
        ProviderKind::Azure => 0,
        ProviderKind::Soniox => 1,
    }
}

fn provider_from_u8(v: u8) -> ProviderKind {
    if v == 1 { ProviderKind::Soniox } else { ProviderKind::Azure }
}

/// Serializable view of one stream instance, for admin endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub subscription: String,
    pub provider: &'static str,
    pub state: &'static str,
    pub created_at: u64,
    pub ready_at: Option<u64>,
    pub last_activity: u64,
    pub chunks_in: u64,
    pub chunks_out: u64,
    pub consecutive_failures: u32,
}

/// Manager-side handle to one stream's run task.
struct StreamSlot {
    id: String,
    feed_tx: mpsc::Sender<Bytes>,
    control_tx: mpsc::UnboundedSender<StreamControl>,
    shared: Arc<StreamShared>,
    task: AbortHandle,
}

enum VadState {
    /// Glasses report silence: no streams run, PCM is dropped.
    Silent,
    /// Speaking, streams starting: PCM accumulates in the pre-roll buffer.
    Buffering(VadAudioBuffer),
    /// Streams up: PCM flows straight through.
    Open,
}

/// Per-session transcription manager. The constructor returns immediately;
/// provider warm-up runs concurrently and every public operation awaits the
/// `ensure_initialized` barrier.
pub struct TranscriptionManager {
    session: Weak<UserSession>,
    user_id: String,
    config: TranscriptionConfig,
    providers: Arc<ProviderRegistry>,
    limits: Arc<TranscriptionLimits>,
    cancel: CancellationToken,
    ready_rx: watch::Receiver<bool>,
    streams: Mutex<HashMap<TranscriptionKey, StreamSlot>>,
    vad: Mutex<VadState>,
    pub history: TranscriptHistory,
    sample_rate_hz: AtomicU32,
}

impl TranscriptionManager {
    pub fn new(
        session: Weak<UserSession>,
        user_id: String,
        config: TranscriptionConfig,
        providers: Arc<ProviderRegistry>,
        limits: Arc<TranscriptionLimits>,
        cancel: CancellationToken,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);

        // Provider warm-up is concurrent; callers queue on the barrier.
        let warmup_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if !warmup_cancel.is_cancelled() {
                let _ = ready_tx.send(true);
            }
        });

        let manager = Self {
            session,
            user_id,
            config,
            providers,
            limits,
            cancel,
            ready_rx,
            streams: Mutex::new(HashMap::new()),
            vad: Mutex::new(VadState::Open),
            history: TranscriptHistory::new(),
            sample_rate_hz: AtomicU32::new(16_000),
        };
        manager.spawn_idle_janitor();
        manager
    }

    /// Record the PCM sample rate the session declared at connect.
    pub fn set_sample_rate(&self, hz: u32) {
        self.sample_rate_hz.store(hz, Ordering::Relaxed);
    }

    /// Await the initialization barrier. Callers enqueued before the barrier
    /// opens proceed in arrival order.
    async fn ensure_initialized(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    // -- subscription lifecycle -----------------------------------------------

    /// Reconcile running streams against the desired language set: close
    /// streams nothing subscribes to, start the missing ones.
    pub async fn update_subscriptions(&self, desired: &[TranscriptionKey]) {
        self.ensure_initialized().await;

        let silent = matches!(*self.vad.lock().await, VadState::Silent);

        let (to_close, to_start) = {
            let streams = self.streams.lock().await;
            let to_close: Vec<TranscriptionKey> =
                streams.keys().filter(|k| !desired.contains(*k)).cloned().collect();
            let to_start: Vec<TranscriptionKey> =
                desired.iter().filter(|k| !streams.contains_key(*k)).cloned().collect();
            (to_close, to_start)
        };

        for key in to_close {
            self.close_stream(&key).await;
        }

        // While the glasses report silence new streams wait for the next
        // speaking transition.
        if silent {
            return;
        }

        for key in to_start {
            self.start_stream(key, false).await;
        }
    }

    /// Create a stream for one subscription. Refuses when a create for the
    /// key is already in flight, when the key is invalid, or when the
    /// resource policy says no.
    async fn start_stream(&self, key: TranscriptionKey, fast: bool) {
        if let Err(e) = self.providers.validate_key(&key) {
            tracing::warn!(user_id = %self.user_id, subscription = %key, err = %e, "invalid subscription");
            self.publish_failure(&key, &e.to_string()).await;
            return;
        }

        let permit = match self.limits.try_acquire() {
            Ok(permit) => permit,
            Err(reason) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    subscription = %key,
                    reason = %reason,
                    "stream creation refused"
                );
                return;
            }
        };

        let initial_provider = match self
            .providers
            .select(&SelectOptions { exclude: Vec::new(), prefer_fast: fast })
        {
            Some(p) => p.kind(),
            None => {
                tracing::error!(user_id = %self.user_id, "no healthy transcription provider");
                return;
            }
        };

        let mut streams = self.streams.lock().await;
        if streams.contains_key(&key) {
            // A create is already in flight for this subscription.
            return;
        }

        let id = format!("st-{}", Uuid::new_v4());
        let shared = StreamShared::new(initial_provider);
        let (feed_tx, feed_rx) = mpsc::channel::<Bytes>(64);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<StreamControl>();

        let ctx = StreamCtx {
            session: self.session.clone(),
            key: key.clone(),
            id: id.clone(),
            shared: Arc::clone(&shared),
            _permit: permit,
            feed_rx,
            control_rx,
            fast,
        };
        let task = tokio::spawn(run_stream(ctx)).abort_handle();

        tracing::info!(
            user_id = %self.user_id,
            subscription = %key,
            stream_id = %id,
            provider = %initial_provider,
            fast,
            "stream starting"
        );
        streams.insert(key, StreamSlot { id, feed_tx, control_tx, shared, task });
    }

    /// Close and drop one stream.
    async fn close_stream(&self, key: &TranscriptionKey) {
        if let Some(slot) = self.streams.lock().await.remove(key) {
            tracing::info!(user_id = %self.user_id, subscription = %key, stream_id = %slot.id, "stream closing");
            let _ = slot.control_tx.send(StreamControl::Close);
            // Dropping feed/control senders winds the task down; abort is the
            // backstop for a task stuck in establishment.
            slot.task.abort();
        }
    }

    /// Remove a slot only if it still belongs to the given instance id.
    /// Called by run tasks on terminal failure.
    async fn remove_slot(&self, key: &TranscriptionKey, id: &str) {
        let mut streams = self.streams.lock().await;
        if streams.get(key).is_some_and(|slot| slot.id == id) {
            streams.remove(key);
        }
    }

    // -- audio ----------------------------------------------------------------

    /// Route one inbound PCM frame. Depending on VAD state the frame is
    /// dropped, buffered, or written to every stream that is READY/ACTIVE.
    pub async fn feed_audio(&self, pcm: Bytes) {
        {
            let mut vad = self.vad.lock().await;
            match &mut *vad {
                VadState::Silent => return,
                VadState::Buffering(buf) => {
                    if buf.expired(self.config.vad_flush()) {
                        // Streams took too long; force-flush into whatever is up.
                        let chunks = buf.drain();
                        *vad = VadState::Open;
                        drop(vad);
                        tracing::warn!(user_id = %self.user_id, chunks = chunks.len(), "vad buffer force-flushed");
                        for chunk in chunks {
                            self.write_to_streams(chunk).await;
                        }
                        self.write_to_streams(pcm).await;
                        return;
                    }
                    buf.push(pcm);
                    return;
                }
                VadState::Open => {}
            }
        }
        self.write_to_streams(pcm).await;
    }

    async fn write_to_streams(&self, pcm: Bytes) {
        let streams = self.streams.lock().await;
        for slot in streams.values() {
            if slot.shared.state().accepts_audio() {
                // Audio never blocks: a full or not-ready pipe drops the frame.
                if slot.feed_tx.try_send(pcm.clone()).is_ok() {
                    slot.shared.chunks_in.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    // -- VAD ------------------------------------------------------------------

    /// React to a VAD transition from the glasses.
    ///
    /// speaking→silent: force providers to flush finals, then stop all
    /// streams. silent→speaking: buffer PCM, fast-start the subscribed
    /// streams, and replay the buffer once they are up.
    pub async fn handle_vad(&self, speaking: bool) {
        self.ensure_initialized().await;

        if !speaking {
            self.finalize_pending_tokens().await;
            self.stop_all_streams().await;
            *self.vad.lock().await = VadState::Silent;
            tracing::debug!(user_id = %self.user_id, "vad silent, streams stopped");
            return;
        }

        {
            let mut vad = self.vad.lock().await;
            if matches!(*vad, VadState::Buffering(_)) {
                return;
            }
            *vad = VadState::Buffering(VadAudioBuffer::new(self.config.vad_buffer_chunks));
        }

        let desired = match self.session.upgrade() {
            Some(session) => session.subscriptions.minimal_language_subscriptions().await,
            None => return,
        };
        for key in desired {
            self.start_stream(key, true).await;
        }
        self.spawn_vad_flusher();
    }

    /// Wait for the fast-started streams to come up, then drain the pre-roll
    /// buffer into them in arrival order.
    fn spawn_vad_flusher(&self) {
        let weak = self.session.clone();
        let cancel = self.cancel.clone();
        let deadline = self.config.stream_timeout_fast() + Duration::from_millis(500);

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let Some(session) = weak.upgrade() else { return };
                let manager = &session.transcription;

                let all_up = {
                    let streams = manager.streams.lock().await;
                    !streams.is_empty()
                        && streams.values().all(|s| s.shared.state().accepts_audio())
                };

                if all_up || started.elapsed() >= deadline {
                    let chunks = {
                        let mut vad = manager.vad.lock().await;
                        match &mut *vad {
                            VadState::Buffering(buf) => {
                                let chunks = buf.drain();
                                *vad = VadState::Open;
                                chunks
                            }
                            _ => return,
                        }
                    };
                    tracing::debug!(
                        user_id = %manager.user_id,
                        chunks = chunks.len(),
                        "vad buffer replayed"
                    );
                    for chunk in chunks {
                        manager.write_to_streams(chunk).await;
                    }
                    return;
                }

                drop(session);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
    }

    /// Force providers that buffer tokens to emit final results now.
    pub async fn finalize_pending_tokens(&self) {
        let streams = self.streams.lock().await;
        for slot in streams.values() {
            let _ = slot.control_tx.send(StreamControl::Finalize);
        }
    }

    async fn stop_all_streams(&self) {
        let keys: Vec<TranscriptionKey> =
            self.streams.lock().await.keys().cloned().collect();
        for key in keys {
            self.close_stream(&key).await;
        }
    }

    // -- publish --------------------------------------------------------------

    /// Package a provider result as a typed event and deliver it to every
    /// subscriber of the canonical key, inheriting resurrection semantics
    /// from the App manager. Final segments also land in the history ring.
    async fn publish_result(&self, key: &TranscriptionKey, result: ProviderResult) {
        let Some(session) = self.session.upgrade() else { return };

        let stream_key = StreamKey::from(key);
        let effective = stream_key.to_string();
        let now = epoch_ms();

        let (kind, source, target) = match key {
            TranscriptionKey::Transcription { language } => ("transcription", language, None),
            TranscriptionKey::Translation { source, target } => {
                ("translation", source, Some(target))
            }
        };
        let did_translate = target.is_some_and(|t| t.as_str() != source.as_str());

        let data = json!({
            "type": kind,
            "text": result.text,
            "isFinal": result.is_final,
            "transcribeLanguage": source.as_str(),
            "translateLanguage": target.map(|t| t.as_str()),
            "didTranslate": did_translate,
            "resultId": result.result_id,
            "speakerId": result.speaker_id,
        });

        let history_language = target.unwrap_or(source).as_str().to_owned();
        self.history
            .append(
                &history_language,
                TranscriptSegment {
                    result_id: result.result_id.clone(),
                    speaker_id: result.speaker_id.clone(),
                    text: result.text.clone(),
                    timestamp: now,
                    is_final: result.is_final,
                },
                now,
            )
            .await;

        for package in session.subscriptions.subscribers(&stream_key).await {
            let _ = session
                .apps
                .send_message_to_app(
                    &package,
                    &AppOutgoing::DataStream {
                        session_id: self.user_id.clone(),
                        stream_type: effective.clone(),
                        data: data.clone(),
                        timestamp: now,
                    },
                )
                .await;
        }
    }

    /// Permanent stream failure: tell the subscribers why their stream died.
    async fn publish_failure(&self, key: &TranscriptionKey, reason: &str) {
        let Some(session) = self.session.upgrade() else { return };
        let stream_key = StreamKey::from(key);
        let effective = stream_key.to_string();
        let now = epoch_ms();
        let data = json!({
            "type": "transcription_error",
            "error": reason,
            "permanent": true,
        });
        for package in session.subscriptions.subscribers(&stream_key).await {
            let _ = session
                .apps
                .send_message_to_app(
                    &package,
                    &AppOutgoing::DataStream {
                        session_id: self.user_id.clone(),
                        stream_type: effective.clone(),
                        data: data.clone(),
                        timestamp: now,
                    },
                )
                .await;
        }
    }

    // -- maintenance ----------------------------------------------------------

    /// Under stream pressure, close streams with no activity for the idle
    /// window.
    fn spawn_idle_janitor(&self) {
        let weak = self.session.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(60));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = timer.tick() => {}
                }

                let Some(session) = weak.upgrade() else { return };
                let manager = &session.transcription;

                // Only bother when the process is under stream pressure.
                if manager.limits.active_streams() * 2 < manager.limits.max_total() {
                    continue;
                }

                let horizon = epoch_ms()
                    .saturating_sub(manager.config.idle_timeout().as_millis() as u64);
                let idle: Vec<TranscriptionKey> = {
                    let streams = manager.streams.lock().await;
                    streams
                        .iter()
                        .filter(|(_, s)| {
                            s.shared.last_activity_ms.load(Ordering::Relaxed) < horizon
                        })
                        .map(|(k, _)| k.clone())
                        .collect()
                };
                for key in idle {
                    tracing::info!(user_id = %manager.user_id, subscription = %key, "closing idle stream");
                    manager.close_stream(&key).await;
                }
            }
        });
    }

    // -- queries & teardown ---------------------------------------------------

    /// Whether any stream currently accepts audio.
    pub async fn is_transcribing(&self) -> bool {
        let streams = self.streams.lock().await;
        streams.values().any(|s| s.shared.state().accepts_audio())
    }

    /// Admin snapshot of all stream instances.
    pub async fn snapshot(&self) -> Vec<StreamInfo> {
        let streams = self.streams.lock().await;
        let mut out: Vec<StreamInfo> = streams
            .iter()
            .map(|(key, slot)| {
                let ready_at = slot.shared.ready_at_ms.load(Ordering::Relaxed);
                StreamInfo {
                    id: slot.id.clone(),
                    subscription: key.to_string(),
                    provider: provider_from_u8(slot.shared.provider.load(Ordering::Relaxed))
                        .as_str(),
                    state: slot.shared.state().as_str(),
                    created_at: slot.shared.created_at_ms,
                    ready_at: (ready_at > 0).then_some(ready_at),
                    last_activity: slot.shared.last_activity_ms.load(Ordering::Relaxed),
                    chunks_in: slot.shared.chunks_in.load(Ordering::Relaxed),
                    chunks_out: slot.shared.chunks_out.load(Ordering::Relaxed),
                    consecutive_failures: slot.shared.consecutive_failures.load(Ordering::Relaxed),
                }
            })
            .collect();
        out.sort_by(|a, b| a.subscription.cmp(&b.subscription));
        out
    }

    /// Tear down every stream. The session cancel token has already fired;
    /// this releases the slots promptly.
    pub async fn dispose(&self) {
        let slots: Vec<(TranscriptionKey, StreamSlot)> =
            self.streams.lock().await.drain().collect();
        for (key, slot) in slots {
            tracing::debug!(user_id = %self.user_id, subscription = %key, "disposing stream");
            let _ = slot.control_tx.send(StreamControl::Close);
            slot.task.abort();
        }
        *self.vad.lock().await = VadState::Silent;
    }
}

// -- stream run task ----------------------------------------------------------

/// Everything a stream's run task owns.
struct StreamCtx {
    session: Weak<UserSession>,
    key: TranscriptionKey,
    id: String,
    shared: Arc<StreamShared>,
    /// Held for the stream's lifetime; dropping it releases the cap slot.
    _permit: StreamPermit,
    feed_rx: mpsc::Receiver<Bytes>,
    control_rx: mpsc::UnboundedReceiver<StreamControl>,
    fast: bool,
}

/// Why the pump loop ended.
enum PumpEnd {
    /// Manager closed us, or the session is going away.
    Done,
    /// The provider failed; decide failover/retry.
    Failed(ProviderError),
}

/// Drive one subscription's stream to completion: establish, pump, and on
/// failure walk the failover-then-retry ladder.
async fn run_stream(mut ctx: StreamCtx) {
    let mut attempt: u32 = 0;

    'lifecycle: loop {
        let Some(session) = ctx.session.upgrade() else { break };
        let manager = &session.transcription;
        if manager.cancel.is_cancelled() {
            break;
        }

        let provider = match manager
            .providers
            .select(&SelectOptions { exclude: Vec::new(), prefer_fast: ctx.fast })
        {
            Some(p) => p,
            None => {
                manager.publish_failure(&ctx.key, "no healthy provider").await;
                break;
            }
        };

        let established = establish(manager, provider.as_ref(), &ctx).await;
        drop(session);

        let error = match established {
            Ok(stream) => {
                match pump(&mut ctx, stream).await {
                    PumpEnd::Done => break 'lifecycle,
                    PumpEnd::Failed(err) => err,
                }
            }
            Err(err) => err,
        };

        // Classify, then failover before backing off.
        let Some(session) = ctx.session.upgrade() else { break };
        let manager = &session.transcription;
        ctx.shared.set_state(StreamState::Error);
        ctx.shared.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        provider.record_failure(&error);
        if matches!(error, ProviderError::RateLimit(_)) {
            manager.limits.record_rate_limit();
        }

        if !error.is_retryable() {
            tracing::warn!(
                user_id = %manager.user_id,
                subscription = %ctx.key,
                err = %error,
                "stream failed permanently"
            );
            manager.publish_failure(&ctx.key, &error.to_string()).await;
            manager.remove_slot(&ctx.key, &ctx.id).await;
            break;
        }

        // A different provider first.
        if let Some(alt) = manager.providers.select(&SelectOptions {
            exclude: vec![provider.kind()],
            prefer_fast: ctx.fast,
        }) {
            match establish(manager, alt.as_ref(), &ctx).await {
                Ok(stream) => {
                    tracing::info!(
                        user_id = %manager.user_id,
                        subscription = %ctx.key,
                        from = %provider.kind(),
                        to = %alt.kind(),
                        "provider_failover"
                    );
                    drop(session);
                    match pump(&mut ctx, stream).await {
                        PumpEnd::Done => break 'lifecycle,
                        PumpEnd::Failed(_) => continue 'lifecycle,
                    }
                }
                Err(alt_err) => {
                    alt.record_failure(&alt_err);
                    if matches!(alt_err, ProviderError::RateLimit(_)) {
                        manager.limits.record_rate_limit();
                    }
                }
            }
        }

        // Same provider, after backoff.
        attempt += 1;
        if attempt > manager.config.max_stream_retries {
            tracing::warn!(
                user_id = %manager.user_id,
                subscription = %ctx.key,
                attempts = attempt,
                "stream retries exhausted"
            );
            manager.publish_failure(&ctx.key, "stream retries exhausted").await;
            manager.remove_slot(&ctx.key, &ctx.id).await;
            break;
        }

        let delay = retry_backoff(&error, attempt, manager.config.retry_delay());
        tracing::info!(
            user_id = %manager.user_id,
            subscription = %ctx.key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            class = error.class(),
            "stream retry scheduled"
        );
        let cancel = manager.cancel.clone();
        drop(session);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if ctx.shared.state() != StreamState::Error {
        ctx.shared.set_state(StreamState::Closed);
    }
}

/// Create a provider stream and wait for READY, both under the configured
/// deadline.
async fn establish(
    manager: &TranscriptionManager,
    provider: &dyn provider::TranscriptionProvider,
    ctx: &StreamCtx,
) -> Result<ProviderStream, ProviderError> {
    // Breaker check on every establishment, not only the first.
    if let Some(remaining) = manager.limits.breaker_open_remaining() {
        return Err(ProviderError::RateLimit(format!(
            "circuit breaker open for {} more ms",
            remaining.as_millis()
        )));
    }

    let deadline =
        if ctx.fast { manager.config.stream_timeout_fast() } else { manager.config.stream_timeout() };
    let opts = StreamOptions {
        sample_rate_hz: manager.sample_rate_hz.load(Ordering::Relaxed),
        fast_start: ctx.fast,
    };

    ctx.shared.set_state(StreamState::Initializing);
    ctx.shared.provider.store(provider_to_u8(provider.kind()), Ordering::Relaxed);

    let started = tokio::time::Instant::now();
    let mut stream = tokio::time::timeout(deadline, provider.create_stream(&ctx.key, opts))
        .await
        .map_err(|_| ProviderError::Timeout("stream establishment".to_owned()))??;

    // Await READY within what is left of the deadline.
    let remaining = deadline.saturating_sub(started.elapsed());
    loop {
        let event = tokio::time::timeout(remaining, stream.events.recv())
            .await
            .map_err(|_| ProviderError::Timeout("provider ready".to_owned()))?;
        match event {
            Some(ProviderEvent::Ready) => break,
            Some(ProviderEvent::Error(e)) => return Err(e),
            Some(ProviderEvent::Closed) | None => {
                return Err(ProviderError::Network("provider closed during init".to_owned()))
            }
            Some(ProviderEvent::Result(_)) => {
                // Results before READY are not expected; ignore.
            }
        }
    }

    provider.record_success();
    ctx.shared.set_state(StreamState::Ready);
    ctx.shared.ready_at_ms.store(epoch_ms(), Ordering::Relaxed);
    ctx.shared.consecutive_failures.store(0, Ordering::Relaxed);
    Ok(stream)
}

/// Shovel audio in and results out until the provider fails, the manager
/// closes us, or the session goes away.
async fn pump(ctx: &mut StreamCtx, mut stream: ProviderStream) -> PumpEnd {
    loop {
        tokio::select! {
            event = stream.events.recv() => {
                match event {
                    Some(ProviderEvent::Result(result)) => {
                        ctx.shared.set_state(StreamState::Active);
                        ctx.shared.chunks_out.fetch_add(1, Ordering::Relaxed);
                        ctx.shared.touch();
                        if let Some(session) = ctx.session.upgrade() {
                            session.transcription.publish_result(&ctx.key, result).await;
                        } else {
                            return PumpEnd::Done;
                        }
                    }
                    Some(ProviderEvent::Error(e)) => return PumpEnd::Failed(e),
                    Some(ProviderEvent::Closed) | None => {
                        return PumpEnd::Failed(ProviderError::Network(
                            "provider closed stream".to_owned(),
                        ));
                    }
                    Some(ProviderEvent::Ready) => {}
                }
            }
            chunk = ctx.feed_rx.recv() => {
                match chunk {
                    Some(pcm) => {
                        ctx.shared.touch();
                        // Full provider pipe: drop, never block.
                        let _ = stream.audio_tx.try_send(pcm);
                    }
                    None => {
                        // Manager dropped the slot.
                        let _ = stream.control.send(StreamControl::Close);
                        return PumpEnd::Done;
                    }
                }
            }
            ctl = ctx.control_rx.recv() => {
                match ctl {
                    Some(StreamControl::Finalize) => {
                        let _ = stream.control.send(StreamControl::Finalize);
                    }
                    Some(StreamControl::Close) | None => {
                        let _ = stream.control.send(StreamControl::Close);
                        return PumpEnd::Done;
                    }
                }
            }
        }
    }
}

/// Backoff ladder: linear base×attempt; 429 exponential capped at 60 s;
/// 5xx doubled-linear.
fn retry_backoff(error: &ProviderError, attempt: u32, base: Duration) -> Duration {
    const RATE_LIMIT_CAP: Duration = Duration::from_secs(60);
    let attempt = attempt.max(1);
    match error {
        ProviderError::RateLimit(_) => {
            let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
            exp.min(RATE_LIMIT_CAP)
        }
        ProviderError::Server(_) => base.saturating_mul(attempt * 2),
        _ => base.saturating_mul(attempt),
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
