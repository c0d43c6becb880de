// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit tests: an in-process session harness, a
//! scriptable mock speech provider, and a fake App webhook server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::CloudConfig;
use crate::persist::{AppRecord, AppStore, MemoryStore, UserStore};
use crate::protocol::stream::TranscriptionKey;
use crate::protocol::{Frame, Outbound};
use crate::session::registry::SessionRegistry;
use crate::session::{SessionDeps, UserSession};
use crate::transcription::breaker::TranscriptionLimits;
use crate::transcription::provider::{
    ProviderError, ProviderEvent, ProviderHealth, ProviderKind, ProviderRegistry, ProviderResult,
    ProviderStream, StreamControl, StreamOptions, TranscriptionProvider,
};

/// What a mock provider should do for one `create_stream` call.
#[derive(Debug, Clone)]
pub enum MockScript {
    /// Fail the creation itself.
    FailCreate(ProviderError),
    /// Come up READY, emit the scripted events, then echo a result per fed
    /// audio chunk (`echo:<first byte>`); a Finalize control emits a final
    /// `finalized` result.
    Ready { events: Vec<ProviderEvent> },
}

/// Scriptable in-memory provider. Calls consume scripts front-to-back; an
/// empty queue behaves like `Ready { events: vec![] }`.
pub struct MockProvider {
    kind: ProviderKind,
    init_ms: u64,
    scripts: StdMutex<VecDeque<MockScript>>,
    creates: AtomicU32,
    health: ProviderHealth,
}

impl MockProvider {
    pub fn new(kind: ProviderKind, init_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            kind,
            init_ms,
            scripts: StdMutex::new(VecDeque::new()),
            creates: AtomicU32::new(0),
            health: ProviderHealth::default(),
        })
    }

    pub fn push_script(&self, script: MockScript) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(script);
        }
    }

    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }
}

impl TranscriptionProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn expected_init_ms(&self) -> u64 {
        self.init_ms
    }

    fn create_stream(
        &self,
        _key: &TranscriptionKey,
        _opts: StreamOptions,
    ) -> BoxFuture<'static, Result<ProviderStream, ProviderError>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or(MockScript::Ready { events: Vec::new() });

        Box::pin(async move {
            match script {
                MockScript::FailCreate(err) => Err(err),
                MockScript::Ready { events } => {
                    let (audio_tx, mut audio_rx) = mpsc::channel::<bytes::Bytes>(64);
                    let (event_tx, events_rx) = mpsc::channel::<ProviderEvent>(64);
                    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<StreamControl>();

                    tokio::spawn(async move {
                        let _ = event_tx.send(ProviderEvent::Ready).await;
                        for event in events {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        let mut counter = 0u32;
                        loop {
                            tokio::select! {
                                chunk = audio_rx.recv() => {
                                    let Some(chunk) = chunk else { return };
                                    counter += 1;
                                    let first = chunk.first().copied().unwrap_or(0);
                                    let result = ProviderResult {
                                        result_id: format!("r{counter}"),
                                        text: format!("echo:{first}"),
                                        is_final: false,
                                        speaker_id: None,
                                    };
                                    if event_tx.send(ProviderEvent::Result(result)).await.is_err() {
                                        return;
                                    }
                                }
                                ctl = control_rx.recv() => {
                                    match ctl {
                                        Some(StreamControl::Finalize) => {
                                            counter += 1;
                                            let result = ProviderResult {
                                                result_id: format!("r{counter}"),
                                                text: "finalized".to_owned(),
                                                is_final: true,
                                                speaker_id: None,
                                            };
                                            let _ = event_tx.send(ProviderEvent::Result(result)).await;
                                        }
                                        Some(StreamControl::Close) | None => {
                                            let _ = event_tx.send(ProviderEvent::Closed).await;
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                    });

                    Ok(ProviderStream { audio_tx, events: events_rx, control: control_tx })
                }
            }
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

/// Everything a manager unit test needs.
pub struct Harness {
    pub session: Arc<UserSession>,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<MemoryStore>,
    pub azure: Arc<MockProvider>,
    pub soniox: Arc<MockProvider>,
    pub limits: Arc<TranscriptionLimits>,
    /// Frames the glasses side would have received.
    pub glasses_rx: mpsc::UnboundedReceiver<Frame>,
    /// The installed glasses link handle (for close-identity checks).
    pub glasses_link: Outbound,
    pub shutdown: CancellationToken,
}

pub const TEST_USER: &str = "alice@example.com";

/// Build a full session wired to mock providers and an in-memory store.
pub async fn harness_with(config_overrides: &[&str], max_streams: usize) -> Harness {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Arc::new(CloudConfig::for_tests_with(config_overrides));
    let store = MemoryStore::new();
    let user_store: Arc<dyn UserStore> = store.clone();
    let app_store: Arc<dyn AppStore> = store.clone();

    let azure = MockProvider::new(ProviderKind::Azure, 1500);
    let soniox = MockProvider::new(ProviderKind::Soniox, 600);
    let providers: Vec<Arc<dyn TranscriptionProvider>> =
        vec![Arc::clone(&azure) as _, Arc::clone(&soniox) as _];
    let registry_providers = Arc::new(ProviderRegistry::new(providers, ProviderKind::Azure));

    let limits = TranscriptionLimits::new(
        max_streams,
        1000,
        Duration::from_secs(60),
        Duration::from_secs(30),
    );

    let shutdown = CancellationToken::new();
    let registry = SessionRegistry::new(
        SessionDeps {
            config,
            user_store,
            app_store,
            providers: registry_providers,
            limits: Arc::clone(&limits),
        },
        shutdown.clone(),
    );

    let (outbound, glasses_rx) = Outbound::channel();
    let glasses_link = outbound.clone();
    let (session, _) = registry.acquire(TEST_USER, outbound).await;

    Harness { session, registry, store, azure, soniox, limits, glasses_rx, glasses_link, shutdown }
}

pub async fn harness() -> Harness {
    harness_with(&[], 500).await
}

impl Harness {
    /// Register an App record whose webhook lands on a black-hole server
    /// that accepts everything.
    pub async fn install_app(&self, package: &str, api_key: &str) -> anyhow::Result<()> {
        let url = spawn_webhook_sink().await?;
        self.store
            .insert_app(
                AppRecord {
                    package_name: package.to_owned(),
                    public_url: url,
                    is_system_app: false,
                    settings: Vec::new(),
                },
                api_key,
            )
            .await;
        Ok(())
    }

    /// Drive an App to RUNNING: start it and back-connect with a test link.
    /// Returns the link handle and the receiver for frames sent to the App.
    pub async fn connect_app(
        &self,
        package: &str,
        api_key: &str,
    ) -> anyhow::Result<(Outbound, mpsc::UnboundedReceiver<Frame>)> {
        let session = Arc::clone(&self.session);
        let package_owned = package.to_owned();
        let start =
            tokio::spawn(async move { session.apps.start_app(&package_owned).await });

        // Let the webhook fire before back-connecting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (link, rx) = Outbound::channel();
        self.session
            .apps
            .handle_app_init(package, api_key, link.clone())
            .await
            .map_err(|code| anyhow::anyhow!("init rejected with close code {code}"))?;

        start.await??;
        Ok((link, rx))
    }
}

/// Spawn an HTTP server that 200s every webhook. Returns its base URL.
pub async fn spawn_webhook_sink() -> anyhow::Result<String> {
    use axum::routing::post;
    let router = axum::Router::new()
        .route("/webhook", post(|| async { axum::http::StatusCode::OK }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(format!("http://{addr}"))
}

/// Pop the next JSON text frame from a link receiver, waiting up to 2 s.
pub async fn next_json(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Option<serde_json::Value> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.ok()??;
        match frame {
            Frame::Text(text) => return serde_json::from_str(&text).ok(),
            Frame::Binary(_) => continue,
            Frame::Close(..) => return None,
        }
    }
}

/// Drain all immediately-available frames.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.push(frame);
    }
    out
}
