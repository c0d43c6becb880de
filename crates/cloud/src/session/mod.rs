// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-user session supervisor. A `UserSession` exclusively owns its
//! managers; they reach their peers through a weak back-reference to the
//! session root, never through ownership.

pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::apps::AppManager;
use crate::audio::AudioRouter;
use crate::config::CloudConfig;
use crate::display::{DashboardManager, DisplayManager};
use crate::media::MediaManager;
use crate::persist::{AppRecord, AppStore, UserStore};
use crate::protocol::app::AppOutgoing;
use crate::protocol::glasses::GlassesOutgoing;
use crate::protocol::stream::{StreamKey, StreamKeyError};
use crate::protocol::{close_code, epoch_ms, Outbound};
use crate::subscription::SubscriptionIndex;
use crate::transcription::provider::ProviderRegistry;
use crate::transcription::breaker::TranscriptionLimits;
use crate::transcription::TranscriptionManager;

/// Everything a new session needs from the process.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<CloudConfig>,
    pub user_store: Arc<dyn UserStore>,
    pub app_store: Arc<dyn AppStore>,
    pub providers: Arc<ProviderRegistry>,
    pub limits: Arc<TranscriptionLimits>,
}

/// Long-lived supervisor for one authenticated user: owns the glasses link
/// and every session-scoped manager.
pub struct UserSession {
    pub user_id: String,
    pub started_at_ms: u64,
    pub config: Arc<CloudConfig>,
    pub user_store: Arc<dyn UserStore>,
    pub app_store: Arc<dyn AppStore>,
    /// Root token for every timer and task under this session.
    pub cancel: CancellationToken,

    pub apps: AppManager,
    pub subscriptions: SubscriptionIndex,
    pub transcription: TranscriptionManager,
    pub audio: AudioRouter,
    pub display: DisplayManager,
    pub dashboard: DashboardManager,
    pub media: MediaManager,

    glasses: RwLock<Option<Outbound>>,
    /// Epoch millis of the glasses disconnect; 0 while connected.
    disconnected_at_ms: AtomicU64,
    /// Installed-App catalog cache; external persistence stays authoritative.
    catalog: RwLock<IndexMap<String, AppRecord>>,
    cleanup_timer: Mutex<Option<AbortHandle>>,
    disposed: AtomicBool,
}

impl UserSession {
    /// Build the session root with its managers wired to a weak back-ref.
    pub fn new(user_id: &str, deps: &SessionDeps, cancel: CancellationToken) -> Arc<Self> {
        let user_id = user_id.to_owned();
        let deps = deps.clone();

        Arc::new_cyclic(|weak: &Weak<UserSession>| UserSession {
            user_id: user_id.clone(),
            started_at_ms: epoch_ms(),
            config: Arc::clone(&deps.config),
            user_store: Arc::clone(&deps.user_store),
            app_store: Arc::clone(&deps.app_store),
            cancel: cancel.clone(),
            apps: AppManager::new(
                weak.clone(),
                user_id.clone(),
                Arc::clone(&deps.config),
                Arc::clone(&deps.user_store),
                Arc::clone(&deps.app_store),
                cancel.clone(),
            ),
            subscriptions: SubscriptionIndex::new(),
            transcription: TranscriptionManager::new(
                weak.clone(),
                user_id.clone(),
                deps.config.transcription.clone(),
                Arc::clone(&deps.providers),
                Arc::clone(&deps.limits),
                cancel.clone(),
            ),
            audio: AudioRouter::new(weak.clone()),
            display: DisplayManager::new(weak.clone(), Arc::clone(&deps.config)),
            dashboard: DashboardManager::new(weak.clone()),
            media: MediaManager::new(weak.clone(), Arc::clone(&deps.config), cancel.clone()),
            glasses: RwLock::new(None),
            disconnected_at_ms: AtomicU64::new(0),
            catalog: RwLock::new(IndexMap::new()),
            cleanup_timer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    // -- glasses link ---------------------------------------------------------

    /// Install (or replace) the glasses link and clear disconnect state.
    pub async fn attach_glasses(&self, link: Outbound) {
        if let Some(timer) = self.cleanup_timer.lock().await.take() {
            timer.abort();
        }
        self.disconnected_at_ms.store(0, Ordering::SeqCst);

        let old = self.glasses.write().await.replace(link);
        if let Some(old) = old {
            old.close(close_code::GOING_AWAY, "link replaced");
        }
    }

    /// Send a frame to the glasses. Returns false when no link is up.
    pub async fn send_to_glasses(&self, message: &GlassesOutgoing) -> bool {
        let glasses = self.glasses.read().await;
        match glasses.as_ref() {
            Some(link) => link.send_json(message).is_ok(),
            None => false,
        }
    }

    /// Whether the given handle is the currently installed glasses link.
    pub async fn glasses_is(&self, link: &Outbound) -> bool {
        self.glasses.read().await.as_ref().is_some_and(|l| l.same_channel(link))
    }

    /// Glasses link closed: remember when, stop transcription. The registry
    /// arms the cleanup timer.
    pub async fn mark_disconnected(&self) {
        self.disconnected_at_ms.store(epoch_ms(), Ordering::SeqCst);
        *self.glasses.write().await = None;
        self.transcription.handle_vad(false).await;
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected_at_ms.load(Ordering::SeqCst) != 0
    }

    pub fn disconnected_at(&self) -> Option<u64> {
        match self.disconnected_at_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub(crate) async fn set_cleanup_timer(&self, handle: AbortHandle) {
        if let Some(old) = self.cleanup_timer.lock().await.replace(handle) {
            old.abort();
        }
    }

    // -- app catalog ----------------------------------------------------------

    /// Look up an installed App, falling back to the store and caching the
    /// result.
    pub async fn installed_app(&self, package: &str) -> Option<AppRecord> {
        if let Some(record) = self.catalog.read().await.get(package) {
            return Some(record.clone());
        }
        match self.app_store.get_app(package).await {
            Ok(Some(record)) => {
                self.catalog.write().await.insert(package.to_owned(), record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, package = %package, err = %e, "app lookup failed");
                None
            }
        }
    }

    async fn refresh_catalog(&self) {
        match self.app_store.list_apps().await {
            Ok(records) => {
                let mut catalog = self.catalog.write().await;
                catalog.clear();
                for record in records {
                    catalog.insert(record.package_name.clone(), record);
                }
            }
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, err = %e, "catalog refresh failed");
            }
        }
    }

    // -- state broadcast ------------------------------------------------------

    /// Client view of the session, sent in `connection_ack` and
    /// `app_state_change`.
    pub async fn snapshot(&self) -> Value {
        json!({
            "userId": self.user_id,
            "startTime": self.started_at_ms,
            "runningApps": self.apps.running_packages().await,
            "appStates": self.apps.snapshot().await,
            "isTranscribing": self.transcription.is_transcribing().await,
            "micRequired": self.subscriptions.has_media_subscriptions().await,
            "dashboardMode": self.dashboard.mode().await,
        })
    }

    /// Refresh the catalog and push `app_state_change` to the glasses.
    pub async fn broadcast_app_state(&self) {
        self.refresh_catalog().await;
        let user_session = self.snapshot().await;
        self.send_to_glasses(&GlassesOutgoing::AppStateChange { user_session }).await;
    }

    // -- subscriptions --------------------------------------------------------

    /// Apply a subscription update from an App: validate and swap the set,
    /// replay cached values for newly added keys, and reconcile the
    /// transcription streams.
    pub async fn apply_subscription_update(
        &self,
        package: &str,
        raw_keys: &[String],
    ) -> Result<(), StreamKeyError> {
        let diff = self.subscriptions.update(package, raw_keys).await?;

        for key in &diff.added {
            self.replay_cached(package, key).await;
        }

        self.refresh_transcription_streams().await;
        self.broadcast_app_state().await;
        Ok(())
    }

    /// Replay-on-subscribe: cached calendar events, last location, last user
    /// datetime. Delivery goes through the App manager and therefore
    /// inherits resurrection semantics.
    async fn replay_cached(&self, package: &str, key: &StreamKey) {
        match key {
            StreamKey::CalendarEvent => {
                for event in self.subscriptions.all_calendar_events().await {
                    let data = match serde_json::to_value(&event) {
                        Ok(data) => data,
                        Err(_) => continue,
                    };
                    let _ = self
                        .apps
                        .send_message_to_app(
                            package,
                            &AppOutgoing::DataStream {
                                session_id: self.user_id.clone(),
                                stream_type: StreamKey::CalendarEvent.to_string(),
                                data,
                                timestamp: epoch_ms(),
                            },
                        )
                        .await;
                }
            }
            StreamKey::LocationUpdate => {
                if let Some(location) = self.subscriptions.last_location().await {
                    if let Ok(data) = serde_json::to_value(&location) {
                        let _ = self
                            .apps
                            .send_message_to_app(
                                package,
                                &AppOutgoing::DataStream {
                                    session_id: self.user_id.clone(),
                                    stream_type: StreamKey::LocationUpdate.to_string(),
                                    data,
                                    timestamp: epoch_ms(),
                                },
                            )
                            .await;
                    }
                }
            }
            StreamKey::CustomMessage => {
                if let Some(datetime) = self.subscriptions.user_datetime().await {
                    let _ = self
                        .apps
                        .send_message_to_app(
                            package,
                            &AppOutgoing::CustomMessage {
                                action: Some("user_datetime".to_owned()),
                                payload: json!({ "datetime": datetime }),
                            },
                        )
                        .await;
                }
            }
            _ => {}
        }
    }

    /// Reconcile transcription streams with the current minimal language
    /// set.
    pub async fn refresh_transcription_streams(&self) {
        let minimal = self.subscriptions.minimal_language_subscriptions().await;
        self.transcription.update_subscriptions(&minimal).await;
    }

    /// Publish a device event to every App subscribed to its key.
    pub async fn relay_to_subscribers(&self, key: &StreamKey, data: Value) {
        let timestamp = epoch_ms();
        for package in self.subscriptions.subscribers(key).await {
            let _ = self
                .apps
                .send_message_to_app(
                    &package,
                    &AppOutgoing::DataStream {
                        session_id: self.user_id.clone(),
                        stream_type: key.to_string(),
                        data: data.clone(),
                        timestamp,
                    },
                )
                .await;
        }
    }

    // -- teardown -------------------------------------------------------------

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Tear the session down. Idempotent; concurrent calls collapse into the
    /// first one.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(user_id = %self.user_id, "disposing session");

        // Everything scoped to the session observes this token.
        self.cancel.cancel();

        if let Some(timer) = self.cleanup_timer.lock().await.take() {
            timer.abort();
        }

        self.transcription.dispose().await;
        self.apps.dispose().await;
        self.media.dispose().await;

        let glasses = self.glasses.write().await.take();
        if let Some(link) = glasses {
            link.close(close_code::NORMAL, "session ended");
        }
    }
}
