// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session App lifecycle: webhook-driven start, authenticated
//! back-connect, reconnect grace, and message delivery with bounded
//! automatic restart ("resurrection").

pub mod webhook;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CloudConfig;
use crate::error::{StartError, StartStage};
use crate::persist::{AppStore, UserStore};
use crate::protocol::app::{AppOutgoing, SessionRequest, SessionRequestKind};
use crate::protocol::{close_code, epoch_ms, Outbound};
use crate::session::UserSession;
use crate::settings::effective_app_settings;

/// Connection state of one App within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppConnectionState {
    Running,
    GracePeriod,
    Resurrecting,
    Stopping,
    Disconnected,
}

impl AppConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::GracePeriod => "grace_period",
            Self::Resurrecting => "resurrecting",
            Self::Stopping => "stopping",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Result of an outbound delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub sent: bool,
    pub resurrection_triggered: bool,
    pub error: Option<String>,
}

impl SendOutcome {
    fn sent() -> Self {
        Self { sent: true, resurrection_triggered: false, error: None }
    }

    fn resurrecting() -> Self {
        Self { sent: false, resurrection_triggered: true, error: None }
    }

    fn failed(reason: &str) -> Self {
        Self { sent: false, resurrection_triggered: false, error: Some(reason.to_owned()) }
    }
}

/// Tracked state for one App package.
struct AppEntry {
    state: AppConnectionState,
    link: Option<Outbound>,
    grace_timer: Option<AbortHandle>,
}

impl AppEntry {
    fn new(state: AppConnectionState) -> Self {
        Self { state, link: None, grace_timer: None }
    }
}

/// In-flight `start_app` waiting for the App to back-connect.
struct PendingConnection {
    started_at: Instant,
    waiters: Vec<oneshot::Sender<Result<(), StartError>>>,
    driver: AbortHandle,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, AppEntry>,
    pending: HashMap<String, PendingConnection>,
}

/// Per-session App manager. One entry per package; one pending connection
/// per in-flight start.
pub struct AppManager {
    session: Weak<UserSession>,
    user_id: String,
    config: Arc<CloudConfig>,
    user_store: Arc<dyn UserStore>,
    app_store: Arc<dyn AppStore>,
    http: reqwest::Client,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl AppManager {
    pub fn new(
        session: Weak<UserSession>,
        user_id: String,
        config: Arc<CloudConfig>,
        user_store: Arc<dyn UserStore>,
        app_store: Arc<dyn AppStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            user_id,
            config,
            user_store,
            app_store,
            http: reqwest::Client::new(),
            cancel,
            inner: Mutex::new(Inner::default()),
        }
    }

    // -- startup --------------------------------------------------------------

    /// Start an App by webhook and wait for it to back-connect.
    ///
    /// Idempotent with respect to RUNNING, and concurrent starts for the same
    /// package piggyback on the one in-flight attempt (a single webhook POST).
    pub async fn start_app(&self, package: &str) -> Result<(), StartError> {
        let rx = {
            let mut inner = self.inner.lock().await;
            if inner
                .entries
                .get(package)
                .is_some_and(|e| e.state == AppConnectionState::Running)
            {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            if let Some(pending) = inner.pending.get_mut(package) {
                pending.waiters.push(tx);
                rx
            } else {
                let driver = self.spawn_start_driver(package);
                inner.pending.insert(
                    package.to_owned(),
                    PendingConnection { started_at: Instant::now(), waiters: vec![tx], driver },
                );
                inner
                    .entries
                    .insert(package.to_owned(), AppEntry::new(AppConnectionState::Resurrecting));
                tracing::info!(user_id = %self.user_id, package = %package, "starting app");
                rx
            }
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(StartError::new(StartStage::Connection, "Session ended")),
        }
    }

    /// Spawn the task that delivers the webhook and holds the back-connect
    /// deadline. Resolution happens through `finish_start`, either from this
    /// task (webhook failure, timeout, cancel) or from `handle_app_init`.
    fn spawn_start_driver(&self, package: &str) -> AbortHandle {
        let weak = self.session.clone();
        let package = package.to_owned();
        let connect_timeout = self.config.app_connect_timeout();

        let handle = tokio::spawn(async move {
            let Some(session) = weak.upgrade() else { return };
            let mgr = &session.apps;

            let deadline = tokio::time::sleep(connect_timeout);
            tokio::pin!(deadline);

            let record = match session.installed_app(&package).await {
                Some(record) => record,
                None => {
                    mgr.finish_start(
                        &package,
                        Err(StartError::new(StartStage::Internal, "app not installed")),
                    )
                    .await;
                    return;
                }
            };

            let body = SessionRequest {
                kind: SessionRequestKind::SessionRequest,
                session_id: format!("{}-{}", mgr.user_id, package),
                user_id: mgr.user_id.clone(),
                timestamp: epoch_ms(),
                callback_ws_url: mgr.config.callback_ws_url(record.is_system_app).to_owned(),
            };

            let webhook = webhook::deliver_session_request(
                &mgr.http,
                &record.public_url,
                &body,
                mgr.config.webhook_timeout(),
            );
            tokio::pin!(webhook);
            let mut webhook_done = false;

            loop {
                tokio::select! {
                    _ = mgr.cancel.cancelled() => {
                        mgr.finish_start(
                            &package,
                            Err(StartError::new(StartStage::Connection, "Session ended")),
                        )
                        .await;
                        return;
                    }
                    _ = &mut deadline => {
                        let _ = mgr.user_store.remove_running_app(&mgr.user_id, &package).await;
                        mgr.finish_start(
                            &package,
                            Err(StartError::new(StartStage::Timeout, "app did not connect in time")),
                        )
                        .await;
                        return;
                    }
                    res = &mut webhook, if !webhook_done => {
                        match res {
                            Ok(()) => webhook_done = true,
                            Err(e) => {
                                let _ = mgr
                                    .user_store
                                    .remove_running_app(&mgr.user_id, &package)
                                    .await;
                                mgr.finish_start(
                                    &package,
                                    Err(StartError::new(StartStage::Webhook, e.to_string())),
                                )
                                .await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        handle.abort_handle()
    }

    /// Resolve the pending connection for a package, waking every waiter.
    ///
    /// All lock work happens before the driver abort so this is safe to call
    /// from the driver task itself.
    async fn finish_start(&self, package: &str, result: Result<(), StartError>) {
        let pending = {
            let mut inner = self.inner.lock().await;
            let Some(pending) = inner.pending.remove(package) else { return };
            if result.is_err()
                && inner
                    .entries
                    .get(package)
                    .is_some_and(|e| e.state == AppConnectionState::Resurrecting)
            {
                inner.entries.remove(package);
            }
            pending
        };

        tracing::debug!(
            user_id = %self.user_id,
            package = %package,
            elapsed_ms = pending.started_at.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "start resolved"
        );

        pending.driver.abort();
        for waiter in pending.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Start everything the user had running last time, concurrently.
    /// Per-App failures are logged and never abort the batch.
    pub async fn start_previously_running_apps(&self) {
        let packages = match self.user_store.get_or_create(&self.user_id).await {
            Ok(user) => user.running_apps,
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, err = %e, "failed to load running apps");
                return;
            }
        };

        let starts = packages.iter().map(|package| async move {
            if let Err(e) = self.start_app(package).await {
                tracing::warn!(
                    user_id = %self.user_id,
                    package = %package,
                    err = %e,
                    "previously-running app failed to start"
                );
            }
        });
        futures_util::future::join_all(starts).await;
    }

    // -- back-connect ---------------------------------------------------------

    /// Install an authenticated App link: validate the API key, verify the
    /// package is expected, move to RUNNING, ack with effective settings,
    /// and resolve the pending start.
    ///
    /// On rejection the error frame is sent and the link closed with a
    /// stable code; the returned code lets the endpoint stop reading.
    pub async fn handle_app_init(
        &self,
        package: &str,
        api_key: &str,
        link: Outbound,
    ) -> Result<(), u16> {
        match self.app_store.validate_api_key(package, api_key).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(user_id = %self.user_id, package = %package, "invalid API key");
                let _ = link.send_json(&AppOutgoing::ConnectionError {
                    code: "UNAUTHORIZED".to_owned(),
                    message: "invalid API key".to_owned(),
                });
                link.close(close_code::POLICY, "invalid API key");
                return Err(close_code::POLICY);
            }
            Err(e) => {
                tracing::error!(user_id = %self.user_id, package = %package, err = %e, "API key validation failed");
                let _ = link.send_json(&AppOutgoing::ConnectionError {
                    code: "INTERNAL".to_owned(),
                    message: "key validation unavailable".to_owned(),
                });
                link.close(close_code::INTERNAL, "key validation unavailable");
                return Err(close_code::INTERNAL);
            }
        }

        {
            let mut inner = self.inner.lock().await;
            let expected = inner.pending.contains_key(package)
                || inner.entries.get(package).is_some_and(|e| {
                    matches!(
                        e.state,
                        AppConnectionState::Running
                            | AppConnectionState::GracePeriod
                            | AppConnectionState::Resurrecting
                    )
                });
            if !expected {
                tracing::warn!(user_id = %self.user_id, package = %package, "unexpected app init");
                let _ = link.send_json(&AppOutgoing::ConnectionError {
                    code: "UNAUTHORIZED".to_owned(),
                    message: "app was not started for this session".to_owned(),
                });
                link.close(close_code::POLICY, "app not started");
                return Err(close_code::POLICY);
            }

            let entry = inner
                .entries
                .entry(package.to_owned())
                .or_insert_with(|| AppEntry::new(AppConnectionState::Resurrecting));
            if let Some(timer) = entry.grace_timer.take() {
                timer.abort();
            }
            if let Some(old) = entry.link.take() {
                old.close(close_code::GOING_AWAY, "link replaced");
            }
            entry.state = AppConnectionState::Running;
            entry.link = Some(link.clone());
        }

        let settings = self.effective_settings(package).await;
        let _ = link.send_json(&AppOutgoing::ConnectionAck {
            session_id: format!("{}-{}", self.user_id, package),
            settings,
        });

        let _ = self.user_store.add_running_app(&self.user_id, package).await;
        self.finish_start(package, Ok(())).await;

        tracing::info!(user_id = %self.user_id, package = %package, "app connected");
        if let Some(session) = self.session.upgrade() {
            session.broadcast_app_state().await;
        }
        Ok(())
    }

    /// User override falling back to the developer default, as a
    /// `[{key, value}]` array.
    async fn effective_settings(&self, package: &str) -> Value {
        let defaults = match self.app_store.get_app(package).await {
            Ok(Some(record)) => record.settings,
            _ => Vec::new(),
        };
        let overrides =
            self.user_store.app_settings(&self.user_id, package).await.unwrap_or_default();
        effective_app_settings(&defaults, &overrides)
    }

    // -- link close -----------------------------------------------------------

    /// React to an App link closing. 1000/1001 are deliberate; everything
    /// else enters the reconnect grace window.
    ///
    /// `link` identifies the closing handler: a close reported for a link
    /// that has already been replaced by a fresh back-connect is ignored.
    pub async fn handle_link_closed(&self, package: &str, code: Option<u16>, link: &Outbound) {
        {
            let inner = self.inner.lock().await;
            let current = inner
                .entries
                .get(package)
                .and_then(|e| e.link.as_ref())
                .is_some_and(|l| l.same_channel(link));
            if !current {
                tracing::debug!(user_id = %self.user_id, package = %package, "stale app link closed, ignoring");
                return;
            }
        }

        if matches!(code, Some(close_code::NORMAL) | Some(close_code::GOING_AWAY)) {
            tracing::info!(user_id = %self.user_id, package = %package, code, "app closed");
            self.remove_app(package).await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.entries.get_mut(package) else { return };
            if entry.state != AppConnectionState::Running {
                return;
            }
            tracing::warn!(
                user_id = %self.user_id,
                package = %package,
                code,
                "app link dropped, entering grace period"
            );
            entry.state = AppConnectionState::GracePeriod;
            entry.link = None;
            // At most one grace timer per package; replacing cancels the old one.
            if let Some(timer) = entry.grace_timer.take() {
                timer.abort();
            }
            entry.grace_timer = Some(self.spawn_grace_timer(package));
        }

        if let Some(session) = self.session.upgrade() {
            session.broadcast_app_state().await;
        }
    }

    fn spawn_grace_timer(&self, package: &str) -> AbortHandle {
        let weak = self.session.clone();
        let package = package.to_owned();
        let grace = self.config.app_grace();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(session) = weak.upgrade() {
                        session.apps.grace_expired(&package).await;
                    }
                }
            }
        });
        handle.abort_handle()
    }

    /// The grace window elapsed without a reconnect: mark DISCONNECTED and
    /// bring the persistent running-apps set back in line with reality.
    async fn grace_expired(&self, package: &str) {
        {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.entries.get_mut(package) else { return };
            if entry.state != AppConnectionState::GracePeriod {
                return;
            }
            entry.state = AppConnectionState::Disconnected;
            entry.grace_timer = None;
        }

        tracing::warn!(user_id = %self.user_id, package = %package, "grace period expired");
        let _ = self.user_store.remove_running_app(&self.user_id, package).await;
        if let Some(session) = self.session.upgrade() {
            session.broadcast_app_state().await;
        }
    }

    // -- stop -----------------------------------------------------------------

    /// Explicit stop: notify the App, close 1000, forget the entry.
    pub async fn stop_app(&self, package: &str) {
        let link = {
            let mut inner = self.inner.lock().await;
            match inner.entries.get_mut(package) {
                Some(entry) => {
                    entry.state = AppConnectionState::Stopping;
                    if let Some(timer) = entry.grace_timer.take() {
                        timer.abort();
                    }
                    entry.link.take()
                }
                None => None,
            }
        };

        if let Some(link) = link {
            let _ = link.send_json(&AppOutgoing::AppStopped {});
            link.close(close_code::NORMAL, "app stopped");
        }

        self.finish_start(package, Err(StartError::new(StartStage::Connection, "App stopped")))
            .await;
        self.remove_app(package).await;
    }

    /// Forget an App entirely: entry, subscriptions, persistent state.
    async fn remove_app(&self, package: &str) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(mut entry) = inner.entries.remove(package) {
                if let Some(timer) = entry.grace_timer.take() {
                    timer.abort();
                }
            }
        }

        let _ = self.user_store.remove_running_app(&self.user_id, package).await;
        if let Some(session) = self.session.upgrade() {
            session.subscriptions.remove(package).await;
            session.display.forget_app(package).await;
            session.dashboard.forget_app(package).await;
            session.refresh_transcription_streams().await;
            session.broadcast_app_state().await;
        }
    }

    // -- outbound delivery ----------------------------------------------------

    /// Deliver a JSON message to an App. At-most-once: a DISCONNECTED App is
    /// restarted asynchronously but the triggering message is never queued
    /// or replayed.
    pub async fn send_message_to_app(&self, package: &str, message: &AppOutgoing) -> SendOutcome {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => return SendOutcome::failed(&format!("serialize: {e}")),
        };
        self.deliver(package, Payload::Json(text)).await
    }

    /// Deliver a raw binary frame (PCM) to an App. Same semantics as
    /// `send_message_to_app`.
    pub async fn send_binary_to_app(&self, package: &str, data: Bytes) -> SendOutcome {
        self.deliver(package, Payload::Binary(data)).await
    }

    async fn deliver(&self, package: &str, payload: Payload) -> SendOutcome {
        {
            let mut inner = self.inner.lock().await;
            match inner.entries.get_mut(package) {
                Some(entry) => match entry.state {
                    AppConnectionState::Running => {
                        let sent = match &entry.link {
                            Some(link) => match payload {
                                Payload::Json(text) => link.send_text(text),
                                Payload::Binary(data) => link.send_binary(data),
                            },
                            None => Err(crate::protocol::LinkClosed),
                        };
                        match sent {
                            Ok(()) => return SendOutcome::sent(),
                            Err(_) => {
                                // Dead link without a close event: drop it and
                                // fall through to resurrection.
                                entry.link = None;
                                entry.state = AppConnectionState::Disconnected;
                            }
                        }
                    }
                    AppConnectionState::Disconnected => {}
                    AppConnectionState::GracePeriod => {
                        return SendOutcome::failed("app in reconnect grace period")
                    }
                    AppConnectionState::Resurrecting => {
                        return SendOutcome::failed("app is starting")
                    }
                    AppConnectionState::Stopping => return SendOutcome::failed("app is stopping"),
                },
                None => return SendOutcome::failed("app not running"),
            }
        }

        // DISCONNECTED: restart asynchronously; the message itself is dropped.
        let weak = self.session.clone();
        let package = package.to_owned();
        tokio::spawn(async move {
            if let Some(session) = weak.upgrade() {
                if let Err(e) = session.apps.start_app(&package).await {
                    tracing::warn!(package = %package, err = %e, "resurrection failed");
                }
            }
        });
        SendOutcome::resurrecting()
    }

    // -- queries --------------------------------------------------------------

    /// Current state of a package, if tracked.
    pub async fn state_of(&self, package: &str) -> Option<AppConnectionState> {
        self.inner.lock().await.entries.get(package).map(|e| e.state)
    }

    /// Whether a start is currently pending for the package.
    pub async fn is_loading(&self, package: &str) -> bool {
        self.inner.lock().await.pending.contains_key(package)
    }

    /// Packages the user currently sees as running (RUNNING plus the
    /// transient GRACE_PERIOD/RESURRECTING states).
    pub async fn running_packages(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut out: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| {
                matches!(
                    e.state,
                    AppConnectionState::Running
                        | AppConnectionState::GracePeriod
                        | AppConnectionState::Resurrecting
                )
            })
            .map(|(p, _)| p.clone())
            .collect();
        out.sort();
        out
    }

    /// State snapshot for admin views and `app_state_change` payloads.
    pub async fn snapshot(&self) -> HashMap<String, &'static str> {
        let inner = self.inner.lock().await;
        inner.entries.iter().map(|(p, e)| (p.clone(), e.state.as_str())).collect()
    }

    // -- dispose --------------------------------------------------------------

    /// Tear down every pending start, timer, and link. Waiters resolve with
    /// a CONNECTION-stage error.
    pub async fn dispose(&self) {
        let (pendings, links) = {
            let mut inner = self.inner.lock().await;
            let pendings: Vec<PendingConnection> =
                inner.pending.drain().map(|(_, p)| p).collect();
            let links: Vec<Outbound> = inner
                .entries
                .drain()
                .filter_map(|(_, mut e)| {
                    if let Some(timer) = e.grace_timer.take() {
                        timer.abort();
                    }
                    e.link
                })
                .collect();
            (pendings, links)
        };

        for pending in pendings {
            pending.driver.abort();
            for waiter in pending.waiters {
                let _ =
                    waiter.send(Err(StartError::new(StartStage::Connection, "Session ended")));
            }
        }

        for link in links {
            let _ = link.send_json(&AppOutgoing::AppStopped {});
            link.close(close_code::NORMAL, "session ended");
        }
    }
}

enum Payload {
    Json(String),
    Binary(Bytes),
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
