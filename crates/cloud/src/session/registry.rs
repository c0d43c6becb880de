// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide `userId -> UserSession` map. The only shared mutable state
//! for sessions; all writes for a user go through this registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{SessionDeps, UserSession};
use crate::protocol::Outbound;

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<UserSession>>>,
    deps: SessionDeps,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self { sessions: RwLock::new(HashMap::new()), deps, shutdown })
    }

    /// Return the session for a user, creating it if needed, and install the
    /// new glasses link. The bool is true when an existing session was
    /// reconnected.
    ///
    /// Acquisition never fails; downstream managers surface their own errors
    /// during init.
    pub async fn acquire(
        self: &Arc<Self>,
        user_id: &str,
        link: Outbound,
    ) -> (Arc<UserSession>, bool) {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(user_id) {
            if existing.is_disposed() {
                // Lost the race against dispose: install a fresh session in
                // its place.
                tracing::warn!(user_id = %user_id, "overwrite: session was disposing during acquire");
            } else {
                let session = Arc::clone(existing);
                drop(sessions);
                session.attach_glasses(link).await;
                tracing::info!(user_id = %user_id, "glasses reconnected");
                return (session, true);
            }
        }

        let session = UserSession::new(user_id, &self.deps, self.shutdown.child_token());
        sessions.insert(user_id.to_owned(), Arc::clone(&session));
        drop(sessions);

        session.attach_glasses(link).await;
        tracing::info!(user_id = %user_id, "session created");
        (session, false)
    }

    pub async fn get(&self, user_id: &str) -> Option<Arc<UserSession>> {
        self.sessions.read().await.get(user_id).map(Arc::clone)
    }

    /// Remove the registry slot without disposing (used when dispose runs
    /// separately).
    pub async fn remove(&self, user_id: &str) -> Option<Arc<UserSession>> {
        self.sessions.write().await.remove(user_id)
    }

    /// All live sessions, for admin and health views.
    pub async fn sessions(&self) -> Vec<Arc<UserSession>> {
        self.sessions.read().await.values().map(Arc::clone).collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Glasses link closed: mark the session disconnected and arm the
    /// cleanup timer. A reconnect inside the grace window cancels it.
    ///
    /// `link` identifies the closing handler; a close from a link that was
    /// already replaced by a reconnect is ignored.
    pub async fn handle_glasses_closed(self: &Arc<Self>, user_id: &str, link: &Outbound) {
        let Some(session) = self.get(user_id).await else { return };
        if !session.glasses_is(link).await {
            tracing::debug!(user_id = %user_id, "stale glasses link closed, ignoring");
            return;
        }
        session.mark_disconnected().await;
        tracing::info!(user_id = %user_id, "glasses disconnected, cleanup armed");

        let registry = Arc::clone(self);
        let user = user_id.to_owned();
        let grace = session.config.session_grace();
        let cancel = session.cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }

            let Some(session) = registry.get(&user).await else { return };
            // A new link may have arrived during the grace window.
            if !session.is_disconnected() {
                return;
            }
            tracing::info!(user_id = %user, "reconnect grace expired");
            registry.dispose_session(&user).await;
        });
        session.set_cleanup_timer(handle.abort_handle()).await;
    }

    /// Remove and fully dispose a session. Idempotent.
    pub async fn dispose_session(&self, user_id: &str) {
        if let Some(session) = self.remove(user_id).await {
            session.dispose().await;
        }
    }

    /// Dispose every session (process shutdown).
    pub async fn dispose_all(&self) {
        let sessions: Vec<Arc<UserSession>> = {
            let mut map = self.sessions.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.dispose().await;
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
