// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Display and dashboard managers. Layout requests from Apps are throttled
//! per App and rendered to the glasses; head-up gestures cycle the dashboard
//! through its modes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::CloudConfig;
use crate::protocol::glasses::GlassesOutgoing;
use crate::session::UserSession;

/// Why a display request was not rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayRefused {
    /// The App sent another layout inside its throttle window.
    Throttled,
    GlassesOffline,
}

#[derive(Default)]
struct DisplayInner {
    last_sent: HashMap<String, Instant>,
    /// Package currently owning the main view.
    owner: Option<String>,
}

/// Merges layout requests across Apps and renders to the glasses.
pub struct DisplayManager {
    session: Weak<UserSession>,
    config: Arc<CloudConfig>,
    inner: Mutex<DisplayInner>,
}

impl DisplayManager {
    pub fn new(session: Weak<UserSession>, config: Arc<CloudConfig>) -> Self {
        Self { session, config, inner: Mutex::new(DisplayInner::default()) }
    }

    /// Render an App's layout, subject to the per-App throttle.
    pub async fn handle_display_request(
        &self,
        package: &str,
        layout: Value,
        duration_ms: Option<u64>,
    ) -> Result<(), DisplayRefused> {
        {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            if let Some(last) = inner.last_sent.get(package) {
                if now.duration_since(*last) < self.config.display_throttle() {
                    return Err(DisplayRefused::Throttled);
                }
            }
            inner.last_sent.insert(package.to_owned(), now);
            inner.owner = Some(package.to_owned());
        }

        let Some(session) = self.session.upgrade() else {
            return Err(DisplayRefused::GlassesOffline);
        };
        if session
            .send_to_glasses(&GlassesOutgoing::DisplayEvent { layout, duration_ms })
            .await
        {
            Ok(())
        } else {
            Err(DisplayRefused::GlassesOffline)
        }
    }

    /// Current main-view owner.
    pub async fn owner(&self) -> Option<String> {
        self.inner.lock().await.owner.clone()
    }

    /// Drop an App's throttle/ownership state when it goes away.
    pub async fn forget_app(&self, package: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_sent.remove(package);
        if inner.owner.as_deref() == Some(package) {
            inner.owner = None;
        }
    }
}

/// Dashboard view modes, cycled by the head-up gesture.
const DASHBOARD_MODES: [&str; 3] = ["main", "expanded", "hidden"];

#[derive(Default)]
struct DashboardInner {
    mode_index: usize,
    /// Latest content per contributing App.
    content: HashMap<String, Value>,
}

/// Owns the system dashboard: per-App content sections merged into one
/// layout per mode.
pub struct DashboardManager {
    session: Weak<UserSession>,
    inner: Mutex<DashboardInner>,
}

impl DashboardManager {
    pub fn new(session: Weak<UserSession>) -> Self {
        Self { session, inner: Mutex::new(DashboardInner::default()) }
    }

    pub async fn mode(&self) -> &'static str {
        DASHBOARD_MODES[self.inner.lock().await.mode_index]
    }

    /// Head-up gesture: advance to the next mode and re-render.
    pub async fn cycle_mode(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.mode_index = (inner.mode_index + 1) % DASHBOARD_MODES.len();
        }
        self.render().await;
    }

    /// An App updated its dashboard section.
    pub async fn update_content(&self, package: &str, content: Value) {
        self.inner.lock().await.content.insert(package.to_owned(), content);
        self.render().await;
    }

    /// An App (typically the system dashboard) forced a mode.
    pub async fn set_mode(&self, mode: &str) {
        if let Some(index) = DASHBOARD_MODES.iter().position(|m| *m == mode) {
            self.inner.lock().await.mode_index = index;
            self.render().await;
        } else {
            tracing::debug!(mode = %mode, "unknown dashboard mode ignored");
        }
    }

    pub async fn forget_app(&self, package: &str) {
        self.inner.lock().await.content.remove(package);
    }

    /// Merge sections into a single layout and push it to the glasses.
    async fn render(&self) {
        let layout = {
            let inner = self.inner.lock().await;
            let mode = DASHBOARD_MODES[inner.mode_index];
            if mode == "hidden" {
                return;
            }
            let mut sections: Vec<(&String, &Value)> = inner.content.iter().collect();
            sections.sort_by_key(|(package, _)| (*package).clone());
            json!({
                "view": "dashboard",
                "mode": mode,
                "sections": sections
                    .into_iter()
                    .map(|(package, content)| json!({"package": package, "content": content}))
                    .collect::<Vec<Value>>(),
            })
        };

        if let Some(session) = self.session.upgrade() {
            let _ = session
                .send_to_glasses(&GlassesOutgoing::DisplayEvent { layout, duration_ms: None })
                .await;
        }
    }
}

#[cfg(test)]
#[path = "display_tests.rs"]
mod tests;
