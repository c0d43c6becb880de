// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence contracts consumed by the core.
//!
//! The authoritative stores live outside this process; the core only needs
//! the narrow interfaces below. The in-memory implementation backs tests and
//! single-node deployments.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// A registered App as the developer portal records it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub package_name: String,
    pub public_url: String,
    #[serde(default)]
    pub is_system_app: bool,
    /// Developer-declared settings with their defaults.
    #[serde(default)]
    pub settings: Vec<AppSetting>,
}

/// One declared App setting with its default value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSetting {
    pub key: String,
    pub default_value: Value,
}

/// Snapshot of a user record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRecord {
    pub email: String,
    /// Device-level settings blob.
    #[serde(default)]
    pub device_settings: Value,
    /// Packages that should be restarted when the user reconnects.
    #[serde(default)]
    pub running_apps: Vec<String>,
    /// Per-App setting overrides, `package -> key -> value`.
    #[serde(default)]
    pub app_settings: HashMap<String, HashMap<String, Value>>,
}

/// User persistence consumed by the session supervisor.
pub trait UserStore: Send + Sync {
    fn get_or_create(&self, email: &str) -> BoxFuture<'_, anyhow::Result<UserRecord>>;
    fn add_running_app(&self, email: &str, package: &str) -> BoxFuture<'_, anyhow::Result<()>>;
    fn remove_running_app(&self, email: &str, package: &str) -> BoxFuture<'_, anyhow::Result<()>>;
    fn set_device_settings(&self, email: &str, settings: Value)
        -> BoxFuture<'_, anyhow::Result<()>>;
    fn app_settings(
        &self,
        email: &str,
        package: &str,
    ) -> BoxFuture<'_, anyhow::Result<HashMap<String, Value>>>;
}

/// App catalog and developer-service key validation.
pub trait AppStore: Send + Sync {
    fn get_app(&self, package: &str) -> BoxFuture<'_, anyhow::Result<Option<AppRecord>>>;
    fn list_apps(&self) -> BoxFuture<'_, anyhow::Result<Vec<AppRecord>>>;
    /// Is this key the current one for this package?
    fn validate_api_key(&self, package: &str, api_key: &str) -> BoxFuture<'_, anyhow::Result<bool>>;
}

// -- In-memory implementation -------------------------------------------------

/// In-memory store used by tests and single-node runs.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
    apps: RwLock<HashMap<String, AppRecord>>,
    api_keys: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an App and its current API key.
    pub async fn insert_app(&self, record: AppRecord, api_key: &str) {
        self.api_keys.write().await.insert(record.package_name.clone(), api_key.to_owned());
        self.apps.write().await.insert(record.package_name.clone(), record);
    }

    /// Seed a user's persisted running-apps list.
    pub async fn seed_running_apps(&self, email: &str, packages: &[&str]) {
        let mut users = self.users.write().await;
        let user = users.entry(email.to_owned()).or_insert_with(|| UserRecord {
            email: email.to_owned(),
            ..UserRecord::default()
        });
        user.running_apps = packages.iter().map(|p| (*p).to_owned()).collect();
    }

    /// Set a user's per-App setting override.
    pub async fn set_app_setting(&self, email: &str, package: &str, key: &str, value: Value) {
        let mut users = self.users.write().await;
        let user = users.entry(email.to_owned()).or_insert_with(|| UserRecord {
            email: email.to_owned(),
            ..UserRecord::default()
        });
        user.app_settings.entry(package.to_owned()).or_default().insert(key.to_owned(), value);
    }
}

impl UserStore for MemoryStore {
    fn get_or_create(&self, email: &str) -> BoxFuture<'_, anyhow::Result<UserRecord>> {
        let email = email.to_owned();
        Box::pin(async move {
            let mut users = self.users.write().await;
            let user = users.entry(email.clone()).or_insert_with(|| UserRecord {
                email,
                ..UserRecord::default()
            });
            Ok(user.clone())
        })
    }

    fn add_running_app(&self, email: &str, package: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        let email = email.to_owned();
        let package = package.to_owned();
        Box::pin(async move {
            let mut users = self.users.write().await;
            if let Some(user) = users.get_mut(&email) {
                if !user.running_apps.contains(&package) {
                    user.running_apps.push(package);
                }
            }
            Ok(())
        })
    }

    fn remove_running_app(&self, email: &str, package: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        let email = email.to_owned();
        let package = package.to_owned();
        Box::pin(async move {
            let mut users = self.users.write().await;
            if let Some(user) = users.get_mut(&email) {
                user.running_apps.retain(|p| p != &package);
            }
            Ok(())
        })
    }

    fn set_device_settings(
        &self,
        email: &str,
        settings: Value,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let email = email.to_owned();
        Box::pin(async move {
            let mut users = self.users.write().await;
            if let Some(user) = users.get_mut(&email) {
                user.device_settings = settings;
            }
            Ok(())
        })
    }

    fn app_settings(
        &self,
        email: &str,
        package: &str,
    ) -> BoxFuture<'_, anyhow::Result<HashMap<String, Value>>> {
        let email = email.to_owned();
        let package = package.to_owned();
        Box::pin(async move {
            let users = self.users.read().await;
            Ok(users
                .get(&email)
                .and_then(|u| u.app_settings.get(&package))
                .cloned()
                .unwrap_or_default())
        })
    }
}

impl AppStore for MemoryStore {
    fn get_app(&self, package: &str) -> BoxFuture<'_, anyhow::Result<Option<AppRecord>>> {
        let package = package.to_owned();
        Box::pin(async move { Ok(self.apps.read().await.get(&package).cloned()) })
    }

    fn list_apps(&self) -> BoxFuture<'_, anyhow::Result<Vec<AppRecord>>> {
        Box::pin(async move { Ok(self.apps.read().await.values().cloned().collect()) })
    }

    fn validate_api_key(
        &self,
        package: &str,
        api_key: &str,
    ) -> BoxFuture<'_, anyhow::Result<bool>> {
        let package = package.to_owned();
        let api_key = api_key.to_owned();
        Box::pin(async move {
            Ok(self.api_keys.read().await.get(&package).is_some_and(|k| k == &api_key))
        })
    }
}
