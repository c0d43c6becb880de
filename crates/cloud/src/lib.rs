// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! visor-cloud: control plane for a smart-glasses fleet. One process
//! mediates between glasses (one duplex link per user) and third-party Apps
//! (one duplex link per App), routing audio, events, and transcription
//! between them.

pub mod apps;
pub mod audio;
pub mod config;
pub mod display;
pub mod error;
pub mod media;
pub mod persist;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod subscription;
pub mod token;
pub mod transcription;
pub mod transport;

#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::CloudConfig;
use crate::persist::{AppStore, MemoryStore, UserStore};
use crate::session::registry::SessionRegistry;
use crate::session::SessionDeps;
use crate::transcription::azure::AzureProvider;
use crate::transcription::breaker::TranscriptionLimits;
use crate::transcription::provider::{ProviderKind, ProviderRegistry, TranscriptionProvider};
use crate::transcription::soniox::SonioxProvider;
use crate::transport::{build_router, CloudState};

/// Build the provider registry from config.
pub fn build_providers(config: &CloudConfig) -> Arc<ProviderRegistry> {
    let azure: Arc<dyn TranscriptionProvider> = AzureProvider::new(
        config.transcription.azure_url.clone(),
        config.transcription.azure_key.clone(),
    );
    let soniox: Arc<dyn TranscriptionProvider> = SonioxProvider::new(
        config.transcription.soniox_url.clone(),
        config.transcription.soniox_key.clone(),
    );
    let default = match config.transcription.default_provider.as_str() {
        "soniox" => ProviderKind::Soniox,
        _ => ProviderKind::Azure,
    };
    Arc::new(ProviderRegistry::new(vec![azure, soniox], default))
}

/// Run the control plane until shutdown.
pub async fn run(config: CloudConfig) -> anyhow::Result<()> {
    // reqwest is built with rustls-no-provider; install the ring provider
    // once for webhook TLS.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();
    let config = Arc::new(config);

    let store = MemoryStore::new();
    let user_store: Arc<dyn UserStore> = store.clone();
    let app_store: Arc<dyn AppStore> = store;

    let limits = TranscriptionLimits::new(
        config.transcription.max_total_streams,
        config.transcription.breaker_threshold,
        config.transcription.breaker_window(),
        config.transcription.breaker_cooldown(),
    );
    let providers = build_providers(&config);

    let registry = SessionRegistry::new(
        SessionDeps {
            config: Arc::clone(&config),
            user_store,
            app_store,
            providers,
            limits: Arc::clone(&limits),
        },
        shutdown.clone(),
    );

    let state = Arc::new(CloudState {
        registry: Arc::clone(&registry),
        config: Arc::clone(&config),
        limits,
    });

    // Ctrl-c cancels the root token; sessions dispose before the server
    // drains.
    let ctrlc_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            ctrlc_shutdown.cancel();
        }
    });

    let drain_registry = Arc::clone(&registry);
    let drain_token = shutdown.clone();
    tokio::spawn(async move {
        drain_token.cancelled().await;
        drain_registry.dispose_all().await;
    });

    tracing::info!("visor-cloud listening on {addr}");
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
