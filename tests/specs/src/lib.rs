// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for black-box scenario tests.
//!
//! Boots the full control plane in-process on an ephemeral port and talks to
//! it exactly the way glasses and Apps do: signed tokens, WebSocket links,
//! webhook back-connects.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use visorcloud::config::CloudConfig;
use visorcloud::persist::{AppRecord, AppStore, MemoryStore, UserStore};
use visorcloud::session::registry::SessionRegistry;
use visorcloud::session::SessionDeps;
use visorcloud::token::{self, GlassesClaims};
use visorcloud::transcription::breaker::TranscriptionLimits;
use visorcloud::transport::{build_router, CloudState};

pub const SECRET: &str = "spec-secret";

#[derive(Parser)]
struct ConfigWrapper {
    #[command(flatten)]
    config: CloudConfig,
}

/// A full in-process control plane.
pub struct CloudInstance {
    pub base_url: String,
    pub ws_base: String,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl Drop for CloudInstance {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl CloudInstance {
    /// Start the control plane on an ephemeral port with the given extra
    /// config flags.
    pub async fn start(overrides: &[&str]) -> anyhow::Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut args = vec!["visor-specs", "--auth-secret", SECRET];
        args.extend_from_slice(overrides);
        let config = Arc::new(ConfigWrapper::parse_from(args).config);

        let store = MemoryStore::new();
        let user_store: Arc<dyn UserStore> = store.clone();
        let app_store: Arc<dyn AppStore> = store.clone();

        let limits = TranscriptionLimits::new(
            config.transcription.max_total_streams,
            config.transcription.breaker_threshold,
            config.transcription.breaker_window(),
            config.transcription.breaker_cooldown(),
        );
        let providers = visorcloud::build_providers(&config);

        let shutdown = CancellationToken::new();
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

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = build_router(state);
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(serve_shutdown.cancelled_owned())
                .await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            ws_base: format!("ws://{addr}"),
            store,
            registry,
            shutdown,
        })
    }

    pub fn glasses_token(&self, email: &str) -> anyhow::Result<String> {
        token::sign(SECRET, &GlassesClaims { email: email.to_owned() })
            .map_err(|e| anyhow::anyhow!("{e}"))
    }

    /// Register an App backed by a local webhook receiver. Received webhook
    /// bodies arrive on the returned channel.
    pub async fn install_app(
        &self,
        package: &str,
        api_key: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<serde_json::Value>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let router = axum::Router::new().route(
            "/webhook",
            axum::routing::post(move |body: axum::Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body.0);
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}", listener.local_addr()?);
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

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
        Ok(rx)
    }

    /// Open a glasses link for the user and consume the `connection_ack`.
    pub async fn connect_glasses(&self, email: &str) -> anyhow::Result<WsClient> {
        let token = self.glasses_token(email)?;
        let url = format!("{}/glasses-ws?token={token}", self.ws_base);
        let (stream, _) = connect_async(&url).await?;
        let mut client = WsClient { stream };

        let ack = client.next_json().await?;
        anyhow::ensure!(ack["type"] == "connection_ack", "unexpected first frame: {ack}");
        Ok(client)
    }

    /// Back-connect an App over the legacy in-band init path and consume the
    /// `connection_ack`.
    pub async fn connect_app(
        &self,
        email: &str,
        package: &str,
        api_key: &str,
    ) -> anyhow::Result<WsClient> {
        let url = format!("{}/app-ws", self.ws_base);
        let (stream, _) = connect_async(&url).await?;
        let mut client = WsClient { stream };

        client
            .send_json(&serde_json::json!({
                "type": "connection_init",
                "package_name": package,
                "api_key": api_key,
                "session_id": format!("{email}-{package}"),
            }))
            .await?;

        let ack = client.next_json().await?;
        anyhow::ensure!(ack["type"] == "connection_ack", "unexpected first frame: {ack}");
        Ok(client)
    }
}

/// Thin wrapper over a client-side WebSocket.
pub struct WsClient {
    pub stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn send_json(&mut self, value: &serde_json::Value) -> anyhow::Result<()> {
        self.stream.send(Message::Text(value.to_string().into())).await?;
        Ok(())
    }

    pub async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()> {
        self.stream.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    /// Next text frame parsed as JSON, skipping pings, within 5 s.
    pub async fn next_json(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for a frame"))?
                .ok_or_else(|| anyhow::anyhow!("stream ended"))??;
            match msg {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(frame) => {
                    anyhow::bail!("closed: {frame:?}");
                }
                _ => continue,
            }
        }
    }

    /// Wait until a frame with the given `type` arrives, discarding others.
    pub async fn wait_for(&mut self, frame_type: &str) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "never saw a {frame_type} frame"
            );
            let frame = self.next_json().await?;
            if frame["type"] == frame_type {
                return Ok(frame);
            }
        }
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}
