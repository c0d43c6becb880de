// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the control plane.

pub mod app_ws;
pub mod auth;
pub mod glasses_ws;
pub mod http;

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::config::CloudConfig;
use crate::protocol::Frame;
use crate::session::registry::SessionRegistry;
use crate::transcription::breaker::TranscriptionLimits;

/// Shared router state.
pub struct CloudState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<CloudConfig>,
    pub limits: Arc<TranscriptionLimits>,
}

/// Build the axum `Router` with all control-plane routes.
pub fn build_router(state: Arc<CloudState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Admin session views
        .route("/api/v1/sessions", get(http::list_sessions))
        .route("/api/v1/sessions/{id}", get(http::session_detail))
        .route("/api/v1/sessions/{id}/audio/recent", get(http::recent_audio))
        .route("/api/v1/sessions/{id}/transcripts", get(http::transcripts))
        // Token minting
        .route("/api/v1/tokens/glasses", post(http::mint_glasses_token))
        .route("/api/v1/tokens/app", post(http::mint_app_token))
        // Duplex links
        .route("/glasses-ws", get(glasses_ws::ws_handler))
        .route("/app-ws", get(app_ws::ws_handler))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Spawn the writer task that owns a socket sink and drains a link's frame
/// queue. This is what serializes outbound sends per link.
pub(crate) fn spawn_link_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                Frame::Text(text) => sink.send(Message::Text(text.into())).await,
                Frame::Binary(data) => sink.send(Message::Binary(data)).await,
                Frame::Close(code, reason) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });
}
