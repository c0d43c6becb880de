// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admin and observability HTTP routes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::error::CloudError;
use crate::protocol::epoch_ms;
use crate::token::{self, AppClaims, GlassesClaims};
use crate::transport::CloudState;

/// `GET /api/v1/health`
pub async fn health(State(state): State<Arc<CloudState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.session_count().await,
        "streams": {
            "active": state.limits.active_streams(),
            "max": state.limits.max_total(),
        },
        "breaker_open": state.limits.breaker_open_remaining().is_some(),
    }))
}

/// `GET /api/v1/sessions`
pub async fn list_sessions(State(state): State<Arc<CloudState>>) -> impl IntoResponse {
    let mut out = Vec::new();
    for session in state.registry.sessions().await {
        out.push(json!({
            "userId": session.user_id,
            "startTime": session.started_at_ms,
            "disconnectedAt": session.disconnected_at(),
            "runningApps": session.apps.running_packages().await,
        }));
    }
    Json(json!({ "sessions": out }))
}

/// `GET /api/v1/sessions/{id}`
pub async fn session_detail(
    State(state): State<Arc<CloudState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let Some(session) = state.registry.get(&user_id).await else {
        return CloudError::SessionNotFound.to_http_response("no such session").into_response();
    };

    Json(json!({
        "session": session.snapshot().await,
        "disconnectedAt": session.disconnected_at(),
        "subscriptions": session.subscriptions.snapshot().await,
        "streams": session.transcription.snapshot().await,
        "rtmpHolder": session.media.rtmp_holder().await,
    }))
    .into_response()
}

/// `GET /api/v1/sessions/{id}/audio/recent` — drain the 10-second PCM ring.
pub async fn recent_audio(
    State(state): State<Arc<CloudState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let Some(session) = state.registry.get(&user_id).await else {
        return CloudError::SessionNotFound.to_http_response("no such session").into_response();
    };

    let chunks: Vec<_> = session
        .audio
        .recent_audio()
        .await
        .into_iter()
        .map(|chunk| {
            json!({
                "timestamp": chunk.timestamp,
                "pcm": BASE64.encode(&chunk.pcm),
            })
        })
        .collect();

    Json(json!({ "userId": user_id, "now": epoch_ms(), "chunks": chunks })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct TranscriptQuery {
    pub language: Option<String>,
}

/// `GET /api/v1/sessions/{id}/transcripts?language=` — 30-minute history.
pub async fn transcripts(
    State(state): State<Arc<CloudState>>,
    Path(user_id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> impl IntoResponse {
    let Some(session) = state.registry.get(&user_id).await else {
        return CloudError::SessionNotFound.to_http_response("no such session").into_response();
    };

    let now = epoch_ms();
    let language = query.language.unwrap_or_else(|| "en-US".to_owned());
    let segments = session.transcription.history.segments(&language, now).await;
    Json(json!({
        "userId": user_id,
        "language": language,
        "languages": session.transcription.history.languages().await,
        "segments": segments,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct GlassesTokenRequest {
    pub email: String,
}

/// `POST /api/v1/tokens/glasses`
pub async fn mint_glasses_token(
    State(state): State<Arc<CloudState>>,
    Json(body): Json<GlassesTokenRequest>,
) -> impl IntoResponse {
    match token::sign(&state.config.auth_secret, &GlassesClaims { email: body.email }) {
        Ok(token) => Json(json!({ "token": token })).into_response(),
        Err(_) => CloudError::Internal.to_http_response("token mint failed").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct AppTokenRequest {
    pub package_name: String,
    pub api_key: String,
}

/// `POST /api/v1/tokens/app`
pub async fn mint_app_token(
    State(state): State<Arc<CloudState>>,
    Json(body): Json<AppTokenRequest>,
) -> impl IntoResponse {
    let claims = AppClaims { package_name: body.package_name, api_key: body.api_key };
    match token::sign(&state.config.auth_secret, &claims) {
        Ok(token) => Json(json!({ "token": token })).into_response(),
        Err(_) => CloudError::Internal.to_http_response("token mint failed").into_response(),
    }
}
