// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Glasses endpoint: one duplex link per user, authenticated by a signed
//! token whose payload carries the user's e-mail.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::protocol::glasses::{GlassesIncoming, GlassesOutgoing, HeadPosition};
use crate::protocol::stream::StreamKey;
use crate::protocol::Outbound;
use crate::session::UserSession;
use crate::settings::changed_keys;
use crate::subscription::CachedLocation;
use crate::token::{self, GlassesClaims};
use crate::transport::{spawn_link_writer, CloudState};

#[derive(Debug, Clone, Deserialize)]
pub struct GlassesWsQuery {
    pub token: String,
}

/// `GET /glasses-ws` — WebSocket upgrade for a glasses link.
pub async fn ws_handler(
    State(state): State<Arc<CloudState>>,
    Query(query): Query<GlassesWsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let claims: GlassesClaims = match token::verify(&state.config.auth_secret, &query.token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(err = %e, "glasses ws auth failed");
            return axum::http::Response::builder()
                .status(401)
                .body(axum::body::Body::from("unauthorized"))
                .unwrap_or_default()
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_glasses(socket, state, claims.email)).into_response()
}

/// Per-connection glasses handler: acquire the session, ack, then dispatch
/// inbound frames until the link drops.
async fn handle_glasses(socket: WebSocket, state: Arc<CloudState>, user_id: String) {
    let (outbound, frame_rx) = Outbound::channel();
    let (ws_tx, mut ws_rx) = socket.split();
    spawn_link_writer(ws_tx, frame_rx);

    let link_id = outbound.clone();
    let (session, reconnected) = state.registry.acquire(&user_id, outbound).await;

    let user_session = session.snapshot().await;
    session
        .send_to_glasses(&GlassesOutgoing::ConnectionAck {
            session_id: user_id.clone(),
            user_session,
        })
        .await;

    if !reconnected {
        // First connect: dashboard, previously-running Apps, transcription.
        // Runs off the read loop so startup webhooks never stall inbound
        // audio.
        let boot = Arc::clone(&session);
        let dashboard_package = state.config.dashboard_package.clone();
        tokio::spawn(async move {
            if let Err(e) = boot.apps.start_app(&dashboard_package).await {
                tracing::warn!(user_id = %boot.user_id, err = %e, "dashboard app failed to start");
            }
            boot.apps.start_previously_running_apps().await;
            boot.refresh_transcription_streams().await;
        });
    }

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<GlassesIncoming>(&text) {
                Ok(incoming) => dispatch(&session, incoming).await,
                Err(e) => {
                    tracing::debug!(user_id = %user_id, err = %e, "malformed glasses frame");
                    session
                        .send_to_glasses(&GlassesOutgoing::ConnectionError {
                            code: "MALFORMED_MESSAGE".to_owned(),
                            message: e.to_string(),
                        })
                        .await;
                }
            },
            Ok(Message::Binary(data)) => {
                session.audio.route_frame(data).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    state.registry.handle_glasses_closed(&user_id, &link_id).await;
}

/// Route one inbound glasses message to its manager.
async fn dispatch(session: &Arc<UserSession>, incoming: GlassesIncoming) {
    match incoming {
        GlassesIncoming::ConnectionInit { sample_rate_hz } => {
            if let Some(hz) = sample_rate_hz {
                session.transcription.set_sample_rate(hz);
            }
        }
        GlassesIncoming::StartApp { package_name } => {
            // Off the read loop; starting can take seconds.
            let session = Arc::clone(session);
            tokio::spawn(async move {
                if let Err(e) = session.apps.start_app(&package_name).await {
                    tracing::warn!(user_id = %session.user_id, package = %package_name, err = %e, "start_app failed");
                }
                session.broadcast_app_state().await;
            });
        }
        GlassesIncoming::StopApp { package_name } => {
            session.apps.stop_app(&package_name).await;
        }
        GlassesIncoming::Vad { status } => {
            session.transcription.handle_vad(status).await;
            let data = serde_json::json!({ "status": status });
            session.relay_to_subscribers(&StreamKey::VadStatus, data).await;
        }
        GlassesIncoming::LocationUpdate { lat, lng, accuracy } => {
            let location = CachedLocation {
                lat,
                lng,
                accuracy,
                timestamp: crate::protocol::epoch_ms(),
            };
            session.subscriptions.cache_location(location.clone()).await;
            if let Ok(data) = serde_json::to_value(&location) {
                session.relay_to_subscribers(&StreamKey::LocationUpdate, data).await;
            }
        }
        GlassesIncoming::CalendarEvent(event) => {
            session.subscriptions.cache_calendar_event(event.clone()).await;
            if let Ok(data) = serde_json::to_value(&event) {
                session.relay_to_subscribers(&StreamKey::CalendarEvent, data).await;
            }
        }
        GlassesIncoming::HeadPosition { position } => {
            if position == HeadPosition::Up {
                session.dashboard.cycle_mode().await;
            }
            let data = serde_json::json!({ "position": position });
            session.relay_to_subscribers(&StreamKey::HeadPosition, data).await;
        }
        GlassesIncoming::CoreStatusUpdate { status } => {
            handle_core_status(session, status).await;
        }
        GlassesIncoming::RtmpStreamStatus { stream_id, status, stats } => {
            session.media.handle_stream_status(stream_id.as_deref(), &status, stats).await;
        }
        GlassesIncoming::KeepAliveAck { ack_id } => {
            session.media.handle_keepalive_ack(&ack_id).await;
        }
        GlassesIncoming::PhotoResponse { request_id, photo_url, error } => {
            session.media.handle_photo_response(&request_id, photo_url, error).await;
        }
        GlassesIncoming::RequestSettings {} => {
            let settings = match session.user_store.get_or_create(&session.user_id).await {
                Ok(user) => user.device_settings,
                Err(_) => Value::Null,
            };
            session.send_to_glasses(&GlassesOutgoing::SettingsUpdate { settings }).await;
        }
    }
}

/// Diff the device settings blob against the stored one, persist, and notify
/// running Apps of the changed keys only.
async fn handle_core_status(session: &Arc<UserSession>, status: Value) {
    // A status blob may carry the device's local datetime; cache it for
    // replay on `custom_message` subscriptions.
    if let Some(datetime) = status.get("datetime").and_then(Value::as_str) {
        session.subscriptions.cache_user_datetime(datetime.to_owned()).await;
    }

    let prev = match session.user_store.get_or_create(&session.user_id).await {
        Ok(user) => user.device_settings,
        Err(e) => {
            tracing::warn!(user_id = %session.user_id, err = %e, "settings load failed");
            Value::Null
        }
    };

    let changed = changed_keys(&prev, &status);
    if changed.is_empty() {
        return;
    }

    if let Err(e) =
        session.user_store.set_device_settings(&session.user_id, status.clone()).await
    {
        tracing::warn!(user_id = %session.user_id, err = %e, "settings persist failed");
    }

    let changed_view: serde_json::Map<String, Value> = changed
        .iter()
        .filter_map(|key| status.get(key).map(|v| (key.clone(), v.clone())))
        .collect();
    let payload = Value::Object(changed_view);

    for package in session.apps.running_packages().await {
        let _ = session
            .apps
            .send_message_to_app(
                &package,
                &crate::protocol::app::AppOutgoing::SettingsUpdate { settings: payload.clone() },
            )
            .await;
    }
}
