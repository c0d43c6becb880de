// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! App endpoint: one duplex link per (user, package). Auth is either a
//! signed bearer token in the query string or a legacy in-band
//! `connection_init` carrying the `userId-package` session id.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::protocol::app::{AppIncoming, AppOutgoing};
use crate::protocol::glasses::GlassesOutgoing;
use crate::protocol::{close_code, Outbound};
use crate::session::UserSession;
use crate::token::{self, AppClaims};
use crate::transport::{spawn_link_writer, CloudState};

/// How long a legacy App gets to send its in-band `connection_init`.
const INIT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct AppWsQuery {
    /// Signed App token; absent for legacy in-band init.
    pub token: Option<String>,
    /// `userId-package`, required with `token`.
    pub session_id: Option<String>,
}

/// `GET /app-ws` — WebSocket upgrade for an App link.
pub async fn ws_handler(
    State(state): State<Arc<CloudState>>,
    Query(query): Query<AppWsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_app(socket, state, query)).into_response()
}

async fn handle_app(socket: WebSocket, state: Arc<CloudState>, query: AppWsQuery) {
    let (outbound, frame_rx) = Outbound::channel();
    let (ws_tx, mut ws_rx) = socket.split();
    spawn_link_writer(ws_tx, frame_rx);

    // Resolve (session, package, api key) from the token, or from the first
    // frame on the legacy path.
    let (session, package, api_key) =
        match authenticate(&state, &query, &mut ws_rx, &outbound).await {
            Some(resolved) => resolved,
            None => return,
        };

    let link_id = outbound.clone();
    if session.apps.handle_app_init(&package, &api_key, outbound).await.is_err() {
        return;
    }

    let mut close_code_seen: Option<u16> = None;
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<AppIncoming>(&text) {
                Ok(incoming) => dispatch(&session, &package, incoming).await,
                Err(e) => {
                    tracing::debug!(package = %package, err = %e, "malformed app frame");
                    let _ = session
                        .apps
                        .send_message_to_app(
                            &package,
                            &AppOutgoing::ConnectionError {
                                code: "MALFORMED_MESSAGE".to_owned(),
                                message: e.to_string(),
                            },
                        )
                        .await;
                }
            },
            Ok(Message::Close(frame)) => {
                close_code_seen = frame.map(|f| f.code);
                break;
            }
            Err(_) => break,
            _ => {}
        }
    }

    session.apps.handle_link_closed(&package, close_code_seen, &link_id).await;
}

/// Resolve the UserSession, package, and api key for this link.
///
/// Token path: claims carry `(package, api_key)`; `session_id` names the
/// user. Legacy path: wait for `connection_init` as the first frame.
async fn authenticate(
    state: &Arc<CloudState>,
    query: &AppWsQuery,
    ws_rx: &mut futures_util::stream::SplitStream<WebSocket>,
    outbound: &Outbound,
) -> Option<(Arc<UserSession>, String, String)> {
    if let Some(token) = query.token.as_deref() {
        let claims: AppClaims = match token::verify(&state.config.auth_secret, token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(err = %e, "app ws token auth failed");
                reject(outbound, "invalid token");
                return None;
            }
        };
        let Some(session_id) = query.session_id.as_deref() else {
            reject(outbound, "session_id required with token");
            return None;
        };
        let Some(user_id) = split_session_id(session_id, &claims.package_name) else {
            reject(outbound, "malformed session_id");
            return None;
        };
        let Some(session) = state.registry.get(user_id).await else {
            reject(outbound, "no session for user");
            return None;
        };
        return Some((session, claims.package_name, claims.api_key));
    }

    // Legacy: first frame must be connection_init within the deadline.
    let first = tokio::time::timeout(INIT_DEADLINE, ws_rx.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            reject(outbound, "expected connection_init");
            return None;
        }
        Err(_) => {
            reject(outbound, "connection_init deadline");
            return None;
        }
    };

    match serde_json::from_str::<AppIncoming>(&text) {
        Ok(AppIncoming::ConnectionInit { package_name, api_key, session_id }) => {
            let Some(user_id) = split_session_id(&session_id, &package_name) else {
                reject(outbound, "malformed session_id");
                return None;
            };
            let Some(session) = state.registry.get(user_id).await else {
                reject(outbound, "no session for user");
                return None;
            };
            Some((session, package_name, api_key))
        }
        _ => {
            reject(outbound, "expected connection_init");
            None
        }
    }
}

fn reject(outbound: &Outbound, reason: &str) {
    let _ = outbound.send_json(&AppOutgoing::ConnectionError {
        code: "UNAUTHORIZED".to_owned(),
        message: reason.to_owned(),
    });
    outbound.close(close_code::POLICY, reason);
}

/// `sessionId` is `userId-package`; the user id may itself contain dashes,
/// so strip the known package suffix.
fn split_session_id<'a>(session_id: &'a str, package: &str) -> Option<&'a str> {
    let suffix = format!("-{package}");
    session_id.strip_suffix(suffix.as_str()).filter(|user| !user.is_empty())
}

/// Route one inbound App message.
async fn dispatch(session: &Arc<UserSession>, package: &str, incoming: AppIncoming) {
    match incoming {
        AppIncoming::ConnectionInit { .. } => {
            tracing::debug!(package = %package, "duplicate connection_init ignored");
        }
        AppIncoming::SubscriptionUpdate { package_name, subscriptions } => {
            // The link identity wins over whatever the body claims.
            if package_name != package {
                tracing::warn!(package = %package, claimed = %package_name, "subscription_update package mismatch");
            }
            if let Err(e) = session.apply_subscription_update(package, &subscriptions).await {
                let _ = session
                    .apps
                    .send_message_to_app(
                        package,
                        &AppOutgoing::ConnectionError {
                            code: "MALFORMED_MESSAGE".to_owned(),
                            message: e.to_string(),
                        },
                    )
                    .await;
            }
        }
        AppIncoming::DisplayRequest { layout, duration_ms, .. } => {
            if let Err(refused) =
                session.display.handle_display_request(package, layout, duration_ms).await
            {
                tracing::debug!(package = %package, refused = ?refused, "display request dropped");
            }
        }
        AppIncoming::DashboardContentUpdate { content, .. } => {
            session.dashboard.update_content(package, content).await;
        }
        AppIncoming::DashboardModeChange { mode, .. } => {
            session.dashboard.set_mode(&mode).await;
        }
        AppIncoming::RtmpStreamRequest { rtmp_url, video, .. } => {
            match session.media.request_rtmp(package, &rtmp_url, video).await {
                Ok(stream_id) => {
                    let _ = session
                        .apps
                        .send_message_to_app(
                            package,
                            &AppOutgoing::ManagedStreamStatus {
                                stream_id,
                                status: "initializing".to_owned(),
                                hls_url: None,
                            },
                        )
                        .await;
                }
                Err(refused) => {
                    let _ = session
                        .apps
                        .send_message_to_app(
                            package,
                            &AppOutgoing::ConnectionError {
                                code: "RESOURCE_EXHAUSTED".to_owned(),
                                message: refused.to_string(),
                            },
                        )
                        .await;
                }
            }
        }
        AppIncoming::RtmpStreamStop { .. } => {
            session.media.stop_rtmp(package).await;
        }
        AppIncoming::PhotoRequest { request_id, size, .. } => {
            session.media.photo_request(package, &request_id, size).await;
        }
        AppIncoming::AudioPlayRequest { request_id, audio_url, volume, .. } => {
            // Forwarded with the package name preserved so the device can
            // attribute and later stop it.
            session
                .send_to_glasses(&GlassesOutgoing::AudioPlayRequest {
                    request_id,
                    package_name: package.to_owned(),
                    audio_url,
                    volume,
                })
                .await;
        }
        AppIncoming::AudioStopRequest { .. } => {
            session
                .send_to_glasses(&GlassesOutgoing::AudioStopRequest {
                    package_name: package.to_owned(),
                })
                .await;
        }
    }
}

#[cfg(test)]
#[path = "app_ws_tests.rs"]
mod tests;
