// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;

use crate::protocol::app::SessionRequestKind;

/// Spawn a webhook receiver that fails the first `fail_first` requests with
/// 500, then accepts. Returns the base URL and the hit counter.
async fn spawn_app_server(fail_first: u32) -> anyhow::Result<(String, Arc<AtomicU32>)> {
    let hits = Arc::new(AtomicU32::new(0));

    #[derive(Clone)]
    struct AppState {
        hits: Arc<AtomicU32>,
        fail_first: u32,
    }

    async fn webhook(State(state): State<AppState>) -> StatusCode {
        let n = state.hits.fetch_add(1, Ordering::SeqCst);
        if n < state.fail_first {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    let router = Router::new()
        .route("/webhook", post(webhook))
        .with_state(AppState { hits: Arc::clone(&hits), fail_first });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Ok((format!("http://{addr}"), hits))
}

fn request() -> SessionRequest {
    SessionRequest {
        kind: SessionRequestKind::SessionRequest,
        session_id: "alice@example.com-com.x.y".to_owned(),
        user_id: "alice@example.com".to_owned(),
        timestamp: 1_700_000_000_000,
        callback_ws_url: "ws://localhost:8002/app-ws".to_owned(),
    }
}

#[tokio::test]
async fn delivers_on_first_attempt() -> anyhow::Result<()> {
    let (url, hits) = spawn_app_server(0).await?;
    let client = reqwest::Client::new();

    deliver_session_request(&client, &url, &request(), Duration::from_secs(2)).await?;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn retries_once_after_500_then_succeeds() -> anyhow::Result<()> {
    let (url, hits) = spawn_app_server(1).await?;
    let client = reqwest::Client::new();

    deliver_session_request(&client, &url, &request(), Duration::from_secs(2)).await?;
    // Exactly two POSTs: the 500 and the 200.
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn gives_up_after_two_attempts() -> anyhow::Result<()> {
    let (url, hits) = spawn_app_server(10).await?;
    let client = reqwest::Client::new();

    let err = deliver_session_request(&client, &url, &request(), Duration::from_secs(2)).await;
    assert!(err.is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn unreachable_host_is_an_error() {
    let client = reqwest::Client::new();
    // Port 9 (discard) on localhost is almost certainly closed.
    let err = deliver_session_request(
        &client,
        "http://127.0.0.1:9",
        &request(),
        Duration::from_millis(500),
    )
    .await;
    assert!(err.is_err());
}
