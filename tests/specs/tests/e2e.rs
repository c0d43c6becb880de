// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios over real WebSocket links: session lifecycle, App
//! launch and back-connect, cached-event replay, audio fan-out, reconnect
//! grace.

use futures_util::StreamExt;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use visor_specs::CloudInstance;

const USER: &str = "alice@example.com";
const PKG: &str = "com.example.captions";
const KEY: &str = "key-1";

#[tokio::test]
async fn glasses_connect_and_health() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let _glasses = cloud.connect_glasses(USER).await?;

    let health: serde_json::Value =
        reqwest::get(format!("{}/api/v1/health", cloud.base_url)).await?.json().await?;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["sessions"], 1);
    Ok(())
}

#[tokio::test]
async fn bad_glasses_token_is_rejected() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let url = format!("{}/glasses-ws?token=not-a-token", cloud.ws_base);
    let err = tokio_tungstenite::connect_async(&url).await;
    assert!(err.is_err(), "handshake must fail for a bad token");
    Ok(())
}

#[tokio::test]
async fn start_app_webhook_backconnect_cycle() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let mut webhooks = cloud.install_app(PKG, KEY).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;
    glasses.send_json(&json!({"type": "start_app", "package_name": PKG})).await?;

    // The webhook carries the compound session id and a callback URL.
    let webhook = tokio::time::timeout(std::time::Duration::from_secs(5), webhooks.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("no webhook"))?;
    assert_eq!(webhook["type"], "session_request");
    assert_eq!(webhook["session_id"], format!("{USER}-{PKG}"));
    assert_eq!(webhook["user_id"], USER);
    assert!(webhook["callback_ws_url"].as_str().is_some_and(|u| u.starts_with("ws")));

    // Back-connect; the ack carries the session id and settings.
    let _app = cloud.connect_app(USER, PKG, KEY).await?;

    // The glasses observe the state change.
    let change = glasses.wait_for("app_state_change").await?;
    let running: Vec<String> = change["user_session"]["runningApps"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        .unwrap_or_default();
    assert!(running.contains(&PKG.to_owned()));
    Ok(())
}

#[tokio::test]
async fn app_backconnect_with_wrong_key_is_closed() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let mut webhooks = cloud.install_app(PKG, KEY).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;
    glasses.send_json(&json!({"type": "start_app", "package_name": PKG})).await?;
    let _ = webhooks.recv().await;

    let err = cloud.connect_app(USER, PKG, "wrong-key").await;
    assert!(err.is_err(), "init with a bad api key must not ack");
    Ok(())
}

#[tokio::test]
async fn calendar_events_replay_on_subscribe() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let mut webhooks = cloud.install_app(PKG, KEY).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;

    // Cache three events before the App exists.
    for (id, title) in [("1", "standup"), ("2", "review"), ("3", "retro")] {
        glasses
            .send_json(&json!({
                "type": "calendar_event",
                "event_id": id,
                "title": title,
                "dt_start": "2026-03-01T10:00:00Z",
                "dt_end": "2026-03-01T11:00:00Z",
            }))
            .await?;
    }

    glasses.send_json(&json!({"type": "start_app", "package_name": PKG})).await?;
    let _ = webhooks.recv().await;
    let mut app = cloud.connect_app(USER, PKG, KEY).await?;

    app.send_json(&json!({
        "type": "subscription_update",
        "package_name": PKG,
        "subscriptions": ["calendar_event"],
    }))
    .await?;

    // Exactly the three cached events arrive, before any new one.
    let mut replayed = Vec::new();
    for _ in 0..3 {
        let frame = app.wait_for("data_stream").await?;
        assert_eq!(frame["stream_type"], "calendar_event");
        replayed.push(frame["data"]["event_id"].as_str().unwrap_or_default().to_owned());
    }
    assert_eq!(replayed, vec!["1", "2", "3"]);

    // A live event follows.
    glasses
        .send_json(&json!({
            "type": "calendar_event",
            "event_id": "4",
            "title": "planning",
            "dt_start": "2026-03-02T10:00:00Z",
            "dt_end": "2026-03-02T11:00:00Z",
        }))
        .await?;
    let live = app.wait_for("data_stream").await?;
    assert_eq!(live["data"]["event_id"], "4");
    Ok(())
}

#[tokio::test]
async fn location_replays_last_value_only() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let mut webhooks = cloud.install_app(PKG, KEY).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;
    glasses.send_json(&json!({"type": "location_update", "lat": 1.0, "lng": 1.0})).await?;
    glasses.send_json(&json!({"type": "location_update", "lat": 2.5, "lng": 3.5})).await?;

    glasses.send_json(&json!({"type": "start_app", "package_name": PKG})).await?;
    let _ = webhooks.recv().await;
    let mut app = cloud.connect_app(USER, PKG, KEY).await?;

    app.send_json(&json!({
        "type": "subscription_update",
        "package_name": PKG,
        "subscriptions": ["location_update"],
    }))
    .await?;

    let frame = app.wait_for("data_stream").await?;
    assert_eq!(frame["stream_type"], "location_update");
    assert_eq!(frame["data"]["lat"], 2.5);
    assert_eq!(frame["data"]["lng"], 3.5);
    Ok(())
}

#[tokio::test]
async fn invalid_subscription_key_surfaces_and_session_continues() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let mut webhooks = cloud.install_app(PKG, KEY).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;
    glasses.send_json(&json!({"type": "start_app", "package_name": PKG})).await?;
    let _ = webhooks.recv().await;
    let mut app = cloud.connect_app(USER, PKG, KEY).await?;

    app.send_json(&json!({
        "type": "subscription_update",
        "package_name": PKG,
        "subscriptions": ["calendar_event", "telepathy"],
    }))
    .await?;

    let err = app.wait_for("connection_error").await?;
    assert_eq!(err["code"], "MALFORMED_MESSAGE");

    // The link survives and a valid update still works.
    app.send_json(&json!({
        "type": "subscription_update",
        "package_name": PKG,
        "subscriptions": ["location_update"],
    }))
    .await?;
    glasses.send_json(&json!({"type": "location_update", "lat": 9.0, "lng": 9.0})).await?;
    let frame = app.wait_for("data_stream").await?;
    assert_eq!(frame["data"]["lat"], 9.0);
    Ok(())
}

#[tokio::test]
async fn raw_audio_fans_out_to_subscribed_apps() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let mut webhooks = cloud.install_app(PKG, KEY).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;
    glasses.send_json(&json!({"type": "start_app", "package_name": PKG})).await?;
    let _ = webhooks.recv().await;
    let mut app = cloud.connect_app(USER, PKG, KEY).await?;

    app.send_json(&json!({
        "type": "subscription_update",
        "package_name": PKG,
        "subscriptions": ["audio_chunk"],
    }))
    .await?;
    // Let the routing change settle before streaming.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    glasses.send_binary(vec![1, 2, 3, 4]).await?;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no binary frame arrived");
        match app.stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                assert_eq!(data.as_ref(), &[1, 2, 3, 4]);
                break;
            }
            Some(Ok(_)) => continue,
            other => anyhow::bail!("stream ended: {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test]
async fn recent_audio_endpoint_returns_trailing_pcm() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let mut glasses = cloud.connect_glasses(USER).await?;

    glasses.send_binary(vec![7; 320]).await?;
    glasses.send_binary(vec![8; 320]).await?;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let body: serde_json::Value =
        reqwest::get(format!("{}/api/v1/sessions/{USER}/audio/recent", cloud.base_url))
            .await?
            .json()
            .await?;
    let chunks = body["chunks"].as_array().cloned().unwrap_or_default();
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0]["pcm"].as_str().is_some_and(|b64| !b64.is_empty()));
    Ok(())
}

#[tokio::test]
async fn glasses_disconnect_grace_disposes_session_and_stops_apps() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&["--session-grace-ms", "300"]).await?;
    let mut webhooks = cloud.install_app(PKG, KEY).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;
    glasses.send_json(&json!({"type": "start_app", "package_name": PKG})).await?;
    let _ = webhooks.recv().await;
    let mut app = cloud.connect_app(USER, PKG, KEY).await?;

    glasses.close().await?;

    // Within the grace window the session is alive.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(cloud.registry.get(USER).await.is_some());

    // After it, the session is gone and the App saw app_stopped then close.
    let stopped = app.wait_for("app_stopped").await;
    assert!(stopped.is_ok(), "expected app_stopped: {stopped:?}");

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert!(cloud.registry.get(USER).await.is_none());
    Ok(())
}

#[tokio::test]
async fn glasses_reconnect_within_grace_keeps_session() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&["--session-grace-ms", "500"]).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;
    glasses.close().await?;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let _glasses = cloud.connect_glasses(USER).await?;

    tokio::time::sleep(std::time::Duration::from_millis(700)).await;
    assert!(cloud.registry.get(USER).await.is_some(), "reconnect cancelled the cleanup");
    Ok(())
}

#[tokio::test]
async fn admin_session_detail_reflects_subscriptions() -> anyhow::Result<()> {
    let cloud = CloudInstance::start(&[]).await?;
    let mut webhooks = cloud.install_app(PKG, KEY).await?;

    let mut glasses = cloud.connect_glasses(USER).await?;
    glasses.send_json(&json!({"type": "start_app", "package_name": PKG})).await?;
    let _ = webhooks.recv().await;
    let mut app = cloud.connect_app(USER, PKG, KEY).await?;

    app.send_json(&json!({
        "type": "subscription_update",
        "package_name": PKG,
        "subscriptions": ["calendar_event", "location_update"],
    }))
    .await?;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let detail: serde_json::Value =
        reqwest::get(format!("{}/api/v1/sessions/{USER}", cloud.base_url))
            .await?
            .json()
            .await?;
    let subs = detail["subscriptions"][PKG].as_array().cloned().unwrap_or_default();
    assert_eq!(subs.len(), 2);
    Ok(())
}
