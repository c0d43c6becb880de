// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::protocol::Frame;
use crate::testutil::{drain, harness, harness_with, TEST_USER};

#[tokio::test]
async fn one_session_per_user() {
    let h = harness().await;

    let (link, _rx) = Outbound::channel();
    let (again, reconnected) = h.registry.acquire(TEST_USER, link).await;

    assert!(reconnected);
    assert!(Arc::ptr_eq(&h.session, &again));
    assert_eq!(h.registry.session_count().await, 1);
}

#[tokio::test]
async fn reconnect_replaces_link_and_clears_disconnect() {
    let h = harness().await;

    h.session.mark_disconnected().await;
    assert!(h.session.is_disconnected());

    let (link, _rx) = Outbound::channel();
    let (_, reconnected) = h.registry.acquire(TEST_USER, link).await;
    assert!(reconnected);
    assert!(!h.session.is_disconnected());
}

#[tokio::test]
async fn acquire_overwrites_disposed_session() {
    let h = harness().await;
    h.session.dispose().await;

    let (link, _rx) = Outbound::channel();
    let (fresh, reconnected) = h.registry.acquire(TEST_USER, link).await;

    assert!(!reconnected, "a disposed slot yields a brand-new session");
    assert!(!Arc::ptr_eq(&h.session, &fresh));
    assert!(!fresh.is_disposed());
}

#[tokio::test]
async fn cleanup_fires_after_grace_and_disposes() -> anyhow::Result<()> {
    let h = harness_with(&["--session-grace-ms", "150"], 500).await;
    h.install_app("com.x.captions", "k").await?;
    let (_app_link, mut app_rx) = h.connect_app("com.x.captions", "k").await?;
    drain(&mut app_rx);

    h.registry.handle_glasses_closed(TEST_USER, &h.glasses_link).await;
    assert!(h.session.is_disconnected());
    assert_eq!(h.registry.session_count().await, 1, "still registered during grace");

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    assert!(h.session.is_disposed());
    assert_eq!(h.registry.session_count().await, 0);

    // Every App link got app_stopped and a normal close.
    let frames = drain(&mut app_rx);
    assert!(frames.iter().any(|f| matches!(f, Frame::Text(t) if t.contains("app_stopped"))));
    assert!(frames.iter().any(|f| matches!(f, Frame::Close(1000, _))));
    Ok(())
}

#[tokio::test]
async fn reconnect_within_grace_cancels_cleanup() {
    let h = harness_with(&["--session-grace-ms", "150"], 500).await;

    h.registry.handle_glasses_closed(TEST_USER, &h.glasses_link).await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let (link, _rx) = Outbound::channel();
    let (_, reconnected) = h.registry.acquire(TEST_USER, link).await;
    assert!(reconnected);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(!h.session.is_disposed(), "cleanup timer was cancelled by the reconnect");
    assert_eq!(h.registry.session_count().await, 1);
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let h = harness().await;

    h.session.dispose().await;
    h.session.dispose().await;
    h.registry.dispose_session(TEST_USER).await;
    h.registry.dispose_session(TEST_USER).await;

    assert!(h.session.is_disposed());
    assert_eq!(h.registry.session_count().await, 0);
}

#[tokio::test]
async fn dispose_closes_glasses_link() {
    let mut h = harness().await;

    h.session.dispose().await;
    let frames = drain(&mut h.glasses_rx);
    assert!(frames.iter().any(|f| matches!(f, Frame::Close(1000, _))));
}

#[tokio::test]
async fn concurrent_disposes_collapse() {
    let h = harness().await;
    let a = {
        let s = Arc::clone(&h.session);
        tokio::spawn(async move { s.dispose().await })
    };
    let b = {
        let s = Arc::clone(&h.session);
        tokio::spawn(async move { s.dispose().await })
    };
    let _ = a.await;
    let _ = b.await;
    assert!(h.session.is_disposed());
}
