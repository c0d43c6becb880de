// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn keys(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| (*s).to_owned()).collect()
}

#[tokio::test]
async fn update_then_subscribers_finds_package() -> anyhow::Result<()> {
    let index = SubscriptionIndex::new();
    index.update("com.x.captions", &keys(&["transcription:en-US", "calendar_event"])).await?;

    let key = StreamKey::parse("transcription:en-US")?;
    assert_eq!(index.subscribers(&key).await, vec!["com.x.captions"]);
    Ok(())
}

#[tokio::test]
async fn bare_and_explicit_default_language_share_a_key() -> anyhow::Result<()> {
    let index = SubscriptionIndex::new();
    index.update("com.a", &keys(&["transcription"])).await?;
    index.update("com.b", &keys(&["transcription:en-US"])).await?;

    let key = StreamKey::parse("transcription:en-US")?;
    assert_eq!(index.subscribers(&key).await, vec!["com.a", "com.b"]);
    Ok(())
}

#[tokio::test]
async fn repeated_update_is_idempotent() -> anyhow::Result<()> {
    let index = SubscriptionIndex::new();
    let first = index.update("com.x", &keys(&["location_update"])).await?;
    assert_eq!(first.added.len(), 1);

    let second = index.update("com.x", &keys(&["location_update"])).await?;
    assert!(second.added.is_empty());
    assert!(second.removed.is_empty());

    let key = StreamKey::parse("location_update")?;
    assert_eq!(index.subscribers(&key).await, vec!["com.x"]);
    Ok(())
}

#[tokio::test]
async fn replacement_update_computes_exact_diff() -> anyhow::Result<()> {
    let index = SubscriptionIndex::new();
    index.update("com.x", &keys(&["transcription:en-US", "calendar_event"])).await?;
    let diff = index.update("com.x", &keys(&["calendar_event", "location_update"])).await?;

    assert_eq!(diff.added, vec![StreamKey::parse("location_update")?]);
    assert_eq!(diff.removed, vec![StreamKey::parse("transcription:en-US")?]);

    // Routing reflects exactly the second set.
    assert!(index.subscribers(&StreamKey::parse("transcription:en-US")?).await.is_empty());
    assert_eq!(index.subscribers(&StreamKey::parse("calendar_event")?).await, vec!["com.x"]);
    Ok(())
}

#[tokio::test]
async fn invalid_key_leaves_existing_subscriptions_untouched() -> anyhow::Result<()> {
    let index = SubscriptionIndex::new();
    index.update("com.x", &keys(&["calendar_event"])).await?;

    let err = index.update("com.x", &keys(&["calendar_event", "telepathy"])).await;
    assert!(err.is_err());

    let key = StreamKey::parse("calendar_event")?;
    assert_eq!(index.subscribers(&key).await, vec!["com.x"]);
    Ok(())
}

#[tokio::test]
async fn media_subscriptions_drive_microphone() -> anyhow::Result<()> {
    let index = SubscriptionIndex::new();
    assert!(!index.has_media_subscriptions().await);

    index.update("com.x", &keys(&["calendar_event"])).await?;
    assert!(!index.has_media_subscriptions().await);

    index.update("com.y", &keys(&["audio_chunk"])).await?;
    assert!(index.has_media_subscriptions().await);

    index.remove("com.y").await;
    assert!(!index.has_media_subscriptions().await);
    Ok(())
}

#[tokio::test]
async fn minimal_language_subscriptions_collapse_duplicates() -> anyhow::Result<()> {
    let index = SubscriptionIndex::new();
    index.update("com.a", &keys(&["transcription:en-US"])).await?;
    index.update("com.b", &keys(&["transcription", "translation:en-US-to-es-ES"])).await?;
    index.update("com.c", &keys(&["translation:en-US-to-es-ES", "calendar_event"])).await?;

    let minimal = index.minimal_language_subscriptions().await;
    assert_eq!(minimal.len(), 2, "one transcription stream and one translation stream: {minimal:?}");
    Ok(())
}

#[tokio::test]
async fn calendar_cache_replaces_by_event_id() {
    let index = SubscriptionIndex::new();
    let event = |id: &str, title: &str| CalendarEvent {
        event_id: id.to_owned(),
        title: title.to_owned(),
        dt_start: "2026-03-01T10:00:00Z".to_owned(),
        dt_end: "2026-03-01T11:00:00Z".to_owned(),
        time_zone: None,
    };

    index.cache_calendar_event(event("1", "standup")).await;
    index.cache_calendar_event(event("2", "review")).await;
    index.cache_calendar_event(event("1", "standup (moved)")).await;

    let events = index.all_calendar_events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events.iter().find(|e| e.event_id == "1").unwrap().title, "standup (moved)");
}

#[tokio::test]
async fn location_cache_keeps_latest() {
    let index = SubscriptionIndex::new();
    index
        .cache_location(CachedLocation { lat: 1.0, lng: 2.0, accuracy: None, timestamp: 10 })
        .await;
    index
        .cache_location(CachedLocation { lat: 3.0, lng: 4.0, accuracy: Some(5.0), timestamp: 20 })
        .await;

    let last = index.last_location().await.unwrap();
    assert_eq!(last.lat, 3.0);
    assert_eq!(last.timestamp, 20);
}
