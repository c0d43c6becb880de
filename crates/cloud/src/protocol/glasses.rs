// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Glasses link wire format: JSON frames plus binary PCM audio.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound JSON frames from the glasses, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GlassesIncoming {
    ConnectionInit {
        #[serde(default)]
        sample_rate_hz: Option<u32>,
    },
    StartApp {
        package_name: String,
    },
    StopApp {
        package_name: String,
    },
    Vad {
        status: bool,
    },
    LocationUpdate {
        lat: f64,
        lng: f64,
        #[serde(default)]
        accuracy: Option<f64>,
    },
    CalendarEvent(CalendarEvent),
    HeadPosition {
        position: HeadPosition,
    },
    CoreStatusUpdate {
        /// Full settings blob from the device; the session diffs it.
        status: Value,
    },
    RtmpStreamStatus {
        #[serde(default)]
        stream_id: Option<String>,
        status: String,
        #[serde(default)]
        stats: Option<Value>,
    },
    KeepAliveAck {
        ack_id: String,
    },
    PhotoResponse {
        request_id: String,
        #[serde(default)]
        photo_url: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    RequestSettings {},
}

/// Head position values reported by the IMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadPosition {
    Up,
    Down,
}

/// A device-sourced calendar entry, cached for replay-on-subscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub event_id: String,
    pub title: String,
    pub dt_start: String,
    pub dt_end: String,
    #[serde(default)]
    pub time_zone: Option<String>,
}

/// Outbound JSON frames to the glasses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GlassesOutgoing {
    ConnectionAck {
        session_id: String,
        user_session: Value,
    },
    ConnectionError {
        code: String,
        message: String,
    },
    AppStateChange {
        user_session: Value,
    },
    SettingsUpdate {
        settings: Value,
    },
    StartRtmpStream {
        stream_id: String,
        rtmp_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video: Option<Value>,
    },
    StopRtmpStream {
        stream_id: String,
    },
    KeepRtmpStreamAlive {
        stream_id: String,
        ack_id: String,
    },
    AudioPlayRequest {
        request_id: String,
        package_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<f32>,
    },
    AudioStopRequest {
        package_name: String,
    },
    PhotoRequest {
        request_id: String,
        package_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<String>,
    },
    DisplayEvent {
        layout: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
}
