// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! App link wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound JSON frames from an App, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppIncoming {
    /// Legacy in-band auth: `session_id` is `userId-package`.
    ConnectionInit {
        package_name: String,
        api_key: String,
        session_id: String,
    },
    SubscriptionUpdate {
        package_name: String,
        subscriptions: Vec<String>,
    },
    DisplayRequest {
        package_name: String,
        layout: Value,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    DashboardContentUpdate {
        package_name: String,
        content: Value,
    },
    DashboardModeChange {
        package_name: String,
        mode: String,
    },
    RtmpStreamRequest {
        package_name: String,
        rtmp_url: String,
        #[serde(default)]
        video: Option<Value>,
    },
    RtmpStreamStop {
        package_name: String,
    },
    PhotoRequest {
        package_name: String,
        request_id: String,
        #[serde(default)]
        size: Option<String>,
    },
    AudioPlayRequest {
        package_name: String,
        request_id: String,
        #[serde(default)]
        audio_url: Option<String>,
        #[serde(default)]
        volume: Option<f32>,
    },
    AudioStopRequest {
        package_name: String,
    },
}

/// Outbound JSON frames to an App.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppOutgoing {
    ConnectionAck {
        session_id: String,
        settings: Value,
    },
    ConnectionError {
        code: String,
        message: String,
    },
    AppStopped {},
    DataStream {
        session_id: String,
        stream_type: String,
        data: Value,
        timestamp: u64,
    },
    CustomMessage {
        #[serde(default)]
        action: Option<String>,
        payload: Value,
    },
    ManagedStreamStatus {
        stream_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hls_url: Option<String>,
    },
    PhotoResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        photo_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SettingsUpdate {
        settings: Value,
    },
}

/// Webhook body POSTed to an App's public URL to request a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(rename = "type")]
    pub kind: SessionRequestKind,
    pub session_id: String,
    pub user_id: String,
    pub timestamp: u64,
    pub callback_ws_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRequestKind {
    SessionRequest,
}
