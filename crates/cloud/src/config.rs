// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the visor-cloud control plane.
#[derive(Debug, Clone, clap::Args)]
pub struct CloudConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "VISOR_CLOUD_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8002, env = "VISOR_CLOUD_PORT")]
    pub port: u16,

    /// Shared secret used to sign glasses and App auth tokens.
    #[arg(long, env = "VISOR_CLOUD_AUTH_SECRET")]
    pub auth_secret: String,

    /// Bearer token for admin HTTP routes. If unset, admin routes are open.
    #[arg(long, env = "VISOR_CLOUD_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Public WebSocket URL Apps connect back to after a webhook.
    #[arg(long, default_value = "ws://localhost:8002/app-ws", env = "VISOR_CLOUD_PUBLIC_WS_URL")]
    pub public_ws_url: String,

    /// Cluster-internal WebSocket URL handed to system Apps.
    #[arg(long, env = "VISOR_CLOUD_INTERNAL_WS_URL")]
    pub internal_ws_url: Option<String>,

    /// Package name of the system dashboard App started on first connect.
    #[arg(long, default_value = "system.visor.dashboard", env = "VISOR_CLOUD_DASHBOARD_PACKAGE")]
    pub dashboard_package: String,

    /// Session cleanup grace after glasses disconnect, in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "VISOR_CLOUD_SESSION_GRACE_MS")]
    pub session_grace_ms: u64,

    /// App reconnect grace after an unexpected link close, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "VISOR_CLOUD_APP_GRACE_MS")]
    pub app_grace_ms: u64,

    /// Overall deadline for an App to back-connect after a webhook, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "VISOR_CLOUD_APP_CONNECT_TIMEOUT_MS")]
    pub app_connect_timeout_ms: u64,

    /// Per-attempt webhook POST timeout, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "VISOR_CLOUD_WEBHOOK_TIMEOUT_MS")]
    pub webhook_timeout_ms: u64,

    /// RTMP keep-alive interval, in milliseconds.
    #[arg(long, default_value_t = 15_000, env = "VISOR_CLOUD_KEEPALIVE_MS")]
    pub keepalive_ms: u64,

    /// Missed keep-alive acks before an RTMP stream is stopped.
    #[arg(long, default_value_t = 3, env = "VISOR_CLOUD_KEEPALIVE_MISS_LIMIT")]
    pub keepalive_miss_limit: u32,

    /// Per-App display request throttle, in milliseconds.
    #[arg(long, default_value_t = 200, env = "VISOR_CLOUD_DISPLAY_THROTTLE_MS")]
    pub display_throttle_ms: u64,

    #[command(flatten)]
    pub transcription: TranscriptionConfig,
}

impl CloudConfig {
    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }

    pub fn app_grace(&self) -> Duration {
        Duration::from_millis(self.app_grace_ms)
    }

    pub fn app_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.app_connect_timeout_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn display_throttle(&self) -> Duration {
        Duration::from_millis(self.display_throttle_ms)
    }

    /// Callback URL for an App webhook, cluster-internal for system Apps.
    pub fn callback_ws_url(&self, is_system_app: bool) -> &str {
        if is_system_app {
            self.internal_ws_url.as_deref().unwrap_or(&self.public_ws_url)
        } else {
            &self.public_ws_url
        }
    }
}

/// Transcription pipeline tuning.
#[derive(Debug, Clone, clap::Args)]
pub struct TranscriptionConfig {
    /// Default provider: `azure` or `soniox`.
    #[arg(long, default_value = "azure", env = "VISOR_CLOUD_ASR_DEFAULT_PROVIDER")]
    pub default_provider: String,

    /// Azure-style provider WebSocket endpoint.
    #[arg(long, default_value = "wss://asr.azure.invalid/speech", env = "VISOR_CLOUD_ASR_AZURE_URL")]
    pub azure_url: String,

    /// Azure-style provider key.
    #[arg(long, default_value = "", env = "VISOR_CLOUD_ASR_AZURE_KEY")]
    pub azure_key: String,

    /// Soniox-style provider WebSocket endpoint.
    #[arg(long, default_value = "wss://stt.soniox.invalid/transcribe-websocket", env = "VISOR_CLOUD_ASR_SONIOX_URL")]
    pub soniox_url: String,

    /// Soniox-style provider key.
    #[arg(long, default_value = "", env = "VISOR_CLOUD_ASR_SONIOX_KEY")]
    pub soniox_key: String,

    /// Stream creation timeout, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "VISOR_CLOUD_ASR_STREAM_TIMEOUT_MS")]
    pub stream_timeout_ms: u64,

    /// Stream creation timeout on the VAD fast path, in milliseconds.
    #[arg(long, default_value_t = 2_000, env = "VISOR_CLOUD_ASR_STREAM_TIMEOUT_FAST_MS")]
    pub stream_timeout_fast_ms: u64,

    /// Base retry delay for failed streams, in milliseconds.
    #[arg(long, default_value_t = 1_000, env = "VISOR_CLOUD_ASR_RETRY_DELAY_MS")]
    pub retry_delay_ms: u64,

    /// Maximum retry attempts per stream before giving up.
    #[arg(long, default_value_t = 3, env = "VISOR_CLOUD_ASR_MAX_RETRIES")]
    pub max_stream_retries: u32,

    /// Process-wide cap on concurrent provider streams.
    #[arg(long, default_value_t = 500, env = "VISOR_CLOUD_ASR_MAX_TOTAL_STREAMS")]
    pub max_total_streams: usize,

    /// Idle stream cleanup threshold, in milliseconds.
    #[arg(long, default_value_t = 600_000, env = "VISOR_CLOUD_ASR_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: u64,

    /// Rate-limit failures within the window that trip the circuit breaker.
    #[arg(long, default_value_t = 10, env = "VISOR_CLOUD_ASR_BREAKER_THRESHOLD")]
    pub breaker_threshold: u32,

    /// Circuit breaker failure window, in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "VISOR_CLOUD_ASR_BREAKER_WINDOW_MS")]
    pub breaker_window_ms: u64,

    /// Circuit breaker cool-down before closing again, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "VISOR_CLOUD_ASR_BREAKER_COOLDOWN_MS")]
    pub breaker_cooldown_ms: u64,

    /// VAD pre-roll buffer capacity, in PCM chunks (~50ms each).
    #[arg(long, default_value_t = 50, env = "VISOR_CLOUD_ASR_VAD_BUFFER_CHUNKS")]
    pub vad_buffer_chunks: usize,

    /// VAD buffer force-flush timeout, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "VISOR_CLOUD_ASR_VAD_FLUSH_MS")]
    pub vad_flush_ms: u64,
}

impl TranscriptionConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn stream_timeout_fast(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_fast_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_millis(self.breaker_window_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn vad_flush(&self) -> Duration {
        Duration::from_millis(self.vad_flush_ms)
    }
}

#[cfg(test)]
impl CloudConfig {
    /// Config with production defaults, suitable for unit tests.
    pub fn for_tests() -> Self {
        Self::for_tests_with(&[])
    }

    /// Test config with extra CLI-style overrides, e.g.
    /// `&["--app-grace-ms", "100"]`.
    pub fn for_tests_with(overrides: &[&str]) -> Self {
        use clap::Parser;

        #[derive(clap::Parser)]
        struct Wrapper {
            #[command(flatten)]
            config: CloudConfig,
        }

        let mut args = vec!["test", "--auth-secret", "test-secret"];
        args.extend_from_slice(overrides);
        let wrapper = Wrapper::parse_from(args);
        wrapper.config
    }
}
