// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-request webhook delivery to an App's public URL.

use std::time::Duration;

use crate::protocol::app::SessionRequest;

/// Maximum delivery attempts per webhook.
const MAX_ATTEMPTS: u32 = 2;

/// Base backoff between attempts; doubles per attempt (1 s, 2 s).
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// POST a `session_request` webhook, retrying on transport and HTTP errors.
///
/// Succeeds on the first 2xx. Exhausting all attempts returns the last error.
pub async fn deliver_session_request(
    client: &reqwest::Client,
    public_url: &str,
    body: &SessionRequest,
    per_attempt_timeout: Duration,
) -> anyhow::Result<()> {
    let url = format!("{}/webhook", public_url.trim_end_matches('/'));
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(BACKOFF_BASE * (1 << (attempt - 2))).await;
        }

        let result = client
            .post(&url)
            .timeout(per_attempt_timeout)
            .json(body)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        match result {
            Ok(_) => {
                tracing::debug!(url = %url, attempt, "session_request webhook delivered");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(url = %url, attempt, err = %e, "session_request webhook failed");
                last_err = Some(e.into());
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("webhook delivery failed")))
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod tests;
