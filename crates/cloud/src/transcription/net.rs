// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared WebSocket plumbing for the speech providers.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::provider::ProviderError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to a provider endpoint, optionally attaching an auth header.
pub async fn connect(
    url: &str,
    header: Option<(&'static str, &str)>,
) -> Result<WsStream, ProviderError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ProviderError::InvalidArgument(format!("bad provider url: {e}")))?;

    if let Some((name, value)) = header {
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProviderError::InvalidArgument("bad auth header".to_owned()))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _) = connect_async(request).await.map_err(|e| classify_connect_error(&e))?;
    Ok(stream)
}

/// Map a WebSocket connect failure onto the retry policy's error classes.
pub fn classify_connect_error(err: &WsError) -> ProviderError {
    match err {
        WsError::Http(resp) => {
            ProviderError::from_status(resp.status().as_u16(), format!("handshake: {}", resp.status()))
        }
        WsError::Io(e) => ProviderError::Network(format!("io: {e}")),
        WsError::Tls(e) => ProviderError::Network(format!("tls: {e}")),
        WsError::Url(e) => ProviderError::InvalidArgument(format!("url: {e}")),
        other => ProviderError::Network(other.to_string()),
    }
}
