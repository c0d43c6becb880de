// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol: frame plumbing shared by the glasses and App endpoints.

pub mod app;
pub mod glasses;
pub mod stream;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

/// A single outbound frame queued on a link writer.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    /// Close the link with the given code and reason. The writer task sends
    /// the close frame and then exits.
    Close(u16, String),
}

/// Handle to the outbound half of a duplex link.
///
/// One writer task owns the socket sink and drains an mpsc queue, so sends
/// for a given link are serialized in enqueue order. Cloning the handle
/// shares the same queue. When the link dies the writer drops the receiver
/// and subsequent sends fail.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Frame>,
}

/// Error returned when enqueueing on a dead link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkClosed;

impl std::fmt::Display for LinkClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("link closed")
    }
}

impl std::error::Error for LinkClosed {}

impl Outbound {
    /// Create an outbound handle together with the receiver the writer task
    /// must drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Serialize a message as JSON text and enqueue it.
    pub fn send_json<T: Serialize>(&self, msg: &T) -> Result<(), LinkClosed> {
        let text = serde_json::to_string(msg).map_err(|_| LinkClosed)?;
        self.send_text(text)
    }

    /// Enqueue an already-serialized text frame.
    pub fn send_text(&self, text: String) -> Result<(), LinkClosed> {
        self.tx.send(Frame::Text(text)).map_err(|_| LinkClosed)
    }

    /// Enqueue a raw binary frame (PCM audio).
    pub fn send_binary(&self, data: Bytes) -> Result<(), LinkClosed> {
        self.tx.send(Frame::Binary(data)).map_err(|_| LinkClosed)
    }

    /// Enqueue a close frame. Idempotent from the caller's perspective; a
    /// second close on a drained queue is simply dropped.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Frame::Close(code, reason.to_owned()));
    }

    /// Whether the writer side is still attached.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Whether two handles feed the same link. Used to tell a stale
    /// handler's close apart from the current link's.
    pub fn same_channel(&self, other: &Outbound) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// WebSocket close codes used on App links.
pub mod close_code {
    /// Normal closure (deliberate stop, session end).
    pub const NORMAL: u16 = 1000;
    /// Peer going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Authentication or policy failure.
    pub const POLICY: u16 = 1008;
    /// Internal server error.
    pub const INTERNAL: u16 = 1011;
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
