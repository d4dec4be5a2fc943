//! Contracts for the collaborators the engine talks to.
//!
//! The engine never owns a socket, a credential store or an outbound buffer
//! directly. It drives them through these traits so the same recovery logic
//! runs against the bundled WebSocket transport, an HTTP long-poll transport
//! or an in-memory fake in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{AuthError, TransportError};

/// Application-level heartbeat request, the same wire shape the relay expects.
pub const PING_TYPE: &str = "tunnel.ping";
/// Application-level heartbeat response.
pub const PONG_TYPE: &str = "tunnel.pong";

/// A single frame crossing the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Transport-level ping (WebSocket control frame).
    Ping(Vec<u8>),
    /// Transport-level pong (WebSocket control frame).
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Build a JSON text frame.
    pub fn json(value: &Value) -> Self {
        Self::Text(value.to_string())
    }

    /// The heartbeat ping frame.
    pub fn heartbeat_ping() -> Self {
        Self::json(&serde_json::json!({ "type": PING_TYPE }))
    }

    /// `type` field of a JSON text frame, if any.
    pub fn message_type(&self) -> Option<String> {
        let Self::Text(text) = self else {
            return None;
        };
        let parsed: Value = serde_json::from_str(text).ok()?;
        parsed["type"].as_str().map(ToString::to_string)
    }

    /// True for transport pongs and `tunnel.pong` text frames.
    pub fn is_pong(&self) -> bool {
        match self {
            Self::Pong(_) => true,
            Self::Text(_) => self.message_type().as_deref() == Some(PONG_TYPE),
            _ => false,
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => b.len(),
            Self::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle notifications emitted by a transport implementation.
#[derive(Debug)]
pub enum TransportEvent {
    /// The underlying connection ended. `error` is `None` for a clean close.
    Closed { error: Option<TransportError> },
}

/// Outbound half of a transport: anything that can carry a frame.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;
}

/// A reconnectable transport to the bridge server.
///
/// Incoming frames and [`TransportEvent`]s are delivered over channels handed
/// out by the concrete implementation when it is constructed.
#[async_trait]
pub trait Transport: FrameSink {
    /// Open (or re-open) the connection using the given bearer token.
    async fn connect(&self, token: &str) -> Result<(), TransportError>;

    /// Close the current connection, if any.
    async fn close(&self);

    /// Cheap reachability check of the bridge endpoint without establishing
    /// a tunnel session. Returns the probe round-trip time.
    async fn probe(&self) -> Result<Duration, TransportError>;

    /// Whether a connection is currently open.
    fn is_open(&self) -> bool;
}

/// The outbound half of a shared transport, for the heartbeat loop.
pub struct TransportSink(pub Arc<dyn Transport>);

#[async_trait]
impl FrameSink for TransportSink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.0.send(frame).await
    }
}

/// Source of bearer tokens.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_token(&self) -> Result<String, AuthError>;
    async fn refresh_token(&self) -> Result<String, AuthError>;
}

/// Queue of requests buffered while the tunnel is down.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Drain buffered requests through the restored connection. Returns how
    /// many were sent.
    async fn flush(&self) -> usize;

    /// Number of requests currently buffered.
    fn size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_detection_covers_both_shapes() {
        assert!(Frame::Pong(vec![]).is_pong());
        assert!(Frame::Text(r#"{"type":"tunnel.pong"}"#.into()).is_pong());
        assert!(!Frame::Text(r#"{"type":"tunnel.exec"}"#.into()).is_pong());
        assert!(!Frame::Text("not json".into()).is_pong());
        assert!(!Frame::Binary(vec![1, 2]).is_pong());
    }

    #[test]
    fn heartbeat_ping_has_ping_type() {
        assert_eq!(
            Frame::heartbeat_ping().message_type().as_deref(),
            Some(PING_TYPE)
        );
    }
}
