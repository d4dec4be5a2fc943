//! Network operations used by the diagnostic tests.
//!
//! [`WsProbe`] talks to a real bridge: DNS through `tokio::net::lookup_host`,
//! a bare TCP connect, then a WebSocket upgrade carrying the token as a query
//! parameter (the same shape the tunnel client uses). Once upgraded, the
//! bridge is expected to echo binary frames and answer `tunnel.ping` with
//! `tunnel.pong`.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::errors::TransportError;
use crate::traits::{PING_TYPE, PONG_TYPE};
use crate::util::token_query;

#[async_trait]
pub trait DiagnosticProbe: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError>;

    /// Open and drop a TCP connection. Returns the connect time.
    async fn tcp_connect(&self, host: &str, port: u16) -> Result<Duration, TransportError>;

    /// Perform the tunnel upgrade and keep the session open for further tests.
    async fn handshake(
        &self,
        host: &str,
        port: u16,
        token: &str,
    ) -> Result<Box<dyn DiagnosticSession>, TransportError>;
}

/// An upgraded diagnostic session.
#[async_trait]
pub trait DiagnosticSession: Send {
    /// Send a binary payload and return what the bridge echoed back.
    async fn echo(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    /// One heartbeat round trip.
    async fn ping(&mut self) -> Result<Duration, TransportError>;

    async fn close(&mut self);
}

/// Probe backed by `tokio` sockets and `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsProbe {
    tls: bool,
    path: String,
}

impl WsProbe {
    pub fn new(tls: bool, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self { tls, path }
    }

    fn url(&self, host: &str, port: u16, token: &str) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{host}:{port}{}?{}", self.path, token_query(token))
    }
}

impl Default for WsProbe {
    fn default() -> Self {
        Self::new(true, "/tunnel")
    }
}

#[async_trait]
impl DiagnosticProbe for WsProbe {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::Dns {
                host: host.to_string(),
                message: e.to_string(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::Dns {
                host: host.to_string(),
                message: "no addresses returned".to_string(),
            });
        }
        Ok(addrs)
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let stream = TcpStream::connect((host, port)).await?;
        let elapsed = started.elapsed();
        debug!(peer = ?stream.peer_addr().ok(), "TCP connect ok");
        Ok(elapsed)
    }

    async fn handshake(
        &self,
        host: &str,
        port: u16,
        token: &str,
    ) -> Result<Box<dyn DiagnosticSession>, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(self.url(host, port, token)).await?;
        debug!(status = response.status().as_u16(), "Diagnostic WebSocket upgraded");
        Ok(Box::new(WsSession { stream }))
    }
}

struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsSession {
    async fn next_message(&mut self) -> Result<Message, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Close(frame))) => Err(TransportError::Closed {
                code: frame.as_ref().map(|f| u16::from(f.code)),
                reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
            }),
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed {
                code: None,
                reason: "stream ended".to_string(),
            }),
        }
    }
}

#[async_trait]
impl DiagnosticSession for WsSession {
    async fn echo(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.stream.send(Message::Binary(payload.into())).await?;
        loop {
            if let Message::Binary(data) = self.next_message().await? {
                return Ok(data.to_vec());
            }
        }
    }

    async fn ping(&mut self) -> Result<Duration, TransportError> {
        let ping = serde_json::json!({ "type": PING_TYPE }).to_string();
        let started = Instant::now();
        self.stream.send(Message::Text(ping.into())).await?;
        loop {
            match self.next_message().await? {
                Message::Pong(_) => return Ok(started.elapsed()),
                Message::Text(text) => {
                    let parsed: serde_json::Value =
                        serde_json::from_str(text.as_str()).unwrap_or_default();
                    if parsed["type"].as_str() == Some(PONG_TYPE) {
                        return Ok(started.elapsed());
                    }
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_shape() {
        let probe = WsProbe::new(false, "tunnel");
        assert_eq!(
            probe.url("bridge.local", 8443, "abc"),
            "ws://bridge.local:8443/tunnel?token=abc"
        );
        assert!(WsProbe::default()
            .url("h", 443, "t")
            .starts_with("wss://h:443/tunnel"));
        assert_eq!(
            probe.url("bridge.local", 8443, "tok en&x=1"),
            "ws://bridge.local:8443/tunnel?token=tok%20en%26x%3D1"
        );
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let addrs = WsProbe::default().resolve("localhost", 80).await.unwrap();
        assert!(addrs.iter().all(|a| a.port() == 80));
    }

    #[tokio::test]
    async fn refused_tcp_connect_is_an_error() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = WsProbe::default()
            .tcp_connect("127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
