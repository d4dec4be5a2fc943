//! WebSocket [`Transport`] over `tokio-tungstenite`.
//!
//! Each `connect` opens a fresh socket, splits it, keeps the sink behind a
//! mutex for senders and spawns a reader task. The reader forwards every data
//! frame to the channel handed out by [`WsTransport::new`] and reports the end
//! of the stream as a [`TransportEvent::Closed`]. An explicit [`close`]
//! aborts the reader first, so only closes the bridge initiated are reported.
//!
//! [`close`]: Transport::close

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::Endpoint;
use crate::errors::TransportError;
use crate::traits::{Frame, FrameSink, Transport, TransportEvent};
use crate::util::token_query;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const FRAME_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// Receiving ends for everything a [`WsTransport`] produces.
pub struct TransportChannels {
    pub frames: mpsc::Receiver<Frame>,
    pub events: mpsc::Receiver<TransportEvent>,
}

pub struct WsTransport {
    url: String,
    endpoint: Endpoint,
    sink: Mutex<Option<WsSink>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    open: Arc<AtomicBool>,
    frames: mpsc::Sender<Frame>,
    events: mpsc::Sender<TransportEvent>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, endpoint: Endpoint) -> (Self, TransportChannels) {
        let (frames, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Self {
            url: url.into(),
            endpoint,
            sink: Mutex::new(None),
            reader: std::sync::Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            frames,
            events,
        };
        let channels = TransportChannels {
            frames: frames_rx,
            events: events_rx,
        };
        (transport, channels)
    }

    fn url_with_token(&self, token: &str) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}{}", self.url, token_query(token))
    }

    fn stop_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl FrameSink for WsTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(to_message(frame)).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, token: &str) -> Result<(), TransportError> {
        self.close().await;
        info!(url = %self.url, "Connecting to bridge");
        let (stream, response) = tokio_tungstenite::connect_async(self.url_with_token(token)).await?;
        debug!(status = response.status().as_u16(), "WebSocket upgraded");

        let (sink, stream) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.open.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(read_loop(
            stream,
            self.frames.clone(),
            self.events.clone(),
            Arc::clone(&self.open),
        ));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn close(&self) {
        self.stop_reader();
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }

    async fn probe(&self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let stream = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        drop(stream);
        Ok(started.elapsed())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    frames: mpsc::Sender<Frame>,
    events: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
) {
    let error = loop {
        match stream.next().await {
            Some(Ok(Message::Close(frame))) => break close_error(frame),
            Some(Ok(msg)) => {
                let Some(frame) = from_message(msg) else {
                    continue;
                };
                if frames.send(frame).await.is_err() {
                    debug!("Frame receiver dropped, stopping reader");
                    return;
                }
            }
            Some(Err(e)) => {
                warn!("WebSocket read error: {e}");
                break Some(e.into());
            }
            None => break None,
        }
    };
    open.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Closed { error }).await;
}

/// A normal close is not an error; anything else carries code and reason.
fn close_error(frame: Option<CloseFrame>) -> Option<TransportError> {
    let frame = frame?;
    if frame.code == CloseCode::Normal {
        return None;
    }
    Some(TransportError::Closed {
        code: Some(u16::from(frame.code)),
        reason: frame.reason.to_string(),
    })
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(msg: Message) -> Option<Frame> {
    match msg {
        Message::Text(text) => Some(Frame::Text(text.to_string())),
        Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
        Message::Ping(data) => Some(Frame::Ping(data.to_vec())),
        Message::Pong(data) => Some(Frame::Pong(data.to_vec())),
        Message::Close(_) | Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "127.0.0.1".into(),
            port: 9,
            tls: false,
            path: "/tunnel".into(),
        }
    }

    #[test]
    fn token_is_appended_as_query() {
        let (t, _) = WsTransport::new("ws://127.0.0.1:9/tunnel", endpoint());
        assert_eq!(t.url_with_token("abc"), "ws://127.0.0.1:9/tunnel?token=abc");
        let (t, _) = WsTransport::new("ws://127.0.0.1:9/tunnel?v=2", endpoint());
        assert_eq!(t.url_with_token("abc"), "ws://127.0.0.1:9/tunnel?v=2&token=abc");
    }

    #[test]
    fn reserved_token_characters_survive_the_query() {
        let (t, _) = WsTransport::new("ws://127.0.0.1:9/tunnel", endpoint());
        let url = t.url_with_token("0123456789abc#de&x+y");
        let uri: tokio_tungstenite::tungstenite::http::Uri = url.parse().unwrap();
        assert_eq!(uri.query(), Some("token=0123456789abc%23de%26x%2By"));
    }

    #[test]
    fn normal_close_is_clean() {
        assert!(close_error(None).is_none());
        assert!(close_error(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .is_none());
        let err = close_error(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "token revoked".into(),
        }));
        assert!(matches!(
            err,
            Some(TransportError::Closed { code: Some(1008), .. })
        ));
    }

    #[test]
    fn message_conversion_preserves_payloads() {
        let frame = Frame::Binary(vec![1, 2, 3]);
        assert_eq!(from_message(to_message(frame.clone())), Some(frame));
        assert_eq!(from_message(Message::Close(None)), None);
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let (t, _) = WsTransport::new("ws://127.0.0.1:9/tunnel", endpoint());
        assert!(!t.is_open());
        assert!(matches!(
            t.send(Frame::Text("x".into())).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn probe_reports_refused_port() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (t, _) = WsTransport::new(
            format!("ws://127.0.0.1:{port}/tunnel"),
            Endpoint {
                port,
                ..endpoint()
            },
        );
        assert!(t.probe().await.is_err());
    }
}
