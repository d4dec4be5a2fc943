//! Tunnel client: outbound connection from the agent to the bridge.
//!
//! [`build`] wires a [`WsTransport`] into the recovery engine and returns two
//! halves. [`TunnelHandle`] is cheap to clone and is what the status API and
//! senders hold. [`TunnelClient`] owns the receive side and runs the loop:
//!
//! - incoming frames pass through the heartbeat monitor, which keeps pongs
//! - bridge-initiated closes go to the orchestrator as disconnections
//! - heartbeat loss goes to the orchestrator as a timeout
//!
//! The loop ends when recovery gives up or the session is closed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::errors::{categorize, TransportError};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::{ConnectionQualityEstimator, MetricsCollector, QualitySample};
use crate::recovery::{Collaborators, ConnectionRecoveryOrchestrator, RecoveryStatus};
use crate::state::{ConnectionState, ConnectionStateTracker};
use crate::traits::{AuthProvider, Frame, Transport, TransportEvent, TransportSink, PING_TYPE, PONG_TYPE};
use crate::tunnel::queue::OutboundQueue;
use crate::tunnel::transport::{TransportChannels, WsTransport};
use crate::tunnel::StaticTokenAuth;
use crate::util::duration_ms;

const BRIDGE_CLOSED: &str = "bridge closed the connection";

/// Shared view of the running tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    orchestrator: Arc<ConnectionRecoveryOrchestrator>,
    quality: Arc<ConnectionQualityEstimator>,
    queue: Arc<OutboundQueue>,
    transport: Arc<dyn Transport>,
}

impl TunnelHandle {
    pub fn orchestrator(&self) -> &Arc<ConnectionRecoveryOrchestrator> {
        &self.orchestrator
    }

    pub fn quality(&self) -> &Arc<ConnectionQualityEstimator> {
        &self.quality
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.orchestrator.metrics()
    }

    /// Send a frame, or buffer it while the tunnel is down.
    ///
    /// Direct sends are recorded as requests in the metrics history. A failed
    /// direct send is recorded with its error code and the frame is queued.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.orchestrator.state() == ConnectionState::Connected {
            let started = Instant::now();
            let result = self.transport.send(frame.clone()).await;
            let latency = duration_ms(started.elapsed());
            match result {
                Ok(()) => {
                    self.metrics().record_request(latency, true, None);
                    return Ok(());
                }
                Err(e) => {
                    let categorized = categorize(e, None);
                    self.metrics()
                        .record_request(latency, false, Some(categorized.code));
                    debug!(code = categorized.code, "Direct send failed, queueing frame");
                }
            }
        }
        self.queue
            .push(frame)
            .map_err(|_| TransportError::Other("outbound queue is full".to_string()))
    }

    /// Frames waiting for the connection to come back.
    pub fn queued(&self) -> usize {
        self.orchestrator.queued_requests()
    }
}

/// Receive side of the tunnel. Consumed by [`run`](Self::run).
pub struct TunnelClient {
    handle: TunnelHandle,
    frames: mpsc::Receiver<Frame>,
    events: mpsc::Receiver<TransportEvent>,
    lost: mpsc::Receiver<()>,
    auto_reconnect: bool,
    quality_interval: Duration,
}

/// Build the WebSocket tunnel described by `config`.
pub fn build(config: &Config) -> Result<(TunnelHandle, TunnelClient), ConfigError> {
    if config.tunnel.url.is_empty() {
        return Err(ConfigError::Invalid("tunnel.url is required".to_string()));
    }
    let endpoint = config.endpoint()?;
    let (transport, channels) = WsTransport::new(config.tunnel.url.clone(), endpoint);
    let auth = Arc::new(StaticTokenAuth::new(config.tunnel.token.clone()));
    Ok(assemble(config, Arc::new(transport), channels, auth))
}

/// Wire an arbitrary transport into the engine.
pub fn assemble(
    config: &Config,
    transport: Arc<dyn Transport>,
    channels: TransportChannels,
    auth: Arc<dyn AuthProvider>,
) -> (TunnelHandle, TunnelClient) {
    let quality = Arc::new(ConnectionQualityEstimator::new(config.metrics.quality_window));

    let (lost_tx, lost_rx) = mpsc::channel(1);
    let on_lost = Arc::new(move || {
        let _ = lost_tx.try_send(());
    });
    let on_sample = {
        let quality = Arc::clone(&quality);
        Arc::new(move |sample: QualitySample| quality.record(sample))
    };
    let heartbeat =
        Arc::new(HeartbeatMonitor::new(config.heartbeat(), on_lost).with_sample_callback(on_sample));

    let tracker = Arc::new(ConnectionStateTracker::new(
        config.tunnel.user_id.clone(),
        config.tunnel.url.clone(),
        config.metrics.max_event_history,
    ));
    let metrics = Arc::new(MetricsCollector::new(
        config.metrics.max_history,
        config.metrics.max_event_history,
        config.metrics.slow_request_ms,
    ));
    let queue = Arc::new(OutboundQueue::new(
        config.tunnel.queue_capacity,
        Arc::new(TransportSink(Arc::clone(&transport))),
    ));
    let collaborators = Collaborators {
        transport: Arc::clone(&transport),
        auth,
        queue: queue.clone(),
    };
    let orchestrator = Arc::new(ConnectionRecoveryOrchestrator::new(
        config.orchestrator(),
        collaborators,
        tracker,
        heartbeat,
        metrics,
    ));

    let handle = TunnelHandle {
        orchestrator,
        quality,
        queue,
        transport,
    };
    let client = TunnelClient {
        handle: handle.clone(),
        frames: channels.frames,
        events: channels.events,
        lost: lost_rx,
        auto_reconnect: config.tunnel.auto_reconnect,
        quality_interval: Duration::from_secs(config.metrics.quality_interval_secs),
    };
    (handle, client)
}

impl TunnelClient {
    /// Connect and service the tunnel until it is closed or recovery gives up.
    pub async fn run(mut self) -> RecoveryStatus {
        let orchestrator = Arc::clone(&self.handle.orchestrator);
        let closed = orchestrator.shutdown_token();
        let quality_task = self
            .handle
            .quality
            .spawn(self.quality_interval, closed.child_token());

        let mut status = match orchestrator.connect().await {
            Ok(()) => RecoveryStatus::Connected,
            Err(e) => {
                warn!(code = e.code, "Initial connection failed, entering recovery");
                orchestrator
                    .handle_disconnection("initial connection failed", Some(e), self.auto_reconnect)
                    .await
            }
        };

        while !status.gave_up() {
            tokio::select! {
                () = closed.cancelled() => {
                    status = RecoveryStatus::NotAttempted;
                    break;
                }
                Some(frame) = self.frames.recv() => self.on_frame(frame).await,
                Some(event) = self.events.recv() => status = self.on_event(event).await,
                Some(()) = self.lost.recv() => {
                    status = orchestrator.handle_heartbeat_lost(self.auto_reconnect).await;
                }
                else => break,
            }
        }

        quality_task.abort();
        info!(state = orchestrator.state().as_str(), "Tunnel client stopped");
        status
    }

    async fn on_frame(&self, frame: Frame) {
        let orchestrator = &self.handle.orchestrator;
        let Some(frame) = orchestrator.heartbeat().handle_frame(frame) else {
            return;
        };
        orchestrator.tracker().touch();
        if frame.message_type().as_deref() == Some(PING_TYPE) {
            let pong = Frame::json(&json!({ "type": PONG_TYPE }));
            if let Err(e) = self.handle.transport.send(pong).await {
                debug!("Failed to answer bridge ping: {e}");
            }
            return;
        }
        debug!(len = frame.len(), "Frame from bridge");
    }

    async fn on_event(&self, event: TransportEvent) -> RecoveryStatus {
        let TransportEvent::Closed { error } = event;
        if self.handle.transport.is_open() {
            debug!("Ignoring close of a replaced connection");
            return RecoveryStatus::NotAttempted;
        }
        let orchestrator = &self.handle.orchestrator;
        match error {
            Some(e) => {
                orchestrator
                    .handle_transport_error(BRIDGE_CLOSED, e, self.auto_reconnect)
                    .await
            }
            None => {
                orchestrator
                    .handle_disconnection(BRIDGE_CLOSED, None, self.auto_reconnect)
                    .await
            }
        }
    }
}
