//! Liveness ping/pong over an active transport.
//!
//! Every `interval` the monitor sends a `tunnel.ping` frame and waits up to
//! `timeout` for a pong. Pongs are fed in through [`HeartbeatMonitor::handle_frame`],
//! which swallows them and passes every other frame straight back to the
//! caller. A missed pong marks the link unhealthy and fires the
//! connection-lost callback, at most once per unresponsive streak: the latch
//! re-arms only when a pong arrives again or the monitor is restarted.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::quality::QualitySample;
use crate::traits::{Frame, FrameSink};

/// Invoked when a heartbeat goes unanswered.
pub type LostCallback = Arc<dyn Fn() + Send + Sync>;
/// Invoked with one sample per answered or missed heartbeat.
pub type SampleCallback = Arc<dyn Fn(QualitySample) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(45),
        }
    }
}

/// Point-in-time heartbeat counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HeartbeatStats {
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub consecutive_misses: u32,
    pub is_healthy: bool,
    pub last_rtt_ms: u64,
    pub running: bool,
}

struct Shared {
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    consecutive_misses: AtomicU32,
    healthy: AtomicBool,
    last_rtt_ms: AtomicU64,
    lost_fired: AtomicBool,
    pong_seq: watch::Sender<u64>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    shared: Arc<Shared>,
    on_lost: LostCallback,
    on_sample: Option<SampleCallback>,
    running: Mutex<Option<Running>>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, on_lost: LostCallback) -> Self {
        let (pong_seq, _) = watch::channel(0);
        Self {
            config,
            shared: Arc::new(Shared {
                pings_sent: AtomicU64::new(0),
                pongs_received: AtomicU64::new(0),
                consecutive_misses: AtomicU32::new(0),
                healthy: AtomicBool::new(true),
                last_rtt_ms: AtomicU64::new(0),
                lost_fired: AtomicBool::new(false),
                pong_seq,
            }),
            on_lost,
            on_sample: None,
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_sample_callback(mut self, on_sample: SampleCallback) -> Self {
        self.on_sample = Some(on_sample);
        self
    }

    pub fn config(&self) -> HeartbeatConfig {
        self.config
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start (or restart) the ping loop over `sink`.
    pub fn start(&self, sink: Arc<dyn FrameSink>) {
        let mut running = self.running();
        if let Some(previous) = running.take() {
            previous.cancel.cancel();
        }

        self.shared.lost_fired.store(false, Ordering::SeqCst);
        self.shared.consecutive_misses.store(0, Ordering::Relaxed);
        self.shared.healthy.store(true, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.shared),
            self.config,
            sink,
            cancel.clone(),
            Arc::clone(&self.on_lost),
            self.on_sample.clone(),
        ));
        debug!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Heartbeat started"
        );
        *running = Some(Running { cancel, handle });
    }

    /// Stop the ping loop. A stopped monitor never fires the lost callback.
    pub fn stop(&self) {
        if let Some(r) = self.running().take() {
            r.cancel.cancel();
            r.handle.abort();
            debug!("Heartbeat stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Consume pongs; hand every other frame back unchanged.
    pub fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        if frame.is_pong() {
            self.shared.pongs_received.fetch_add(1, Ordering::Relaxed);
            self.shared.pong_seq.send_modify(|seq| *seq += 1);
            None
        } else {
            Some(frame)
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Relaxed)
    }

    pub fn pings_sent(&self) -> u64 {
        self.shared.pings_sent.load(Ordering::Relaxed)
    }

    pub fn pongs_received(&self) -> u64 {
        self.shared.pongs_received.load(Ordering::Relaxed)
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.shared.consecutive_misses.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            pings_sent: self.pings_sent(),
            pongs_received: self.pongs_received(),
            consecutive_misses: self.consecutive_misses(),
            is_healthy: self.is_healthy(),
            last_rtt_ms: self.shared.last_rtt_ms.load(Ordering::Relaxed),
            running: self.is_running(),
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    config: HeartbeatConfig,
    sink: Arc<dyn FrameSink>,
    cancel: CancellationToken,
    on_lost: LostCallback,
    on_sample: Option<SampleCallback>,
) {
    let mut pong_rx = shared.pong_seq.subscribe();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(config.interval) => {}
        }

        // Pongs that arrived between cycles don't answer this ping.
        pong_rx.borrow_and_update();
        let sent_at = Instant::now();

        if let Err(e) = sink.send(Frame::heartbeat_ping()).await {
            warn!("Heartbeat ping failed to send: {e}");
            missed(&shared, &cancel, &on_lost, on_sample.as_ref());
            continue;
        }
        shared.pings_sent.fetch_add(1, Ordering::Relaxed);

        let answered = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            r = tokio::time::timeout(config.timeout, pong_rx.changed()) => r,
        };

        match answered {
            Ok(Ok(())) => {
                let rtt = sent_at.elapsed();
                let rtt_ms = rtt.as_millis() as u64;
                shared.last_rtt_ms.store(rtt_ms, Ordering::Relaxed);
                shared.consecutive_misses.store(0, Ordering::Relaxed);
                shared.healthy.store(true, Ordering::Relaxed);
                if shared.lost_fired.swap(false, Ordering::SeqCst) {
                    info!(rtt_ms, "Heartbeat answered again");
                }
                if let Some(cb) = &on_sample {
                    cb(QualitySample::answered(rtt));
                }
            }
            // The sender lives in `shared`, which this task holds.
            Ok(Err(_)) => return,
            Err(_) => {
                warn!(
                    timeout_secs = config.timeout.as_secs(),
                    "Heartbeat pong timed out"
                );
                missed(&shared, &cancel, &on_lost, on_sample.as_ref());
            }
        }
    }
}

fn missed(
    shared: &Shared,
    cancel: &CancellationToken,
    on_lost: &LostCallback,
    on_sample: Option<&SampleCallback>,
) {
    let misses = shared.consecutive_misses.fetch_add(1, Ordering::Relaxed) + 1;
    shared.healthy.store(false, Ordering::Relaxed);
    if let Some(cb) = on_sample {
        cb(QualitySample::missed());
    }
    if cancel.is_cancelled() {
        return;
    }
    if !shared.lost_fired.swap(true, Ordering::SeqCst) {
        warn!(consecutive_misses = misses, "Connection lost: heartbeat unanswered");
        on_lost();
    }
}
