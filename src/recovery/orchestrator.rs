//! The disconnect → recover → restore cycle.
//!
//! The orchestrator owns the session tracker, the heartbeat monitor and the
//! strategy dispatcher. None of them hold a reference back to it: the
//! reconnection observer is a closure over the tracker and the metrics
//! collector, and heartbeat loss reaches the orchestrator through whatever
//! callback the caller gave the monitor (the client loop uses a channel).
//!
//! Only one recovery runs at a time. A disconnect reported while a recovery
//! is in flight returns [`RecoveryStatus::InProgress`]; a network loss
//! cancels the in-flight recovery at its next wait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::strategy::{RecoveryConfig, RecoveryStrategyDispatcher};
use crate::errors::{categorize, CategorizedError, ErrorContext, ErrorKind, TransportError};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::MetricsCollector;
use crate::reconnect::{AttemptOutcome, BackoffPolicy, ReconnectionAttempt, ReconnectionManager};
use crate::state::{ConnectionState, ConnectionStateTracker, EventType};
use crate::traits::{AuthProvider, FrameSink, RequestQueue, Transport, TransportSink};
use crate::util::{duration_ms, now_ms};

const NOTICE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    pub backoff: BackoffPolicy,
    pub max_reconnect_attempts: u32,
    pub recovery: RecoveryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: 10,
            recovery: RecoveryConfig::default(),
        }
    }
}

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub auth: Arc<dyn AuthProvider>,
    pub queue: Arc<dyn RequestQueue>,
}

/// Outcome of a disconnect or network change as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryStatus {
    Connected,
    Recovered { attempts: u32 },
    /// Another recovery is already running.
    InProgress,
    WaitingForNetwork,
    /// Nothing was attempted (auto-reconnect off, session closed, no change).
    NotAttempted,
    Cancelled,
    /// Automatic recovery has stopped and will not resume on its own.
    GaveUp { code: String, message: String },
}

impl RecoveryStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Recovered { .. })
    }

    pub fn gave_up(&self) -> bool {
        matches!(self, Self::GaveUp { .. })
    }
}

/// Published on every recovery status change.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryNotice {
    pub timestamp: u64,
    #[serde(flatten)]
    pub status: RecoveryStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// False once the engine will not retry without outside help.
    pub will_retry: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CategorizedError>,
}

struct Flag<'a>(&'a AtomicBool);

impl Drop for Flag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConnectionRecoveryOrchestrator {
    tracker: Arc<ConnectionStateTracker>,
    heartbeat: Arc<HeartbeatMonitor>,
    metrics: Arc<MetricsCollector>,
    dispatcher: RecoveryStrategyDispatcher,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    queue: Arc<dyn RequestQueue>,
    sink: Arc<dyn FrameSink>,
    probe_timeout: Duration,
    network_available: AtomicBool,
    recovering: AtomicBool,
    recovery_cancel: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    last_error: Mutex<Option<CategorizedError>>,
    notices: broadcast::Sender<RecoveryNotice>,
}

impl ConnectionRecoveryOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        tracker: Arc<ConnectionStateTracker>,
        heartbeat: Arc<HeartbeatMonitor>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let observer = {
            let tracker = Arc::clone(&tracker);
            let metrics = Arc::clone(&metrics);
            Arc::new(move |attempt: &ReconnectionAttempt| {
                if attempt.outcome == AttemptOutcome::Cancelled {
                    return;
                }
                let success = attempt.outcome == AttemptOutcome::Success;
                let total = tracker.increment_reconnect_attempts();
                let mut context = BTreeMap::new();
                context.insert("attempt".to_string(), Value::from(attempt.attempt_number));
                context.insert("delay_ms".to_string(), Value::from(attempt.delay_ms));
                context.insert("total_attempts".to_string(), Value::from(total));
                if let Some(e) = &attempt.error {
                    context.insert("error".to_string(), Value::from(e.as_str()));
                }
                let outcome = if success { "succeeded" } else { "failed" };
                tracker.record_event(
                    EventType::Reconnecting,
                    format!("Reconnection attempt {} {outcome}", attempt.attempt_number),
                    context,
                );
                metrics.record_reconnection(
                    attempt.attempt_number,
                    success,
                    Some(Duration::from_millis(attempt.delay_ms)),
                );
            })
        };
        let manager = ReconnectionManager::new(config.backoff, config.max_reconnect_attempts)
            .with_observer(observer);
        let dispatcher = RecoveryStrategyDispatcher::new(
            Arc::clone(&collaborators.transport),
            Arc::clone(&collaborators.auth),
            Arc::clone(&collaborators.queue),
            Arc::new(manager),
            config.recovery,
        );
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);

        Self {
            tracker,
            heartbeat,
            metrics,
            dispatcher,
            sink: Arc::new(TransportSink(Arc::clone(&collaborators.transport))),
            transport: collaborators.transport,
            auth: collaborators.auth,
            queue: collaborators.queue,
            probe_timeout: config.recovery.probe_timeout,
            network_available: AtomicBool::new(true),
            recovering: AtomicBool::new(false),
            recovery_cancel: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            last_error: Mutex::new(None),
            notices,
        }
    }

    pub fn tracker(&self) -> &Arc<ConnectionStateTracker> {
        &self.tracker
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryNotice> {
        self.notices.subscribe()
    }

    pub fn last_error(&self) -> Option<CategorizedError> {
        lock(&self.last_error).clone()
    }

    pub fn is_network_available(&self) -> bool {
        self.network_available.load(Ordering::SeqCst)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Requests buffered while the tunnel is down.
    pub fn queued_requests(&self) -> usize {
        self.queue.size()
    }

    /// Cancelled by [`close`](Self::close).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn publish(&self, status: RecoveryStatus, message: &str, suggestion: Option<&str>) {
        let will_retry = !status.gave_up() && !self.shutdown.is_cancelled();
        let _ = self.notices.send(RecoveryNotice {
            timestamp: now_ms(),
            status,
            message: message.to_string(),
            suggestion: suggestion.map(ToString::to_string),
            will_retry,
        });
    }

    fn transition(&self, state: ConnectionState, message: &str) -> bool {
        let applied = self.tracker.update_state(state, Some(message)).is_ok();
        if applied {
            self.metrics.record_connection(state, Some(message));
        }
        applied
    }

    fn set_last_error(&self, error: Option<CategorizedError>) {
        *lock(&self.last_error) = error;
    }

    fn on_connected(&self, message: &str) {
        if self.transition(ConnectionState::Connected, message) {
            self.heartbeat.start(Arc::clone(&self.sink));
        }
    }

    /// Initial connection from `idle`.
    pub async fn connect(&self) -> Result<(), CategorizedError> {
        let state = self.tracker.state();
        if state == ConnectionState::Connected {
            return Ok(());
        }
        if !self.transition(ConnectionState::Connecting, "Connecting to bridge") {
            return Err(CategorizedError::from_kind(
                ErrorKind::Unknown,
                format!("cannot start a connection from state {state}"),
            ));
        }

        let attempt = async {
            let token = self.auth.current_token().await?;
            self.transport.connect(&token).await
        };
        let result = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(TransportError::Other("shutdown requested".into())),
            r = attempt => r,
        };

        match result {
            Ok(()) => {
                self.set_last_error(None);
                self.on_connected("Connected to bridge");
                self.publish(RecoveryStatus::Connected, "Connected to bridge", None);
                Ok(())
            }
            Err(e) => {
                let mut context = ErrorContext::new();
                context.insert("operation".to_string(), "connect".to_string());
                context.insert("server_url".to_string(), self.tracker.record().server_url);
                let categorized = categorize(e, Some(&context));
                warn!(code = categorized.code, "Initial connection failed: {}", categorized.detail);
                self.transition(ConnectionState::Disconnected, &categorized.user_message);
                self.set_last_error(Some(categorized.clone()));
                Err(categorized)
            }
        }
    }

    /// Heartbeat went unanswered: record it, then treat it as a disconnect.
    pub async fn handle_heartbeat_lost(&self, auto_reconnect: bool) -> RecoveryStatus {
        let stats = self.heartbeat.stats();
        let mut context = BTreeMap::new();
        context.insert("pings_sent".to_string(), Value::from(stats.pings_sent));
        context.insert("pongs_received".to_string(), Value::from(stats.pongs_received));
        context.insert(
            "consecutive_misses".to_string(),
            Value::from(stats.consecutive_misses),
        );
        self.tracker
            .record_event(EventType::Heartbeat, "Heartbeat timed out", context);
        let timeout = self.heartbeat.config().timeout;
        let error = CategorizedError::from_kind(
            ErrorKind::Timeout,
            format!("no pong within {}s", timeout.as_secs()),
        );
        self.handle_disconnection("heartbeat timeout", Some(error), auto_reconnect)
            .await
    }

    /// A transport error ended the session.
    pub async fn handle_transport_error(
        &self,
        reason: &str,
        error: TransportError,
        auto_reconnect: bool,
    ) -> RecoveryStatus {
        let mut context = ErrorContext::new();
        context.insert("reason".to_string(), reason.to_string());
        let categorized = categorize(error, Some(&context));
        self.handle_disconnection(reason, Some(categorized), auto_reconnect)
            .await
    }

    /// The session dropped. `None` error means a generic network loss.
    pub async fn handle_disconnection(
        &self,
        reason: &str,
        error: Option<CategorizedError>,
        auto_reconnect: bool,
    ) -> RecoveryStatus {
        if self.shutdown.is_cancelled() {
            return RecoveryStatus::NotAttempted;
        }
        if self.is_recovering() {
            debug!(reason, "Disconnect reported during recovery");
            return RecoveryStatus::InProgress;
        }

        self.heartbeat.stop();
        match self.tracker.state() {
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Error => {
                return RecoveryStatus::NotAttempted;
            }
            ConnectionState::Disconnected => {}
            _ => {
                self.transition(ConnectionState::Disconnected, reason);
            }
        }

        let error = error.unwrap_or_else(|| CategorizedError::connection_lost(reason));
        warn!(
            code = error.code,
            category = error.category.as_str(),
            reason,
            "Connection lost"
        );
        self.set_last_error(Some(error.clone()));

        if !RecoveryStrategyDispatcher::is_recoverable(&error) {
            return self.give_up(&error, &error.user_message);
        }
        if !auto_reconnect {
            self.publish(
                RecoveryStatus::NotAttempted,
                &error.user_message,
                Some(&error.suggestion),
            );
            return RecoveryStatus::NotAttempted;
        }
        if !self.is_network_available() {
            info!("Network unavailable, waiting before recovery");
            self.publish(
                RecoveryStatus::WaitingForNetwork,
                "Waiting for the network to come back",
                None,
            );
            return RecoveryStatus::WaitingForNetwork;
        }
        self.recover(&error).await
    }

    fn give_up(&self, error: &CategorizedError, message: &str) -> RecoveryStatus {
        let full = format!("{message} Automatic recovery has stopped.");
        self.transition(ConnectionState::Error, &full);
        error!(
            code = error.code,
            suggestion = %error.suggestion,
            "{full}"
        );
        let status = RecoveryStatus::GaveUp {
            code: error.code.to_string(),
            message: full.clone(),
        };
        self.publish(status.clone(), &full, Some(&error.suggestion));
        status
    }

    async fn recover(&self, error: &CategorizedError) -> RecoveryStatus {
        if self
            .recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RecoveryStatus::InProgress;
        }
        let _flag = Flag(&self.recovering);

        if !self.transition(
            ConnectionState::Reconnecting,
            &format!("Recovering: {}", error.user_message),
        ) {
            return RecoveryStatus::NotAttempted;
        }

        let cancel = self.shutdown.child_token();
        *lock(&self.recovery_cancel) = cancel.clone();
        if !self.is_network_available() {
            cancel.cancel();
        }
        self.publish(
            RecoveryStatus::InProgress,
            &error.user_message,
            Some(&error.suggestion),
        );

        let result = self
            .dispatcher
            .attempt_recovery_then(error, &cancel, |message| {
                self.set_last_error(None);
                self.on_connected(message);
            })
            .await;

        if result.success {
            let status = RecoveryStatus::Recovered {
                attempts: result.attempts,
            };
            self.publish(status.clone(), &result.message, None);
            return status;
        }

        self.transition(ConnectionState::Disconnected, &result.message);
        if result.cancelled {
            if self.shutdown.is_cancelled() {
                self.transition(ConnectionState::Closed, "Closed during recovery");
            }
            self.publish(RecoveryStatus::Cancelled, &result.message, None);
            return RecoveryStatus::Cancelled;
        }
        self.give_up(error, &result.message)
    }

    /// Network reachability changed. Loss cancels any running recovery;
    /// restoration resumes recovery for a disconnected session.
    pub async fn handle_network_change(&self, is_connected: bool, network_type: &str) -> RecoveryStatus {
        let was_connected = self.network_available.swap(is_connected, Ordering::SeqCst);
        let mut context = BTreeMap::new();
        context.insert("network_type".to_string(), Value::from(network_type));
        context.insert("connected".to_string(), Value::from(is_connected));
        let message = if is_connected {
            format!("Network available ({network_type})")
        } else {
            format!("Network lost ({network_type})")
        };
        self.tracker
            .record_event(EventType::ConfigChanged, message, context);

        if !is_connected {
            lock(&self.recovery_cancel).cancel();
            self.publish(
                RecoveryStatus::WaitingForNetwork,
                "Network lost; recovery paused",
                None,
            );
            return RecoveryStatus::WaitingForNetwork;
        }
        if was_connected || self.is_recovering() {
            return RecoveryStatus::NotAttempted;
        }
        if self.tracker.state() != ConnectionState::Disconnected {
            return RecoveryStatus::NotAttempted;
        }

        let error = self
            .last_error()
            .unwrap_or_else(|| CategorizedError::connection_lost("network restored"));
        if !RecoveryStrategyDispatcher::is_recoverable(&error) {
            return RecoveryStatus::NotAttempted;
        }
        info!(network_type, "Network restored, resuming recovery");
        self.recover(&error).await
    }

    /// Reachability probe, independent of the session.
    pub async fn test_connection(&self) -> ConnectionTestResult {
        let probe = tokio::time::timeout(self.probe_timeout, self.transport.probe()).await;
        let outcome = match probe {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                operation: "probe".to_string(),
                after: self.probe_timeout,
            }),
        };
        match outcome {
            Ok(rtt) => ConnectionTestResult {
                reachable: true,
                latency_ms: Some(duration_ms(rtt)),
                error: None,
            },
            Err(e) => {
                let mut context = ErrorContext::new();
                context.insert("operation".to_string(), "probe".to_string());
                ConnectionTestResult {
                    reachable: false,
                    latency_ms: None,
                    error: Some(categorize(e, Some(&context))),
                }
            }
        }
    }

    /// Explicit shutdown. Cancels recovery and moves the session to `closed`.
    pub async fn close(&self, reason: &str) {
        self.shutdown.cancel();
        self.heartbeat.stop();
        self.transport.close().await;
        let state = self.tracker.state();
        if state.can_transition_to(ConnectionState::Closed) {
            self.transition(ConnectionState::Closed, reason);
        } else {
            debug!(state = state.as_str(), "Session not closable from current state");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
