//! Per-category recovery actions.
//!
//! | Category / kind          | Action                                         |
//! |--------------------------|------------------------------------------------|
//! | network                  | probe, then reconnect (immediate if reachable) |
//! | authentication (expired) | refresh token, reconnect with the new token    |
//! | authentication (invalid) | none, needs manual re-authentication           |
//! | server: rate limited     | fixed cooldown, one attempt                    |
//! | server: unavailable      | bounded backoff reconnect                      |
//! | server: queue full       | short fixed wait, one attempt                  |
//! | protocol, unknown        | drop the session, backoff reconnect            |
//! | configuration            | none                                           |
//!
//! Every successful action ends with exactly one [`RequestQueue::flush`],
//! issued after the caller has been told the connection is back.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{CategorizedError, ErrorCategory, ErrorKind, TransportError};
use crate::reconnect::{ReconnectOutcome, ReconnectPlan, ReconnectionManager};
use crate::traits::{AuthProvider, RequestQueue, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub rate_limit_cooldown: Duration,
    pub queue_full_wait: Duration,
    pub server_unavailable_retries: u32,
    pub probe_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown: Duration::from_secs(60),
            queue_full_wait: Duration::from_secs(5),
            server_unavailable_retries: 5,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Reconnect,
    RefreshAndReconnect,
    Cooldown,
    BoundedRetry,
    ShortWait,
    SessionReset,
    Manual,
}

impl RecoveryStrategy {
    /// Strategy for an error. Unknown errors get the protocol treatment.
    pub fn for_error(error: &CategorizedError) -> Self {
        match (error.category, error.kind) {
            (ErrorCategory::Configuration, _) | (_, ErrorKind::TokenInvalid) => Self::Manual,
            (_, ErrorKind::TokenExpired) => Self::RefreshAndReconnect,
            (_, ErrorKind::RateLimited) => Self::Cooldown,
            (_, ErrorKind::QueueFull) => Self::ShortWait,
            (ErrorCategory::Server, _) => Self::BoundedRetry,
            (ErrorCategory::Protocol | ErrorCategory::Unknown, _) => Self::SessionReset,
            _ => Self::Reconnect,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reconnect => "reconnect",
            Self::RefreshAndReconnect => "refresh_and_reconnect",
            Self::Cooldown => "cooldown",
            Self::BoundedRetry => "bounded_retry",
            Self::ShortWait => "short_wait",
            Self::SessionReset => "session_reset",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub duration_ms: u64,
    pub attempts: u32,
    pub message: String,
    pub strategy: RecoveryStrategy,
    pub cancelled: bool,
    /// Requests drained from the queue after a successful recovery.
    pub flushed: usize,
}

/// Executes the recovery action for a categorized error.
pub struct RecoveryStrategyDispatcher {
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    queue: Arc<dyn RequestQueue>,
    reconnection: Arc<ReconnectionManager>,
    config: RecoveryConfig,
}

impl RecoveryStrategyDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        queue: Arc<dyn RequestQueue>,
        reconnection: Arc<ReconnectionManager>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            transport,
            auth,
            queue,
            reconnection,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn reconnection(&self) -> &ReconnectionManager {
        &self.reconnection
    }

    /// Whether automatic recovery is possible at all.
    pub fn is_recoverable(error: &CategorizedError) -> bool {
        RecoveryStrategy::for_error(error) != RecoveryStrategy::Manual
    }

    pub async fn attempt_recovery(
        &self,
        error: &CategorizedError,
        cancel: &CancellationToken,
    ) -> RecoveryResult {
        self.attempt_recovery_then(error, cancel, |_| {}).await
    }

    /// Run the strategy for `error`. On success `on_restored` receives the
    /// outcome message before the queue is flushed, so the caller can mark
    /// the session connected first.
    pub async fn attempt_recovery_then<F>(
        &self,
        error: &CategorizedError,
        cancel: &CancellationToken,
        on_restored: F,
    ) -> RecoveryResult
    where
        F: FnOnce(&str),
    {
        let strategy = RecoveryStrategy::for_error(error);
        let started = Instant::now();
        info!(
            code = error.code,
            category = error.category.as_str(),
            strategy = strategy.as_str(),
            "Attempting recovery"
        );

        let step = match strategy {
            RecoveryStrategy::Manual => Step::failed(
                0,
                format!("{} {}", error.user_message, error.suggestion),
            ),
            RecoveryStrategy::Reconnect => {
                let plan = ReconnectPlan {
                    immediate_first: self.probe_reachable(cancel).await,
                    ..self.reconnection.plan()
                };
                self.backoff(plan, cancel).await
            }
            RecoveryStrategy::RefreshAndReconnect => self.refresh_and_reconnect(cancel).await,
            RecoveryStrategy::Cooldown => {
                self.wait_then_connect(self.config.rate_limit_cooldown, cancel)
                    .await
            }
            RecoveryStrategy::ShortWait => {
                self.wait_then_connect(self.config.queue_full_wait, cancel)
                    .await
            }
            RecoveryStrategy::BoundedRetry => {
                let plan = ReconnectPlan {
                    max_attempts: self.config.server_unavailable_retries,
                    immediate_first: false,
                };
                self.backoff(plan, cancel).await
            }
            RecoveryStrategy::SessionReset => {
                self.transport.close().await;
                self.backoff(self.reconnection.plan(), cancel).await
            }
        };

        let flushed = if step.success {
            on_restored(&step.message);
            let n = self.queue.flush().await;
            debug!(flushed = n, "Flushed queued requests after recovery");
            n
        } else {
            0
        };

        let result = RecoveryResult {
            success: step.success,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts: step.attempts,
            message: step.message,
            strategy,
            cancelled: step.cancelled,
            flushed,
        };
        if result.success {
            info!(
                attempts = result.attempts,
                duration_ms = result.duration_ms,
                flushed,
                "Recovery succeeded"
            );
        } else {
            warn!(
                attempts = result.attempts,
                cancelled = result.cancelled,
                "Recovery failed: {}",
                result.message
            );
        }
        result
    }

    async fn connect_once(&self) -> Result<(), TransportError> {
        let token = self.auth.current_token().await?;
        self.transport.connect(&token).await
    }

    /// Reachable bridge: reconnect right away. Otherwise back off first.
    async fn probe_reachable(&self, cancel: &CancellationToken) -> bool {
        let probe = tokio::time::timeout(self.config.probe_timeout, self.transport.probe());
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            r = probe => r,
        };
        match result {
            Ok(Ok(rtt)) => {
                debug!(rtt_ms = rtt.as_millis() as u64, "Bridge reachable, reconnecting now");
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Bridge probe failed, backing off");
                false
            }
            Err(_) => {
                debug!("Bridge probe timed out, backing off");
                false
            }
        }
    }

    async fn backoff(&self, plan: ReconnectPlan, cancel: &CancellationToken) -> Step {
        let outcome = self
            .reconnection
            .attempt_reconnection_with(cancel, plan, |_| self.connect_once())
            .await;
        match outcome {
            ReconnectOutcome::Connected { attempts } => {
                Step::ok(attempts, format!("Reconnected after {attempts} attempt(s)"))
            }
            ReconnectOutcome::Exhausted { attempts } => Step::failed(
                attempts,
                format!("Gave up after {attempts} reconnection attempt(s)"),
            ),
            ReconnectOutcome::Cancelled { attempts } => Step::cancelled(attempts),
            ReconnectOutcome::AlreadyRunning => {
                Step::failed(0, "A reconnection is already in progress".to_string())
            }
        }
    }

    async fn refresh_and_reconnect(&self, cancel: &CancellationToken) -> Step {
        let refreshed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Step::cancelled(0),
            r = self.auth.refresh_token() => r,
        };
        let token = match refreshed {
            Ok(token) => token,
            Err(e) => {
                return Step::failed(0, format!("Token refresh failed: {e}. Sign in again."));
            }
        };
        info!("Token refreshed, reconnecting");

        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => return Step::cancelled(0),
            r = self.transport.connect(&token) => r,
        };
        match first {
            Ok(()) => Step::ok(1, "Reconnected with a refreshed token".to_string()),
            Err(e) => {
                debug!(error = %e, "Reconnect with refreshed token failed, backing off");
                let mut step = self.backoff(self.reconnection.plan(), cancel).await;
                step.attempts += 1;
                step
            }
        }
    }

    async fn wait_then_connect(&self, wait: Duration, cancel: &CancellationToken) -> Step {
        info!(wait_secs = wait.as_secs(), "Waiting before retry");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Step::cancelled(0),
            () = tokio::time::sleep(wait) => {}
        }
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Step::cancelled(0),
            r = self.connect_once() => r,
        };
        match result {
            Ok(()) => Step::ok(1, format!("Reconnected after waiting {}s", wait.as_secs())),
            Err(e) => Step::failed(1, format!("Retry after {}s wait failed: {e}", wait.as_secs())),
        }
    }
}

struct Step {
    success: bool,
    attempts: u32,
    message: String,
    cancelled: bool,
}

impl Step {
    fn ok(attempts: u32, message: String) -> Self {
        Self {
            success: true,
            attempts,
            message,
            cancelled: false,
        }
    }

    fn failed(attempts: u32, message: String) -> Self {
        Self {
            success: false,
            attempts,
            message,
            cancelled: false,
        }
    }

    fn cancelled(attempts: u32) -> Self {
        Self {
            success: false,
            attempts,
            message: "Recovery cancelled".to_string(),
            cancelled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{categorize, AuthError};
    use crate::reconnect::BackoffPolicy;
    use crate::testing::{FakeAuth, FakeQueue, FakeTransport};

    struct Harness {
        transport: Arc<FakeTransport>,
        auth: Arc<FakeAuth>,
        queue: Arc<FakeQueue>,
        dispatcher: RecoveryStrategyDispatcher,
    }

    fn harness(max_attempts: u32) -> Harness {
        let transport = FakeTransport::new();
        let auth = FakeAuth::new("initial-token-0123456789");
        let queue = FakeQueue::with_pending(3);
        let manager = ReconnectionManager::new(BackoffPolicy::default(), max_attempts);
        let dispatcher = RecoveryStrategyDispatcher::new(
            transport.clone(),
            auth.clone(),
            queue.clone(),
            Arc::new(manager),
            RecoveryConfig::default(),
        );
        Harness {
            transport,
            auth,
            queue,
            dispatcher,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_fails_immediately() {
        let h = harness(10);
        let err = categorize(TransportError::Config("invalid url".into()), None);
        let started = Instant::now();
        let r = h
            .dispatcher
            .attempt_recovery(&err, &CancellationToken::new())
            .await;
        assert!(!r.success);
        assert_eq!(r.attempts, 0);
        assert_eq!(r.strategy, RecoveryStrategy::Manual);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(h.transport.connect_count(), 0);
        assert_eq!(h.queue.flush_count(), 0);
        assert!(r.message.contains("configuration"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credentials_need_manual_action() {
        let h = harness(10);
        let err = categorize(AuthError::Invalid("bad signature".into()).into(), None);
        assert!(!RecoveryStrategyDispatcher::is_recoverable(&err));
        let r = h
            .dispatcher
            .attempt_recovery(&err, &CancellationToken::new())
            .await;
        assert!(!r.success);
        assert_eq!(r.attempts, 0);
        assert_eq!(h.auth.refreshes.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn recoverability_predicate() {
        let recoverable = |e: TransportError| {
            RecoveryStrategyDispatcher::is_recoverable(&categorize(e, None))
        };
        assert!(recoverable(TransportError::ConnectionRefused("x".into())));
        assert!(recoverable(AuthError::Expired.into()));
        assert!(recoverable(TransportError::Http {
            status: 429,
            message: String::new()
        }));
        assert!(recoverable(TransportError::Protocol("bad frame".into())));
        assert!(recoverable(TransportError::Other("???".into())));
        assert!(!recoverable(TransportError::Config("bad port".into())));
        assert!(!recoverable(AuthError::Missing.into()));
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_reconnects_and_flushes_once() {
        let h = harness(10);
        h.transport.fail_next(2);
        let err = CategorizedError::connection_lost("socket closed");
        let r = h
            .dispatcher
            .attempt_recovery(&err, &CancellationToken::new())
            .await;
        assert!(r.success);
        assert_eq!(r.attempts, 3);
        assert_eq!(r.strategy, RecoveryStrategy::Reconnect);
        assert_eq!(h.queue.flush_count(), 1);
        assert_eq!(r.flushed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_refreshed_before_reconnect() {
        let h = harness(10);
        let err = categorize(AuthError::Expired.into(), None);
        let r = h
            .dispatcher
            .attempt_recovery(&err, &CancellationToken::new())
            .await;
        assert!(r.success);
        assert_eq!(r.attempts, 1);
        assert_eq!(
            h.transport.tokens.lock().unwrap().as_slice(),
            ["refreshed-token-1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_does_not_connect() {
        let h = harness(10);
        h.auth.set_refresh_ok(false);
        let err = categorize(AuthError::Expired.into(), None);
        let r = h
            .dispatcher
            .attempt_recovery(&err, &CancellationToken::new())
            .await;
        assert!(!r.success);
        assert_eq!(h.transport.connect_count(), 0);
        assert!(r.message.contains("refresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_full_cooldown() {
        let h = harness(10);
        let err = categorize(
            TransportError::Http {
                status: 429,
                message: "too many requests".into(),
            },
            None,
        );
        let started = Instant::now();
        let r = h
            .dispatcher
            .attempt_recovery(&err, &CancellationToken::new())
            .await;
        assert!(r.success);
        assert_eq!(r.strategy, RecoveryStrategy::Cooldown);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(r.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_cooldown() {
        let h = harness(10);
        let err = categorize(
            TransportError::Http {
                status: 429,
                message: String::new(),
            },
            None,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let r = h.dispatcher.attempt_recovery(&err, &cancel).await;
        assert!(r.cancelled);
        assert!(!r.success);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(h.transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn server_unavailable_is_bounded() {
        let h = harness(10);
        h.transport.fail_next(20);
        let err = categorize(
            TransportError::Http {
                status: 503,
                message: "maintenance".into(),
            },
            None,
        );
        let r = h
            .dispatcher
            .attempt_recovery(&err, &CancellationToken::new())
            .await;
        assert!(!r.success);
        assert_eq!(r.attempts, 5);
        assert_eq!(h.transport.connect_count(), 5);
        assert_eq!(h.queue.flush_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_error_resets_session() {
        let h = harness(10);
        let err = categorize(TransportError::Protocol("unexpected frame".into()), None);
        let r = h
            .dispatcher
            .attempt_recovery(&err, &CancellationToken::new())
            .await;
        assert!(r.success);
        assert_eq!(r.strategy, RecoveryStrategy::SessionReset);
        assert_eq!(h.transport.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reachable_bridge_reconnects_without_delay() {
        let h = harness(10);
        let started = Instant::now();
        let r = h
            .dispatcher
            .attempt_recovery(&CategorizedError::connection_lost("reset"), &CancellationToken::new())
            .await;
        assert!(r.success);
        assert_eq!(r.attempts, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_bridge_backs_off_first() {
        let h = harness(10);
        h.transport.set_probe_fails(true);
        let started = Instant::now();
        let r = h
            .dispatcher
            .attempt_recovery(&CategorizedError::connection_lost("reset"), &CancellationToken::new())
            .await;
        assert!(r.success);
        assert!(started.elapsed() >= Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_shares_the_reconnect_guard() {
        let h = harness(10);
        h.transport.fail_next(20);
        let unavailable = categorize(
            TransportError::Http {
                status: 503,
                message: "maintenance".into(),
            },
            None,
        );
        let lost = CategorizedError::connection_lost("reset");
        let cancel = CancellationToken::new();
        let (bounded, network) = tokio::join!(
            h.dispatcher.attempt_recovery(&unavailable, &cancel),
            h.dispatcher.attempt_recovery(&lost, &cancel),
        );
        assert!(!bounded.success);
        assert_eq!(bounded.attempts, 5);
        assert!(!network.success);
        assert_eq!(network.attempts, 0);
        assert!(network.message.contains("already in progress"));
        assert_eq!(h.transport.connect_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn restored_callback_runs_before_flush() {
        let h = harness(10);
        let seen = std::sync::Mutex::new(None);
        let r = h
            .dispatcher
            .attempt_recovery_then(
                &CategorizedError::connection_lost("reset"),
                &CancellationToken::new(),
                |message| {
                    *seen.lock().unwrap() = Some((message.to_string(), h.queue.flush_count()));
                },
            )
            .await;
        assert!(r.success);
        let (message, flushes_before) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(message, r.message);
        assert_eq!(flushes_before, 0);
        assert_eq!(h.queue.flush_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_never_reports_restored() {
        let h = harness(2);
        h.transport.fail_next(5);
        h.transport.set_probe_fails(true);
        let mut called = false;
        let r = h
            .dispatcher
            .attempt_recovery_then(
                &CategorizedError::connection_lost("reset"),
                &CancellationToken::new(),
                |_| called = true,
            )
            .await;
        assert!(!r.success);
        assert!(!called);
    }
}
