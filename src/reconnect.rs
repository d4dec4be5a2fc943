//! Backoff-scheduled reconnection.
//!
//! Delay for attempt `n` (1-based):
//!
//! ```text
//! min(max_delay, base_delay * 2^(n-1)) * (1 + U(-jitter, +jitter))
//! ```
//!
//! with `jitter = 0.3` by default. The loop checks the cancellation token
//! before every attempt and races every sleep against it, so a cancel takes
//! effect mid-delay rather than after the current wait.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential backoff with symmetric multiplicative jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1)`; `0.3` means ±30%.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub const DEFAULT_JITTER: f64 = 0.3;

    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: Self::DEFAULT_JITTER,
        }
    }

    /// `min(max_delay, base_delay * 2^(attempt-1))`, before jitter.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Raw delay scaled by `1 + jitter * unit`, with `unit` clamped to `[-1, 1]`.
    pub fn jittered(&self, attempt: u32, unit: f64) -> Duration {
        let factor = 1.0 + self.jitter * unit.clamp(-1.0, 1.0);
        self.raw_delay(attempt).mul_f64(factor.max(0.0))
    }

    /// Delay for `attempt` with a fresh random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit = rand::rng().random_range(-1.0..=1.0);
        self.jittered(attempt, unit)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// Result of a single attempt within a reconnection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Cancelled,
}

/// One backoff step: which attempt, how long it waited, how it ended.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectionAttempt {
    pub attempt_number: u32,
    pub delay_ms: u64,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Callback receiving every attempt as it completes.
pub type AttemptObserver = Arc<dyn Fn(&ReconnectionAttempt) + Send + Sync>;

/// How a reconnection cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected { attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
    /// Another cycle is already running on this manager.
    AlreadyRunning,
}

impl ReconnectOutcome {
    pub fn succeeded(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn attempts(self) -> u32 {
        match self {
            Self::Connected { attempts }
            | Self::Exhausted { attempts }
            | Self::Cancelled { attempts } => attempts,
            Self::AlreadyRunning => 0,
        }
    }
}

/// Attempt budget and first-attempt timing for one reconnection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    pub max_attempts: u32,
    /// Skip the backoff delay before attempt 1.
    pub immediate_first: bool,
}

/// Clears the running flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs backoff-scheduled reconnection cycles, one at a time.
pub struct ReconnectionManager {
    policy: BackoffPolicy,
    max_attempts: u32,
    running: AtomicBool,
    observer: Option<AttemptObserver>,
}

impl ReconnectionManager {
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            running: AtomicBool::new(false),
            observer: None,
        }
    }

    /// Attach an observer that sees every attempt.
    #[must_use]
    pub fn with_observer(mut self, observer: AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The default plan: the configured budget, every attempt delayed.
    pub fn plan(&self) -> ReconnectPlan {
        ReconnectPlan {
            max_attempts: self.max_attempts,
            immediate_first: false,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn observe(&self, attempt_number: u32, delay: Duration, outcome: AttemptOutcome, error: Option<String>) {
        if let Some(observer) = &self.observer {
            observer(&ReconnectionAttempt {
                attempt_number,
                delay_ms: delay.as_millis() as u64,
                outcome,
                error,
            });
        }
    }

    /// Sleep, connect, repeat until success, exhaustion or cancellation.
    ///
    /// `connect` receives the 1-based attempt number.
    pub async fn attempt_reconnection<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        connect: F,
    ) -> ReconnectOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.attempt_reconnection_with(cancel, self.plan(), connect)
            .await
    }

    /// [`attempt_reconnection`](Self::attempt_reconnection) with an explicit
    /// plan. Shares the single-flight guard with every other cycle on this
    /// manager.
    pub async fn attempt_reconnection_with<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        plan: ReconnectPlan,
        mut connect: F,
    ) -> ReconnectOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconnection already in progress, ignoring request");
            return ReconnectOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.running);

        let max_attempts = plan.max_attempts;
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                info!(attempt, "Reconnection cancelled");
                self.observe(attempt, Duration::ZERO, AttemptOutcome::Cancelled, None);
                return ReconnectOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            let delay = if attempt == 1 && plan.immediate_first {
                Duration::ZERO
            } else {
                self.policy.delay(attempt)
            };
            info!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting in {:.1}s",
                delay.as_secs_f64()
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(attempt, "Reconnection cancelled during backoff");
                    self.observe(attempt, delay, AttemptOutcome::Cancelled, None);
                    return ReconnectOutcome::Cancelled { attempts: attempt - 1 };
                }
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                r = connect(attempt) => Some(r),
            };

            match result {
                None => {
                    info!(attempt, "Reconnection cancelled during connect");
                    self.observe(attempt, delay, AttemptOutcome::Cancelled, None);
                    return ReconnectOutcome::Cancelled { attempts: attempt };
                }
                Some(Ok(())) => {
                    info!(attempt, "Reconnected");
                    self.observe(attempt, delay, AttemptOutcome::Success, None);
                    return ReconnectOutcome::Connected { attempts: attempt };
                }
                Some(Err(e)) => {
                    warn!(attempt, max_attempts, "Reconnect attempt failed: {e}");
                    self.observe(attempt, delay, AttemptOutcome::Failure, Some(e.to_string()));
                }
            }
        }

        warn!(max_attempts, "Reconnection attempts exhausted");
        ReconnectOutcome::Exhausted {
            attempts: max_attempts,
        }
    }
}
