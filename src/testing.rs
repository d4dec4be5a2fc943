//! In-memory collaborators for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{AuthError, TransportError};
use crate::traits::{AuthProvider, Frame, FrameSink, RequestQueue, Transport};

/// Transport whose connect results are scripted; unscripted connects succeed.
#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    probe_fails: AtomicBool,
    open: AtomicBool,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub tokens: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<Frame>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the outcome of the next connect call.
    pub fn push_connect(&self, result: Result<(), TransportError>) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Make the next `n` connects fail with "connection refused".
    pub fn fail_next(&self, n: usize) {
        for _ in 0..n {
            self.push_connect(Err(TransportError::ConnectionRefused(
                "connection refused".into(),
            )));
        }
    }

    pub fn clear_script(&self) {
        self.script.lock().unwrap().clear();
    }

    pub fn set_probe_fails(&self, fails: bool) {
        self.probe_fails.store(fails, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSink for FakeTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, token: &str) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.to_string());
        let next = self.script.lock().unwrap().pop_front();
        let result = next.unwrap_or(Ok(()));
        self.open.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    async fn probe(&self) -> Result<Duration, TransportError> {
        if self.probe_fails.load(Ordering::SeqCst) {
            Err(TransportError::Unreachable("network is unreachable".into()))
        } else {
            Ok(Duration::from_millis(12))
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Auth provider with a fixed token; refresh returns `refreshed` or fails.
pub struct FakeAuth {
    token: Mutex<String>,
    refresh_ok: AtomicBool,
    pub refreshes: AtomicUsize,
}

impl FakeAuth {
    pub fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new(token.to_string()),
            refresh_ok: AtomicBool::new(true),
            refreshes: AtomicUsize::new(0),
        })
    }

    pub fn set_refresh_ok(&self, ok: bool) {
        self.refresh_ok.store(ok, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthProvider for FakeAuth {
    async fn current_token(&self) -> Result<String, AuthError> {
        Ok(self.token.lock().unwrap().clone())
    }

    async fn refresh_token(&self) -> Result<String, AuthError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_ok.load(Ordering::SeqCst) {
            return Err(AuthError::RefreshFailed("issuer unavailable".into()));
        }
        let fresh = format!("refreshed-token-{n}");
        *self.token.lock().unwrap() = fresh.clone();
        Ok(fresh)
    }
}

/// Queue that just counts flushes.
#[derive(Default)]
pub struct FakeQueue {
    pending: AtomicUsize,
    pub flushes: AtomicUsize,
}

impl FakeQueue {
    pub fn with_pending(n: usize) -> Arc<Self> {
        let q = Self::default();
        q.pending.store(n, Ordering::SeqCst);
        Arc::new(q)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestQueue for FakeQueue {
    async fn flush(&self) -> usize {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.pending.swap(0, Ordering::SeqCst)
    }

    fn size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}
