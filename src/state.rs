//! Connection state machine and event history.
//!
//! [`ConnectionStateTracker`] owns the single [`ConnectionRecord`] of a tunnel
//! session. Every accepted transition appends a [`ConnectionEvent`] to a
//! bounded ring buffer and is published on a broadcast channel; rejected
//! transitions leave everything untouched.
//!
//! All mutation goes through one `std::sync::Mutex`, held only for the
//! check-apply-append step and never across an `.await`, so transitions are
//! applied strictly in the order they arrive.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::now_ms;

/// Capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Terminal: automatic recovery gave up or cannot help.
    Error,
    /// Terminal: closed on request.
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState as S;
        matches!(
            (self, next),
            (S::Idle, S::Connecting)
                | (S::Connecting, S::Connected | S::Disconnected)
                | (S::Connected, S::Disconnected | S::Closed)
                | (S::Disconnected, S::Reconnecting | S::Error | S::Closed)
                | (S::Reconnecting, S::Connected | S::Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a recorded lifecycle occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    Error,
    Heartbeat,
    ConfigChanged,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::ConfigChanged => "config_changed",
        }
    }
}

/// One lifecycle occurrence.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub event_type: EventType,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

/// The logical tunnel session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub server_url: String,
    pub state: ConnectionState,
    pub created_at: u64,
    pub last_activity_at: u64,
}

/// Message published on the status channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConnectionUpdate {
    Record(ConnectionRecord),
    Event(ConnectionEvent),
}

/// A transition that is not in the allowed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

struct TrackerInner {
    record: ConnectionRecord,
    events: VecDeque<ConnectionEvent>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
}

/// Authoritative owner of the connection state machine.
pub struct ConnectionStateTracker {
    inner: Mutex<TrackerInner>,
    max_events: usize,
    updates: broadcast::Sender<ConnectionUpdate>,
}

impl ConnectionStateTracker {
    /// Create a tracker for a new session in the `idle` state.
    pub fn new(user_id: impl Into<String>, server_url: impl Into<String>, max_events: usize) -> Self {
        let now = now_ms();
        let (updates, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(TrackerInner {
                record: ConnectionRecord {
                    id: Uuid::new_v4(),
                    user_id: user_id.into(),
                    server_url: server_url.into(),
                    state: ConnectionState::Idle,
                    created_at: now,
                    last_activity_at: now,
                },
                events: VecDeque::with_capacity(max_events.min(1024)),
                reconnect_attempts: 0,
                connected_since: None,
            }),
            max_events: max_events.max(1),
            updates,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        // Fields are written one assignment at a time; a poisoned guard is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Subscribe to record snapshots and events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionUpdate> {
        self.updates.subscribe()
    }

    /// Apply a transition. Rejected transitions change nothing.
    pub fn update_state(
        &self,
        new_state: ConnectionState,
        message: Option<&str>,
    ) -> Result<ConnectionRecord, InvalidTransition> {
        let (record, event) = {
            let mut inner = self.lock();
            let from = inner.record.state;
            if !from.can_transition_to(new_state) {
                warn!(
                    connection_id = %inner.record.id,
                    from = from.as_str(),
                    to = new_state.as_str(),
                    "Rejected connection state transition"
                );
                return Err(InvalidTransition {
                    from,
                    to: new_state,
                });
            }

            let now = now_ms();
            inner.record.state = new_state;
            inner.record.last_activity_at = now;

            let event_type = match (from, new_state) {
                (ConnectionState::Reconnecting, ConnectionState::Connected) => {
                    EventType::Reconnected
                }
                (_, ConnectionState::Connected) => EventType::Connected,
                (_, ConnectionState::Connecting) => EventType::Connecting,
                (_, ConnectionState::Reconnecting) => EventType::Reconnecting,
                (_, ConnectionState::Error) => EventType::Error,
                _ => EventType::Disconnected,
            };

            let mut context = BTreeMap::new();
            context.insert("from".to_string(), Value::from(from.as_str()));
            context.insert("to".to_string(), Value::from(new_state.as_str()));

            if new_state == ConnectionState::Connected {
                if inner.reconnect_attempts > 0 {
                    context.insert(
                        "reconnect_attempts".to_string(),
                        Value::from(inner.reconnect_attempts),
                    );
                }
                inner.reconnect_attempts = 0;
                inner.connected_since = Some(Instant::now());
            } else {
                inner.connected_since = None;
            }

            let event = ConnectionEvent {
                timestamp: now,
                event_type,
                message: message.unwrap_or(new_state.as_str()).to_string(),
                context,
            };
            Self::push_event(&mut inner.events, self.max_events, event.clone());
            let record = inner.record.clone();
            // Published under the lock so subscribers see updates in apply order.
            // No receivers is fine; lagging receivers drop old updates.
            let _ = self.updates.send(ConnectionUpdate::Record(record.clone()));
            let _ = self.updates.send(ConnectionUpdate::Event(event.clone()));
            (record, event)
        };

        info!(
            connection_id = %record.id,
            state = record.state.as_str(),
            "{}",
            event.message
        );
        Ok(record)
    }

    /// Append a non-transition event (heartbeat, config change, reconnect attempt).
    pub fn record_event(
        &self,
        event_type: EventType,
        message: impl Into<String>,
        context: BTreeMap<String, Value>,
    ) {
        let event = ConnectionEvent {
            timestamp: now_ms(),
            event_type,
            message: message.into(),
            context,
        };
        debug!(event = event_type.as_str(), "{}", event.message);
        let mut inner = self.lock();
        Self::push_event(&mut inner.events, self.max_events, event.clone());
        let _ = self.updates.send(ConnectionUpdate::Event(event));
    }

    fn push_event(events: &mut VecDeque<ConnectionEvent>, cap: usize, event: ConnectionEvent) {
        while events.len() >= cap {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Count one reconnection attempt. Returns the new total.
    pub fn increment_reconnect_attempts(&self) -> u32 {
        let mut inner = self.lock();
        inner.reconnect_attempts += 1;
        inner.reconnect_attempts
    }

    /// Mark activity on the session (frame sent or received).
    pub fn touch(&self) {
        self.lock().record.last_activity_at = now_ms();
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().record.state
    }

    pub fn record(&self) -> ConnectionRecord {
        self.lock().record.clone()
    }

    /// Time since the last transition into `connected`; zero when not connected.
    pub fn uptime(&self) -> Duration {
        self.lock()
            .connected_since
            .map_or(Duration::ZERO, |since| since.elapsed())
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    /// Snapshot of the event history, oldest first.
    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// The `n` most recent events, newest first.
    pub fn recent_events(&self, n: usize) -> Vec<ConnectionEvent> {
        self.lock().events.iter().rev().take(n).cloned().collect()
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ConnectionState as S;

    const ALL: [ConnectionState; 7] = [
        S::Idle,
        S::Connecting,
        S::Connected,
        S::Disconnected,
        S::Reconnecting,
        S::Error,
        S::Closed,
    ];

    fn tracker() -> ConnectionStateTracker {
        ConnectionStateTracker::new("user-1", "wss://bridge.example/api/tunnel", 100)
    }

    fn connect(t: &ConnectionStateTracker) {
        t.update_state(S::Connecting, None).unwrap();
        t.update_state(S::Connected, None).unwrap();
    }

    #[test]
    fn happy_path_and_reconnect_cycle() {
        let t = tracker();
        connect(&t);
        t.update_state(S::Disconnected, Some("socket closed")).unwrap();
        t.update_state(S::Reconnecting, None).unwrap();
        t.increment_reconnect_attempts();
        t.increment_reconnect_attempts();
        assert_eq!(t.reconnect_attempts(), 2);
        t.update_state(S::Connected, None).unwrap();
        assert_eq!(t.reconnect_attempts(), 0);

        let types: Vec<EventType> = t.events().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::Connecting,
                EventType::Connected,
                EventType::Disconnected,
                EventType::Reconnecting,
                EventType::Reconnected,
            ]
        );
    }

    #[test]
    fn connected_to_connecting_is_rejected() {
        let t = tracker();
        connect(&t);
        let before = t.events().len();
        let err = t.update_state(S::Connecting, None).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: S::Connected,
                to: S::Connecting
            }
        );
        assert_eq!(t.state(), S::Connected);
        assert_eq!(t.events().len(), before);
    }

    #[test]
    fn every_transition_outside_the_table_is_rejected() {
        for from in ALL {
            for to in ALL {
                let t = tracker();
                // Drive the tracker into `from` along allowed edges.
                let path: &[ConnectionState] = match from {
                    S::Idle => &[],
                    S::Connecting => &[S::Connecting],
                    S::Connected => &[S::Connecting, S::Connected],
                    S::Disconnected => &[S::Connecting, S::Connected, S::Disconnected],
                    S::Reconnecting => {
                        &[S::Connecting, S::Connected, S::Disconnected, S::Reconnecting]
                    }
                    S::Error => &[S::Connecting, S::Connected, S::Disconnected, S::Error],
                    S::Closed => &[S::Connecting, S::Connected, S::Closed],
                };
                for s in path {
                    t.update_state(*s, None).unwrap();
                }
                let events_before = t.events().len();
                let result = t.update_state(to, None);
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{from} -> {to} should be accepted");
                    assert_eq!(t.state(), to);
                    assert_eq!(t.events().len(), events_before + 1);
                } else {
                    assert!(result.is_err(), "{from} -> {to} should be rejected");
                    assert_eq!(t.state(), from);
                    assert_eq!(t.events().len(), events_before);
                }
            }
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [S::Error, S::Closed] {
            assert!(terminal.is_terminal());
            assert!(ALL.iter().all(|to| !terminal.can_transition_to(*to)));
        }
    }

    #[test]
    fn event_history_is_bounded_fifo() {
        let t = ConnectionStateTracker::new("u", "wss://x", 5);
        for i in 0..12 {
            t.record_event(EventType::Heartbeat, format!("beat {i}"), BTreeMap::new());
        }
        let events = t.events();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].message, "beat 7");
        assert_eq!(events[4].message, "beat 11");
        assert_eq!(t.recent_events(2)[0].message, "beat 11");
    }

    #[test]
    fn uptime_is_zero_unless_connected() {
        let t = tracker();
        assert_eq!(t.uptime(), Duration::ZERO);
        connect(&t);
        std::thread::sleep(Duration::from_millis(5));
        assert!(t.uptime() >= Duration::from_millis(5));
        t.update_state(S::Disconnected, None).unwrap();
        assert_eq!(t.uptime(), Duration::ZERO);
    }

    #[tokio::test]
    async fn accepted_transitions_are_published() {
        let t = tracker();
        let mut rx = t.subscribe();
        t.update_state(S::Connecting, Some("dialing")).unwrap();
        let _ = t.update_state(S::Closed, None);

        match rx.recv().await.unwrap() {
            ConnectionUpdate::Record(r) => assert_eq!(r.state, S::Connecting),
            ConnectionUpdate::Event(_) => panic!("record should come first"),
        }
        match rx.recv().await.unwrap() {
            ConnectionUpdate::Event(e) => assert_eq!(e.message, "dialing"),
            ConnectionUpdate::Record(_) => panic!("expected event"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_does_not_fail() {
        let t = tracker();
        connect(&t);
        assert_eq!(t.state(), S::Connected);
    }

    #[test]
    fn concurrent_updates_publish_in_history_order() {
        let tracker = Arc::new(ConnectionStateTracker::new("u", "wss://bridge", 1000));
        let mut rx = tracker.subscribe();
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        tracker.record_event(EventType::Heartbeat, format!("{w}-{i}"), BTreeMap::new());
                    }
                })
            })
            .collect();
        tracker.update_state(S::Connecting, None).unwrap();
        tracker.update_state(S::Connected, None).unwrap();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut published = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if let ConnectionUpdate::Event(event) = update {
                published.push(event.message);
            }
        }
        let history: Vec<String> = tracker.events().into_iter().map(|e| e.message).collect();
        assert_eq!(history.len(), 202);
        assert_eq!(published, history);
    }
}
