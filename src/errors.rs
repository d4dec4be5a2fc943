//! Error taxonomy and categorization.
//!
//! Raw failures from the transport, the auth provider and the HTTP layer are
//! collected in [`TransportError`]. [`categorize`] turns one of those into a
//! [`CategorizedError`]: a category from a closed taxonomy plus the
//! user-facing message, a suggested next action and a transience flag.
//!
//! Classification is shape-first: every variant (and the inner
//! `std::io::ErrorKind`, `tungstenite::Error` or HTTP status) is matched
//! explicitly. Only shapes that carry no usable structure (`Other`, unknown
//! close codes, opaque io errors) fall back to [`FALLBACK_PATTERNS`], a
//! substring table over the lower-cased message.
//!
//! All per-kind text lives in [`ErrorKind::descriptor`], so adding a kind is a
//! one-place change.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_tungstenite::tungstenite;

/// Free-form key/value context attached to a categorized error
/// (e.g. `operation = "connect"`, `url = "wss://..."`).
pub type ErrorContext = BTreeMap<String, String>;

/// Raw failure shapes produced while talking to the bridge.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("DNS resolution failed for {host}: {message}")]
    Dns { host: String, message: String },
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("tunnel handshake failed: {0}")]
    Handshake(String),
    #[error("compression negotiation failed: {0}")]
    Compression(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("transport is not connected")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

/// Failures from the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("invalid credentials: {0}")]
    Invalid(String),
    #[error("no credentials configured")]
    Missing,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Top-level error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authentication,
    Configuration,
    Server,
    Protocol,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Configuration => "configuration",
            Self::Server => "server",
            Self::Protocol => "protocol",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained error kind. Each kind belongs to exactly one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Dns,
    ConnectionRefused,
    Unreachable,
    Timeout,
    ConnectionReset,
    TokenExpired,
    TokenInvalid,
    InvalidSettings,
    RateLimited,
    ServerUnavailable,
    QueueFull,
    Handshake,
    Compression,
    ProtocolViolation,
    Unknown,
}

/// Static description of an error kind.
struct Descriptor {
    category: ErrorCategory,
    code: &'static str,
    user_message: &'static str,
    suggestion: &'static str,
    transient: bool,
    doc: &'static str,
}

impl ErrorKind {
    fn descriptor(self) -> Descriptor {
        use ErrorCategory as C;
        let (category, code, user_message, suggestion, transient, doc) = match self {
            Self::Dns => (
                C::Network,
                "NET_DNS",
                "The bridge server's hostname could not be resolved.",
                "Check your DNS settings and that the server URL is spelled correctly.",
                true,
                "network#dns",
            ),
            Self::ConnectionRefused => (
                C::Network,
                "NET_REFUSED",
                "The bridge server refused the connection.",
                "Verify the server is running and the port is correct.",
                true,
                "network#refused",
            ),
            Self::Unreachable => (
                C::Network,
                "NET_UNREACHABLE",
                "The bridge server is unreachable from this network.",
                "Check your internet connection, VPN and firewall rules.",
                true,
                "network#unreachable",
            ),
            Self::Timeout => (
                C::Network,
                "NET_TIMEOUT",
                "The connection to the bridge server timed out.",
                "The network may be slow or congested; the agent will retry automatically.",
                true,
                "network#timeout",
            ),
            Self::ConnectionReset => (
                C::Network,
                "NET_RESET",
                "The connection to the bridge server was interrupted.",
                "The agent will reconnect automatically.",
                true,
                "network#reset",
            ),
            Self::TokenExpired => (
                C::Authentication,
                "AUTH_EXPIRED",
                "Your session token has expired.",
                "A new token is being requested; sign in again if this persists.",
                false,
                "authentication#expired",
            ),
            Self::TokenInvalid => (
                C::Authentication,
                "AUTH_INVALID",
                "The bridge server rejected your credentials.",
                "Sign in again or replace the configured token.",
                false,
                "authentication#invalid",
            ),
            Self::InvalidSettings => (
                C::Configuration,
                "CONFIG_INVALID",
                "The tunnel settings are invalid.",
                "Fix the server URL or port in the configuration and restart.",
                false,
                "configuration",
            ),
            Self::RateLimited => (
                C::Server,
                "SERVER_RATE_LIMITED",
                "The bridge server is rate limiting this agent.",
                "Wait a minute; the agent will retry after a cooldown.",
                true,
                "server#rate-limited",
            ),
            Self::ServerUnavailable => (
                C::Server,
                "SERVER_UNAVAILABLE",
                "The bridge server is temporarily unavailable.",
                "The agent will retry with backoff; check the server status page if this persists.",
                true,
                "server#unavailable",
            ),
            Self::QueueFull => (
                C::Server,
                "SERVER_QUEUE_FULL",
                "The bridge server's request queue is full.",
                "The agent will retry shortly.",
                true,
                "server#queue-full",
            ),
            Self::Handshake => (
                C::Protocol,
                "PROTO_HANDSHAKE",
                "The tunnel handshake with the bridge server failed.",
                "Make sure the agent and server versions are compatible.",
                true,
                "protocol#handshake",
            ),
            Self::Compression => (
                C::Protocol,
                "PROTO_COMPRESSION",
                "Compression could not be negotiated with the bridge server.",
                "The agent will reconnect with a fresh session.",
                true,
                "protocol#compression",
            ),
            Self::ProtocolViolation => (
                C::Protocol,
                "PROTO_TRANSPORT",
                "The bridge server sent data the agent could not understand.",
                "The agent will reconnect with a fresh session.",
                true,
                "protocol#transport",
            ),
            Self::Unknown => (
                C::Unknown,
                "UNKNOWN",
                "An unexpected connection error occurred.",
                "The agent will try to reconnect; report this if it keeps happening.",
                true,
                "unknown",
            ),
        };
        Descriptor {
            category,
            code,
            user_message,
            suggestion,
            transient,
            doc,
        }
    }

    pub fn category(self) -> ErrorCategory {
        self.descriptor().category
    }
}

/// Substring fallback, checked in order against the lower-cased message.
/// More specific patterns come first.
const FALLBACK_PATTERNS: &[(&str, ErrorKind)] = &[
    ("token expired", ErrorKind::TokenExpired),
    ("jwt expired", ErrorKind::TokenExpired),
    ("expired token", ErrorKind::TokenExpired),
    ("enotfound", ErrorKind::Dns),
    ("getaddrinfo", ErrorKind::Dns),
    ("name resolution", ErrorKind::Dns),
    ("dns", ErrorKind::Dns),
    ("econnrefused", ErrorKind::ConnectionRefused),
    ("connection refused", ErrorKind::ConnectionRefused),
    ("unreachable", ErrorKind::Unreachable),
    ("ehostunreach", ErrorKind::Unreachable),
    ("econnreset", ErrorKind::ConnectionReset),
    ("connection reset", ErrorKind::ConnectionReset),
    ("broken pipe", ErrorKind::ConnectionReset),
    ("timed out", ErrorKind::Timeout),
    ("timeout", ErrorKind::Timeout),
    ("unauthorized", ErrorKind::TokenInvalid),
    ("forbidden", ErrorKind::TokenInvalid),
    ("invalid token", ErrorKind::TokenInvalid),
    ("invalid credentials", ErrorKind::TokenInvalid),
    ("rate limit", ErrorKind::RateLimited),
    ("too many requests", ErrorKind::RateLimited),
    ("queue full", ErrorKind::QueueFull),
    ("queue is full", ErrorKind::QueueFull),
    ("service unavailable", ErrorKind::ServerUnavailable),
    ("server unavailable", ErrorKind::ServerUnavailable),
    ("bad gateway", ErrorKind::ServerUnavailable),
    ("handshake", ErrorKind::Handshake),
    ("compression", ErrorKind::Compression),
    ("deflate", ErrorKind::Compression),
    ("protocol", ErrorKind::ProtocolViolation),
    ("invalid url", ErrorKind::InvalidSettings),
    ("malformed", ErrorKind::InvalidSettings),
    ("configuration", ErrorKind::InvalidSettings),
];

/// A raw error mapped onto the taxonomy, ready to show to a user.
#[derive(Debug, Clone, Serialize)]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub kind: ErrorKind,
    pub code: &'static str,
    pub user_message: String,
    pub suggestion: String,
    pub is_transient: bool,
    /// Documentation anchor for this code.
    pub doc_link: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub context: ErrorContext,
    /// Display form of the original error.
    pub detail: String,
    #[serde(skip)]
    pub cause: Option<Arc<TransportError>>,
}

impl CategorizedError {
    /// Build from a kind with no underlying error (e.g. "connection lost").
    pub fn from_kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let d = kind.descriptor();
        Self {
            category: d.category,
            kind,
            code: d.code,
            user_message: d.user_message.to_string(),
            suggestion: d.suggestion.to_string(),
            is_transient: d.transient,
            doc_link: d.doc,
            context: ErrorContext::new(),
            detail: detail.into(),
            cause: None,
        }
    }

    /// Generic network loss, used when a disconnect carries no error.
    pub fn connection_lost(reason: &str) -> Self {
        Self::from_kind(ErrorKind::ConnectionReset, reason)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn is_auth_expired(&self) -> bool {
        self.kind == ErrorKind::TokenExpired
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.code, self.user_message, self.detail)
    }
}

/// Categorize a raw error, optionally attaching context.
pub fn categorize(error: TransportError, context: Option<&ErrorContext>) -> CategorizedError {
    let kind = classify(&error);
    let mut categorized = CategorizedError::from_kind(kind, error.to_string());
    if let Some(ctx) = context {
        categorized.context.extend(ctx.clone());
    }
    categorized.cause = Some(Arc::new(error));
    categorized
}

/// Map a raw error to its kind without building the full value.
pub fn classify(error: &TransportError) -> ErrorKind {
    match error {
        TransportError::Dns { .. } => ErrorKind::Dns,
        TransportError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
        TransportError::Unreachable(_) => ErrorKind::Unreachable,
        TransportError::Timeout { .. } => ErrorKind::Timeout,
        TransportError::NotConnected => ErrorKind::ConnectionReset,
        TransportError::Io(e) => classify_io(e),
        TransportError::WebSocket(e) => classify_ws(e),
        TransportError::Http { status, message } => classify_http(*status, message),
        TransportError::Auth(e) => match e {
            AuthError::Expired => ErrorKind::TokenExpired,
            AuthError::Invalid(_) | AuthError::Missing | AuthError::RefreshFailed(_) => {
                ErrorKind::TokenInvalid
            }
        },
        TransportError::Config(_) => ErrorKind::InvalidSettings,
        TransportError::Handshake(_) => ErrorKind::Handshake,
        TransportError::Compression(_) => ErrorKind::Compression,
        TransportError::Protocol(_) => ErrorKind::ProtocolViolation,
        TransportError::Closed { code, reason } => classify_close(*code, reason),
        TransportError::Other(message) => classify_message(message),
    }
}

fn classify_io(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionReset,
        io::ErrorKind::AddrNotAvailable => ErrorKind::Unreachable,
        io::ErrorKind::InvalidInput => ErrorKind::InvalidSettings,
        io::ErrorKind::InvalidData => ErrorKind::ProtocolViolation,
        _ => classify_message(&e.to_string()),
    }
}

fn classify_ws(e: &tungstenite::Error) -> ErrorKind {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ErrorKind::ConnectionReset
        }
        tungstenite::Error::Io(io_err) => classify_io(io_err),
        tungstenite::Error::Http(response) => classify_http(response.status().as_u16(), ""),
        tungstenite::Error::Url(_) => ErrorKind::InvalidSettings,
        tungstenite::Error::Protocol(_) | tungstenite::Error::Capacity(_) => {
            ErrorKind::ProtocolViolation
        }
        other => match classify_message(&other.to_string()) {
            ErrorKind::Unknown => ErrorKind::ProtocolViolation,
            kind => kind,
        },
    }
}

fn classify_http(status: u16, message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    match status {
        401 if lower.contains("expired") => ErrorKind::TokenExpired,
        401 | 403 => ErrorKind::TokenInvalid,
        429 => ErrorKind::RateLimited,
        503 if lower.contains("queue") => ErrorKind::QueueFull,
        507 => ErrorKind::QueueFull,
        500 | 502 | 503 | 504 => ErrorKind::ServerUnavailable,
        400 | 404 | 422 => ErrorKind::InvalidSettings,
        426 => ErrorKind::Handshake,
        _ => classify_message(message),
    }
}

fn classify_close(code: Option<u16>, reason: &str) -> ErrorKind {
    match code {
        Some(1000 | 1006) => ErrorKind::ConnectionReset,
        Some(1001 | 1011 | 1012) => ErrorKind::ServerUnavailable,
        Some(1002 | 1003 | 1007 | 1009 | 1010) => ErrorKind::ProtocolViolation,
        Some(1008) => match classify_message(reason) {
            ErrorKind::TokenExpired => ErrorKind::TokenExpired,
            _ => ErrorKind::TokenInvalid,
        },
        Some(1013) => ErrorKind::RateLimited,
        _ => match classify_message(reason) {
            ErrorKind::Unknown => ErrorKind::ConnectionReset,
            kind => kind,
        },
    }
}

/// Substring fallback over the lower-cased message.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    FALLBACK_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map_or(ErrorKind::Unknown, |(_, kind)| *kind)
}
