//! Live tunnel to the bridge.
//!
//! - [`transport::WsTransport`]: the WebSocket connection itself.
//! - [`queue::OutboundQueue`]: frames held back while disconnected.
//! - [`client`]: wires the transport into the recovery engine and runs the
//!   event loop.

pub mod client;
pub mod queue;
pub mod transport;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::errors::AuthError;
use crate::traits::AuthProvider;

pub use client::{assemble, build, TunnelClient, TunnelHandle};

type TokenSource = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// Bearer token taken from configuration. Refresh re-reads `TUNLINK_TOKEN`,
/// so an operator can rotate the token without restarting the agent.
pub struct StaticTokenAuth {
    token: Mutex<String>,
    source: TokenSource,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_source(token, Box::new(|| std::env::var("TUNLINK_TOKEN").ok()))
    }

    pub fn with_source(token: impl Into<String>, source: TokenSource) -> Self {
        Self {
            token: Mutex::new(token.into()),
            source,
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn current_token(&self) -> Result<String, AuthError> {
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        Ok(token)
    }

    async fn refresh_token(&self) -> Result<String, AuthError> {
        let fresh = (self.source)()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AuthError::RefreshFailed("TUNLINK_TOKEN is not set".to_string()))?;
        info!("Reloaded tunnel token");
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_token_is_missing() {
        let auth = StaticTokenAuth::with_source("", Box::new(|| None));
        assert_eq!(auth.current_token().await, Err(AuthError::Missing));
        assert!(matches!(
            auth.refresh_token().await,
            Err(AuthError::RefreshFailed(_))
        ));
    }

    #[tokio::test]
    async fn refresh_replaces_token() {
        let auth = StaticTokenAuth::with_source("old", Box::new(|| Some("rotated".into())));
        assert_eq!(auth.current_token().await.unwrap(), "old");
        assert_eq!(auth.refresh_token().await.unwrap(), "rotated");
        assert_eq!(auth.current_token().await.unwrap(), "rotated");
    }
}
