//! Application hooks
//!
//! [`ServerHooks`] is the capability set an application implements to react
//! to connection events. Every method has a default that only logs, so an
//! implementation overrides just what it needs. Lifecycle and message hooks
//! run on the dispatch pool, never on a connection's read path. Handshake
//! hooks run synchronously inside the upgrade and should stay cheap.
//!
//! ```rust,ignore
//! use brisk::prelude::*;
//!
//! struct Chat;
//!
//! #[async_trait]
//! impl ServerHooks for Chat {
//!     async fn on_message_received(&self, server: &ServerHandle, client_id: &str, message: &Message) {
//!         if let Some(group) = server.client(client_id).await.and_then(|c| c.group()) {
//!             let _ = server.broadcast_to_group(&group, message).await;
//!         }
//!     }
//! }
//! ```

use std::future::Future;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::Message;
use crate::server::ServerHandle;

/// Reason a handshake hook refused the upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRejection {
    /// HTTP status returned to the client
    pub status: u16,
    /// Response body
    pub reason: String,
}

impl HandshakeRejection {
    /// Rejection with an explicit status
    #[must_use]
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    /// 403 Forbidden
    #[must_use]
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(403, reason)
    }

    /// 401 Unauthorized
    #[must_use]
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(401, reason)
    }
}

impl std::fmt::Display for HandshakeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.reason)
    }
}

/// Connection event hooks
#[async_trait]
pub trait ServerHooks: Send + Sync + 'static {
    /// After the upgrade, before the first read
    async fn on_client_connected(&self, _server: &ServerHandle, client_id: &str) {
        tracing::info!(client_id, "Client connected");
    }

    /// After the registry bound the client's authenticated id
    async fn on_client_authenticated(&self, _server: &ServerHandle, client_id: &str) {
        tracing::info!(client_id, "Client authenticated");
    }

    /// Every decoded message from an authenticated client
    async fn on_message_received(&self, _server: &ServerHandle, client_id: &str, message: &Message) {
        tracing::debug!(client_id, event = %message.event, "Message received");
    }

    /// Exactly once per connection, after registry removal
    async fn on_client_disconnected(
        &self,
        _server: &ServerHandle,
        client_id: &str,
        error: Option<&TransportError>,
    ) {
        match error {
            Some(error) => tracing::info!(client_id, %error, "Client disconnected with error"),
            None => tracing::info!(client_id, "Client disconnected"),
        }
    }

    /// Value of the `Host` header of the upgrade request
    fn on_host(&self, _host: &[u8]) -> Result<(), HandshakeRejection> {
        Ok(())
    }

    /// Once per header of the upgrade request
    fn on_header(&self, _name: &str, _value: &[u8]) -> Result<(), HandshakeRejection> {
        Ok(())
    }

    /// Extra headers for the upgrade response
    fn on_before_upgrade(&self) -> Result<Vec<(String, String)>, HandshakeRejection> {
        Ok(Vec::new())
    }
}

/// Hooks that only log
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ServerHooks for DefaultHooks {}

/// Result of an authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Bind the connection to `client_id`
    Accepted { client_id: String },
    /// Refuse and close the connection
    Rejected { reason: String },
}

impl AuthOutcome {
    /// Accept under the given id
    #[must_use]
    pub fn accept(client_id: impl Into<String>) -> Self {
        Self::Accepted {
            client_id: client_id.into(),
        }
    }

    /// Reject with a reason for the logs
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Decides whether a connection may proceed
///
/// Called with the connection's provisional id and its first message.
/// Required when authentication is enabled. Implemented for async closures
/// taking `(String, Message)`.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, client_id: &str, message: &Message) -> AuthOutcome;
}

#[async_trait]
impl<F, Fut> Authenticator for F
where
    F: Fn(String, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AuthOutcome> + Send,
{
    async fn authenticate(&self, client_id: &str, message: &Message) -> AuthOutcome {
        (self)(client_id.to_string(), message.clone()).await
    }
}
