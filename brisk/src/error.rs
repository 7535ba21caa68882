//! Error types for the server, its registry and its collaborators

use thiserror::Error;

use crate::dispatch::Rejected;

/// Failures of the frame transport underneath a connection
///
/// Transport errors are never retried: they end the owning connection's
/// read loop and trigger teardown.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer or the server already closed the connection
    #[error("connection closed")]
    Closed,

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(io) => TransportError::Io(io),
            other => TransportError::WebSocket(Box::new(other)),
        }
    }
}

/// Message encoding and decoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    /// Inbound bytes could not be decoded into a message
    #[error("could not decode message: {0}")]
    Decode(String),

    /// Outbound message could not be encoded
    #[error("could not encode message: {0}")]
    Encode(String),

    /// The configured encoding has no codec
    #[error("encoding not supported: {0}")]
    Unsupported(String),
}

/// Client registry failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The client to authenticate is not in the pending partition
    #[error("client {0} is not pending authentication")]
    NotPending(String),

    /// Another live connection is already active under this id
    #[error("client id {0} is already in use")]
    IdTaken(String),

    /// The client to revoke is not in the active partition
    #[error("client {0} is not authenticated")]
    NotActive(String),
}

/// Group broadcast failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    /// The broadcast feed is at capacity and the group rejects instead of waiting
    #[error("broadcast feed for group {0} is full")]
    FeedFull(String),

    /// The group has been shut down
    #[error("broadcast feed for group {0} is closed")]
    Closed(String),
}

/// Pub/sub bridge failures
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// NATS error
    #[cfg(feature = "nats")]
    #[error("NATS error: {0}")]
    Nats(String),

    /// The bridge is no longer running
    #[error("bridge closed")]
    Closed,
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BridgeError {
    fn from(err: redis::RedisError) -> Self {
        BridgeError::Redis(Box::new(err))
    }
}

/// Main error type for the server
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration is well formed but unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Codec error
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Registry error
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Group error
    #[error(transparent)]
    Group(#[from] GroupError),

    /// Pub/sub bridge error
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A work item was rejected by the dispatcher
    #[error(transparent)]
    Dispatch(#[from] Rejected),

    /// No client is registered under the id
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

/// Result type alias using the server error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_websocket_errors_map_to_closed() {
        use tokio_tungstenite::tungstenite::Error as WsError;

        assert!(matches!(
            TransportError::from(WsError::ConnectionClosed),
            TransportError::Closed
        ));
        assert!(matches!(
            TransportError::from(WsError::AlreadyClosed),
            TransportError::Closed
        ));
    }

    #[test]
    fn test_hub_error_display() {
        let err: Error = HubError::IdTaken("alice".into()).into();
        assert_eq!(err.to_string(), "client id alice is already in use");
    }
}
