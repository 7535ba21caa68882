//! # brisk
//!
//! WebSocket server framework built around an authenticated client registry,
//! broadcast groups and a bounded work dispatcher.
//!
//! ## Features
//!
//! - **Client registry**: pending and active clients, atomic promotion on authentication
//! - **Groups**: each client belongs to one group; broadcasts fan out through a bounded feed
//! - **Work dispatch**: hooks and replies run on a worker pool, never on a connection's read loop
//! - **Handshake hooks**: inspect the Host header and request headers, add response headers
//! - **Cross-server broadcast**: optional Redis or NATS pub/sub bridge per group
//! - **Graceful shutdown**: SIGINT and SIGTERM close every connection with a close frame
//!
//! ## Example
//!
//! ```rust,no_run
//! use brisk::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ServerHooks for Echo {
//!     async fn on_message_received(&self, server: &ServerHandle, client_id: &str, message: &Message) {
//!         let _ = server.send_to(client_id, message).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config.logging)?;
//!
//!     ServerBuilder::new()
//!         .config(config)
//!         .hooks(Echo)
//!         .build()
//!         .await?
//!         .serve()
//!         .await
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod group;
pub mod handler;
pub mod hooks;
pub mod hub;
pub mod ids;
pub mod message;
pub mod observability;
pub mod server;
pub mod state;
pub mod transport;

pub use error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{MemoryBridge, PubSubBridge, Subscription};
    #[cfg(feature = "nats")]
    pub use crate::bridge::NatsBridge;
    #[cfg(feature = "redis")]
    pub use crate::bridge::RedisBridge;
    pub use crate::client::Client;
    pub use crate::codec::{Codec, JsonCodec};
    pub use crate::config::{
        AuthMode, BroadcastConfig, BroadcastMode, Config, DispatchConfig, Encoding, LogFormat,
        LoggingConfig, ServerConfig,
    };
    pub use crate::dispatch::{Dispatcher, PoolStats, WorkItem, WorkerPool};
    pub use crate::error::{Error, Result};
    pub use crate::group::{Group, GroupManager};
    pub use crate::hooks::{
        AuthOutcome, Authenticator, DefaultHooks, HandshakeRejection, ServerHooks,
    };
    pub use crate::ids::{ConnectionId, GroupId};
    pub use crate::message::Message;
    pub use crate::observability::init_tracing;
    pub use crate::server::{Server, ServerBuilder, ServerHandle, ServerStats};
    pub use crate::transport::Frame;

    pub use async_trait::async_trait;
}
