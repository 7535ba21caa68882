//! Server assembly and listener
//!
//! ```rust,ignore
//! use brisk::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> brisk::Result<()> {
//!     let config = Config::load()?;
//!     brisk::observability::init_tracing(&config.logging)?;
//!
//!     ServerBuilder::new()
//!         .config(config)
//!         .hooks(DefaultHooks)
//!         .build()
//!         .await?
//!         .serve()
//!         .await
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_util::task::TaskTracker;

use crate::bridge::PubSubBridge;
use crate::client::Client;
use crate::codec::codec_for;
use crate::config::{AuthMode, Config};
use crate::dispatch::{
    submit_or_spawn, ClientDisconnectedWork, Dispatcher, PoolStats, ReplyWork, WorkerPool,
};
use crate::error::{Error, Result, TransportError};
use crate::group::GroupManager;
use crate::handler::ConnectionHandler;
use crate::hooks::{Authenticator, DefaultHooks, ServerHooks};
use crate::hub::ClientHub;
use crate::message::Message;
use crate::state::ServerState;
use crate::transport;

/// Counts reported by [`ServerHandle::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub pending_clients: usize,
    pub active_clients: usize,
    pub groups: usize,
    pub dispatch: Option<PoolStats>,
}

/// Cheap, cloneable access to a running server
///
/// Hooks receive one with every call; applications get one from
/// [`Server::handle`].
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    pub(crate) fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    #[must_use]
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        self.state.config()
    }

    pub(crate) fn hooks(&self) -> &dyn ServerHooks {
        self.state.hooks()
    }

    pub async fn client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.state.hub().get(client_id).await
    }

    async fn require_client(&self, client_id: &str) -> Result<Arc<Client>> {
        self.client(client_id)
            .await
            .ok_or_else(|| Error::ClientNotFound(client_id.to_string()))
    }

    /// Encode and write a message to one client now
    pub async fn send_to(&self, client_id: &str, message: &Message) -> Result<()> {
        let client = self.require_client(client_id).await?;
        let frame = self.state.codec().encode(message)?;
        client.send(frame).await?;
        Ok(())
    }

    /// Hand a message for one client to the dispatcher
    pub async fn send_to_async(&self, client_id: &str, message: Message) -> Result<()> {
        let client = self.require_client(client_id).await?;
        let work = ReplyWork::new(client, self.state.codec().clone(), message);
        self.state.dispatcher().submit(Box::new(work))?;
        Ok(())
    }

    /// Queue a message on one client's outbound feed
    ///
    /// Returns `false` for an unknown client or a full feed.
    pub async fn push_to(&self, client_id: &str, message: &Message) -> Result<bool> {
        let frame = self.state.codec().encode(message)?;
        Ok(self.state.hub().push_to(client_id, frame).await)
    }

    /// Broadcast to the members of one group
    ///
    /// Returns `false` if the group does not exist.
    pub async fn broadcast_to_group(&self, group: &str, message: &Message) -> Result<bool> {
        let frame = self.state.codec().encode(message)?;
        Ok(self.state.groups().broadcast_to_group(group, frame).await?)
    }

    /// Broadcast to every group; returns how many groups took the message
    pub async fn broadcast_to_all(&self, message: &Message) -> Result<usize> {
        let frame = self.state.codec().encode(message)?;
        Ok(self.state.groups().broadcast_to_all(frame).await)
    }

    /// Broadcast to a group on every server sharing the bridge
    pub async fn publish(&self, group: &str, message: &Message) -> Result<()> {
        let frame = self.state.codec().encode(message)?;
        self.state.groups().publish(group, frame).await
    }

    /// Move a client to another group, creating it if needed
    pub async fn move_to_group(&self, client_id: &str, group: &str) -> Result<()> {
        let client = self.require_client(client_id).await?;
        self.state
            .groups()
            .join(&client, group)
            .await
            .ok_or_else(|| Error::ClientNotFound(client_id.to_string()))?;
        Ok(())
    }

    /// Revoke a client's authentication
    ///
    /// The client goes back to pending under its connection id and its next
    /// message is treated as an authentication attempt.
    pub async fn revoke(&self, client_id: &str) -> Result<()> {
        let client = self.state.hub().revoke(client_id).await?;
        self.state.groups().leave(&client).await;
        Ok(())
    }

    /// Close a client's connection from the server side
    ///
    /// Returns `false` if the client was not connected.
    pub async fn disconnect(&self, client_id: &str) -> bool {
        match self.client(client_id).await {
            Some(client) => self.remove_client(&client, None).await,
            None => false,
        }
    }

    /// Single removal path for a client
    ///
    /// Stops the client, leaves its group, removes it from the registry and
    /// schedules the disconnect hook. Only the first call for a client
    /// reaches the hook. The client is stopped before leaving so a
    /// concurrent move cannot put it back in a group.
    pub(crate) async fn remove_client(
        &self,
        client: &Arc<Client>,
        read_error: Option<TransportError>,
    ) -> bool {
        client.stop();
        self.state.groups().leave(client).await;

        let server = self.clone();
        self.state
            .hub()
            .remove_client(client, move |client_id, close_error| {
                let work = ClientDisconnectedWork::new(
                    server.clone(),
                    client_id,
                    close_error.or(read_error),
                );
                submit_or_spawn(server.state.dispatcher(), Box::new(work));
                std::future::ready(())
            })
            .await
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            pending_clients: self.state.hub().pending_count().await,
            active_clients: self.state.hub().active_count().await,
            groups: self.state.groups().len().await,
            dispatch: self.state.dispatcher().stats(),
        }
    }

    /// Disconnect every client, then stop groups and the dispatcher
    pub async fn shutdown(&self) {
        let ids = self.state.hub().client_ids().await;
        let count = ids.len();
        for id in ids {
            self.disconnect(&id).await;
        }
        self.state.groups().shutdown().await;
        self.state.dispatcher().shutdown().await;
        tracing::info!(clients = count, "Server state shut down");
    }
}

/// Builder for [`Server`]
///
/// Without a config, [`Config::load`] is used. Without hooks,
/// [`DefaultHooks`]. Without a dispatcher, a [`WorkerPool`] sized from the
/// config. Without a bridge, one is connected from the `redis` or `nats`
/// section when the matching feature is enabled.
#[derive(Default)]
pub struct ServerBuilder {
    config: Option<Config>,
    hooks: Option<Arc<dyn ServerHooks>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    bridge: Option<Arc<dyn PubSubBridge>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl ServerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: impl ServerHooks) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    #[must_use]
    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    #[must_use]
    pub fn bridge(mut self, bridge: impl PubSubBridge) -> Self {
        self.bridge = Some(Arc::new(bridge));
        self
    }

    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Validate the configuration and assemble the server
    ///
    /// Fails before anything listens if the encoding has no codec or
    /// authentication is enabled without an authenticator.
    pub async fn build(self) -> Result<Server> {
        let config = match self.config {
            Some(config) => config,
            None => Config::load()?,
        };
        config.validate()?;
        let addr = config.server.socket_addr()?;

        let codec = codec_for(config.server.encoding)?;

        if config.server.auth == AuthMode::Enabled && self.authenticator.is_none() {
            return Err(Error::InvalidConfig(
                "authentication is enabled but no authenticator was provided".into(),
            ));
        }

        let bridge = match self.bridge {
            Some(bridge) => Some(bridge),
            None => bridge_from_config(&config).await?,
        };

        let dispatcher: Arc<dyn Dispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(WorkerPool::new(&config.dispatch)),
        };

        let groups = GroupManager::new(
            config.server.default_group.clone(),
            config.broadcast.feed_capacity,
            config.broadcast.mode,
            bridge,
        )
        .await;

        let state = ServerState {
            config: Arc::new(config),
            hub: ClientHub::new(),
            groups,
            codec,
            dispatcher,
            hooks: self.hooks.unwrap_or_else(|| Arc::new(DefaultHooks)),
            authenticator: self.authenticator,
        };

        Ok(Server {
            handle: ServerHandle::new(Arc::new(state)),
            addr,
        })
    }
}

#[allow(clippy::unused_async)]
async fn bridge_from_config(config: &Config) -> Result<Option<Arc<dyn PubSubBridge>>> {
    #[cfg(feature = "redis")]
    if let Some(redis) = &config.redis {
        let bridge = crate::bridge::RedisBridge::connect(redis).await?;
        return Ok(Some(Arc::new(bridge)));
    }

    #[cfg(feature = "nats")]
    if let Some(nats) = &config.nats {
        let bridge = crate::bridge::NatsBridge::connect(nats).await?;
        return Ok(Some(Arc::new(bridge)));
    }

    if config.redis.is_some() || config.nats.is_some() {
        tracing::warn!("Bridge configured but its feature is not enabled, broadcasts stay local");
    }
    Ok(None)
}

/// A WebSocket server ready to listen
pub struct Server {
    handle: ServerHandle,
    addr: SocketAddr,
}

impl Server {
    /// Handle for sending and broadcasting from application code
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        self.handle.config()
    }

    /// Configured bind address
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serve on an existing listener until `signal` completes
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            name = %self.config().server.name,
            auth = ?self.config().server.auth,
            "Listening on {}",
            local_addr
        );

        let connections = TaskTracker::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(self.handle.clone(), stream, peer));
                    }
                    Err(e) => {
                        // typically descriptor exhaustion; back off instead of spinning
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        drop(listener);
        tracing::info!(connections = connections.len(), "Shutting down");

        self.handle.shutdown().await;
        connections.close();
        let timeout = self.config().dispatch.shutdown_timeout();
        if tokio::time::timeout(timeout, connections.wait()).await.is_err() {
            tracing::warn!(remaining = connections.len(), "Connections still open after shutdown timeout");
        }

        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn handle_connection(server: ServerHandle, stream: TcpStream, peer: SocketAddr) {
    let hooks = server.state.hooks.clone();
    let (source, sink) = match transport::accept(stream, hooks).await {
        Ok(halves) => halves,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "Handshake failed");
            return;
        }
    };

    let capacity = server.config().broadcast.client_feed_capacity;
    let client = Client::connect(Box::new(sink), capacity, Some(peer));
    tracing::debug!(%peer, client_id = %client.id(), "Connection upgraded");

    ConnectionHandler::new(server, client, source).run().await;
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Encoding;
    use crate::error::CodecError;
    use crate::hooks::AuthOutcome;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite;

    fn local_config() -> Config {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1:0".into();
        config
    }

    #[tokio::test]
    async fn test_msg_pack_is_rejected_at_build() {
        let mut config = local_config();
        config.server.encoding = Encoding::MsgPack;

        let result = ServerBuilder::new().config(config).build().await;
        assert!(matches!(result, Err(Error::Codec(CodecError::Unsupported(_)))));
    }

    #[tokio::test]
    async fn test_auth_without_authenticator_is_rejected_at_build() {
        let mut config = local_config();
        config.server.auth = AuthMode::Enabled;

        let result = ServerBuilder::new().config(config).build().await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_build_with_authenticator() {
        let mut config = local_config();
        config.server.auth = AuthMode::Enabled;

        let server = ServerBuilder::new()
            .config(config)
            .authenticator(|id: String, _msg: Message| async move { AuthOutcome::accept(id) })
            .build()
            .await
            .unwrap();

        let stats = server.handle().stats().await;
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.pending_clients, 0);
        assert!(stats.dispatch.is_some());
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let server = ServerBuilder::new().config(local_config()).build().await.unwrap();
        let result = server.handle().send_to("ghost", &Message::new("x")).await;
        assert!(matches!(result, Err(Error::ClientNotFound(_))));
    }

    #[tokio::test]
    async fn test_end_to_end_over_tcp() {
        let mut config = local_config();
        config.server.send_acknowledgement = true;
        let server = ServerBuilder::new().config(config).build().await.unwrap();
        let handle = server.handle();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve_with_shutdown(listener, async move {
            let _ = stop_rx.await;
        }));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();

        ws.send(tungstenite::Message::Text(r#"{"event":"ping","payload":{}}"#.into()))
            .await
            .unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                tungstenite::Message::Text(text) => {
                    break serde_json::from_str::<Message>(text.as_str()).unwrap();
                }
                _ => continue,
            }
        };
        assert_eq!(reply.event, "ack");
        assert_eq!(reply.code(), Some(200));

        let stats = handle.stats().await;
        assert_eq!(stats.active_clients, 1);

        let client_id = handle.state().hub().client_ids().await.remove(0);
        handle
            .send_to(&client_id, &Message::new("hello"))
            .await
            .unwrap();
        let pushed = loop {
            match ws.next().await.unwrap().unwrap() {
                tungstenite::Message::Text(text) => {
                    break serde_json::from_str::<Message>(text.as_str()).unwrap();
                }
                _ => continue,
            }
        };
        assert_eq!(pushed.event, "hello");

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();

        // the server closed the connection on shutdown
        let closed = loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                _ => break None,
            }
        };
        if let Some(frame) = closed {
            assert_eq!(frame.reason.as_str(), transport::SERVER_CLOSE_REASON);
        }
        assert_eq!(handle.stats().await.active_clients, 0);
    }
}
