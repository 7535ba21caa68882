//! Per-connection client state

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::ids::{ConnectionId, GroupId};
use crate::transport::{CloseReason, Frame, FrameSink, SERVER_CLOSE_REASON};

pub(crate) type SharedSink = Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>;

/// A connected client
///
/// Created once the upgrade completes and shared between the registry, its
/// group and the connection handler. The client id and authenticated flag
/// only change inside the registry's critical section.
pub struct Client {
    connection_id: ConnectionId,
    id: RwLock<String>,
    authenticated: AtomicBool,
    metadata: DashMap<String, Value>,
    group: RwLock<Option<GroupId>>,
    peer_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    feed: mpsc::Sender<Frame>,
    transport: Mutex<Option<SharedSink>>,
    shutdown: CancellationToken,
}

impl Client {
    /// Wrap an upgraded transport and start its delivery task
    ///
    /// `feed_capacity` bounds the outbound feed drained by the delivery task.
    pub fn connect(
        sink: Box<dyn FrameSink>,
        feed_capacity: usize,
        peer_addr: Option<SocketAddr>,
    ) -> Arc<Self> {
        let connection_id = ConnectionId::new();
        let (feed, rx) = mpsc::channel(feed_capacity.max(1));
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
        let shutdown = CancellationToken::new();

        tokio::spawn(deliver(connection_id, rx, sink.clone(), shutdown.clone()));

        Arc::new(Self {
            connection_id,
            id: RwLock::new(connection_id.to_string()),
            authenticated: AtomicBool::new(false),
            metadata: DashMap::new(),
            group: RwLock::new(None),
            peer_addr,
            connected_at: Utc::now(),
            feed,
            transport: Mutex::new(Some(sink)),
            shutdown,
        })
    }

    /// Opaque handle of the underlying connection
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Application-visible id
    ///
    /// The connection id until authentication binds another one.
    #[must_use]
    pub fn id(&self) -> String {
        self.id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn bind_id(&self, id: String) {
        *self.id.write().unwrap_or_else(PoisonError::into_inner) = id;
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    /// Group the client currently belongs to
    #[must_use]
    pub fn group(&self) -> Option<GroupId> {
        self.group.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_group(&self, group: Option<GroupId>) -> Option<GroupId> {
        std::mem::replace(
            &mut *self.group.write().unwrap_or_else(PoisonError::into_inner),
            group,
        )
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Attach an application value to the client
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.get(key).map(|v| v.value().clone())
    }

    pub fn remove_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.remove(key).map(|(_, v)| v)
    }

    /// Replace all metadata at once
    pub fn replace_metadata(&self, metadata: Map<String, Value>) {
        self.metadata.clear();
        for (key, value) in metadata {
            self.metadata.insert(key, value);
        }
    }

    /// Copy of all metadata
    #[must_use]
    pub fn metadata_snapshot(&self) -> Map<String, Value> {
        self.metadata
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Queue a frame for the delivery task without waiting
    ///
    /// Returns `false` when the feed is full or the client is stopped. A slow
    /// reader loses frames instead of stalling the sender.
    pub fn push(&self, frame: Frame) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.feed.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(client_id = %self.id(), "Outbound feed full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Write a frame to the transport directly
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let sink = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)?;
        let mut sink = sink.lock().await;
        sink.send_frame(frame).await
    }

    /// Whether the client has been stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop delivery; later pushes and group joins are refused
    pub(crate) fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stop delivery and hand out the transport
    ///
    /// Only the first caller gets `Some`; the registry calls this under its
    /// write lock so the transport is closed exactly once.
    pub(crate) fn take_transport(&self) -> Option<SharedSink> {
        self.shutdown.cancel();
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Send the server close frame and release the transport
    ///
    /// Returns the error of the final close, if any.
    pub(crate) async fn close_transport(sink: &SharedSink) -> Option<TransportError> {
        let mut sink = sink.lock().await;
        // the peer may already be gone
        let _ = sink
            .send_frame(Frame::Close(Some(CloseReason::normal(SERVER_CLOSE_REASON))))
            .await;
        match sink.close().await {
            Ok(()) | Err(TransportError::Closed) => None,
            Err(e) => Some(e),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection_id", &self.connection_id)
            .field("id", &self.id())
            .field("authenticated", &self.is_authenticated())
            .field("group", &self.group())
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

async fn deliver(
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<Frame>,
    sink: SharedSink,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let mut sink = sink.lock().await;
        if let Err(e) = sink.send_frame(frame).await {
            tracing::debug!(%connection_id, error = %e, "Delivery stopped");
            break;
        }
    }
}
