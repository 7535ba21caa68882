//! Client registry
//!
//! The hub keeps two disjoint partitions: *pending* clients that connected but
//! have not authenticated, and *active* clients that have. Both are keyed by
//! the client's application-visible id. Every mutation takes the write lock
//! over both partitions, so moving a client between them is a single atomic
//! step and an id is never visible in both or neither.
//!
//! No user callback and no transport I/O runs while the lock is held.
//! [`ClientHub::remove`] detaches the transport under the lock, closes it after
//! the lock is released, and only then calls the removal callback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::client::{Client, SharedSink};
use crate::error::{HubError, TransportError};
use crate::transport::Frame;

#[derive(Default)]
struct Partitions {
    pending: HashMap<String, Arc<Client>>,
    active: HashMap<String, Arc<Client>>,
}

impl Partitions {
    fn find(&self, id: &str) -> Option<&Arc<Client>> {
        self.active.get(id).or_else(|| self.pending.get(id))
    }

    /// Remove the entry under `id`, only if it is `expected` when given
    fn take(&mut self, id: &str, expected: Option<&Arc<Client>>) -> Option<Arc<Client>> {
        let wanted = |client: &Arc<Client>| expected.map_or(true, |e| Arc::ptr_eq(client, e));

        if self.active.get(id).is_some_and(wanted) {
            return self.active.remove(id);
        }
        if self.pending.get(id).is_some_and(wanted) {
            return self.pending.remove(id);
        }
        None
    }
}

type Detached = (String, Arc<Client>, Option<SharedSink>);

/// Stop the client and take its transport; called under the write lock
fn detach(id: String, client: Arc<Client>) -> Detached {
    let sink = client.take_transport();
    (id, client, sink)
}

/// Close a detached transport and run the removal callback, outside the lock
async fn finish<F, Fut>(detached: Option<Detached>, on_removed: F) -> bool
where
    F: FnOnce(String, Option<TransportError>) -> Fut,
    Fut: Future<Output = ()>,
{
    let Some((id, _client, sink)) = detached else {
        return false;
    };

    let error = match sink {
        Some(sink) => Client::close_transport(&sink).await,
        None => None,
    };

    tracing::debug!(client_id = %id, "Client removed");
    on_removed(id, error).await;
    true
}

/// Concurrent store of connected clients
#[derive(Default)]
pub struct ClientHub {
    inner: RwLock<Partitions>,
}

impl ClientHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected client as pending
    ///
    /// Returns `false`, leaving the registry untouched, if the id is taken.
    pub async fn add(&self, client: Arc<Client>) -> bool {
        let id = client.id();
        let mut parts = self.inner.write().await;

        if parts.find(&id).is_some() {
            tracing::warn!(client_id = %id, "Client already registered");
            return false;
        }

        parts.pending.insert(id, client);
        true
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Client>> {
        self.inner.read().await.find(id).cloned()
    }

    /// Move a pending client to the active partition under `new_id`
    ///
    /// The client's id and authenticated flag change in the same critical
    /// section. Fails without side effects if `old_id` is not pending or
    /// `new_id` already belongs to another client.
    pub async fn authenticate(&self, old_id: &str, new_id: &str) -> Result<Arc<Client>, HubError> {
        let mut parts = self.inner.write().await;

        if !parts.pending.contains_key(old_id) {
            return Err(HubError::NotPending(old_id.to_string()));
        }
        if parts.active.contains_key(new_id) || (new_id != old_id && parts.pending.contains_key(new_id)) {
            return Err(HubError::IdTaken(new_id.to_string()));
        }

        let client = parts
            .pending
            .remove(old_id)
            .ok_or_else(|| HubError::NotPending(old_id.to_string()))?;
        client.bind_id(new_id.to_string());
        client.set_authenticated(true);
        parts.active.insert(new_id.to_string(), client.clone());

        tracing::debug!(old_id, new_id, "Client moved to active");
        Ok(client)
    }

    /// Demote an active client back to pending under its connection id
    pub async fn revoke(&self, id: &str) -> Result<Arc<Client>, HubError> {
        let mut parts = self.inner.write().await;

        let client = parts
            .active
            .remove(id)
            .ok_or_else(|| HubError::NotActive(id.to_string()))?;
        let pending_id = client.connection_id().to_string();
        client.bind_id(pending_id.clone());
        client.set_authenticated(false);
        parts.pending.insert(pending_id, client.clone());

        tracing::info!(client_id = id, "Client authentication revoked");
        Ok(client)
    }

    /// Remove a client and close its transport
    ///
    /// `on_removed` receives the client id and the error from closing the
    /// transport. It runs after the lock is released, at most once per
    /// client. Returns `false` if no client was registered under `id`.
    pub async fn remove<F, Fut>(&self, id: &str, on_removed: F) -> bool
    where
        F: FnOnce(String, Option<TransportError>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let detached = {
            let mut parts = self.inner.write().await;
            parts.take(id, None).map(|client| detach(id.to_string(), client))
        };
        finish(detached, on_removed).await
    }

    /// Remove this particular client, whatever id it is registered under
    ///
    /// The id is resolved under the write lock, so a concurrent
    /// [`authenticate`](Self::authenticate) or [`revoke`](Self::revoke) cannot
    /// make the client unreachable. Same callback contract as
    /// [`remove`](Self::remove).
    pub async fn remove_client<F, Fut>(&self, client: &Arc<Client>, on_removed: F) -> bool
    where
        F: FnOnce(String, Option<TransportError>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let detached = {
            let mut parts = self.inner.write().await;
            // ids only change under this lock
            let id = client.id();
            parts
                .take(&id, Some(client))
                .map(|client| detach(id, client))
        };
        finish(detached, on_removed).await
    }

    /// Queue a frame for one client, ignoring unknown ids
    pub async fn push_to(&self, id: &str, frame: Frame) -> bool {
        match self.get(id).await {
            Some(client) => client.push(frame),
            None => false,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.pending.len()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.active.len()
    }

    /// Number of clients in both partitions
    pub async fn len(&self) -> usize {
        let parts = self.inner.read().await;
        parts.pending.len() + parts.active.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids of all registered clients
    pub async fn client_ids(&self) -> Vec<String> {
        let parts = self.inner.read().await;
        parts.pending.keys().chain(parts.active.keys()).cloned().collect()
    }

    /// Whether `id` is in the pending partition
    pub async fn is_pending(&self, id: &str) -> bool {
        self.inner.read().await.pending.contains_key(id)
    }

    /// Whether `id` is in the active partition
    pub async fn is_active(&self, id: &str) -> bool {
        self.inner.read().await.active.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> (memory::MemoryPeer, Arc<Client>) {
        let (peer, _source, sink) = memory::pair();
        (peer, Client::connect(Box::new(sink), 8, None))
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let hub = ClientHub::new();
        let (_peer, c) = client();
        let id = c.id();

        assert!(hub.add(c.clone()).await);
        assert!(!hub.add(c.clone()).await);
        assert!(hub.is_pending(&id).await);
        assert_eq!(hub.len().await, 1);
        assert!(Arc::ptr_eq(&hub.get(&id).await.unwrap(), &c));
    }

    #[tokio::test]
    async fn test_authenticate_moves_client() {
        let hub = ClientHub::new();
        let (_peer, c) = client();
        let old = c.id();
        hub.add(c.clone()).await;

        hub.authenticate(&old, "alice").await.unwrap();

        assert_eq!(c.id(), "alice");
        assert!(c.is_authenticated());
        assert!(!hub.is_pending(&old).await);
        assert!(hub.is_active("alice").await);
        assert!(hub.get(&old).await.is_none());
        assert_eq!(hub.pending_count().await, 0);
        assert_eq!(hub.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_authenticate_unknown_is_noop() {
        let hub = ClientHub::new();
        let (_peer, c) = client();
        hub.add(c.clone()).await;

        assert_eq!(
            hub.authenticate("nobody", "alice").await.unwrap_err(),
            HubError::NotPending("nobody".into())
        );
        assert!(hub.get("alice").await.is_none());
        assert_eq!(hub.pending_count().await, 1);
        assert_eq!(hub.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_authenticate_twice_is_noop() {
        let hub = ClientHub::new();
        let (_peer, c) = client();
        let old = c.id();
        hub.add(c.clone()).await;

        hub.authenticate(&old, "alice").await.unwrap();
        assert!(matches!(
            hub.authenticate(&old, "bob").await,
            Err(HubError::NotPending(_))
        ));
        assert_eq!(c.id(), "alice");
        assert!(hub.get("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_authenticate_rejects_taken_id() {
        let hub = ClientHub::new();
        let (_p1, first) = client();
        let (_p2, second) = client();
        let second_id = second.id();
        hub.add(first.clone()).await;
        hub.add(second.clone()).await;

        hub.authenticate(&first.id(), "alice").await.unwrap();
        assert_eq!(
            hub.authenticate(&second_id, "alice").await.unwrap_err(),
            HubError::IdTaken("alice".into())
        );
        assert!(hub.is_pending(&second_id).await);
        assert!(!second.is_authenticated());
    }

    #[tokio::test]
    async fn test_revoke_returns_client_to_pending() {
        let hub = ClientHub::new();
        let (_peer, c) = client();
        hub.add(c.clone()).await;
        hub.authenticate(&c.id(), "alice").await.unwrap();

        hub.revoke("alice").await.unwrap();

        assert!(!c.is_authenticated());
        assert_eq!(c.id(), c.connection_id().to_string());
        assert!(hub.is_pending(&c.id()).await);
        assert!(!hub.is_active("alice").await);
        assert!(matches!(hub.revoke("alice").await, Err(HubError::NotActive(_))));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let hub = ClientHub::new();
        let (peer, c) = client();
        let id = c.id();
        hub.add(c).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let callback = |calls: Arc<AtomicUsize>| {
            move |_id: String, _err: Option<TransportError>| async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        };

        assert!(hub.remove(&id, callback(calls.clone())).await);
        assert!(!hub.remove(&id, callback(calls.clone())).await);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(peer.close_count(), 1);
        assert!(hub.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_remove_closes_once() {
        let hub = Arc::new(ClientHub::new());
        let (peer, c) = client();
        let id = c.id();
        hub.add(c).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let hub = hub.clone();
            let id = id.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                hub.remove(&id, |_, _| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }));
        }

        let mut removed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                removed += 1;
            }
        }

        assert_eq!(removed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_authenticate_and_remove_never_duplicates() {
        for _ in 0..50 {
            let hub = Arc::new(ClientHub::new());
            let (_peer, c) = client();
            let old = c.id();
            hub.add(c).await;

            let auth = {
                let hub = hub.clone();
                let old = old.clone();
                tokio::spawn(async move { hub.authenticate(&old, "alice").await.is_ok() })
            };
            let remove = {
                let hub = hub.clone();
                let old = old.clone();
                tokio::spawn(async move { hub.remove(&old, |_, _| async {}).await })
            };

            let authenticated = auth.await.unwrap();
            let removed_pending = remove.await.unwrap();

            let pending = hub.is_pending(&old).await;
            let active = hub.is_active("alice").await;
            assert!(!(pending && active));
            // exactly one of the two operations won the pending entry
            assert!(authenticated != removed_pending);
            assert_eq!(active, authenticated);
            assert!(!pending);
        }
    }

    #[tokio::test]
    async fn test_remove_client_follows_revoke() {
        let hub = Arc::new(ClientHub::new());
        let (peer, c) = client();
        let old = c.id();
        hub.add(c.clone()).await;
        hub.authenticate(&old, "alice").await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        // queue a revoke ahead of the removal while the registry is locked
        let guard = hub.inner.write().await;
        let revoke = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.revoke("alice").await.is_ok() })
        };
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        let remove = {
            let hub = hub.clone();
            let c = c.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                hub.remove_client(&c, |id, _| async move {
                    assert_eq!(id, old);
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .await
            })
        };
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        drop(guard);

        assert!(revoke.await.unwrap());
        assert!(remove.await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(peer.close_count(), 1);
        assert!(hub.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_client_spares_other_client_with_same_id() {
        let hub = ClientHub::new();
        let (_first_peer, first) = client();
        let (_second_peer, second) = client();
        let first_id = first.id();
        hub.add(first.clone()).await;
        hub.authenticate(&first_id, "alice").await.unwrap();
        hub.remove("alice", |_, _| async {}).await;

        hub.add(second.clone()).await;
        hub.authenticate(&second.id(), "alice").await.unwrap();
        first.bind_id("alice".into());

        assert!(!hub.remove_client(&first, |_, _| async {}).await);
        let still = hub.get("alice").await.unwrap();
        assert!(Arc::ptr_eq(&still, &second));
    }

    #[tokio::test]
    async fn test_push_to_unknown_is_noop() {
        let hub = ClientHub::new();
        assert!(!hub.push_to("ghost", Frame::Text("x".into())).await);
    }
}
