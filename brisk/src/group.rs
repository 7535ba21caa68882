//! Broadcast groups
//!
//! A [`Group`] is a named set of clients with a bounded broadcast feed. One
//! broadcaster task per group drains the feed and pushes each frame to every
//! client that is a member *when the frame is dequeued*, so members observe
//! broadcasts in enqueue order. The broadcaster only writes into client feeds,
//! never into its own.
//!
//! The [`GroupManager`] creates groups on demand and keeps each client in
//! exactly one of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bridge::{PubSubBridge, Subscription};
use crate::client::Client;
use crate::config::BroadcastMode;
use crate::error::{Error, GroupError, Result};
use crate::ids::{ConnectionId, GroupId};
use crate::transport::Frame;

type Members = Arc<RwLock<HashMap<ConnectionId, Arc<Client>>>>;

/// A named broadcast domain
pub struct Group {
    id: GroupId,
    members: Members,
    feed: mpsc::Sender<Frame>,
    mode: BroadcastMode,
    metadata: DashMap<String, Value>,
    created_at: DateTime<Utc>,
    shutdown: CancellationToken,
    subscription: Mutex<Option<Subscription>>,
}

impl Group {
    /// Create a group and start its broadcaster
    pub fn new(id: impl Into<GroupId>, feed_capacity: usize, mode: BroadcastMode) -> Arc<Self> {
        let id = id.into();
        let (feed, rx) = mpsc::channel(feed_capacity.max(1));
        let members: Members = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(fan_out(id.clone(), rx, members.clone(), shutdown.clone()));

        Arc::new(Self {
            id,
            members,
            feed,
            mode,
            metadata: DashMap::new(),
            created_at: Utc::now(),
            shutdown,
            subscription: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> &GroupId {
        &self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Add a member; returns `false` if it was already one
    pub async fn add(&self, client: Arc<Client>) -> bool {
        let mut members = self.members.write().await;
        members.insert(client.connection_id(), client).is_none()
    }

    /// Remove a member; returns `false` if it was not one
    pub async fn remove(&self, connection_id: ConnectionId) -> bool {
        self.members.write().await.remove(&connection_id).is_some()
    }

    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&connection_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Client ids of the current members
    pub async fn member_ids(&self) -> Vec<String> {
        self.members.read().await.values().map(|c| c.id()).collect()
    }

    /// Enqueue a frame for every member
    ///
    /// In [`BroadcastMode::Block`] this waits for feed capacity; in
    /// [`BroadcastMode::Reject`] a full feed fails with `FeedFull`.
    pub async fn broadcast(&self, frame: Frame) -> std::result::Result<(), GroupError> {
        match self.mode {
            BroadcastMode::Block => self
                .feed
                .send(frame)
                .await
                .map_err(|_| GroupError::Closed(self.id.to_string())),
            BroadcastMode::Reject => self.feed.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => GroupError::FeedFull(self.id.to_string()),
                mpsc::error::TrySendError::Closed(_) => GroupError::Closed(self.id.to_string()),
            }),
        }
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.get(key).map(|v| v.value().clone())
    }

    /// Whether the group forwards from an external topic
    #[must_use]
    pub fn is_bridged(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn feed_sender(&self) -> mpsc::Sender<Frame> {
        self.feed.clone()
    }

    pub(crate) fn attach(&self, subscription: Subscription) {
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);
    }

    /// Stop the broadcaster and the bridge subscription
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

async fn fan_out(
    id: GroupId,
    mut rx: mpsc::Receiver<Frame>,
    members: Members,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // push never blocks, holding the read lock is fine
        let members = members.read().await;
        for client in members.values() {
            client.push(frame.clone());
        }
        tracing::trace!(group_id = %id, members = members.len(), "Broadcast delivered");
    }
    tracing::debug!(group_id = %id, "Group broadcaster stopped");
}

/// Owns all groups of a server
pub struct GroupManager {
    groups: RwLock<HashMap<GroupId, Arc<Group>>>,
    moves: tokio::sync::Mutex<()>,
    default_group: GroupId,
    feed_capacity: usize,
    mode: BroadcastMode,
    bridge: Option<Arc<dyn PubSubBridge>>,
}

impl GroupManager {
    /// Create the manager and its default group
    pub async fn new(
        default_group: impl Into<GroupId>,
        feed_capacity: usize,
        mode: BroadcastMode,
        bridge: Option<Arc<dyn PubSubBridge>>,
    ) -> Self {
        let manager = Self {
            groups: RwLock::new(HashMap::new()),
            moves: tokio::sync::Mutex::new(()),
            default_group: default_group.into(),
            feed_capacity,
            mode,
            bridge,
        };
        manager
            .ensure(manager.default_group.clone(), manager.feed_capacity)
            .await;
        manager
    }

    #[must_use]
    pub fn default_group(&self) -> &GroupId {
        &self.default_group
    }

    /// Get or create a group
    ///
    /// A new group is subscribed to the bridge under its own id. A failed
    /// subscription is logged and the group stays local.
    pub async fn ensure(&self, id: impl Into<GroupId>, feed_capacity: usize) -> Arc<Group> {
        let id = id.into();

        if let Some(group) = self.groups.read().await.get(&id) {
            return group.clone();
        }

        let (group, created) = {
            let mut groups = self.groups.write().await;
            match groups.get(&id) {
                Some(group) => (group.clone(), false),
                None => {
                    let group = Group::new(id.clone(), feed_capacity, self.mode);
                    groups.insert(id.clone(), group.clone());
                    (group, true)
                }
            }
        };

        if created {
            tracing::debug!(group_id = %id, feed_capacity, "Group created");
            if let Some(bridge) = &self.bridge {
                match bridge.subscribe(id.as_str(), group.feed_sender()).await {
                    Ok(subscription) => group.attach(subscription),
                    Err(e) => tracing::warn!(group_id = %id, error = %e, "Bridge subscription failed"),
                }
            }
        }

        group
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Group>> {
        self.groups.read().await.get(&GroupId::from(id)).cloned()
    }

    /// Put a client in a group, leaving its previous one first
    ///
    /// Returns `None`, changing nothing, if the client has been stopped.
    pub async fn join(&self, client: &Arc<Client>, id: impl Into<GroupId>) -> Option<Arc<Group>> {
        if client.is_stopped() {
            return None;
        }
        let id = id.into();
        let group = self.ensure(id.clone(), self.feed_capacity).await;

        let _moving = self.moves.lock().await;
        // removal stops the client before leaving, under the same lock
        if client.is_stopped() {
            tracing::debug!(client_id = %client.id(), group_id = %id, "Stopped client not joined");
            return None;
        }
        if let Some(previous) = client.set_group(Some(id.clone())) {
            if previous != id {
                if let Some(old) = self.get(previous.as_str()).await {
                    old.remove(client.connection_id()).await;
                }
            }
        }
        group.add(client.clone()).await;

        tracing::debug!(client_id = %client.id(), group_id = %id, "Client joined group");
        Some(group)
    }

    /// Take a client out of its group
    pub async fn leave(&self, client: &Client) -> Option<GroupId> {
        let _moving = self.moves.lock().await;
        let previous = client.set_group(None)?;
        if let Some(group) = self.get(previous.as_str()).await {
            group.remove(client.connection_id()).await;
        }
        Some(previous)
    }

    /// Broadcast to one group
    ///
    /// Returns `Ok(false)` for an unknown group.
    pub async fn broadcast_to_group(&self, id: &str, frame: Frame) -> std::result::Result<bool, GroupError> {
        match self.get(id).await {
            Some(group) => group.broadcast(frame).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Broadcast to every group
    ///
    /// Returns how many groups accepted the frame. Failures are logged.
    pub async fn broadcast_to_all(&self, frame: Frame) -> usize {
        let groups: Vec<Arc<Group>> = self.groups.read().await.values().cloned().collect();

        let mut delivered = 0;
        for group in groups {
            match group.broadcast(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(group_id = %group.id(), error = %e, "Broadcast failed"),
            }
        }
        delivered
    }

    /// Broadcast across processes through the bridge
    ///
    /// Without a bridge this is a local broadcast to an existing group.
    pub async fn publish(&self, id: &str, frame: Frame) -> Result<()> {
        match &self.bridge {
            Some(bridge) => {
                let payload = frame
                    .data()
                    .ok_or_else(|| Error::Internal("only data frames can be published".into()))?
                    .to_vec();
                bridge.publish(id, payload).await?;
                Ok(())
            }
            None => {
                self.broadcast_to_group(id, frame).await?;
                Ok(())
            }
        }
    }

    pub async fn group_ids(&self) -> Vec<GroupId> {
        self.groups.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.groups.read().await.is_empty()
    }

    /// Stop every group
    pub async fn shutdown(&self) {
        let groups: Vec<Arc<Group>> = self.groups.write().await.drain().map(|(_, g)| g).collect();
        for group in &groups {
            group.shutdown();
        }
        tracing::debug!(count = groups.len(), "Groups shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MemoryBridge;
    use crate::transport::memory;
    use std::time::Duration;

    fn client() -> (memory::MemoryPeer, Arc<Client>) {
        let (peer, _source, sink) = memory::pair();
        (peer, Client::connect(Box::new(sink), 16, None))
    }

    async fn nothing_arrives(peer: &mut memory::MemoryPeer) -> bool {
        tokio::time::timeout(Duration::from_millis(50), peer.recv())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_default_group_exists() {
        let manager = GroupManager::new("default", 8, BroadcastMode::Block, None).await;
        assert!(manager.get("default").await.is_some());
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let manager = GroupManager::new("default", 8, BroadcastMode::Block, None).await;
        let a = manager.ensure("a", 8).await;
        let again = manager.ensure("a", 8).await;
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_target_group() {
        let manager = GroupManager::new("default", 8, BroadcastMode::Block, None).await;
        let (mut peer_a, a) = client();
        let (mut peer_b, b) = client();
        manager.join(&a, "a").await;
        manager.join(&b, "b").await;

        let frame = Frame::Text("m".into());
        assert!(manager.broadcast_to_group("a", frame.clone()).await.unwrap());

        assert_eq!(peer_a.recv().await, Some(frame));
        assert!(nothing_arrives(&mut peer_b).await);
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_group_is_noop() {
        let manager = GroupManager::new("default", 8, BroadcastMode::Block, None).await;
        assert!(!manager.broadcast_to_group("ghost", Frame::Text("m".into())).await.unwrap());
        assert!(manager.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_join_moves_between_groups() {
        let manager = GroupManager::new("default", 8, BroadcastMode::Block, None).await;
        let (_peer, c) = client();

        let first = manager.join(&c, "a").await.unwrap();
        let second = manager.join(&c, "b").await.unwrap();

        assert!(!first.contains(c.connection_id()).await);
        assert!(second.contains(c.connection_id()).await);
        assert_eq!(c.group(), Some(GroupId::from("b")));

        assert_eq!(manager.leave(&c).await, Some(GroupId::from("b")));
        assert_eq!(second.member_count().await, 0);
        assert!(c.group().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order() {
        let group = Group::new("g", 64, BroadcastMode::Block);
        let (mut peer, c) = client();
        group.add(c).await;

        for i in 0..10 {
            group.broadcast(Frame::Text(i.to_string())).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(peer.recv().await, Some(Frame::Text(i.to_string())));
        }
    }

    #[tokio::test]
    async fn test_member_added_before_dequeue_receives() {
        let group = Group::new("g", 8, BroadcastMode::Block);
        let (mut peer, c) = client();

        {
            let mut members = group.members.write().await;
            group.feed.try_send(Frame::Text("m".into())).unwrap();
            members.insert(c.connection_id(), c.clone());
        }

        assert_eq!(peer.recv().await, Some(Frame::Text("m".into())));
    }

    #[tokio::test]
    async fn test_member_removed_before_dequeue_does_not_receive() {
        let group = Group::new("g", 8, BroadcastMode::Block);
        let (mut peer, c) = client();
        group.add(c.clone()).await;

        {
            let mut members = group.members.write().await;
            group.feed.try_send(Frame::Text("m".into())).unwrap();
            members.remove(&c.connection_id());
        }

        assert!(nothing_arrives(&mut peer).await);
    }

    #[tokio::test]
    async fn test_reject_mode_reports_full_feed() {
        let group = Group::new("g", 1, BroadcastMode::Reject);
        let guard = group.members.write().await;

        // the broadcaster holds one frame while it waits for the lock
        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(group.broadcast(Frame::Text("m".into())).await);
        }
        drop(guard);

        assert!(results.contains(&Err(GroupError::FeedFull("g".into()))));
    }

    #[tokio::test]
    async fn test_block_mode_waits_for_feed_capacity() {
        let group = Group::new("g", 1, BroadcastMode::Block);
        let (mut peer, c) = client();
        group.add(c).await;
        let guard = group.members.write().await;

        let sender = {
            let group = group.clone();
            tokio::spawn(async move {
                for i in 0..3 {
                    group.broadcast(Frame::Text(i.to_string())).await.unwrap();
                }
            })
        };

        // one frame held by the broadcaster, one queued, the third waits
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .unwrap()
            .unwrap();
        for i in 0..3 {
            assert_eq!(peer.recv().await, Some(Frame::Text(i.to_string())));
        }
    }

    #[tokio::test]
    async fn test_stopped_client_cannot_join() {
        let manager = GroupManager::new("default", 8, BroadcastMode::Block, None).await;
        let (_peer, c) = client();
        c.stop();

        assert!(manager.join(&c, "a").await.is_none());
        assert!(c.group().is_none());
        assert!(manager.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_to_all() {
        let manager = GroupManager::new("default", 8, BroadcastMode::Block, None).await;
        let (mut peer_a, a) = client();
        let (mut peer_b, b) = client();
        manager.join(&a, "a").await;
        manager.join(&b, "b").await;

        assert_eq!(manager.broadcast_to_all(Frame::Text("all".into())).await, 3);
        assert_eq!(peer_a.recv().await, Some(Frame::Text("all".into())));
        assert_eq!(peer_b.recv().await, Some(Frame::Text("all".into())));
    }

    #[tokio::test]
    async fn test_publish_through_bridge_reaches_other_manager() {
        let bridge = MemoryBridge::new(16);
        let here = GroupManager::new("default", 8, BroadcastMode::Block, Some(Arc::new(bridge.clone()))).await;
        let there = GroupManager::new("default", 8, BroadcastMode::Block, Some(Arc::new(bridge))).await;
        let (mut peer, c) = client();
        there.join(&c, "room").await;
        here.ensure("room", 8).await;
        assert!(there.get("room").await.unwrap().is_bridged());

        here.publish("room", Frame::Text("hi".into())).await.unwrap();

        assert_eq!(peer.recv().await, Some(Frame::Text("hi".into())));
    }

    #[tokio::test]
    async fn test_shutdown_clears_groups() {
        let manager = GroupManager::new("default", 8, BroadcastMode::Block, None).await;
        let group = manager.ensure("a", 8).await;
        manager.shutdown().await;
        assert!(manager.is_empty().await);

        // the broadcaster is gone, so the feed eventually closes
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            group.broadcast(Frame::Text("m".into())).await,
            Err(GroupError::Closed("a".into()))
        );
    }
}
