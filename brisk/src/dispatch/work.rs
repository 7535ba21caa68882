//! Work items submitted by connection handlers

use std::sync::Arc;

use async_trait::async_trait;

use super::WorkItem;
use crate::client::Client;
use crate::codec::Codec;
use crate::error::TransportError;
use crate::message::Message;
use crate::server::ServerHandle;

/// Runs `on_client_connected`
pub struct ClientConnectedWork {
    server: ServerHandle,
    client_id: String,
}

impl ClientConnectedWork {
    #[must_use]
    pub fn new(server: ServerHandle, client_id: String) -> Self {
        Self { server, client_id }
    }
}

#[async_trait]
impl WorkItem for ClientConnectedWork {
    fn id(&self) -> String {
        format!("client-connected:{}", self.client_id)
    }

    async fn execute(&self) {
        self.server
            .hooks()
            .on_client_connected(&self.server, &self.client_id)
            .await;
    }
}

/// Runs `on_client_authenticated`
pub struct ClientAuthenticatedWork {
    server: ServerHandle,
    client_id: String,
}

impl ClientAuthenticatedWork {
    #[must_use]
    pub fn new(server: ServerHandle, client_id: String) -> Self {
        Self { server, client_id }
    }
}

#[async_trait]
impl WorkItem for ClientAuthenticatedWork {
    fn id(&self) -> String {
        format!("client-authenticated:{}", self.client_id)
    }

    async fn execute(&self) {
        self.server
            .hooks()
            .on_client_authenticated(&self.server, &self.client_id)
            .await;
    }
}

/// Runs `on_message_received`
pub struct MessageReceivedWork {
    server: ServerHandle,
    client_id: String,
    message: Message,
}

impl MessageReceivedWork {
    #[must_use]
    pub fn new(server: ServerHandle, client_id: String, message: Message) -> Self {
        Self {
            server,
            client_id,
            message,
        }
    }
}

#[async_trait]
impl WorkItem for MessageReceivedWork {
    fn id(&self) -> String {
        format!("message-received:{}:{}", self.client_id, self.message.event)
    }

    async fn execute(&self) {
        self.server
            .hooks()
            .on_message_received(&self.server, &self.client_id, &self.message)
            .await;
    }
}

/// Runs `on_client_disconnected`
pub struct ClientDisconnectedWork {
    server: ServerHandle,
    client_id: String,
    error: Option<TransportError>,
}

impl ClientDisconnectedWork {
    #[must_use]
    pub fn new(server: ServerHandle, client_id: String, error: Option<TransportError>) -> Self {
        Self {
            server,
            client_id,
            error,
        }
    }
}

#[async_trait]
impl WorkItem for ClientDisconnectedWork {
    fn id(&self) -> String {
        format!("client-disconnected:{}", self.client_id)
    }

    async fn execute(&self) {
        self.server
            .hooks()
            .on_client_disconnected(&self.server, &self.client_id, self.error.as_ref())
            .await;
    }
}

/// Encodes a message and writes it to one client
pub struct ReplyWork {
    client: Arc<Client>,
    codec: Arc<dyn Codec>,
    message: Message,
}

impl ReplyWork {
    #[must_use]
    pub fn new(client: Arc<Client>, codec: Arc<dyn Codec>, message: Message) -> Self {
        Self {
            client,
            codec,
            message,
        }
    }
}

#[async_trait]
impl WorkItem for ReplyWork {
    fn id(&self) -> String {
        format!("reply:{}:{}", self.client.id(), self.message.event)
    }

    async fn execute(&self) {
        let frame = match self.codec.encode(&self.message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(client_id = %self.client.id(), error = %e, "Could not encode reply");
                return;
            }
        };

        if let Err(e) = self.client.send(frame).await {
            tracing::debug!(client_id = %self.client.id(), error = %e, "Reply not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::transport::memory;

    #[tokio::test]
    async fn test_reply_work_writes_encoded_message() {
        let (mut peer, _source, sink) = memory::pair();
        let client = Client::connect(Box::new(sink), 4, None);

        let work = ReplyWork::new(client, Arc::new(JsonCodec), Message::ack(200, "ok"));
        assert!(work.id().starts_with("reply:"));
        work.execute().await;

        assert_eq!(peer.recv_message().await, Some(Message::ack(200, "ok")));
    }
}
