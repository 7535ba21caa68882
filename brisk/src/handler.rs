//! Per-connection protocol state machine
//!
//! One [`ConnectionHandler`] owns the read half of one connection and walks it
//! through its phases:
//!
//! ```text
//! Connecting -> Unauthenticated -> Authenticated -> Closing -> Closed
//! ```
//!
//! The read loop decides protocol actions only. Hooks, encoding of replies
//! and acknowledgements go to the dispatcher as work items, so a slow hook
//! never holds up reads on the socket. Control frames are answered inline,
//! except pings on transports that answer them on their own.
//!
//! Decode failures are reported to the client with an `error` message
//! (code 400) and the loop keeps reading. A failed authentication is reported
//! with code 401 and ends the connection. Teardown runs exactly once, whatever
//! ended the loop.

use std::sync::Arc;

use crate::client::Client;
use crate::dispatch::{
    submit_or_log, submit_or_spawn, ClientAuthenticatedWork, ClientConnectedWork,
    MessageReceivedWork, ReplyWork,
};
use crate::error::TransportError;
use crate::hooks::AuthOutcome;
use crate::message::Message;
use crate::server::ServerHandle;
use crate::transport::{Frame, FrameSource};

/// Reply text for a failed authentication
pub const AUTH_FAILED_MESSAGE: &str = "could not authenticate client";

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Upgraded, not yet registered
    Connecting,
    /// Registered as pending
    Unauthenticated,
    /// Messages are delivered to the application
    Authenticated,
    /// The loop has ended and teardown is running
    Closing,
    /// Removed from the registry and transport closed
    Closed,
}

enum Step {
    Continue,
    Stop,
}

/// Drives one connection from registration to removal
pub struct ConnectionHandler<S> {
    server: ServerHandle,
    client: Arc<Client>,
    source: S,
    phase: ConnectionPhase,
    read_error: Option<TransportError>,
}

impl<S: FrameSource> ConnectionHandler<S> {
    #[must_use]
    pub fn new(server: ServerHandle, client: Arc<Client>, source: S) -> Self {
        Self {
            server,
            client,
            source,
            phase: ConnectionPhase::Connecting,
            read_error: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Register, read until the connection ends, then tear down
    pub async fn run(mut self) -> ConnectionPhase {
        if self.register().await {
            self.read_loop().await;
        }
        self.teardown().await;
        self.phase
    }

    async fn register(&mut self) -> bool {
        let state = self.server.state();
        let id = self.client.id();

        if !state.hub().add(self.client.clone()).await {
            tracing::error!(client_id = %id, "Could not register client");
            return false;
        }
        self.phase = ConnectionPhase::Unauthenticated;

        if !state.auth_required() {
            // without authentication every connection is active under its own id
            if let Err(e) = state.hub().authenticate(&id, &id).await {
                tracing::error!(client_id = %id, error = %e, "Could not activate client");
                return false;
            }
            let default_group = state.groups().default_group().clone();
            if state.groups().join(&self.client, default_group).await.is_none() {
                // removed by the server before the read loop started
                return false;
            }
            self.phase = ConnectionPhase::Authenticated;
        }

        submit_or_spawn(
            state.dispatcher(),
            Box::new(ClientConnectedWork::new(self.server.clone(), id)),
        );
        true
    }

    async fn read_loop(&mut self) {
        while let Some(next) = self.source.next_frame().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(client_id = %self.client.id(), error = %e, "Read failed");
                    self.read_error = Some(e);
                    break;
                }
            };

            if let Step::Stop = self.handle_frame(frame).await {
                break;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Step {
        match frame {
            Frame::Close(reason) => {
                tracing::debug!(client_id = %self.client.id(), ?reason, "Close received");
                self.phase = ConnectionPhase::Closing;
                // the transport may already have answered
                let _ = self.client.send(Frame::Close(reason)).await;
                Step::Stop
            }
            Frame::Ping(_) if self.source.answers_pings() => Step::Continue,
            Frame::Ping(data) => match self.client.send(Frame::Pong(data)).await {
                Ok(()) => Step::Continue,
                Err(e) => {
                    self.read_error = Some(e);
                    Step::Stop
                }
            },
            Frame::Pong(_) => Step::Continue,
            Frame::Text(text) => self.handle_data(text.as_bytes()).await,
            Frame::Binary(bytes) => self.handle_data(&bytes).await,
        }
    }

    async fn handle_data(&mut self, bytes: &[u8]) -> Step {
        let state = self.server.state();

        let message = match state.codec().decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(client_id = %self.client.id(), error = %e, "Undecodable message");
                self.reply(Message::error(400, e.to_string()));
                return Step::Continue;
            }
        };

        if state.auth_required() && !self.client.is_authenticated() {
            return self.authenticate(message).await;
        }

        submit_or_log(
            state.dispatcher(),
            Box::new(MessageReceivedWork::new(
                self.server.clone(),
                self.client.id(),
                message,
            )),
        );
        if state.config().server.send_acknowledgement {
            self.reply(Message::ack(200, "ok"));
        }
        Step::Continue
    }

    async fn authenticate(&mut self, message: Message) -> Step {
        let state = self.server.state();
        let old_id = self.client.id();

        let outcome = match state.authenticator() {
            Some(authenticator) => {
                let attempt = authenticator.authenticate(&old_id, &message);
                tokio::time::timeout(state.config().server.auth_timeout(), attempt)
                    .await
                    .unwrap_or_else(|_| AuthOutcome::reject("authentication timed out"))
            }
            None => AuthOutcome::reject("no authenticator configured"),
        };

        let new_id = match outcome {
            AuthOutcome::Accepted { client_id } => client_id,
            AuthOutcome::Rejected { reason } => {
                tracing::info!(client_id = %old_id, %reason, "Authentication rejected");
                return self.reject_authentication().await;
            }
        };

        if let Err(e) = state.hub().authenticate(&old_id, &new_id).await {
            tracing::warn!(client_id = %old_id, error = %e, "Authentication could not be applied");
            return self.reject_authentication().await;
        }
        self.phase = ConnectionPhase::Authenticated;

        let group = message
            .payload_str("group")
            .map(Into::into)
            .unwrap_or_else(|| state.groups().default_group().clone());
        if state.groups().join(&self.client, group).await.is_none() {
            self.phase = ConnectionPhase::Closing;
            return Step::Stop;
        }

        submit_or_log(
            state.dispatcher(),
            Box::new(ClientAuthenticatedWork::new(self.server.clone(), new_id)),
        );
        Step::Continue
    }

    /// Tell the client why it is being dropped, ahead of the close frame
    async fn reject_authentication(&mut self) -> Step {
        self.phase = ConnectionPhase::Closing;
        match self.server.state().codec().encode(&Message::error(401, AUTH_FAILED_MESSAGE)) {
            Ok(frame) => {
                if let Err(e) = self.client.send(frame).await {
                    tracing::debug!(client_id = %self.client.id(), error = %e, "Could not send rejection");
                }
            }
            Err(e) => tracing::error!(error = %e, "Could not encode rejection"),
        }
        Step::Stop
    }

    fn reply(&self, message: Message) {
        let state = self.server.state();
        submit_or_log(
            state.dispatcher(),
            Box::new(ReplyWork::new(
                self.client.clone(),
                state.codec().clone(),
                message,
            )),
        );
    }

    async fn teardown(&mut self) {
        self.phase = ConnectionPhase::Closing;
        let removed = self
            .server
            .remove_client(&self.client, self.read_error.take())
            .await;

        if !removed {
            // never registered: release the transport directly
            if let Some(sink) = self.client.take_transport() {
                Client::close_transport(&sink).await;
            }
        }
        self.phase = ConnectionPhase::Closed;
        tracing::debug!(client_id = %self.client.id(), "Connection closed");
    }
}
