//! Frame transport
//!
//! The connection handler reads [`Frame`]s from a [`FrameSource`] and the
//! client writes them to a [`FrameSink`]. The production implementation wraps
//! a `tokio-tungstenite` stream; [`memory`] provides an in-process pair for
//! driving connections without a socket.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    tungstenite::{
        self,
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderName, HeaderValue, StatusCode},
        protocol::{frame::coding::CloseCode, CloseFrame},
    },
    WebSocketStream,
};

use crate::error::TransportError;
use crate::hooks::{HandshakeRejection, ServerHooks};

/// Close reason sent when the server drops a client
pub const SERVER_CLOSE_REASON: &str = "closing connection from server";

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 data frame
    Text(String),
    /// Binary data frame
    Binary(Vec<u8>),
    /// Ping control frame
    Ping(Vec<u8>),
    /// Pong control frame
    Pong(Vec<u8>),
    /// Close control frame
    Close(Option<CloseReason>),
}

impl Frame {
    /// Payload of a data frame
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Frame::Text(text) => Some(text.as_bytes()),
            Frame::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Status code and reason of a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// RFC6455 status code
    pub code: u16,
    /// Human-readable reason
    pub reason: String,
}

impl CloseReason {
    /// Normal closure (1000)
    #[must_use]
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: 1000,
            reason: reason.into(),
        }
    }
}

/// Read half of a connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the peer has gone away
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Whether the transport queues a pong for every ping it reads
    ///
    /// When `false` the connection handler writes the pong itself.
    fn answers_pings(&self) -> bool {
        false
    }
}

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Finish the close handshake and release the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

fn into_ws(frame: Frame) -> tungstenite::Message {
    match frame {
        Frame::Text(text) => tungstenite::Message::Text(text.into()),
        Frame::Binary(bytes) => tungstenite::Message::Binary(bytes.into()),
        Frame::Ping(bytes) => tungstenite::Message::Ping(bytes.into()),
        Frame::Pong(bytes) => tungstenite::Message::Pong(bytes.into()),
        Frame::Close(reason) => tungstenite::Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

fn from_ws(message: tungstenite::Message) -> Option<Frame> {
    Some(match message {
        tungstenite::Message::Text(text) => Frame::Text(text.to_string()),
        tungstenite::Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
        tungstenite::Message::Ping(bytes) => Frame::Ping(bytes.to_vec()),
        tungstenite::Message::Pong(bytes) => Frame::Pong(bytes.to_vec()),
        tungstenite::Message::Close(frame) => Frame::Close(frame.map(|f| CloseReason {
            code: u16::from(f.code),
            reason: f.reason.to_string(),
        })),
        // raw frames are only produced when writing
        tungstenite::Message::Frame(_) => return None,
    })
}

/// Read half of an upgraded WebSocket stream
pub struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(message) => {
                    if let Some(frame) = from_ws(message) {
                        return Some(Ok(frame));
                    }
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    /// tungstenite replies to pings while reading
    fn answers_pings(&self) -> bool {
        true
    }
}

/// Write half of an upgraded WebSocket stream
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, tungstenite::Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(into_ws(frame)).await.map_err(Into::into)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await.map_err(TransportError::from) {
            Ok(()) | Err(TransportError::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn rejection_response(rejection: HandshakeRejection) -> ErrorResponse {
    let status = StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::FORBIDDEN);
    let mut response = ErrorResponse::new(Some(rejection.reason));
    *response.status_mut() = status;
    response
}

fn run_handshake_hooks(
    hooks: &dyn ServerHooks,
    request: &Request,
    mut response: Response,
) -> Result<Response, HandshakeRejection> {
    let host = request
        .headers()
        .get(tungstenite::http::header::HOST)
        .map(HeaderValue::as_bytes)
        .unwrap_or_default();
    hooks.on_host(host)?;

    for (name, value) in request.headers() {
        hooks.on_header(name.as_str(), value.as_bytes())?;
    }

    for (name, value) in hooks.on_before_upgrade()? {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid upgrade response header"),
        }
    }

    Ok(response)
}

/// Perform the server side of the WebSocket handshake
///
/// The handshake hooks run against the upgrade request; the first hook that
/// fails rejects the upgrade with its HTTP status.
pub async fn accept<S>(
    stream: S,
    hooks: Arc<dyn ServerHooks>,
) -> Result<(WsSource<S>, WsSink<S>), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let callback = move |request: &Request, response: Response| {
        run_handshake_hooks(hooks.as_ref(), request, response).map_err(|rejection| {
            tracing::info!(status = rejection.status, reason = %rejection.reason, "Upgrade rejected");
            rejection_response(rejection)
        })
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (sink, source) = ws.split();

    Ok((WsSource { inner: source }, WsSink { inner: sink }))
}

/// In-process transport for driving connections without a socket
pub mod memory {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{Frame, FrameSink, FrameSource};
    use crate::error::TransportError;
    use crate::message::Message;

    /// Create a connected peer, source and sink
    ///
    /// Frames sent through the peer are read from the source; frames written
    /// to the sink are received by the peer.
    #[must_use]
    pub fn pair() -> (MemoryPeer, MemorySource, MemorySink) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));

        let peer = MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            closes: closes.clone(),
        };
        let source = MemorySource { inbound: inbound_rx };
        let sink = MemorySink {
            outbound: outbound_tx,
            closes,
        };

        (peer, source, sink)
    }

    /// The remote end of an in-process connection
    pub struct MemoryPeer {
        inbound: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
        outbound: mpsc::UnboundedReceiver<Frame>,
        closes: Arc<AtomicUsize>,
    }

    impl MemoryPeer {
        /// Deliver a frame to the server
        pub fn send(&self, frame: Frame) {
            if let Some(tx) = &self.inbound {
                let _ = tx.send(Ok(frame));
            }
        }

        /// Deliver a text frame holding the JSON form of `message`
        pub fn send_message(&self, message: &Message) {
            if let Ok(text) = serde_json::to_string(message) {
                self.send(Frame::Text(text));
            }
        }

        /// Make the next read fail
        pub fn fail(&self, err: TransportError) {
            if let Some(tx) = &self.inbound {
                let _ = tx.send(Err(err));
            }
        }

        /// End the inbound stream as if the peer disconnected
        pub fn hang_up(&mut self) {
            self.inbound = None;
        }

        /// Next frame written by the server
        pub async fn recv(&mut self) -> Option<Frame> {
            self.outbound.recv().await
        }

        /// Next data frame written by the server, decoded as JSON
        pub async fn recv_message(&mut self) -> Option<Message> {
            loop {
                match self.recv().await? {
                    Frame::Text(text) => return serde_json::from_str(&text).ok(),
                    Frame::Binary(bytes) => return serde_json::from_slice(&bytes).ok(),
                    _ => continue,
                }
            }
        }

        /// Number of times the server closed the sink
        #[must_use]
        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    /// Read half of an in-process connection
    pub struct MemorySource {
        inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
            self.inbound.recv().await
        }
    }

    /// Write half of an in-process connection
    pub struct MemorySink {
        outbound: mpsc::UnboundedSender<Frame>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
            if self.closes.load(Ordering::SeqCst) > 0 {
                return Err(TransportError::Closed);
            }
            self.outbound.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_conversion() {
        let frame = Frame::Close(Some(CloseReason::normal(SERVER_CLOSE_REASON)));
        let back = from_ws(into_ws(frame.clone()));
        assert_eq!(back, Some(frame));
    }

    #[test]
    fn test_data_accessor() {
        assert_eq!(Frame::Text("hi".into()).data(), Some(&b"hi"[..]));
        assert_eq!(Frame::Ping(vec![1]).data(), None);
    }

    #[test]
    fn test_rejection_keeps_status() {
        let response = rejection_response(HandshakeRejection::new(401, "no token"));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("no token"));
    }

    #[tokio::test]
    async fn test_memory_pair_closes_once_then_refuses_writes() {
        let (mut peer, _source, mut sink) = memory::pair();
        sink.send_frame(Frame::Text("a".into())).await.unwrap();
        sink.close().await.unwrap();
        assert!(matches!(
            sink.send_frame(Frame::Text("b".into())).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(peer.recv().await, Some(Frame::Text("a".into())));
        assert_eq!(peer.close_count(), 1);
    }
}
