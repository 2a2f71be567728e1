//! Chat room connections.
//!
//! A chat connection couples a [`Transport`] (normally a WebSocket) with a
//! subscriber joined to the room's topic. [`run_chat_connection`] drives
//! both directions from one task:
//!
//! - inbound text frames are parsed, admitted and published to the room
//! - messages arriving in the mailbox are rendered and written out
//!
//! The subscriber is deregistered by the [`ChatSession`] guard when the
//! loop ends, including when the task running it is aborted.
//!
//! A session bound to a token with [`ChatSession::bind_token`] re-verifies
//! that token before every publish and every delivery, so logging out or
//! logging in elsewhere ends the connection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::broadcast::TopicRegistry;
use crate::session::SessionVerifier;
use crate::subscriber::{Mailbox, Subscriber};
use crate::types::{admit, ChatSubmission};

/// A frame read from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Transport failures. Neither variant is retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// A bidirectional, message-oriented connection to one client.
#[async_trait]
pub trait Transport: Send {
    /// Reads the next frame.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a frame.
    async fn read_message(&mut self) -> Result<Frame, TransportError>;

    /// Writes one text frame.
    async fn write_message(&mut self, text: String) -> Result<(), TransportError>;

    /// Closes the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl Transport for WebSocket {
    async fn read_message(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.recv().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(Frame::Text(text.as_str().to_owned())),
                Some(Ok(WsMessage::Binary(data))) => return Ok(Frame::Binary(data.to_vec())),
                Some(Ok(WsMessage::Close(_))) => return Ok(Frame::Close),
                // axum answers pings itself.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Err(err)) => return Err(TransportError::Io(err.to_string())),
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn write_message(&mut self, text: String) -> Result<(), TransportError> {
        self.send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.send(WsMessage::Close(None))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }
}

/// A subscriber joined to one room, disconnected when dropped.
pub struct ChatSession {
    registry: TopicRegistry,
    subscriber: Arc<Subscriber>,
    room: String,
    binding: Option<TokenBinding>,
}

struct TokenBinding {
    verifier: SessionVerifier,
    token: String,
}

impl ChatSession {
    /// Registers `username` as a subscriber and joins it to `room`.
    pub fn open(registry: &TopicRegistry, username: &str, room: &str) -> (Self, Mailbox) {
        let (subscriber, mailbox) = registry.create_subscriber(username);
        registry.join(&subscriber, room);
        info!(
            subscriber_id = %subscriber.id(),
            username = %username,
            room = %room,
            "Chat client joined room"
        );
        (
            Self {
                registry: registry.clone(),
                subscriber,
                room: room.to_string(),
                binding: None,
            },
            mailbox,
        )
    }

    /// Ties the session to the token presented when connecting. Once that
    /// token is revoked or replaced the connection ends.
    #[must_use]
    pub fn bind_token(mut self, verifier: SessionVerifier, token: impl Into<String>) -> Self {
        self.binding = Some(TokenBinding {
            verifier,
            token: token.into(),
        });
        self
    }

    /// Returns `false` once a bound token no longer verifies. Unbound
    /// sessions are always live.
    pub fn is_live(&self) -> bool {
        self.binding
            .as_ref()
            .map_or(true, |b| b.verifier.verify_token(self.username(), &b.token))
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    pub fn username(&self) -> &str {
        self.subscriber.username()
    }

    pub fn room(&self) -> &str {
        &self.room
    }
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("subscriber", &self.subscriber)
            .field("room", &self.room)
            .field("token_bound", &self.binding.is_some())
            .finish()
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.registry.disconnect(&self.subscriber);
        info!(
            subscriber_id = %self.subscriber.id(),
            room = %self.room,
            "Chat client left room"
        );
    }
}

/// Why a chat connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The client closed the connection.
    ClientClosed,

    /// The client sent a binary frame or a text frame that is not a chat
    /// submission.
    InvalidFrame,

    /// The subscriber was closed by the server (shutdown or backpressure).
    Disconnected,

    /// The session token the connection was opened with was revoked or
    /// replaced by a newer login.
    SessionRevoked,

    /// Reading or writing failed.
    TransportFailed(String),
}

/// Runs a chat connection until either side ends it.
///
/// Submissions that fail admission are dropped without telling the client;
/// the connection stays open.
pub async fn run_chat_connection<T: Transport>(
    mut transport: T,
    session: ChatSession,
    mut mailbox: Mailbox,
) -> ConnectionEnd {
    let username = session.username().to_string();
    let room = session.room().to_string();

    let end = loop {
        tokio::select! {
            frame = transport.read_message() => match frame {
                Ok(Frame::Text(text)) => {
                    if !session.is_live() {
                        info!(username = %username, room = %room, "Session revoked, closing chat connection");
                        break ConnectionEnd::SessionRevoked;
                    }
                    let submission = match serde_json::from_str::<ChatSubmission>(&text) {
                        Ok(submission) => submission,
                        Err(err) => {
                            debug!(username = %username, error = %err, "Malformed chat frame");
                            break ConnectionEnd::InvalidFrame;
                        }
                    };
                    match admit(submission, &username, &room) {
                        Ok(message) => {
                            session.registry.publish(message);
                        }
                        Err(err) => {
                            debug!(username = %username, room = %room, reason = %err, "Dropped chat message");
                        }
                    }
                }
                Ok(Frame::Binary(data)) => {
                    debug!(username = %username, len = data.len(), "Binary chat frame");
                    break ConnectionEnd::InvalidFrame;
                }
                Ok(Frame::Close) | Err(TransportError::Closed) => break ConnectionEnd::ClientClosed,
                Err(TransportError::Io(err)) => break ConnectionEnd::TransportFailed(err),
            },
            message = mailbox.poll_message() => match message {
                Some(message) => {
                    if !session.is_live() {
                        info!(username = %username, room = %room, "Session revoked, closing chat connection");
                        break ConnectionEnd::SessionRevoked;
                    }
                    trace!(username = %username, "Writing chat message");
                    if let Err(err) = transport.write_message(message.body().to_html_fragment()).await {
                        break ConnectionEnd::TransportFailed(err.to_string());
                    }
                }
                None => break ConnectionEnd::Disconnected,
            },
        }
    };

    drop(session);
    if !matches!(end, ConnectionEnd::ClientClosed) {
        if let Err(err) = transport.close().await {
            trace!(error = %err, "Close after chat connection end failed");
        }
    }
    debug!(username = %username, room = %room, end = ?end, "Chat connection finished");
    end
}

/// In-memory [`Transport`] backed by channels.
#[derive(Debug)]
pub struct ChannelTransport {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

/// The client side of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelPeer {
    to_server: mpsc::UnboundedSender<Frame>,
    from_server: mpsc::UnboundedReceiver<String>,
}

/// Creates a connected transport and peer.
pub fn channel_transport() -> (ChannelTransport, ChannelPeer) {
    let (to_server, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_server) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            incoming,
            outgoing: Some(outgoing),
        },
        ChannelPeer {
            to_server,
            from_server,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn read_message(&mut self) -> Result<Frame, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Closed)
    }

    async fn write_message(&mut self, text: String) -> Result<(), TransportError> {
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        outgoing.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outgoing = None;
        Ok(())
    }
}

impl ChannelPeer {
    /// Sends a frame to the server. Returns `false` if the server side is
    /// gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.to_server.send(frame).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Waits for the next text written by the server. `None` once the
    /// server has closed the connection.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_server.recv().await
    }

    /// Returns already-written text without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.from_server.try_recv().ok()
    }
}
