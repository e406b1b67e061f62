use thiserror::Error;

use crate::connection::ConnError;

/// Boxed error raised by consumer-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the session, subscription and transaction APIs.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Dial, TLS, WebSocket handshake or CONNECT negotiation failed
    #[error("connection error: {0}")]
    Connection(ConnError),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid ack mode '{0}', expected one of auto, client, client-individual")]
    InvalidAckMode(String),

    #[error("message is required")]
    NilMessage,

    /// The subscription's channel closed or it became inactive
    #[error("subscription completed")]
    SubscriptionCompleted,

    /// A listener or error listener returned an error
    #[error("listener error: {0}")]
    Listener(BoxError),

    /// Pass-through failure from the protocol engine or transport
    #[error(transparent)]
    Transport(#[from] ConnError),

    /// `read()` was called on a subscription driven by a listener
    #[error("subscription has a listener attached; messages are pushed to it")]
    ListenerAttached,

    #[error("json error: {0}")]
    Json(String),
}

impl SessionError {
    /// `true` for errors raised before any network interaction.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected
                | SessionError::AlreadyConnected
                | SessionError::InvalidAckMode(_)
                | SessionError::NilMessage
                | SessionError::ListenerAttached
        )
    }
}
