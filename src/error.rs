//! Error taxonomy shared by the socket client and the transport.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::connection::HandlerError;
use crate::transport::envelope::EnvelopeError;
use crate::transport::state::ConnectionState;

/// Errors produced by the duplex channel, the transport, and envelope
/// decoding.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Address scheme is not one of `ws`, `wss`, `http`, or `https`, or the
    /// address could not be parsed.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Websocket handshake or transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Subprotocol could not be converted to a valid HTTP header value.
    #[error("invalid subprotocol header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// Channel did not report opened within the binding's open timeout.
    #[error("channel did not open within {0:?}")]
    OpenTimeout(Duration),

    /// Close handshake did not finish within the binding's close timeout.
    #[error("close handshake did not finish within {0:?}")]
    CloseTimeout(Duration),

    /// Operation requires an open channel.
    #[error("channel is not open (state: {0:?})")]
    NotOpen(ConnectionState),

    /// `open` was called on a client whose channel already exists.
    #[error("channel has already been opened")]
    AlreadyOpened,

    /// Transport has no active session.
    #[error("transport has not been started")]
    NotStarted,

    /// Channel worker stopped before answering a command.
    #[error("channel worker has stopped")]
    ChannelClosed,

    /// Channel closed while the session was still started.
    #[error("connection to the server was lost")]
    ConnectionLost,

    /// Inbound frame could not be decoded as an envelope.
    #[error("envelope decode error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// A receive callback rejected a message.
    #[error("receive handler failed: {0}")]
    Handler(#[source] HandlerError),
}

impl TransportError {
    pub(crate) fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }
}
