//! Client-side realtime transport over websockets.
//!
//! The crate is organized by layer:
//! - `connection`: the connection collaborator a transport reports into.
//! - `transport`: duplex socket client, envelope decoding, and the
//!   websocket transport that ties them to a connection.
//! - `error`: shared error taxonomy.

/// Connection trait and a channel-backed implementation.
pub mod connection;
/// Transport and socket error types.
pub mod error;
/// Duplex socket client and websocket transport.
pub mod transport;

pub use connection::{BasicConnection, Connection, ConnectionEvent, HandlerError};
pub use error::TransportError;
pub use transport::socket::{ChannelBinding, DuplexSocketClient};
pub use transport::state::ConnectionState;
pub use transport::websocket::RealtimeTransport;
pub use transport::ClientTransport;
