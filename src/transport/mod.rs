//! Realtime transport modules.
//!
//! - `address`: logical-to-physical address rewriting.
//! - `state`: channel lifecycle and derived websocket state.
//! - `envelope`: inbound envelope schema.
//! - `socket`: duplex websocket client with its channel worker.
//! - `websocket`: session orchestration and envelope decoding.

use std::future::Future;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::TransportError;

/// Address schemes and rewriting.
pub mod address;
/// Envelope protocol messages.
pub mod envelope;
/// Duplex websocket client.
pub mod socket;
/// Channel lifecycle and websocket state.
pub mod state;
/// Websocket transport for a [`Connection`].
pub mod websocket;

/// Contract a connection manager drives a transport through.
pub trait ClientTransport: Send + Sync {
    /// Connects on behalf of `connection` and resolves once the channel is
    /// open.
    fn start<C: Connection>(
        &self,
        connection: Arc<C>,
        connection_data: Option<&str>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sends `data`. Replies arrive through the connection's receive
    /// callback, so the result is always `T::default()`.
    fn send<C: Connection, T: Default>(
        &self,
        connection: &C,
        data: &str,
    ) -> impl Future<Output = Result<T, TransportError>> + Send;

    /// Tears down the active session, if any.
    fn stop<C: Connection>(&self, connection: &C) -> impl Future<Output = ()> + Send;
}
