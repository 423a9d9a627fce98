//! Connection collaborator used by transports.
//!
//! A transport never owns connection identity or cursor state. It borrows a
//! [`Connection`] for the lifetime of a session, pushes received messages
//! into it, and updates its cursor and group membership.

use std::error::Error;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::error::TransportError;

/// Error returned by a receive callback.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// State and callbacks a transport needs from its owning connection.
///
/// Implementations use interior mutability; the transport shares the
/// connection with its channel dispatcher task.
pub trait Connection: Send + Sync + 'static {
    /// Base URL the transport appends its query string to.
    fn url(&self) -> &str;

    /// Client identifier sent as `clientId`.
    fn client_id(&self) -> &str;

    /// Cursor into the server's message stream, unset until the first frame.
    fn message_id(&self) -> Option<i64>;

    /// Replaces the cursor with the value the server reported.
    fn set_message_id(&self, message_id: i64);

    /// Current group membership.
    fn groups(&self) -> Vec<String>;

    /// Replaces the group membership wholesale.
    fn set_groups(&self, groups: Vec<String>);

    /// Handles one application message.
    fn on_received(&self, message: &str) -> Result<(), HandlerError>;

    /// Observes a transport or decode failure.
    fn on_error(&self, error: TransportError);
}

/// Events produced by a [`BasicConnection`].
#[derive(Debug)]
pub enum ConnectionEvent {
    Received(String),
    Error(TransportError),
}

/// Channel-backed [`Connection`].
///
/// Received messages and errors are forwarded to the receiver returned by
/// [`BasicConnection::new`].
#[derive(Debug)]
pub struct BasicConnection {
    url: String,
    client_id: String,
    message_id: RwLock<Option<i64>>,
    groups: RwLock<Vec<String>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl BasicConnection {
    /// Creates a connection for `url` and the receiver its events go to.
    pub fn new(
        url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            url: url.into(),
            client_id: client_id.into(),
            message_id: RwLock::new(None),
            groups: RwLock::new(Vec::new()),
            events,
        });
        (connection, events_rx)
    }
}

impl Connection for BasicConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn message_id(&self) -> Option<i64> {
        self.message_id.read().map(|guard| *guard).unwrap_or(None)
    }

    fn set_message_id(&self, message_id: i64) {
        if let Ok(mut guard) = self.message_id.write() {
            *guard = Some(message_id);
        }
    }

    fn groups(&self) -> Vec<String> {
        self.groups
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn set_groups(&self, groups: Vec<String>) {
        if let Ok(mut guard) = self.groups.write() {
            *guard = groups;
        }
    }

    fn on_received(&self, message: &str) -> Result<(), HandlerError> {
        self.events
            .send(ConnectionEvent::Received(message.to_string()))
            .map_err(|_| "connection event receiver has been dropped".into())
    }

    fn on_error(&self, error: TransportError) {
        let _ = self.events.send(ConnectionEvent::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_and_groups_start_empty_and_are_replaced() {
        let (connection, _events) = BasicConnection::new("http://h/", "c1");
        assert_eq!(connection.message_id(), None);
        assert!(connection.groups().is_empty());

        connection.set_message_id(4);
        connection.set_groups(vec!["a".to_string(), "b".to_string()]);
        connection.set_groups(vec!["c".to_string()]);

        assert_eq!(connection.message_id(), Some(4));
        assert_eq!(connection.groups(), vec!["c".to_string()]);
    }

    #[test]
    fn received_messages_and_errors_are_forwarded() {
        let (connection, mut events) = BasicConnection::new("http://h/", "c1");
        connection.on_received("hello").expect("receiver alive");
        connection.on_error(TransportError::NotStarted);

        assert!(matches!(
            events.try_recv(),
            Ok(ConnectionEvent::Received(text)) if text == "hello"
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(ConnectionEvent::Error(TransportError::NotStarted))
        ));
    }

    #[test]
    fn on_received_fails_once_receiver_is_dropped() {
        let (connection, events) = BasicConnection::new("http://h/", "c1");
        drop(events);
        assert!(connection.on_received("lost").is_err());
    }
}
