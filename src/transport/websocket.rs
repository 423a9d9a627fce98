//! Websocket transport for a [`Connection`].
//!
//! `RealtimeTransport` builds the connect URL, owns one
//! [`DuplexSocketClient`] per session, and decodes every inbound frame as an
//! [`Envelope`]: batched messages go to the connection's receive callback,
//! then the cursor and group membership are updated.
//!
//! `start` and `stop` serialize on one lock. `send` does not take it, so a
//! caller must not send once `stop` has begun.

use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::transport::envelope::{message_text, Envelope, EnvelopeError};
use crate::transport::socket::{ChannelBinding, DuplexSocketClient, SocketSender};
use crate::transport::state::ConnectionState;
use crate::transport::ClientTransport;

/// Value of the `transport` query parameter.
pub const TRANSPORT_NAME: &str = "webSockets";
/// Query key carrying the opaque connection data.
pub const CONNECTION_DATA_KEY: &str = "connectionData";
/// Query key naming the transport.
pub const TRANSPORT_KEY: &str = "transport";
/// Query key carrying the connection's client id.
pub const CLIENT_ID_KEY: &str = "clientId";

/// Session phase of a [`RealtimeTransport`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransportPhase {
    #[default]
    Idle,
    Starting,
    Started,
    Stopping,
}

#[derive(Debug, Default)]
struct SessionWatch {
    started: bool,
    closed: bool,
    reported: bool,
}

impl SessionWatch {
    fn take_report(&mut self) -> bool {
        if self.started && self.closed && !self.reported {
            self.reported = true;
            return true;
        }
        false
    }
}

/// Ties a client's close notification to the session that owns it.
///
/// A loss is reported once, when the channel has closed while the session
/// is started, whichever of the two is observed last.
#[derive(Clone, Debug, Default)]
struct SessionLink(Arc<StdMutex<SessionWatch>>);

impl SessionLink {
    fn mark_closed(&self) -> bool {
        self.update(|watch| {
            watch.closed = true;
            watch.take_report()
        })
    }

    fn mark_started(&self) -> bool {
        self.update(|watch| {
            watch.started = true;
            watch.take_report()
        })
    }

    /// Stops reporting for a session that is being torn down on purpose.
    fn detach(&self) {
        self.update(|watch| {
            watch.started = false;
            false
        });
    }

    fn update(&self, apply: impl FnOnce(&mut SessionWatch) -> bool) -> bool {
        self.0
            .lock()
            .map(|mut watch| apply(&mut watch))
            .unwrap_or(false)
    }
}

#[derive(Debug)]
struct ActiveSession {
    client: DuplexSocketClient,
    link: SessionLink,
}

/// Websocket implementation of [`ClientTransport`].
#[derive(Debug)]
pub struct RealtimeTransport {
    binding: ChannelBinding,
    session: Mutex<Option<ActiveSession>>,
    sender: RwLock<Option<SocketSender>>,
    phase: RwLock<TransportPhase>,
}

impl Default for RealtimeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeTransport {
    /// Creates an idle transport with the default [`ChannelBinding`].
    pub fn new() -> Self {
        Self::with_binding(ChannelBinding::default())
    }

    /// Creates a transport whose sessions use `binding`.
    ///
    /// Transport security is always derived from the connection URL.
    pub fn with_binding(binding: ChannelBinding) -> Self {
        Self {
            binding,
            session: Mutex::new(None),
            sender: RwLock::new(None),
            phase: RwLock::new(TransportPhase::Idle),
        }
    }

    /// Binding applied to every session this transport opens.
    pub fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    /// Current session phase.
    pub fn phase(&self) -> TransportPhase {
        self.phase.read().map(|guard| *guard).unwrap_or_default()
    }

    /// Websocket state of the active session, `None` when idle.
    pub fn state(&self) -> ConnectionState {
        self.active_sender()
            .map(|sender| sender.state())
            .unwrap_or(ConnectionState::None)
    }

    fn set_phase(&self, phase: TransportPhase) {
        if let Ok(mut guard) = self.phase.write() {
            *guard = phase;
        }
    }

    fn active_sender(&self) -> Option<SocketSender> {
        self.sender
            .read()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }

    fn replace_sender(&self, sender: Option<SocketSender>) {
        if let Ok(mut guard) = self.sender.write() {
            *guard = sender;
        }
    }

    async fn open_session<C: Connection>(
        &self,
        connection: &Arc<C>,
        url: &str,
    ) -> Result<(ActiveSession, SocketSender), TransportError> {
        let mut client = DuplexSocketClient::new(url, self.binding.clone())?;
        let link = SessionLink::default();

        let receiver = Arc::clone(connection);
        client.set_on_message(move |response| process_response(receiver.as_ref(), &response));

        let watcher = Arc::clone(connection);
        let close_link = link.clone();
        client.set_on_close(move || {
            if close_link.mark_closed() {
                report_connection_lost(watcher.as_ref());
            }
        });

        client.open().await?;
        let sender = client.sender()?;
        Ok((ActiveSession { client, link }, sender))
    }
}

impl ClientTransport for RealtimeTransport {
    async fn start<C: Connection>(
        &self,
        connection: Arc<C>,
        connection_data: Option<&str>,
    ) -> Result<(), TransportError> {
        let url = build_connect_url(connection.url(), connection.client_id(), connection_data);

        let mut active = self.session.lock().await;
        self.set_phase(TransportPhase::Starting);
        self.replace_sender(None);
        // Dropping a previous client aborts its channel.
        if let Some(previous) = active.take() {
            previous.link.detach();
        }

        debug!(event = "transport_starting", url = %url);
        match self.open_session(&connection, &url).await {
            Ok((session, sender)) => {
                let link = session.link.clone();
                *active = Some(session);
                self.replace_sender(Some(sender));
                self.set_phase(TransportPhase::Started);
                debug!(event = "transport_started", client_id = connection.client_id());
                // The channel may already have closed while the phase was
                // still `Starting`.
                if link.mark_started() {
                    report_connection_lost(connection.as_ref());
                }
                Ok(())
            }
            Err(err) => {
                self.set_phase(TransportPhase::Idle);
                warn!(event = "transport_start_failed", error = %err);
                Err(err)
            }
        }
    }

    async fn send<C: Connection, T: Default>(
        &self,
        _connection: &C,
        data: &str,
    ) -> Result<T, TransportError> {
        let sender = self.active_sender().ok_or(TransportError::NotStarted)?;
        sender.send(data).await?;
        Ok(T::default())
    }

    async fn stop<C: Connection>(&self, _connection: &C) {
        let mut active = self.session.lock().await;
        let Some(mut session) = active.take() else {
            return;
        };

        self.set_phase(TransportPhase::Stopping);
        self.replace_sender(None);
        session.link.detach();
        session.client.dispose();
        drop(session);
        self.set_phase(TransportPhase::Idle);
        debug!(event = "transport_stopped");
    }
}

fn report_connection_lost<C: Connection + ?Sized>(connection: &C) {
    warn!(event = "connection_lost", client_id = connection.client_id());
    connection.on_error(TransportError::ConnectionLost);
}

/// Builds the connect URL for a session.
///
/// `connection_data` is included only when present and non-empty. Values are
/// form-urlencoded.
pub fn build_connect_url(base: &str, client_id: &str, connection_data: Option<&str>) -> String {
    let mut url = String::from(base);
    url.push('?');
    if let Some(data) = connection_data.filter(|data| !data.is_empty()) {
        push_query_pair(&mut url, CONNECTION_DATA_KEY, data);
        url.push('&');
    }
    push_query_pair(&mut url, TRANSPORT_KEY, TRANSPORT_NAME);
    url.push('&');
    push_query_pair(&mut url, CLIENT_ID_KEY, client_id);
    url
}

fn push_query_pair(url: &mut String, key: &str, value: &str) {
    url.push_str(key);
    url.push('=');
    url.extend(form_urlencoded::byte_serialize(value.as_bytes()));
}

/// Decodes one inbound frame into `connection`.
///
/// Failures are reported through [`Connection::on_error`]; a failing receive
/// callback does not stop the rest of the batch. The cursor is updated only
/// after the whole batch has been delivered.
pub fn process_response<C: Connection + ?Sized>(connection: &C, response: &str) {
    if connection.message_id().is_none() {
        connection.set_message_id(0);
    }

    let envelope = match Envelope::from_text(response) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return,
        Err(err) => {
            warn!(event = "envelope_decode_failed", error = %err);
            connection.on_error(err.into());
            return;
        }
    };

    let Some(messages) = envelope.messages.as_ref() else {
        return;
    };

    for message in messages {
        if let Err(err) = connection.on_received(&message_text(message)) {
            warn!(event = "message_handler_failed", error = %err);
            connection.on_error(TransportError::Handler(err));
        }
    }

    if let Err(err) = apply_envelope_state(connection, &envelope) {
        warn!(event = "envelope_state_invalid", error = %err);
        connection.on_error(err.into());
    }
}

fn apply_envelope_state<C: Connection + ?Sized>(
    connection: &C,
    envelope: &Envelope,
) -> Result<(), EnvelopeError> {
    connection.set_message_id(envelope.cursor()?);
    if let Some(groups) = envelope.groups()? {
        connection.set_groups(groups);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::connection::HandlerError;

    #[derive(Default)]
    struct RecordingConnection {
        message_id: StdMutex<Option<i64>>,
        groups: StdMutex<Vec<String>>,
        received: StdMutex<Vec<String>>,
        errors: StdMutex<Vec<String>>,
        reject: Option<String>,
    }

    impl RecordingConnection {
        fn rejecting(message: &str) -> Self {
            Self {
                reject: Some(message.to_string()),
                ..Self::default()
            }
        }

        fn received(&self) -> Vec<String> {
            self.received.lock().expect("received").clone()
        }

        fn errors(&self) -> Vec<String> {
            self.errors.lock().expect("errors").clone()
        }
    }

    impl Connection for RecordingConnection {
        fn url(&self) -> &str {
            "ftp://unsupported/"
        }

        fn client_id(&self) -> &str {
            "c1"
        }

        fn message_id(&self) -> Option<i64> {
            *self.message_id.lock().expect("message_id")
        }

        fn set_message_id(&self, message_id: i64) {
            *self.message_id.lock().expect("message_id") = Some(message_id);
        }

        fn groups(&self) -> Vec<String> {
            self.groups.lock().expect("groups").clone()
        }

        fn set_groups(&self, groups: Vec<String>) {
            *self.groups.lock().expect("groups") = groups;
        }

        fn on_received(&self, message: &str) -> Result<(), HandlerError> {
            if self.reject.as_deref() == Some(message) {
                return Err(format!("rejected {message}").into());
            }
            self.received
                .lock()
                .expect("received")
                .push(message.to_string());
            Ok(())
        }

        fn on_error(&self, error: TransportError) {
            self.errors.lock().expect("errors").push(error.to_string());
        }
    }

    #[test]
    fn connect_url_includes_connection_data_when_present() {
        assert_eq!(
            build_connect_url("http://h/", "c1", Some("X")),
            "http://h/?connectionData=X&transport=webSockets&clientId=c1"
        );
    }

    #[test]
    fn connect_url_omits_missing_or_empty_connection_data() {
        let expected = "http://h/?transport=webSockets&clientId=c1";
        assert_eq!(build_connect_url("http://h/", "c1", None), expected);
        assert_eq!(build_connect_url("http://h/", "c1", Some("")), expected);
    }

    #[test]
    fn connect_url_encodes_query_values() {
        assert_eq!(
            build_connect_url("ws://h/rt", "id 1", Some(r#"[{"name":"hub"}]"#)),
            "ws://h/rt?connectionData=%5B%7B%22name%22%3A%22hub%22%7D%5D&transport=webSockets&clientId=id+1"
        );
    }

    #[test]
    fn first_frame_initializes_cursor() {
        let connection = RecordingConnection::default();
        process_response(&connection, "{}");
        assert_eq!(connection.message_id(), Some(0));
    }

    #[test]
    fn heartbeat_leaves_state_untouched() {
        let connection = RecordingConnection::default();
        connection.set_message_id(7);
        connection.set_groups(vec!["g0".to_string()]);

        for frame in ["{}", "[]", "null"] {
            process_response(&connection, frame);
        }

        assert!(connection.received().is_empty());
        assert!(connection.errors().is_empty());
        assert_eq!(connection.message_id(), Some(7));
        assert_eq!(connection.groups(), vec!["g0".to_string()]);
    }

    #[test]
    fn batch_is_delivered_in_order_then_cursor_advances() {
        let connection = RecordingConnection::default();
        process_response(&connection, r#"{"Messages":["a","b"],"MessageId":5}"#);

        assert_eq!(connection.received(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(connection.message_id(), Some(5));
        assert!(connection.errors().is_empty());
    }

    #[test]
    fn structured_messages_are_forwarded_as_json() {
        let connection = RecordingConnection::default();
        process_response(
            &connection,
            r#"{"Messages":[{"H":"chat","A":[1,2]}],"MessageId":1}"#,
        );
        assert_eq!(connection.received(), vec![r#"{"H":"chat","A":[1,2]}"#.to_string()]);
    }

    #[test]
    fn failing_message_does_not_stop_the_batch() {
        let connection = RecordingConnection::rejecting("b");
        process_response(&connection, r#"{"Messages":["a","b","c","b"],"MessageId":9}"#);

        assert_eq!(connection.received(), vec!["a".to_string(), "c".to_string()]);
        let errors = connection.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|error| error.contains("rejected b")));
        assert_eq!(connection.message_id(), Some(9));
    }

    #[test]
    fn group_list_replaces_membership() {
        let connection = RecordingConnection::default();
        connection.set_groups(vec!["old".to_string(), "g1".to_string()]);

        process_response(
            &connection,
            r#"{"Messages":[],"MessageId":2,"TransportData":{"Groups":["g1","g2"]}}"#,
        );

        assert_eq!(connection.groups(), vec!["g1".to_string(), "g2".to_string()]);
        assert_eq!(connection.message_id(), Some(2));
    }

    #[test]
    fn envelope_without_messages_skips_cursor_and_groups() {
        let connection = RecordingConnection::default();
        connection.set_message_id(3);
        process_response(
            &connection,
            r#"{"MessageId":10,"TransportData":{"Groups":["g1"]}}"#,
        );

        assert_eq!(connection.message_id(), Some(3));
        assert!(connection.groups().is_empty());
        assert!(connection.errors().is_empty());
    }

    #[test]
    fn missing_cursor_is_reported_after_delivery() {
        let connection = RecordingConnection::default();
        process_response(
            &connection,
            r#"{"Messages":["a"],"TransportData":{"Groups":["g1"]}}"#,
        );

        assert_eq!(connection.received(), vec!["a".to_string()]);
        assert_eq!(connection.message_id(), Some(0));
        assert!(connection.groups().is_empty());
        let errors = connection.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("without a MessageId"));
    }

    #[test]
    fn malformed_frame_is_reported_and_dropped() {
        let connection = RecordingConnection::default();
        process_response(&connection, "{\"Messages\":[\"a\"");

        assert!(connection.received().is_empty());
        assert_eq!(connection.errors().len(), 1);
        assert_eq!(connection.message_id(), Some(0));
    }

    #[test]
    fn mistyped_transport_data_does_not_block_the_batch() {
        let connection = RecordingConnection::default();
        connection.set_groups(vec!["g0".to_string()]);
        process_response(
            &connection,
            r#"{"Messages":["a","b"],"MessageId":5,"TransportData":"x"}"#,
        );

        assert_eq!(connection.received(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(connection.message_id(), Some(5));
        assert_eq!(connection.groups(), vec!["g0".to_string()]);
        assert!(connection.errors().is_empty());
    }

    #[test]
    fn non_array_groups_fail_after_delivery_and_cursor() {
        let connection = RecordingConnection::default();
        connection.set_groups(vec!["g0".to_string()]);
        process_response(
            &connection,
            r#"{"Messages":["a","b"],"MessageId":5,"TransportData":{"Groups":"g1"}}"#,
        );

        assert_eq!(connection.received(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(connection.message_id(), Some(5));
        assert_eq!(connection.groups(), vec!["g0".to_string()]);
        let errors = connection.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("group name"));
    }

    #[test]
    fn non_array_messages_are_treated_as_absent() {
        let connection = RecordingConnection::default();
        connection.set_message_id(3);
        process_response(&connection, r#"{"Messages":{"a":1},"MessageId":9}"#);

        assert!(connection.received().is_empty());
        assert_eq!(connection.message_id(), Some(3));
        assert!(connection.errors().is_empty());
    }

    #[test]
    fn structured_messages_keep_key_order_and_big_numbers() {
        let connection = RecordingConnection::default();
        process_response(
            &connection,
            r#"{"Messages":[{"z":1,"a":12345678901234567890123}],"MessageId":1}"#,
        );
        assert_eq!(
            connection.received(),
            vec![r#"{"z":1,"a":12345678901234567890123}"#.to_string()]
        );
    }

    #[test]
    fn whole_float_cursor_is_accepted() {
        let connection = RecordingConnection::default();
        process_response(&connection, r#"{"Messages":["a"],"MessageId":1.0}"#);

        assert_eq!(connection.message_id(), Some(1));
        assert!(connection.errors().is_empty());
    }

    #[test]
    fn close_before_start_is_reported_when_session_starts() {
        let link = SessionLink::default();
        assert!(!link.mark_closed());
        assert!(link.mark_started());
        assert!(!link.mark_started());
        assert!(!link.mark_closed());
    }

    #[test]
    fn close_after_start_is_reported_once() {
        let link = SessionLink::default();
        assert!(!link.mark_started());
        assert!(link.mark_closed());
        assert!(!link.mark_closed());
    }

    #[test]
    fn detached_session_never_reports() {
        let link = SessionLink::default();
        link.mark_started();
        link.detach();
        assert!(!link.mark_closed());
    }

    #[tokio::test]
    async fn stop_without_session_is_a_no_op() {
        let transport = RealtimeTransport::new();
        let connection = RecordingConnection::default();

        transport.stop(&connection).await;
        transport.stop(&connection).await;

        assert_eq!(transport.phase(), TransportPhase::Idle);
        assert_eq!(transport.state(), ConnectionState::None);
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let transport = RealtimeTransport::new();
        let connection = RecordingConnection::default();

        let err = transport
            .send::<_, ()>(&connection, "hello")
            .await
            .expect_err("no active session");
        assert!(matches!(err, TransportError::NotStarted));
    }

    #[tokio::test]
    async fn start_rejects_unsupported_scheme() {
        let transport = RealtimeTransport::new();
        let connection = Arc::new(RecordingConnection::default());

        let err = transport
            .start(Arc::clone(&connection), None)
            .await
            .expect_err("ftp is not a realtime address");
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
        assert_eq!(transport.phase(), TransportPhase::Idle);
    }
}
