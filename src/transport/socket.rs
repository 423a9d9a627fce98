//! Duplex websocket client.
//!
//! [`DuplexSocketClient`] owns one physical connection. A background worker
//! owns the websocket and serves a command queue for outbound frames and
//! close requests, while a dispatcher task delivers inbound text to the
//! registered message callback so a slow consumer never stalls the receive
//! loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::transport::address::{rewrite_address, EndpointAddress, TransportSecurity};
use crate::transport::state::{ChannelLifecycle, ConnectionState, LifecycleCell};

/// Idle receive window for long-lived channels.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Default bound on the opening handshake.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
/// Default bound on the closing handshake.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
/// Header carrying the negotiated subprotocol.
pub const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback receiving decoded inbound text.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;
/// Callback fired once when an opened channel closes.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Framing marker attached to outbound frames.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum MessageType {
    #[default]
    Text,
}

/// What to do when the graceful close handshake fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CloseFailurePolicy {
    /// Return the failure to the caller and leave the channel as it is.
    #[default]
    Propagate,
    /// Abort the channel, then return the failure.
    Abort,
}

/// Channel binding: framing constants, timeouts, and buffer limits.
#[derive(Clone, Debug)]
pub struct ChannelBinding {
    pub security: TransportSecurity,
    pub subprotocol: Option<String>,
    pub outgoing_message_type: MessageType,
    pub receive_timeout: Duration,
    pub open_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,
    pub send_buffer_size: Option<usize>,
    pub max_message_size: Option<usize>,
    pub close_failure: CloseFailurePolicy,
}

impl Default for ChannelBinding {
    fn default() -> Self {
        Self {
            security: TransportSecurity::Plain,
            subprotocol: None,
            outgoing_message_type: MessageType::Text,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            open_timeout: Some(DEFAULT_OPEN_TIMEOUT),
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            send_buffer_size: None,
            max_message_size: None,
            close_failure: CloseFailurePolicy::Propagate,
        }
    }
}

impl ChannelBinding {
    /// Requests `subprotocol` through the `Sec-WebSocket-Protocol` header.
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }

    /// Sets the idle window after which a silent channel faults.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets the open timeout. `None` waits for the handshake indefinitely.
    pub fn with_open_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Sets the close handshake timeout. `None` waits indefinitely.
    pub fn with_close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the websocket write buffer size in bytes.
    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Caps the size of one inbound message in bytes.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Chooses what `close` does when the graceful handshake fails.
    pub fn with_close_failure(mut self, policy: CloseFailurePolicy) -> Self {
        self.close_failure = policy;
        self
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if let Some(size) = self.send_buffer_size {
            config.write_buffer_size = size;
        }
        if self.max_message_size.is_some() {
            config.max_message_size = self.max_message_size;
        }
        config
    }

    /// Builds the upgrade request for a physical endpoint.
    pub fn upgrade_request(&self, endpoint: &Url) -> Result<Request, TransportError> {
        let handshake_url = handshake_url(endpoint, self.security)?;
        let mut request = handshake_url.as_str().into_client_request()?;
        if let Some(subprotocol) = self.subprotocol.as_deref() {
            request
                .headers_mut()
                .insert(SUBPROTOCOL_HEADER, HeaderValue::from_str(subprotocol)?);
        }
        Ok(request)
    }
}

/// One outbound frame: a complete UTF-8 payload and its framing marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutboundFrame {
    pub message_type: MessageType,
    pub payload: String,
}

impl OutboundFrame {
    pub fn new(message_type: MessageType, payload: impl Into<String>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    fn into_message(self) -> Message {
        match self.message_type {
            MessageType::Text => Message::Text(self.payload),
        }
    }
}

enum Command {
    Send {
        frame: OutboundFrame,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
}

#[derive(Default)]
struct Handlers {
    on_message: Option<MessageHandler>,
    on_close: Option<CloseHandler>,
}

struct ChannelShared {
    lifecycle: LifecycleCell,
    handlers: RwLock<Handlers>,
    close_notified: AtomicBool,
}

impl ChannelShared {
    fn new() -> Self {
        Self {
            lifecycle: LifecycleCell::new(),
            handlers: RwLock::new(Handlers::default()),
            close_notified: AtomicBool::new(false),
        }
    }

    fn message_handler(&self) -> Option<MessageHandler> {
        self.handlers
            .read()
            .map(|handlers| handlers.on_message.clone())
            .unwrap_or(None)
    }

    fn notify_closed(&self) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self
            .handlers
            .read()
            .map(|handlers| handlers.on_close.clone())
            .unwrap_or(None);
        if let Some(handler) = handler {
            handler();
        }
    }
}

struct ChannelTasks {
    commands: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Client for one physical duplex channel.
pub struct DuplexSocketClient {
    endpoint: EndpointAddress,
    binding: ChannelBinding,
    shared: Arc<ChannelShared>,
    tasks: Option<ChannelTasks>,
}

impl fmt::Debug for DuplexSocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexSocketClient")
            .field("endpoint", &self.endpoint)
            .field("binding", &self.binding)
            .field("state", &self.state())
            .finish()
    }
}

impl DuplexSocketClient {
    /// Creates a client for a logical address.
    ///
    /// The address is rewritten to its physical form here, so unsupported
    /// schemes fail before any I/O. Transport security is taken from the
    /// address scheme.
    pub fn new(address: &str, binding: ChannelBinding) -> Result<Self, TransportError> {
        let endpoint = rewrite_address(address)?;
        let binding = ChannelBinding {
            security: endpoint.security(),
            ..binding
        };
        Ok(Self {
            endpoint,
            binding,
            shared: Arc::new(ChannelShared::new()),
            tasks: None,
        })
    }

    /// Physical endpoint after address rewriting.
    pub fn endpoint(&self) -> &EndpointAddress {
        &self.endpoint
    }

    /// Binding with the transport security derived from the address.
    pub fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    /// Registers the inbound message callback, replacing any previous one.
    pub fn set_on_message<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.shared.handlers.write() {
            handlers.on_message = Some(Arc::new(handler));
        }
    }

    /// Registers the close callback, replacing any previous one.
    pub fn set_on_close<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.shared.handlers.write() {
            handlers.on_close = Some(Arc::new(handler));
        }
    }

    /// Current websocket state, derived from the channel lifecycle.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.shared.lifecycle.load())
    }

    /// Opens the channel and waits until it reports opened.
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.tasks.is_some() || self.shared.lifecycle.load() != ChannelLifecycle::Created {
            return Err(TransportError::AlreadyOpened);
        }
        let Some(url) = self.endpoint.as_url() else {
            return Err(TransportError::invalid_address(
                self.endpoint.to_string(),
                "relative addresses cannot be opened",
            ));
        };
        let request = self.binding.upgrade_request(url)?;
        let config = self.binding.websocket_config();
        let receive_timeout = self.binding.receive_timeout;
        let close_timeout = self.binding.close_timeout;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        self.shared.lifecycle.advance(ChannelLifecycle::Opening);
        debug!(event = "channel_opening", endpoint = %self.endpoint);

        let dispatcher = tokio::spawn(dispatch_inbound(inbound_rx, Arc::clone(&self.shared)));
        let worker = tokio::spawn(channel_worker(
            request,
            config,
            receive_timeout,
            close_timeout,
            Arc::clone(&self.shared),
            command_rx,
            inbound_tx,
            ready_tx,
        ));
        self.tasks = Some(ChannelTasks {
            commands: command_tx,
            worker,
            dispatcher,
        });

        let ready = match self.binding.open_timeout {
            Some(limit) => match tokio::time::timeout(limit, ready_rx).await {
                Ok(ready) => ready,
                Err(_) => {
                    self.abort_tasks(ChannelLifecycle::Faulted);
                    return Err(TransportError::OpenTimeout(limit));
                }
            },
            None => ready_rx.await,
        };

        match ready {
            Ok(Ok(())) => {
                debug!(event = "channel_opened", endpoint = %self.endpoint);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::ChannelClosed),
        }
    }

    /// Runs the graceful close handshake and waits for it to finish.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        let result = match self.tasks.as_ref() {
            Some(tasks) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if tasks.commands.send(Command::Close { ack: ack_tx }).is_err() {
                    return Err(TransportError::ChannelClosed);
                }
                ack_rx.await.unwrap_or(Err(TransportError::ChannelClosed))
            }
            None => return Err(TransportError::NotOpen(self.state())),
        };

        if let Err(err) = &result {
            warn!(event = "channel_close_failed", error = %err);
            if self.binding.close_failure == CloseFailurePolicy::Abort {
                self.dispose();
            }
        }
        result
    }

    /// Sends one text frame.
    ///
    /// Completes once the frame has been written to the socket; there is no
    /// delivery acknowledgement from the peer.
    pub async fn send(&self, text: &str) -> Result<(), TransportError> {
        self.sender()?.send(text).await
    }

    /// Cloneable sender bound to this client's channel.
    pub fn sender(&self) -> Result<SocketSender, TransportError> {
        let tasks = self
            .tasks
            .as_ref()
            .ok_or_else(|| TransportError::NotOpen(self.state()))?;
        Ok(SocketSender {
            commands: tasks.commands.clone(),
            shared: Arc::clone(&self.shared),
            message_type: self.binding.outgoing_message_type,
        })
    }

    /// Aborts the channel. Safe to call repeatedly and before `open`.
    pub fn dispose(&mut self) {
        self.abort_tasks(ChannelLifecycle::Closed);
    }

    fn abort_tasks(&mut self, lifecycle: ChannelLifecycle) {
        let Some(tasks) = self.tasks.take() else {
            return;
        };
        tasks.worker.abort();
        tasks.dispatcher.abort();
        let previous = self.shared.lifecycle.advance(lifecycle);
        debug!(event = "channel_aborted", endpoint = %self.endpoint, previous = ?previous);
        if matches!(previous, ChannelLifecycle::Opened | ChannelLifecycle::Closing) {
            self.shared.notify_closed();
        }
    }
}

impl Drop for DuplexSocketClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Cloneable handle for sending frames on an open channel.
#[derive(Clone)]
pub struct SocketSender {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<ChannelShared>,
    message_type: MessageType,
}

impl fmt::Debug for SocketSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketSender")
            .field("state", &self.state())
            .field("message_type", &self.message_type)
            .finish()
    }
}

impl SocketSender {
    /// State of the channel this sender is bound to.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.shared.lifecycle.load())
    }

    /// Sends `text` as one complete frame.
    pub async fn send(&self, text: &str) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(TransportError::NotOpen(state));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                frame: OutboundFrame::new(self.message_type, text),
                ack: ack_tx,
            })
            .map_err(|_| TransportError::ChannelClosed)?;
        ack_rx.await.unwrap_or(Err(TransportError::ChannelClosed))
    }
}

fn handshake_url(endpoint: &Url, security: TransportSecurity) -> Result<Url, TransportError> {
    let scheme = match security {
        TransportSecurity::Plain => "ws",
        TransportSecurity::Tls => "wss",
    };
    let mut url = endpoint.clone();
    url.set_scheme(scheme).map_err(|()| {
        TransportError::invalid_address(endpoint.as_str(), "cannot derive upgrade address")
    })?;
    Ok(url)
}

async fn dispatch_inbound(mut inbound_rx: mpsc::UnboundedReceiver<String>, shared: Arc<ChannelShared>) {
    while let Some(text) = inbound_rx.recv().await {
        match shared.message_handler() {
            Some(handler) => handler(text),
            None => debug!(event = "inbound_frame_unhandled", len = text.len()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn channel_worker(
    request: Request,
    config: WebSocketConfig,
    receive_timeout: Duration,
    close_timeout: Option<Duration>,
    shared: Arc<ChannelShared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<String>,
    ready_tx: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut socket = match connect_async_with_config(request, Some(config), false).await {
        Ok((socket, _response)) => socket,
        Err(err) => {
            shared.lifecycle.advance(ChannelLifecycle::Faulted);
            warn!(event = "channel_open_failed", error = %err);
            let _ = ready_tx.send(Err(err.into()));
            return;
        }
    };

    shared.lifecycle.advance(ChannelLifecycle::Opened);
    let _ = ready_tx.send(Ok(()));

    let outcome = run_channel(
        &mut socket,
        receive_timeout,
        close_timeout,
        &shared,
        &mut commands,
        &inbound_tx,
    )
    .await;

    shared.lifecycle.advance(outcome);
    debug!(event = "channel_closed", lifecycle = ?outcome);
    shared.notify_closed();
}

async fn run_channel(
    socket: &mut Socket,
    receive_timeout: Duration,
    close_timeout: Option<Duration>,
    shared: &ChannelShared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    inbound_tx: &mpsc::UnboundedSender<String>,
) -> ChannelLifecycle {
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Send { frame, ack }) => {
                        let result = socket
                            .send(frame.into_message())
                            .await
                            .map_err(TransportError::from);
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            warn!(event = "channel_send_failed");
                            return ChannelLifecycle::Faulted;
                        }
                    }
                    Some(Command::Close { ack }) => {
                        shared.lifecycle.advance(ChannelLifecycle::Closing);
                        let result = close_handshake(socket, close_timeout).await;
                        let lifecycle = if result.is_ok() {
                            ChannelLifecycle::Closed
                        } else {
                            ChannelLifecycle::Faulted
                        };
                        let _ = ack.send(result);
                        return lifecycle;
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return ChannelLifecycle::Closed;
                    }
                }
            }
            inbound = tokio::time::timeout(receive_timeout, socket.next()) => {
                match inbound {
                    Err(_) => {
                        warn!(
                            event = "channel_receive_timeout",
                            timeout_ms = duration_millis(receive_timeout)
                        );
                        return ChannelLifecycle::Faulted;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let _ = inbound_tx.send(text);
                    }
                    Ok(Some(Ok(Message::Binary(payload)))) => {
                        warn!(event = "binary_frame_dropped", len = payload.len());
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        debug!(event = "close_received", frame = ?frame);
                        shared.lifecycle.advance(ChannelLifecycle::Closing);
                        return match drain_until_closed(socket).await {
                            Ok(()) => ChannelLifecycle::Closed,
                            Err(_) => ChannelLifecycle::Faulted,
                        };
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(err))) => {
                        warn!(event = "channel_faulted", error = %err);
                        return ChannelLifecycle::Faulted;
                    }
                    Ok(None) => return ChannelLifecycle::Closed,
                }
            }
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn close_handshake(
    socket: &mut Socket,
    limit: Option<Duration>,
) -> Result<(), TransportError> {
    let handshake = async {
        socket.close(None).await?;
        drain_until_closed(socket).await
    };
    match limit {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| TransportError::CloseTimeout(limit))?,
        None => handshake.await,
    }
}

async fn drain_until_closed(socket: &mut Socket) -> Result<(), TransportError> {
    loop {
        match socket.next().await {
            None | Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(()),
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(_)) => {}
        }
    }
}
