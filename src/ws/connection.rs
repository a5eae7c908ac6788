#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use backoff::backoff::Backoff as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::config::{Config, ReconnectBackoff};
use super::error::WsError;
use super::traits::{ReadyState, Socket};
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture =
    Pin<Box<dyn Future<Output = std::result::Result<WsStream, tungstenite::Error>> + Send>>;

/// Close code used when a handshake stalls past the configured timeout.
pub const HANDSHAKE_TIMEOUT_CLOSE_CODE: u16 = 4000;
/// Close code used when an authenticated connection stops producing traffic.
pub const HEARTBEAT_TIMEOUT_CLOSE_CODE: u16 = 4001;
/// Close code used for a deliberate [`ConnectionManager::disconnect`].
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, and no reconnection is scheduled
    Disconnected,
    /// Opening handshake in flight
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the backoff delay before the next attempt
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
        /// Delay before the attempt starts
        delay: Duration,
    },
    /// Reconnection budget exhausted
    Failed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Something the connection manager wants its owner to react to.
#[non_exhaustive]
#[derive(Debug)]
pub enum LifecycleEvent {
    /// A socket finished its handshake and is ready to carry frames
    Opened(SocketHandle),
    /// A text frame arrived, untouched
    Message(String),
    /// The socket went away
    Disconnected {
        /// Why the socket was lost
        cause: WsError,
        /// Delay before the next attempt, `None` once the manager has failed
        retry: Option<Duration>,
    },
}

/// Shared, cloneable send capability for the live socket.
///
/// Frames are forwarded to a dedicated writer task, so sending never blocks.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    outbound: mpsc::UnboundedSender<Message>,
    ready: Arc<AtomicU8>,
}

impl SocketHandle {
    fn new(outbound: mpsc::UnboundedSender<Message>, ready: Arc<AtomicU8>) -> Self {
        Self { outbound, ready }
    }

    fn close(&self, code: u16, reason: &str) {
        if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
            return;
        }

        store_ready(&self.ready, ReadyState::Closing);
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        if self.outbound.send(Message::Close(Some(frame))).is_err() {
            store_ready(&self.ready, ReadyState::Closed);
        }
    }
}

impl Socket for SocketHandle {
    fn ready_state(&self) -> ReadyState {
        load_ready(&self.ready)
    }

    fn send_text(&self, text: String) -> Result<()> {
        if !self.ready_state().is_open() {
            return Err(WsError::NotOpen.into());
        }

        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }
}

struct ActiveSocket {
    handle: SocketHandle,
    read: SplitStream<WsStream>,
}

/// Owns the one WebSocket of a session and every timer around it.
///
/// The manager handles:
/// - Opening sockets to the session address, with a handshake timeout
/// - Reconnection with exponential backoff, bounded by the configured attempt budget
/// - Proactive reconnection when the host becomes visible again
/// - Forwarding raw text frames to its owner
///
/// It never parses frames. Its owner drives it by awaiting [`ConnectionManager::next_event`]
/// in a loop and reacting to the returned [`LifecycleEvent`]s.
///
/// # Example
///
/// ```ignore
/// let mut connection = ConnectionManager::new("wss://example.com/ws", "session-1", config)?;
/// connection.connect();
///
/// loop {
///     match connection.next_event().await {
///         LifecycleEvent::Opened(socket) => { /* authenticate */ }
///         LifecycleEvent::Message(text) => { /* route */ }
///         LifecycleEvent::Disconnected { retry: None, .. } => break,
///         LifecycleEvent::Disconnected { .. } => {}
///     }
/// }
/// ```
pub struct ConnectionManager {
    /// Socket address including the session identifier
    endpoint: Url,
    config: Config,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    backoff: ReconnectBackoff,
    connecting: Option<ConnectFuture>,
    handshake_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    socket: Option<ActiveSocket>,
    /// Whether visibility changes may trigger a connection attempt
    visibility_armed: bool,
}

impl ConnectionManager {
    /// Create a connection manager for `endpoint`, tagging the address with `session_id`.
    ///
    /// Nothing is opened until [`ConnectionManager::connect`] is called.
    pub fn new(endpoint: &str, session_id: &str, config: Config) -> Result<Self> {
        let endpoint = session_endpoint(endpoint, &config.session_id_param, session_id)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = config.reconnect.clone().into();

        Ok(Self {
            endpoint,
            config,
            state_tx,
            backoff,
            connecting: None,
            handshake_deadline: None,
            reconnect_deadline: None,
            socket: None,
            visibility_armed: false,
        })
    }

    /// Address the manager connects to.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Send capability for the live socket, if there is one.
    #[must_use]
    pub fn socket(&self) -> Option<&SocketHandle> {
        self.socket.as_ref().map(|socket| &socket.handle)
    }

    /// Number of reconnection attempts made since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    /// Start connecting.
    ///
    /// A no-op while connected or while a handshake is already in flight. A pending
    /// backoff wait is skipped. Calling this after [`ConnectionState::Failed`] or
    /// [`ConnectionState::Disconnected`] starts a fresh attempt budget.
    pub fn connect(&mut self) {
        self.visibility_armed = true;

        match self.state() {
            ConnectionState::Connected { .. } => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Already connected, ignoring connect request");
                return;
            }
            ConnectionState::Connecting => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Handshake already in flight, ignoring connect request");
                return;
            }
            ConnectionState::Disconnected | ConnectionState::Failed => self.backoff.reset(),
            ConnectionState::Reconnecting { .. } => {}
        }

        self.open();
    }

    /// Close the socket and stop all timers. No reconnection follows.
    pub fn disconnect(&mut self) {
        self.visibility_armed = false;
        self.clear_timers();
        self.release_socket(NORMAL_CLOSE_CODE, "client disconnect");
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close the live socket with `code` and run the reconnect path with `cause`.
    pub fn abort(&mut self, code: u16, cause: WsError) -> LifecycleEvent {
        #[cfg(feature = "tracing")]
        tracing::warn!(code, %cause, "Closing WebSocket");

        self.release_socket(code, &cause.to_string());
        self.handle_disconnect(cause)
    }

    /// React to the host becoming visible or hidden.
    ///
    /// Becoming visible while not connected starts an attempt immediately instead of waiting
    /// out the backoff delay. Returns whether an attempt was started.
    pub fn visibility_changed(&mut self, visible: bool) -> bool {
        if !visible || !self.visibility_armed {
            return false;
        }

        match self.state() {
            ConnectionState::Connected { .. } | ConnectionState::Connecting => false,
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting { .. }
            | ConnectionState::Failed => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Became visible while offline, reconnecting now");
                self.open();
                true
            }
        }
    }

    /// Wait for the next lifecycle event.
    ///
    /// Backoff timers are handled internally. The returned future is cancel safe and can be
    /// used as a `tokio::select!` branch.
    pub async fn next_event(&mut self) -> LifecycleEvent {
        loop {
            tokio::select! {
                result = poll_connecting(&mut self.connecting) => {
                    self.connecting = None;
                    self.handshake_deadline = None;

                    return match result {
                        Ok(stream) => self.handle_open(stream),
                        Err(e) => self.handle_disconnect(WsError::Connection(e)),
                    };
                }

                () = sleep_until_some(self.handshake_deadline), if self.connecting.is_some() => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        code = HANDSHAKE_TIMEOUT_CLOSE_CODE,
                        timeout = ?self.config.handshake_timeout,
                        "WebSocket handshake timed out"
                    );
                    self.connecting = None;
                    self.handshake_deadline = None;

                    return self.handle_disconnect(WsError::HandshakeTimeout(
                        self.config.handshake_timeout,
                    ));
                }

                () = sleep_until_some(self.reconnect_deadline) => {
                    self.open();
                }

                frame = next_frame(&mut self.socket) => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");

                            return LifecycleEvent::Message(text.as_str().to_owned());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(?frame, "Server closed WebSocket");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &frame;

                            self.release_socket(NORMAL_CLOSE_CODE, "closed by server");
                            return self.handle_disconnect(WsError::ConnectionClosed);
                        }
                        Some(Err(e)) => {
                            self.release_socket(NORMAL_CLOSE_CODE, "read error");
                            return self.handle_disconnect(WsError::Connection(e));
                        }
                        None => {
                            self.release_socket(NORMAL_CLOSE_CODE, "stream ended");
                            return self.handle_disconnect(WsError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            // Binary frames and control frames carry nothing for the session.
                        }
                    }
                }
            }
        }
    }

    fn open(&mut self) {
        self.clear_timers();

        let endpoint = self.endpoint.to_string();
        self.connecting = Some(Box::pin(async move {
            connect_async(endpoint).await.map(|(stream, _)| stream)
        }));
        self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);

        self.set_state(ConnectionState::Connecting);
    }

    fn handle_open(&mut self, stream: WsStream) -> LifecycleEvent {
        let (write, read) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicU8::new(ready_to_u8(ReadyState::Open)));

        tokio::spawn(write_loop(write, outbound_rx, Arc::clone(&ready)));

        let handle = SocketHandle::new(outbound_tx, ready);
        self.socket = Some(ActiveSocket {
            handle: handle.clone(),
            read,
        });
        self.backoff.reset();
        self.set_state(ConnectionState::Connected {
            since: Instant::now(),
        });

        LifecycleEvent::Opened(handle)
    }

    fn handle_disconnect(&mut self, cause: WsError) -> LifecycleEvent {
        self.clear_timers();
        self.release_socket(NORMAL_CLOSE_CODE, "disconnected");

        #[cfg(feature = "tracing")]
        tracing::warn!(%cause, "WebSocket disconnected");

        let retry = self.backoff.next_backoff();
        match retry {
            Some(delay) => {
                self.reconnect_deadline = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting {
                    attempt: self.backoff.attempts(),
                    delay,
                });
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    attempts = self.backoff.attempts(),
                    "Reconnection budget exhausted"
                );
                self.set_state(ConnectionState::Failed);
            }
        }

        LifecycleEvent::Disconnected { cause, retry }
    }

    fn clear_timers(&mut self) {
        self.connecting = None;
        self.handshake_deadline = None;
        self.reconnect_deadline = None;
    }

    fn release_socket(&mut self, code: u16, reason: &str) {
        if let Some(socket) = self.socket.take() {
            socket.handle.close(code, reason);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(?state, "Connection state changed");

        self.state_tx.send_replace(state);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.release_socket(NORMAL_CLOSE_CODE, "client dropped");
    }
}

/// Build the session address: `endpoint` plus the session identifier query parameter.
fn session_endpoint(endpoint: &str, param: &str, session_id: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(WsError::InvalidEndpoint(format!(
            "unsupported scheme `{}`, expected ws or wss",
            url.scheme()
        ))
        .into());
    }

    url.query_pairs_mut().append_pair(param, session_id);
    Ok(url)
}

async fn poll_connecting(
    connecting: &mut Option<ConnectFuture>,
) -> std::result::Result<WsStream, tungstenite::Error> {
    match connecting {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<ActiveSocket>,
) -> Option<std::result::Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.read.next().await,
        None => pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Single writer for one socket. Ends after a close frame or the first write error.
async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    ready: Arc<AtomicU8>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));

        if let Err(e) = write.send(message).await {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "WebSocket write failed");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            break;
        }

        if closing {
            break;
        }
    }

    store_ready(&ready, ReadyState::Closed);
}

const fn ready_to_u8(state: ReadyState) -> u8 {
    match state {
        ReadyState::Connecting => 0,
        ReadyState::Open => 1,
        ReadyState::Closing => 2,
        ReadyState::Closed => 3,
    }
}

fn load_ready(ready: &AtomicU8) -> ReadyState {
    match ready.load(Ordering::Acquire) {
        0 => ReadyState::Connecting,
        1 => ReadyState::Open,
        2 => ReadyState::Closing,
        _ => ReadyState::Closed,
    }
}

fn store_ready(ready: &AtomicU8, state: ReadyState) {
    ready.store(ready_to_u8(state), Ordering::Release);
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::error::Kind;
    use crate::ws::config::ReconnectConfig;

    #[test]
    fn endpoint_carries_session_id() {
        let connection =
            ConnectionManager::new("wss://game.example.com/ws", "abc-123", Config::default())
                .unwrap();

        assert_eq!(
            connection.endpoint().as_str(),
            "wss://game.example.com/ws?sessionId=abc-123"
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn endpoint_keeps_existing_query() {
        let connection =
            ConnectionManager::new("ws://localhost:8787/?room=a", "s1", Config::default())
                .unwrap();

        assert_eq!(
            connection.endpoint().as_str(),
            "ws://localhost:8787/?room=a&sessionId=s1"
        );
    }

    #[test]
    fn http_endpoint_is_rejected() {
        let Err(error) = ConnectionManager::new("https://example.com", "s1", Config::default())
        else {
            panic!("http endpoint should be rejected");
        };

        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(
            matches!(
                error.downcast_ref::<WsError>(),
                Some(WsError::InvalidEndpoint(_))
            ),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn closed_handle_rejects_frames() {
        let (tx, rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicU8::new(ready_to_u8(ReadyState::Open)));
        let handle = SocketHandle::new(tx, ready);

        handle.send_text("one".to_owned()).unwrap();
        handle.close(NORMAL_CLOSE_CODE, "bye");
        drop(rx);

        assert_eq!(handle.ready_state(), ReadyState::Closing);
        assert!(
            handle.send_text("two".to_owned()).is_err(),
            "closing socket must not accept frames"
        );
    }

    #[test]
    fn visibility_is_ignored_before_connect() {
        let mut connection =
            ConnectionManager::new("ws://127.0.0.1:9/ws", "s1", Config::default()).unwrap();

        assert!(
            !connection.visibility_changed(true),
            "hook is only armed by connect()"
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_schedules_first_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut connection =
            ConnectionManager::new(&format!("ws://{addr}/ws"), "s1", Config::default()).unwrap();
        connection.connect();
        assert_eq!(connection.state(), ConnectionState::Connecting);

        let event = connection.next_event().await;

        assert!(
            matches!(
                event,
                LifecycleEvent::Disconnected {
                    retry: Some(delay),
                    ..
                } if delay == Duration::from_secs(2)
            ),
            "unexpected event: {event:?}"
        );
        assert_eq!(
            connection.state(),
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(2),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_times_out() {
        // Accepts TCP but never answers the WebSocket upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut connection =
            ConnectionManager::new(&format!("ws://{addr}/ws"), "s1", Config::default()).unwrap();
        connection.connect();

        let event = connection.next_event().await;

        assert!(
            matches!(
                event,
                LifecycleEvent::Disconnected {
                    cause: WsError::HandshakeTimeout(_),
                    retry: Some(_),
                }
            ),
            "unexpected event: {event:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = Config::builder()
            .reconnect(ReconnectConfig::builder().max_attempts(1).build())
            .build();
        let mut connection =
            ConnectionManager::new(&format!("ws://{addr}/ws"), "s1", config).unwrap();
        connection.connect();

        let first = connection.next_event().await;
        assert!(
            matches!(first, LifecycleEvent::Disconnected { retry: Some(_), .. }),
            "first failure should retry: {first:?}"
        );

        let second = connection.next_event().await;
        assert!(
            matches!(second, LifecycleEvent::Disconnected { retry: None, .. }),
            "second failure should be terminal: {second:?}"
        );
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_skips_backoff_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut connection =
            ConnectionManager::new(&format!("ws://{addr}/ws"), "s1", Config::default()).unwrap();
        connection.connect();
        let _event = connection.next_event().await;
        assert!(
            matches!(connection.state(), ConnectionState::Reconnecting { .. }),
            "should be waiting out the backoff"
        );

        assert!(connection.visibility_changed(true), "should reconnect now");
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(
            !connection.visibility_changed(true),
            "must not open a second socket while connecting"
        );
    }

    #[tokio::test]
    async fn successful_open_resets_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            // First attempt dies before the upgrade.
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);

            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = release_rx.await;
            drop(ws);
        });

        let base = Duration::from_millis(100);
        let config = Config::builder()
            .reconnect(
                ReconnectConfig::builder()
                    .initial_backoff(base)
                    .max_backoff(Duration::from_secs(1))
                    .build(),
            )
            .build();
        let mut connection =
            ConnectionManager::new(&format!("ws://{addr}/ws"), "s1", config).unwrap();
        connection.connect();

        let failed = connection.next_event().await;
        assert!(
            matches!(failed, LifecycleEvent::Disconnected { retry: Some(delay), .. } if delay == base),
            "unexpected event: {failed:?}"
        );
        assert_eq!(connection.attempts(), 1);

        let opened = connection.next_event().await;
        assert!(
            matches!(opened, LifecycleEvent::Opened(_)),
            "unexpected event: {opened:?}"
        );
        assert_eq!(connection.attempts(), 0, "open must reset the attempt counter");

        release_tx.send(()).unwrap();
        let lost = connection.next_event().await;
        assert!(
            matches!(lost, LifecycleEvent::Disconnected { retry: Some(delay), .. } if delay == base),
            "retry after a good open should start from the base delay: {lost:?}"
        );
        assert_eq!(connection.attempts(), 1);
    }

    #[test]
    fn disconnect_disarms_visibility() {
        let mut connection =
            ConnectionManager::new("ws://127.0.0.1:9/ws", "s1", Config::default()).unwrap();

        connection.disconnect();

        assert!(!connection.visibility_changed(true), "hook should be disarmed");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
