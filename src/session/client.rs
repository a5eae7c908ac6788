use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use secrecy::SecretString;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;
use uuid::Uuid;

use super::auth::{AuthEvent, AuthState, AuthenticationManager};
use super::heartbeat::{HeartbeatCheck, HeartbeatManager};
use super::queue::MessageQueueManager;
use super::router::MessageRouter;
use super::types::request::OutboundMessage;
use super::types::response::{
    Ack, AuthResponse, ControlMessage, DragPreview, HeartbeatAck, InboundMessage, Nack,
    PointerPreview, RoomSnapshot, RtcSignal, TokenUpdated,
};
use super::warmup::ServerWarmupManager;
use crate::Result;
use crate::ws::ConnectionManager;
use crate::ws::config::Config;
use crate::ws::connection::{ConnectionState, HEARTBEAT_TIMEOUT_CLOSE_CODE, LifecycleEvent};
use crate::ws::error::WsError;
use crate::ws::traits::Socket as _;

/// Broadcast capacity for session events.
const EVENT_CAPACITY: usize = 1024;

/// Everything a collaborator can observe about a session, apart from state changes.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Full room state, or an inbound frame with no known shape
    Snapshot(RoomSnapshot),
    /// WebRTC signaling from a peer
    RtcSignal(RtcSignal),
    /// Room and DM administration reply
    Control(ControlMessage),
    TokenUpdated(TokenUpdated),
    PointerPreview(PointerPreview),
    DragPreview(DragPreview),
    HeartbeatAck(HeartbeatAck),
    Ack(Ack),
    Nack(Nack),
    /// Authentication progress
    Auth(AuthEvent),
}

/// Whether the hosting application is in the foreground.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Realtime session client.
///
/// Cloning is cheap and every clone drives the same session. A background task owns the
/// socket, the handshake, the heartbeat and the outbound queue; the methods below only hand
/// it work, so none of them block or fail. Dropping the last clone closes the socket.
///
/// Must be created inside a Tokio runtime.
///
/// # Examples
///
/// ```rust, no_run
/// use futures::StreamExt as _;
/// use tabletop_realtime::session::{Client, SessionEvent};
/// use tabletop_realtime::ws::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new("wss://rooms.example.com/ws", Config::default())?;
///     let mut events = Box::pin(client.events());
///
///     client.connect();
///     client
///         .state_receiver()
///         .wait_for(|state| state.is_connected())
///         .await?;
///     client.authenticate("room secret", Some("room-1".to_owned()));
///
///     while let Some(event) = events.next().await {
///         if let SessionEvent::Snapshot(snapshot) = event? {
///             println!("room: {}", snapshot.as_value());
///         }
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    session_id: String,
    endpoint: Url,
    commands: mpsc::UnboundedSender<DriverCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    auth_rx: watch::Receiver<AuthState>,
    events_tx: broadcast::Sender<SessionEvent>,
    /// Stops the driver once the last handle is gone
    _shutdown: DropGuard,
}

/// Work handed from a [`Client`] handle to the driver.
enum DriverCommand {
    Connect,
    Disconnect,
    Send(OutboundMessage),
    Authenticate(Credentials),
    Visibility(Visibility),
}

#[derive(Clone)]
struct Credentials {
    secret: SecretString,
    room_id: Option<String>,
}

impl Client {
    /// Create a session client for the socket at `endpoint`.
    ///
    /// A fresh session identifier is generated and appended to the address. Nothing is
    /// opened until [`Client::connect`] is called.
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        let session_id = Uuid::new_v4().to_string();
        let connection = ConnectionManager::new(endpoint, &session_id, config.clone())?;
        let warmup = ServerWarmupManager::new(connection.endpoint(), &config)?;
        let auth = AuthenticationManager::new();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let token = CancellationToken::new();

        let inner = ClientInner {
            session_id,
            endpoint: connection.endpoint().clone(),
            commands: commands_tx,
            state_rx: connection.state_receiver(),
            auth_rx: auth.state_receiver(),
            events_tx: events_tx.clone(),
            _shutdown: token.clone().drop_guard(),
        };

        let driver = Driver {
            connection,
            auth,
            heartbeat: HeartbeatManager::new(config.heartbeat_interval),
            queue: MessageQueueManager::new(config.queue_capacity),
            router: MessageRouter::new(),
            warmup,
            credentials: None,
            events: events_tx,
        };
        tokio::spawn(driver.run(commands_rx, token));

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Identifier sent with the socket address.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Full socket address, session identifier included.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Reset authentication, fire the warmup ping and open the socket.
    ///
    /// Ignored while the socket is already open.
    pub fn connect(&self) {
        self.dispatch(DriverCommand::Connect);
    }

    /// Close the socket without reconnecting and forget the credentials.
    ///
    /// Messages still queued stay queued for the next session.
    pub fn disconnect(&self) {
        self.dispatch(DriverCommand::Disconnect);
    }

    /// Send a frame once the session is open and authenticated, queueing it until then.
    pub fn send<M: Into<OutboundMessage>>(&self, message: M) {
        self.dispatch(DriverCommand::Send(message.into()));
    }

    /// Start the handshake on the open socket.
    ///
    /// A call made while no socket is open is logged and ignored. Accepted credentials are
    /// replayed after every reconnect until the server rejects them or
    /// [`Client::disconnect`] is called.
    pub fn authenticate<S: Into<String>>(&self, secret: S, room_id: Option<String>) {
        self.dispatch(DriverCommand::Authenticate(Credentials {
            secret: SecretString::from(secret.into()),
            room_id,
        }));
    }

    /// Report that the host moved to the foreground or background.
    ///
    /// Becoming visible while offline reconnects immediately instead of waiting for the
    /// next backoff attempt.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.dispatch(DriverCommand::Visibility(visibility));
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        *self.inner.auth_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to authentication state changes.
    #[must_use]
    pub fn auth_receiver(&self) -> watch::Receiver<AuthState> {
        self.inner.auth_rx.clone()
    }

    /// Raw receiver for session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Stream of session events, starting now.
    ///
    /// A consumer that falls behind gets a [`WsError::Lagged`] item and the stream carries
    /// on. The stream does not borrow the client and ends once the session shuts down.
    pub fn events(&self) -> impl Stream<Item = Result<SessionEvent>> + use<> {
        let mut rx = self.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(count)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Session event stream lagged, missed {count} events");
                        Err(WsError::Lagged { count })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    fn dispatch(&self, command: DriverCommand) {
        if self.inner.commands.send(command).is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Session driver has stopped, dropping request");
        }
    }
}

/// Single owner of all session state. Runs until every [`Client`] handle is dropped.
struct Driver {
    connection: ConnectionManager,
    auth: AuthenticationManager,
    heartbeat: HeartbeatManager,
    queue: MessageQueueManager,
    router: MessageRouter,
    warmup: ServerWarmupManager,
    /// Last handshake sent, replayed on reconnect
    credentials: Option<Credentials>,
    events: broadcast::Sender<SessionEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = token.cancelled() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                event = self.connection.next_event() => self.handle_lifecycle(event),

                () = self.heartbeat.tick() => self.handle_heartbeat(),
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Session driver shutting down");

        self.heartbeat.stop();
        self.connection.disconnect();
    }

    fn handle_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Connect => self.connect(),
            DriverCommand::Disconnect => self.disconnect(),
            // Every handshake goes through the auth manager or `auth-ok` would be ignored.
            DriverCommand::Send(message) if message.is_authenticate() => {
                match message.into_handshake() {
                    Some((secret, room_id)) => self.authenticate(Credentials { secret, room_id }),
                    None => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Ignoring authenticate frame without a string secret");
                    }
                }
            }
            DriverCommand::Send(message) => self.send(message),
            DriverCommand::Authenticate(credentials) => self.authenticate(credentials),
            DriverCommand::Visibility(visibility) => {
                let _reconnecting = self
                    .connection
                    .visibility_changed(visibility == Visibility::Visible);
            }
        }
    }

    fn connect(&mut self) {
        if matches!(
            self.connection.state(),
            ConnectionState::Connected { .. } | ConnectionState::Connecting
        ) {
            // Auth is reset only when a new socket is about to open, so a live handshake on
            // the current socket is never discarded. Lifecycle logs and ignores the request.
            self.connection.connect();
            return;
        }

        let reset = self.auth.reset();
        self.publish(SessionEvent::Auth(reset));

        tokio::spawn(self.warmup.ensure_warmup());
        self.connection.connect();
    }

    fn disconnect(&mut self) {
        let reset = self.auth.reset();
        self.publish(SessionEvent::Auth(reset));

        self.heartbeat.stop();
        self.connection.disconnect();
        self.credentials = None;
    }

    fn send(&mut self, message: OutboundMessage) {
        let socket = self.connection.socket();
        let auth = &self.auth;

        let _outcome = self.queue.send(message, socket, || {
            socket.is_some_and(|socket| socket.ready_state().is_open()) && auth.is_authenticated()
        });
    }

    fn authenticate(&mut self, credentials: Credentials) {
        let event = self.auth.authenticate(
            self.connection.socket(),
            &credentials.secret,
            credentials.room_id.as_deref(),
        );

        if let Some(event) = event {
            self.credentials = Some(credentials);
            self.publish(SessionEvent::Auth(event));
        }
    }

    fn flush(&mut self) {
        let socket = self.connection.socket();
        let auth = &self.auth;

        let _sent = self.queue.flush(socket, || {
            socket.is_some_and(|socket| socket.ready_state().is_open()) && auth.is_authenticated()
        });
    }

    fn handle_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Opened(socket) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.connection.endpoint(), "Session socket open");

                self.heartbeat.start(socket);

                if let Some(credentials) = self.credentials.clone() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Re-authenticating after reconnect");
                    self.authenticate(credentials);
                }
            }
            LifecycleEvent::Message(text) => {
                self.heartbeat.record_message();

                if let Some(message) = self.router.route(&text) {
                    self.handle_message(message);
                }
            }
            LifecycleEvent::Disconnected { cause, retry } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%cause, ?retry, "Session socket lost");
                #[cfg(not(feature = "tracing"))]
                let _ = (&cause, &retry);

                self.heartbeat.stop();
                let reset = self.auth.reset();
                self.publish(SessionEvent::Auth(reset));
            }
        }
    }

    fn handle_message(&mut self, message: InboundMessage) {
        let event = match message {
            InboundMessage::Auth(response) => {
                let Some(event) = self.auth.handle_auth_response(&response) else {
                    return;
                };
                match response {
                    AuthResponse::Ok => self.flush(),
                    AuthResponse::Failed { .. } => self.credentials = None,
                }
                SessionEvent::Auth(event)
            }
            InboundMessage::RtcSignal(signal) => SessionEvent::RtcSignal(signal),
            InboundMessage::Control(control) => SessionEvent::Control(control),
            InboundMessage::TokenUpdated(delta) => SessionEvent::TokenUpdated(delta),
            InboundMessage::PointerPreview(preview) => SessionEvent::PointerPreview(preview),
            InboundMessage::DragPreview(preview) => SessionEvent::DragPreview(preview),
            InboundMessage::HeartbeatAck(ack) => SessionEvent::HeartbeatAck(ack),
            InboundMessage::Ack(ack) => SessionEvent::Ack(ack),
            InboundMessage::Nack(nack) => SessionEvent::Nack(nack),
            InboundMessage::Snapshot(snapshot) => SessionEvent::Snapshot(snapshot),
        };

        self.publish(event);
    }

    fn handle_heartbeat(&mut self) {
        let check = self.heartbeat.check_heartbeat(self.auth.state());

        if let HeartbeatCheck::TimedOut { elapsed } = check {
            let event = self
                .connection
                .abort(HEARTBEAT_TIMEOUT_CLOSE_CODE, WsError::HeartbeatTimeout(elapsed));
            self.handle_lifecycle(event);
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        _ = self.events.send(event);
    }
}
