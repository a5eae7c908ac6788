#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::Stream;
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tabletop_realtime::Result;
use tabletop_realtime::session::{AuthEvent, AuthState, Client, Command, SessionEvent, Visibility};
use tabletop_realtime::ws::config::{Config, ReconnectConfig};
use tabletop_realtime::ws::connection::ConnectionState;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

const WAIT: Duration = Duration::from_secs(5);

/// What the server pushes to every live connection.
#[derive(Debug, Clone)]
enum ServerFrame {
    Text(String),
    /// Drop the TCP stream without a closing handshake
    Drop,
}

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    frame_tx: broadcast::Sender<ServerFrame>,
    /// Request URI of every accepted connection
    connection_rx: mpsc::UnboundedReceiver<String>,
    /// Text frames sent by clients
    received_rx: mpsc::UnboundedReceiver<Value>,
    /// Close codes sent by clients
    close_rx: mpsc::UnboundedReceiver<u16>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (frame_tx, _) = broadcast::channel::<ServerFrame>(100);
        let (connection_tx, connection_rx) = mpsc::unbounded_channel::<String>();
        let (received_tx, received_rx) = mpsc::unbounded_channel::<Value>();
        let (close_tx, close_rx) = mpsc::unbounded_channel::<u16>();

        let broadcast_tx = frame_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let broadcast_tx = broadcast_tx.clone();
                let connection_tx = connection_tx.clone();
                let received_tx = received_tx.clone();
                let close_tx = close_tx.clone();

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    let mut uri = String::new();
                    let handshake = tokio_tungstenite::accept_hdr_async(
                        stream,
                        |request: &Request, response: Response| {
                            uri = request.uri().to_string();
                            Ok::<_, ErrorResponse>(response)
                        },
                    )
                    .await;

                    // Plain HTTP requests (the warmup ping) end up here.
                    let Ok(ws_stream) = handshake else {
                        return;
                    };

                    let (mut write, mut read) = ws_stream.split();
                    let mut frame_rx = broadcast_tx.subscribe();
                    drop(connection_tx.send(uri));

                    loop {
                        tokio::select! {
                            // Handle incoming messages from client
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let value = serde_json::from_str(text.as_str()).unwrap();
                                        drop(received_tx.send(value));
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        if let Some(frame) = frame {
                                            drop(close_tx.send(u16::from(frame.code)));
                                        }
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            // Handle outgoing messages to client
                            frame = frame_rx.recv() => {
                                match frame {
                                    Ok(ServerFrame::Text(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerFrame::Drop) | Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            frame_tx,
            connection_rx,
            received_rx,
            close_rx,
        }
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a text frame to all connected clients.
    fn send(&self, message: &str) {
        drop(self.frame_tx.send(ServerFrame::Text(message.to_owned())));
    }

    /// Abruptly drop every live connection.
    fn drop_all(&self) {
        drop(self.frame_tx.send(ServerFrame::Drop));
    }

    /// Wait for the next accepted connection, returning its request URI.
    async fn next_connection(&mut self) -> Option<String> {
        self.next_connection_within(WAIT).await
    }

    async fn next_connection_within(&mut self, wait: Duration) -> Option<String> {
        timeout(wait, self.connection_rx.recv()).await.ok().flatten()
    }

    /// Receive the next client frame that is not a heartbeat.
    async fn recv(&mut self) -> Option<Value> {
        loop {
            let frame = timeout(WAIT, self.received_rx.recv()).await.ok().flatten()?;
            if frame["t"] != "heartbeat" {
                return Some(frame);
            }
        }
    }

    /// Receive the next client frame with the given tag.
    async fn recv_tagged(&mut self, tag: &str) -> Option<Value> {
        loop {
            let frame = timeout(WAIT, self.received_rx.recv()).await.ok().flatten()?;
            if frame["t"] == tag {
                return Some(frame);
            }
        }
    }

    async fn next_close(&mut self) -> Option<u16> {
        timeout(WAIT, self.close_rx.recv()).await.ok().flatten()
    }
}

fn config() -> Config {
    Config::builder()
        .warmup_timeout(Duration::from_secs(1))
        .reconnect(
            ReconnectConfig::builder()
                .max_attempts(5)
                .initial_backoff(Duration::from_millis(50))
                .max_backoff(Duration::from_millis(200))
                .build(),
        )
        .build()
}

async fn wait_for_state<F>(client: &Client, predicate: F)
where
    F: Fn(&ConnectionState) -> bool,
{
    let mut state_rx = client.state_receiver();
    timeout(WAIT, state_rx.wait_for(|state| predicate(state)))
        .await
        .unwrap()
        .unwrap();
}

async fn wait_for_auth(client: &Client, expected: AuthState) {
    let mut auth_rx = client.auth_receiver();
    timeout(WAIT, auth_rx.wait_for(|state| *state == expected))
        .await
        .unwrap()
        .unwrap();
}

/// Next event that is not an auth notification.
async fn next_routed<S>(events: &mut S) -> SessionEvent
where
    S: Stream<Item = Result<SessionEvent>> + Unpin,
{
    loop {
        let event = timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap();
        if !matches!(event, SessionEvent::Auth(_)) {
            return event;
        }
    }
}

/// Connect, wait for the server side, authenticate and complete the handshake.
async fn authenticated_session(server: &mut MockWsServer, config: Config) -> Client {
    let client = Client::new(&server.ws_url("/ws"), config).unwrap();
    client.connect();
    server.next_connection().await.unwrap();
    wait_for_state(&client, |state| state.is_connected()).await;

    client.authenticate("secret", None);
    assert_eq!(server.recv_tagged("authenticate").await.unwrap()["secret"], "secret");
    server.send(r#"{"t":"auth-ok"}"#);
    wait_for_auth(&client, AuthState::Authenticated).await;

    client
}

mod handshake {
    use super::*;

    #[tokio::test]
    async fn queued_messages_flush_in_order_after_auth_ok() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(&server.ws_url("/ws"), config()).unwrap();

        for n in 1..=3 {
            client.send(Command::new("move-token").with_field("n", json!(n)));
        }

        client.connect();
        let uri = server.next_connection().await.unwrap();
        assert!(
            uri.contains(&format!("sessionId={}", client.session_id())),
            "session id missing from {uri}"
        );
        wait_for_state(&client, |state| state.is_connected()).await;
        assert!(client.is_connected(), "client should report the open socket");

        client.authenticate("secret", Some("room-1".to_owned()));
        assert_eq!(
            server.recv().await.unwrap(),
            json!({ "t": "authenticate", "secret": "secret", "roomId": "room-1" }),
            "handshake must be the first frame on the wire"
        );
        wait_for_auth(&client, AuthState::Pending).await;

        server.send(r#"{"t":"auth-ok"}"#);

        for n in 1..=3 {
            assert_eq!(
                server.recv().await.unwrap(),
                json!({ "t": "move-token", "n": n }),
                "queued messages must keep enqueue order"
            );
        }
        assert_eq!(client.auth_state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn sends_go_straight_out_once_authenticated() {
        let mut server = MockWsServer::start().await;
        let client = authenticated_session(&mut server, config()).await;

        client.send(Command::new("select-token").with_field("tokenId", json!("tok-1")));

        assert_eq!(
            server.recv().await.unwrap(),
            json!({ "t": "select-token", "tokenId": "tok-1" })
        );
    }

    #[tokio::test]
    async fn auth_failure_is_reported_with_reason() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(&server.ws_url("/ws"), config()).unwrap();
        let mut events = Box::pin(client.events());

        client.connect();
        server.next_connection().await.unwrap();
        wait_for_state(&client, |state| state.is_connected()).await;

        client.authenticate("wrong", None);
        server.recv_tagged("authenticate").await.unwrap();
        server.send(r#"{"t":"auth-failed","reason":"bad secret"}"#);

        let failure = loop {
            let event = timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap();
            if let SessionEvent::Auth(AuthEvent::Failure { reason }) = event {
                break reason;
            }
        };

        assert_eq!(failure.as_deref(), Some("bad secret"));
        assert_eq!(client.auth_state(), AuthState::Failed);
    }

    #[tokio::test]
    async fn premature_authenticate_is_ignored() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(&server.ws_url("/ws"), config()).unwrap();

        client.authenticate("secret", None);
        client.connect();
        server.next_connection().await.unwrap();
        wait_for_state(&client, |state| state.is_connected()).await;

        client.send(Command::new("select-token"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(client.auth_state(), AuthState::Unauthenticated);
        assert!(
            server.received_rx.try_recv().is_err(),
            "nothing may be sent before a handshake on an open socket"
        );
    }

    #[tokio::test]
    async fn free_form_authenticate_command_drives_the_handshake() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(&server.ws_url("/ws"), config()).unwrap();

        client.connect();
        server.next_connection().await.unwrap();
        wait_for_state(&client, |state| state.is_connected()).await;

        client.send(
            Command::from_value(json!({ "t": "authenticate", "secret": "s", "roomId": "room-2" }))
                .unwrap(),
        );
        assert_eq!(
            server.recv().await.unwrap(),
            json!({ "t": "authenticate", "secret": "s", "roomId": "room-2" })
        );
        wait_for_auth(&client, AuthState::Pending).await;

        client.send(Command::new("move-token").with_field("tokenId", json!("tok-1")));
        server.send(r#"{"t":"auth-ok"}"#);

        assert_eq!(
            server.recv().await.unwrap(),
            json!({ "t": "move-token", "tokenId": "tok-1" }),
            "held command must flush once the free-form handshake is accepted"
        );
        assert_eq!(client.auth_state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn authenticate_command_without_secret_is_not_sent() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(&server.ws_url("/ws"), config()).unwrap();

        client.connect();
        server.next_connection().await.unwrap();
        wait_for_state(&client, |state| state.is_connected()).await;

        client.send(Command::new("authenticate"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(client.auth_state(), AuthState::Unauthenticated);
        assert!(
            server.received_rx.try_recv().is_err(),
            "a handshake without a secret must not reach the wire"
        );
    }
}

mod routing {
    use super::*;

    #[tokio::test]
    async fn inbound_frames_become_typed_events() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(&server.ws_url("/ws"), config()).unwrap();
        let mut events = Box::pin(client.events());

        client.connect();
        server.next_connection().await.unwrap();

        server.send("not json");
        server.send(r#"{"t":"rtc-signal","from":"peer-1","signal":{"type":"offer"}}"#);
        server.send(r#"{"t":"nack","commandId":"c-1","reason":"stale"}"#);
        server.send(r#"{"tokens":[{"id":"tok-1"}]}"#);
        server.send("null");

        let SessionEvent::RtcSignal(signal) = next_routed(&mut events).await else {
            panic!("invalid JSON must be dropped and the signal routed");
        };
        assert_eq!(signal.from, "peer-1");
        assert_eq!(signal.signal, json!({ "type": "offer" }));

        let SessionEvent::Nack(nack) = next_routed(&mut events).await else {
            panic!("expected a nack");
        };
        assert_eq!(nack.command_id, "c-1");
        assert_eq!(nack.reason.as_deref(), Some("stale"));

        let SessionEvent::Snapshot(snapshot) = next_routed(&mut events).await else {
            panic!("expected a snapshot");
        };
        assert_eq!(snapshot.as_value(), &json!({ "tokens": [{ "id": "tok-1" }] }));

        let SessionEvent::Snapshot(snapshot) = next_routed(&mut events).await else {
            panic!("null must be delivered as a snapshot");
        };
        assert_eq!(snapshot.as_value(), &Value::Null);
    }

    #[tokio::test]
    async fn control_frames_are_delivered() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(&server.ws_url("/ws"), config()).unwrap();
        let mut events = Box::pin(client.events());

        client.connect();
        server.next_connection().await.unwrap();
        server.send(r#"{"t":"dm-status","isDM":true}"#);

        let event = next_routed(&mut events).await;
        assert!(
            matches!(event, SessionEvent::Control(ref control) if control.tag() == "dm-status"),
            "unexpected event: {event:?}"
        );
    }
}

mod reconnection {
    use super::*;

    #[tokio::test]
    async fn reconnects_and_replays_authentication_after_server_drop() {
        let mut server = MockWsServer::start().await;
        let client = authenticated_session(&mut server, config()).await;

        server.drop_all();

        let uri = server.next_connection().await;
        assert!(uri.is_some(), "client should reconnect after the drop");
        assert_eq!(
            server.recv_tagged("authenticate").await.unwrap()["secret"],
            "secret",
            "accepted credentials are replayed on the new socket"
        );

        client.send(Command::new("move-token").with_field("n", json!(9)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.send(r#"{"t":"auth-ok"}"#);

        assert_eq!(
            server.recv().await.unwrap(),
            json!({ "t": "move-token", "n": 9 }),
            "message held during re-auth is flushed afterwards"
        );
    }

    #[tokio::test]
    async fn disconnect_closes_normally_and_never_retries() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(&server.ws_url("/ws"), config()).unwrap();

        client.connect();
        server.next_connection().await.unwrap();
        wait_for_state(&client, |state| state.is_connected()).await;

        client.disconnect();

        assert_eq!(server.next_close().await, Some(1000));
        wait_for_state(&client, |state| *state == ConnectionState::Disconnected).await;
        assert!(
            server
                .next_connection_within(Duration::from_millis(500))
                .await
                .is_none(),
            "no reconnection may follow a deliberate disconnect"
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn visibility_skips_the_backoff_wait() {
        let mut server = MockWsServer::start().await;
        let config = Config::builder()
            .warmup_timeout(Duration::from_secs(1))
            .reconnect(
                ReconnectConfig::builder()
                    .initial_backoff(Duration::from_secs(30))
                    .build(),
            )
            .build();
        let client = Client::new(&server.ws_url("/ws"), config).unwrap();

        client.connect();
        server.next_connection().await.unwrap();
        server.drop_all();
        wait_for_state(&client, |state| {
            matches!(state, ConnectionState::Reconnecting { .. })
        })
        .await;

        client.set_visibility(Visibility::Hidden);
        assert!(
            server
                .next_connection_within(Duration::from_millis(200))
                .await
                .is_none(),
            "hidden host must keep waiting"
        );

        client.set_visibility(Visibility::Visible);
        assert!(
            server.next_connection().await.is_some(),
            "becoming visible should reconnect well before the 30s backoff"
        );
    }

    #[tokio::test]
    async fn exhausted_budget_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = Config::builder()
            .warmup_timeout(Duration::from_millis(200))
            .reconnect(
                ReconnectConfig::builder()
                    .max_attempts(2)
                    .initial_backoff(Duration::from_millis(10))
                    .build(),
            )
            .build();
        let client = Client::new(&format!("ws://{addr}/ws"), config).unwrap();

        client.connect();

        wait_for_state(&client, |state| *state == ConnectionState::Failed).await;
    }
}

mod heartbeat {
    use super::*;

    #[tokio::test]
    async fn silent_server_triggers_heartbeat_timeout_and_reconnect() {
        let mut server = MockWsServer::start().await;
        let config = Config::builder()
            .heartbeat_interval(Duration::from_millis(100))
            .warmup_timeout(Duration::from_secs(1))
            .reconnect(
                ReconnectConfig::builder()
                    .initial_backoff(Duration::from_millis(50))
                    .build(),
            )
            .build();
        let _client = authenticated_session(&mut server, config).await;

        assert!(
            server.recv_tagged("heartbeat").await.is_some(),
            "authenticated session should ping"
        );
        assert_eq!(
            server.next_close().await,
            Some(4001),
            "silence past twice the interval closes with the heartbeat code"
        );
        assert!(
            server.next_connection().await.is_some(),
            "heartbeat timeout runs the reconnect path"
        );
    }
}
