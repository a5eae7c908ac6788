//! Joins a tabletop room and prints what the server sends.
//!
//! Reads the socket address from `TABLETOP_WS_URL`, the room secret from `TABLETOP_SECRET`
//! and an optional room from `TABLETOP_ROOM`.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=tabletop_realtime=debug,session=info cargo run --example session
//! ```

use std::env;
use std::time::Duration;

use futures::StreamExt as _;
use serde_json::json;
use tabletop_realtime::session::{AuthEvent, Client, Command, SessionEvent};
use tabletop_realtime::ws::config::Config;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint =
        env::var("TABLETOP_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8787/ws".to_owned());
    let secret = env::var("TABLETOP_SECRET")?;
    let room = env::var("TABLETOP_ROOM").ok();

    let client = Client::new(&endpoint, Config::default())?;
    let mut events = Box::pin(client.events());
    info!(endpoint = %client.endpoint(), session = client.session_id(), "Connecting");

    client.connect();
    timeout(
        Duration::from_secs(30),
        client.state_receiver().wait_for(|state| state.is_connected()),
    )
    .await??;

    client.authenticate(secret, room);
    client.send(Command::new("request-snapshot"));

    while let Ok(Some(event)) = timeout(Duration::from_secs(60), events.next()).await {
        match event {
            Ok(SessionEvent::Auth(AuthEvent::Failure { reason })) => {
                warn!(?reason, "Room rejected the secret");
                break;
            }
            Ok(SessionEvent::Auth(event)) => info!(?event, "Auth"),
            Ok(SessionEvent::Snapshot(snapshot)) => {
                info!(
                    initiative = ?snapshot.characters_with_initiative(),
                    "Room snapshot"
                );
                client.send(
                    Command::new("pointer-preview").with_field("pointer", json!({ "x": 0, "y": 0 })),
                );
            }
            Ok(other) => info!(event = ?other, "Event"),
            Err(e) => warn!(error = %e, "Event stream"),
        }
    }

    client.disconnect();
    Ok(())
}
