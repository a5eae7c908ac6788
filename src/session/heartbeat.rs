use std::future::pending;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

use super::auth::AuthState;
use super::types::request::OutboundMessage;
use crate::ws::connection::SocketHandle;
use crate::ws::traits::Socket;

/// Result of one heartbeat check.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatCheck {
    /// Nothing was received for longer than the liveness window. The manager stopped itself.
    TimedOut {
        /// Silence observed at the time of the check
        elapsed: Duration,
    },
    /// A heartbeat frame went out
    Sent,
    /// Nothing to do: not authenticated, no open socket, or not running
    Skipped,
}

/// Periodic liveness ping plus stalled-connection detection.
///
/// The liveness clock is reset by *every* inbound frame, not only heartbeat acks. Checks only
/// act while the session is authenticated, so no heartbeat traffic ever precedes the
/// handshake.
#[derive(Debug)]
pub struct HeartbeatManager<S: Socket = SocketHandle> {
    interval: Duration,
    socket: Option<S>,
    ticker: Option<Interval>,
    last_message: Instant,
}

impl<S: Socket> HeartbeatManager<S> {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            socket: None,
            ticker: None,
            last_message: Instant::now(),
        }
    }

    /// Silence after which [`HeartbeatManager::check_heartbeat`] reports a timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.interval.saturating_mul(2)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Restart the recurring check against `socket`, resetting the liveness clock.
    pub fn start(&mut self, socket: S) {
        self.stop();

        let now = Instant::now();
        // `interval_at` rejects a zero period.
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(now + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.last_message = now;
        self.socket = Some(socket);
        self.ticker = Some(ticker);
    }

    /// Cancel the recurring check and drop the socket. Idempotent.
    pub fn stop(&mut self) {
        self.ticker = None;
        self.socket = None;
    }

    /// Note that a frame arrived.
    pub fn record_message(&mut self) {
        self.last_message = Instant::now();
    }

    #[must_use]
    pub fn time_since_last_message(&self) -> Duration {
        self.last_message.elapsed()
    }

    /// Wait for the next scheduled check. Never resolves while stopped.
    ///
    /// Cancel safe, so it can sit in a `tokio::select!` loop.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => pending().await,
        }
    }

    /// Either declare the connection dead or send a heartbeat, never both.
    pub fn check_heartbeat(&mut self, auth_state: AuthState) -> HeartbeatCheck {
        if auth_state != AuthState::Authenticated {
            return HeartbeatCheck::Skipped;
        }

        let elapsed = self.time_since_last_message();
        if self.is_running() && elapsed > self.timeout() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                ?elapsed,
                timeout = ?self.timeout(),
                "Heartbeat timeout: no message received"
            );

            self.stop();
            return HeartbeatCheck::TimedOut { elapsed };
        }

        let Some(socket) = self.socket.as_ref().filter(|s| s.ready_state().is_open()) else {
            return HeartbeatCheck::Skipped;
        };

        match OutboundMessage::Heartbeat
            .to_json()
            .and_then(|json| socket.send_text(json))
        {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Heartbeat sent");
                HeartbeatCheck::Sent
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "Heartbeat could not be sent");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                HeartbeatCheck::Skipped
            }
        }
    }
}
