use secrecy::SecretString;
use tokio::sync::watch;

use super::types::request::OutboundMessage;
use super::types::response::AuthResponse;
use crate::ws::traits::Socket;

/// Where the session handshake stands.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Pending,
    Authenticated,
    Failed,
}

/// Notification emitted on every auth state change.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// An `authenticate` command went out
    Pending,
    /// Server accepted the secret
    Success,
    /// Server rejected the secret
    Failure { reason: Option<String> },
    /// Handshake state was cleared
    Reset,
}

/// Tracks the authentication handshake of the current socket.
///
/// Secrets are never retried automatically: after a failure the caller has to invoke
/// [`AuthenticationManager::authenticate`] again.
#[derive(Debug)]
pub struct AuthenticationManager {
    state_tx: watch::Sender<AuthState>,
}

impl Default for AuthenticationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthenticationManager {
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(AuthState::Unauthenticated);
        Self { state_tx }
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        *self.state_tx.borrow()
    }

    /// Subscribe to auth state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    /// Send the handshake over `socket`.
    ///
    /// Requires an open socket. Otherwise this logs, leaves the state untouched and returns
    /// `None`.
    pub fn authenticate<S: Socket>(
        &self,
        socket: Option<&S>,
        secret: &SecretString,
        room_id: Option<&str>,
    ) -> Option<AuthEvent> {
        let Some(socket) = socket.filter(|socket| socket.ready_state().is_open()) else {
            #[cfg(feature = "tracing")]
            tracing::warn!("Cannot authenticate: socket is not open");
            return None;
        };

        self.set_state(AuthState::Pending);

        let message = OutboundMessage::Authenticate {
            secret: secret.clone(),
            room_id: room_id.map(ToOwned::to_owned),
        };
        let sent = message.to_json().and_then(|json| socket.send_text(json));
        if let Err(e) = sent {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to send authenticate command");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        Some(AuthEvent::Pending)
    }

    /// Return to [`AuthState::Unauthenticated`].
    pub fn reset(&self) -> AuthEvent {
        self.set_state(AuthState::Unauthenticated);
        AuthEvent::Reset
    }

    /// Apply the server verdict.
    ///
    /// `auth-ok` only counts while a handshake is pending; a stray one is ignored and yields
    /// `None`.
    pub fn handle_auth_response(&self, response: &AuthResponse) -> Option<AuthEvent> {
        let event = match response {
            AuthResponse::Ok if self.state() != AuthState::Pending => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    state = %self.state(),
                    "Ignoring auth-ok without a pending handshake"
                );
                return None;
            }
            AuthResponse::Ok => {
                self.set_state(AuthState::Authenticated);
                AuthEvent::Success
            }
            AuthResponse::Failed { reason } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?reason, "Authentication rejected");

                self.set_state(AuthState::Failed);
                AuthEvent::Failure {
                    reason: reason.clone(),
                }
            }
        };

        Some(event)
    }

    fn set_state(&self, state: AuthState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(%state, "Auth state changed");

        self.state_tx.send_replace(state);
    }
}
