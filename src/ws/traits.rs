//! Core traits for the realtime socket infrastructure.

use serde::de::DeserializeOwned;

/// Readiness of a socket, mirroring the classic WebSocket `readyState` values.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Send capability over the one live socket.
///
/// Only the connection manager owns the underlying stream. Every other component talks to
/// the socket through this trait, which is limited to reading readiness and queueing text.
///
/// # Example
///
/// ```ignore
/// if socket.ready_state().is_open() {
///     socket.send_text(r#"{"t":"heartbeat"}"#.to_owned())?;
/// }
/// ```
pub trait Socket {
    /// Current readiness of the socket.
    fn ready_state(&self) -> ReadyState;

    /// Hand a text frame to the socket writer.
    ///
    /// Fails when the socket is not [`ReadyState::Open`] or its writer has gone away.
    fn send_text(&self, text: String) -> crate::Result<()>;
}

/// Message parser trait for converting raw frames to messages.
///
/// # Example
///
/// ```ignore
/// pub struct SimpleParser;
///
/// impl MessageParser<MyMessage> for SimpleParser {
///     fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<MyMessage>> {
///         let msg: MyMessage = serde_json::from_slice(bytes)?;
///         Ok(vec![msg])
///     }
/// }
/// ```
pub trait MessageParser<M: DeserializeOwned>: Send + Sync + 'static {
    /// Parse incoming bytes into messages.
    ///
    /// May return an empty vec if the frame carries nothing to deliver.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<M>>;
}
