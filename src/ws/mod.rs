//! Core WebSocket infrastructure.
//!
//! This module owns the socket side of a realtime session: opening and re-opening the
//! connection, and the narrow [`Socket`] capability that the session components use to
//! talk through it.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: Connection lifecycle with handshake timeout, backoff reconnection
//!   and visibility recovery
//! - [`Socket`]: Readiness check plus send, implemented by [`connection::SocketHandle`]
//! - [`MessageParser`]: Trait for parsing incoming WebSocket messages
//!
//! # Example
//!
//! ```ignore
//! let mut connection = ConnectionManager::new(endpoint, &session_id, config)?;
//! connection.connect();
//! let event = connection.next_event().await;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod traits;

pub use connection::ConnectionManager;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
