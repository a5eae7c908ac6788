//! Realtime session on top of the [`crate::ws`] connection layer.
//!
//! [`Client`] is the entry point. It composes one manager per concern, all owned by a
//! single background task:
//!
//! - [`warmup::ServerWarmupManager`]: best-effort HTTP ping that wakes a cold backend
//! - [`auth::AuthenticationManager`]: `authenticate` handshake and [`AuthState`]
//! - [`queue::MessageQueueManager`]: bounded outbound FIFO, flushed after authentication
//! - [`heartbeat::HeartbeatManager`]: liveness pings and stalled-connection detection
//! - [`router::MessageRouter`]: decodes inbound frames into [`types::response::InboundMessage`]
//!
//! Inbound traffic reaches collaborators as [`SessionEvent`]s. Connection and auth state are
//! observable through `watch` receivers.

pub mod auth;
pub mod client;
pub mod heartbeat;
pub mod queue;
pub mod router;
#[cfg(test)]
mod test_support;
pub mod types;
pub mod warmup;

pub use auth::{AuthEvent, AuthState};
pub use client::{Client, SessionEvent, Visibility};
pub use types::request::{Command, OutboundMessage};
