use super::types::response::InboundMessage;
use crate::Result;
use crate::ws::error::WsError;
use crate::ws::traits::MessageParser;

/// Turns raw text frames into [`InboundMessage`]s.
///
/// Malformed JSON is logged and dropped. It never reaches the session and never panics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageRouter;

impl MessageRouter {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    #[must_use]
    pub fn route(&self, text: &str) -> Option<InboundMessage> {
        match self.parse(text.as_bytes()) {
            Ok(mut messages) => {
                let message = messages.pop();
                #[cfg(feature = "tracing")]
                if let Some(message) = &message {
                    log_routed(message);
                }
                message
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    error = %e,
                    len = text.len(),
                    preview = frame_preview(text),
                    "Dropping malformed WebSocket frame"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                None
            }
        }
    }
}

impl MessageParser<InboundMessage> for MessageRouter {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<InboundMessage>> {
        let message = serde_json::from_slice(bytes).map_err(WsError::MessageParse)?;
        Ok(vec![message])
    }
}

/// Characters of a malformed frame kept in the log.
#[cfg(feature = "tracing")]
const PREVIEW_CHARS: usize = 32;

#[cfg(feature = "tracing")]
fn frame_preview(text: &str) -> &str {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((end, _)) => text.get(..end).unwrap_or(text),
        None => text,
    }
}

#[cfg(feature = "tracing")]
fn log_routed(message: &InboundMessage) {
    match message {
        InboundMessage::Snapshot(snapshot) => {
            let initiative = snapshot.characters_with_initiative();
            if initiative.is_empty() {
                tracing::trace!("Routing room snapshot");
            } else {
                tracing::debug!(?initiative, "Routing room snapshot with initiative order");
            }
        }
        other => tracing::trace!(tag = other.tag(), "Routing message"),
    }
}
