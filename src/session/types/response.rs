use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Every inbound frame, decoded once.
///
/// Frames are discriminated by their top-level `t` field. A frame whose tag is unknown, or
/// whose body does not fit its tag, is not an error: it is carried verbatim as a
/// [`RoomSnapshot`], including `null` and scalar payloads.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// WebRTC signaling relayed from another peer
    RtcSignal(RtcSignal),
    /// Reply to an `authenticate` command
    Auth(AuthResponse),
    /// Room and DM administration replies
    Control(ControlMessage),
    /// Incremental token update
    TokenUpdated(TokenUpdated),
    /// Another participant's pointer position
    PointerPreview(PointerPreview),
    /// Another participant's in-progress drag
    DragPreview(DragPreview),
    /// Reply to a `heartbeat` command
    HeartbeatAck(HeartbeatAck),
    /// A command was applied
    Ack(Ack),
    /// A command was rejected
    Nack(Nack),
    /// Full room state, or anything unrecognised
    Snapshot(RoomSnapshot),
}

impl InboundMessage {
    /// Classify an already parsed JSON value.
    #[must_use]
    pub fn classify(value: Value) -> Self {
        match WireFrame::deserialize(&value) {
            Ok(frame) => frame.into(),
            Err(_) => Self::Snapshot(RoomSnapshot(value)),
        }
    }

    /// Wire tag of this message, `None` for snapshots.
    #[must_use]
    pub fn tag(&self) -> Option<&'static str> {
        let tag = match self {
            Self::RtcSignal(_) => "rtc-signal",
            Self::Auth(AuthResponse::Ok) => "auth-ok",
            Self::Auth(AuthResponse::Failed { .. }) => "auth-failed",
            Self::Control(control) => control.tag(),
            Self::TokenUpdated(_) => "token-updated",
            Self::PointerPreview(_) => "pointer-preview",
            Self::DragPreview(_) => "drag-preview",
            Self::HeartbeatAck(_) => "heartbeat-ack",
            Self::Ack(_) => "ack",
            Self::Nack(_) => "nack",
            Self::Snapshot(_) => return None,
        };
        Some(tag)
    }
}

impl<'de> Deserialize<'de> for InboundMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::classify)
    }
}

/// WebRTC signal from a peer.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RtcSignal {
    /// Sending peer identifier
    pub from: String,
    /// Opaque signaling payload (offer, answer or candidate)
    pub signal: Value,
}

/// Server verdict on an authentication attempt.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    Ok,
    Failed { reason: Option<String> },
}

/// Replies to room password and DM elevation commands.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    RoomPasswordUpdated,
    RoomPasswordUpdateFailed { reason: Option<String> },
    DmStatus { is_dm: bool },
    DmElevationFailed { reason: Option<String> },
    DmPasswordUpdated,
    DmPasswordUpdateFailed { reason: Option<String> },
}

impl ControlMessage {
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::RoomPasswordUpdated => "room-password-updated",
            Self::RoomPasswordUpdateFailed { .. } => "room-password-update-failed",
            Self::DmStatus { .. } => "dm-status",
            Self::DmElevationFailed { .. } => "dm-elevation-failed",
            Self::DmPasswordUpdated => "dm-password-updated",
            Self::DmPasswordUpdateFailed { .. } => "dm-password-update-failed",
        }
    }
}

/// Incremental token update. Fields other than the state version are kept as sent.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenUpdated {
    /// Room state version this delta produces
    #[serde(rename = "stateVersion")]
    pub state_version: u64,
    /// Remaining payload fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PointerPreview {
    pub pointer: Value,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DragPreview {
    pub preview: Value,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeartbeatAck {
    /// Server timestamp echoed back
    pub timestamp: Value,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ack {
    #[serde(rename = "commandId")]
    pub command_id: String,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Nack {
    #[serde(rename = "commandId")]
    pub command_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Opaque room state. Interpreting it is left to game logic.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot(pub Value);

impl RoomSnapshot {
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Names (or ids) of characters that carry a non-empty initiative value.
    #[must_use]
    pub fn characters_with_initiative(&self) -> Vec<String> {
        let Some(characters) = self.0.get("characters").and_then(Value::as_array) else {
            return Vec::new();
        };

        characters
            .iter()
            .filter(|character| {
                character
                    .get("initiative")
                    .is_some_and(|initiative| match initiative {
                        Value::Null => false,
                        Value::String(s) => !s.is_empty(),
                        _ => true,
                    })
            })
            .map(|character| {
                character
                    .get("name")
                    .or_else(|| character.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_owned()
            })
            .collect()
    }
}

/// Strict wire shapes, tried before falling back to a snapshot.
#[derive(Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case")]
enum WireFrame {
    RtcSignal(RtcSignal),
    AuthOk,
    AuthFailed {
        #[serde(default)]
        reason: Option<String>,
    },
    RoomPasswordUpdated,
    RoomPasswordUpdateFailed {
        #[serde(default)]
        reason: Option<String>,
    },
    DmStatus {
        #[serde(rename = "isDM")]
        is_dm: bool,
    },
    DmElevationFailed {
        #[serde(default)]
        reason: Option<String>,
    },
    DmPasswordUpdated,
    DmPasswordUpdateFailed {
        #[serde(default)]
        reason: Option<String>,
    },
    TokenUpdated(TokenUpdated),
    PointerPreview(PointerPreview),
    DragPreview(DragPreview),
    HeartbeatAck(HeartbeatAck),
    Ack(Ack),
    Nack(Nack),
}

impl From<WireFrame> for InboundMessage {
    fn from(frame: WireFrame) -> Self {
        match frame {
            WireFrame::RtcSignal(signal) => Self::RtcSignal(signal),
            WireFrame::AuthOk => Self::Auth(AuthResponse::Ok),
            WireFrame::AuthFailed { reason } => Self::Auth(AuthResponse::Failed { reason }),
            WireFrame::RoomPasswordUpdated => Self::Control(ControlMessage::RoomPasswordUpdated),
            WireFrame::RoomPasswordUpdateFailed { reason } => {
                Self::Control(ControlMessage::RoomPasswordUpdateFailed { reason })
            }
            WireFrame::DmStatus { is_dm } => Self::Control(ControlMessage::DmStatus { is_dm }),
            WireFrame::DmElevationFailed { reason } => {
                Self::Control(ControlMessage::DmElevationFailed { reason })
            }
            WireFrame::DmPasswordUpdated => Self::Control(ControlMessage::DmPasswordUpdated),
            WireFrame::DmPasswordUpdateFailed { reason } => {
                Self::Control(ControlMessage::DmPasswordUpdateFailed { reason })
            }
            WireFrame::TokenUpdated(delta) => Self::TokenUpdated(delta),
            WireFrame::PointerPreview(preview) => Self::PointerPreview(preview),
            WireFrame::DragPreview(preview) => Self::DragPreview(preview),
            WireFrame::HeartbeatAck(ack) => Self::HeartbeatAck(ack),
            WireFrame::Ack(ack) => Self::Ack(ack),
            WireFrame::Nack(nack) => Self::Nack(nack),
        }
    }
}
