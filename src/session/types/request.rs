use secrecy::{ExposeSecret as _, SecretString};
use serde_json::{Map, Value, json};

use crate::Result;
use crate::error::Error;

/// A frame headed for the server.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Session handshake. Always sent straight away, even when other traffic is held back.
    Authenticate {
        secret: SecretString,
        room_id: Option<String>,
    },
    /// Liveness ping. Dropped rather than queued when it cannot be sent.
    Heartbeat,
    /// Any domain command (move, select, update, ...)
    Command(Command),
}

impl OutboundMessage {
    #[must_use]
    pub fn authenticate<S: Into<String>>(secret: S, room_id: Option<String>) -> Self {
        Self::Authenticate {
            secret: SecretString::from(secret.into()),
            room_id,
        }
    }

    /// Wire tag of the frame.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Heartbeat => "heartbeat",
            Self::Command(command) => command.tag(),
        }
    }

    /// Whether this frame is an `authenticate` command, typed or free-form.
    #[must_use]
    pub fn is_authenticate(&self) -> bool {
        self.tag() == "authenticate"
    }

    /// Whether this frame is a `heartbeat`, typed or free-form.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.tag() == "heartbeat"
    }

    /// Secret and room carried by an `authenticate` frame, typed or free-form.
    ///
    /// `None` for any other frame and for a free-form handshake without a string `secret`.
    #[must_use]
    pub fn into_handshake(self) -> Option<(SecretString, Option<String>)> {
        match self {
            Self::Authenticate { secret, room_id } => Some((secret, room_id)),
            Self::Command(command) if command.tag() == "authenticate" => {
                let secret = command.fields.get("secret").and_then(Value::as_str)?;
                let room_id = command
                    .fields
                    .get("roomId")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                Some((SecretString::from(secret.to_owned()), room_id))
            }
            Self::Heartbeat | Self::Command(_) => None,
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            Self::Authenticate { secret, room_id } => {
                let mut frame = json!({
                    "t": "authenticate",
                    "secret": secret.expose_secret(),
                });
                if let (Some(room_id), Value::Object(obj)) = (room_id, &mut frame) {
                    obj.insert("roomId".to_owned(), Value::String(room_id.clone()));
                }
                frame
            }
            Self::Heartbeat => json!({ "t": "heartbeat" }),
            Self::Command(command) => command.to_value(),
        };

        Ok(serde_json::to_string(&value)?)
    }
}

impl From<Command> for OutboundMessage {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

/// Free-form command frame: a `t` tag plus whatever fields the command needs.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tabletop_realtime::session::types::request::Command;
///
/// let command = Command::new("move-token")
///     .with_field("tokenId", json!("tok-1"))
///     .with_field("x", json!(4));
///
/// assert_eq!(command.tag(), "move-token");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    tag: String,
    fields: Map<String, Value>,
}

impl Command {
    #[must_use]
    pub fn new<S: Into<String>>(tag: S) -> Self {
        Self {
            tag: tag.into(),
            fields: Map::new(),
        }
    }

    /// Build a command from a JSON object carrying a string `t` field.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::validation("command frame must be a JSON object"));
        };

        match fields.remove("t") {
            Some(Value::String(tag)) if !tag.is_empty() => Ok(Self { tag, fields }),
            _ => Err(Error::validation(
                "command frame needs a non-empty string `t` field",
            )),
        }
    }

    #[must_use]
    pub fn with_field<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        let key = key.into();
        if key != "t" {
            self.fields.insert(key, value);
        }
        self
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    fn to_value(&self) -> Value {
        let mut frame = Map::with_capacity(self.fields.len() + 1);
        frame.insert("t".to_owned(), Value::String(self.tag.clone()));
        frame.extend(self.fields.clone());
        Value::Object(frame)
    }
}
