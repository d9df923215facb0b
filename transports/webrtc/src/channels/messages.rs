//! Wire messages exchanged between the host and its joiners
//!
//! Every message is a JSON object tagged by `type`. In-band messages also
//! carry an `id` assigned per channel; out-of-band messages (`ping`, `pong`,
//! `keep-alive`, `bye-bye`) never do, and for `ping`/`pong` the `id` field is
//! the ping token instead.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Closed set of messages understood by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Greeting sent on channel open, echoed back by the joiner
    ConnectionEstablished {
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
        #[serde(rename = "usesTURN", default, skip_serializing_if = "Option::is_none")]
        uses_turn: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uuid: Option<String>,
    },

    /// Host verdict on the joiner's network path
    ConnectionValidation {
        #[serde(rename = "isApproved")]
        is_approved: bool,
    },

    Login {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    LoginSuccessful,
    IncorrectPassword,
    NoUsernameGiven,
    UsernameAlreadyTaken,

    Chat {
        message: String,
    },
    ChatRelay {
        message: String,
        username: String,
    },

    /// One fragment of a chunked message; index and length are omitted in the compact form
    HnwBurst {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        #[serde(rename = "fullLength", default, skip_serializing_if = "Option::is_none")]
        full_length: Option<usize>,
        #[serde(with = "base64_bytes")]
        parcel: Vec<u8>,
    },

    Ping {
        id: u64,
        #[serde(rename = "lastPing", default, skip_serializing_if = "Option::is_none")]
        last_ping: Option<u64>,
    },
    Pong {
        id: u64,
    },
    KeepAlive,
    ByeBye,

    /// Opaque payload forwarded to the embedding application
    Relay {
        payload: Value,
    },

    /// First model snapshot for a freshly logged-in joiner
    InitialModel {
        role: String,
        token: String,
        state: Value,
        view: Value,
    },

    #[serde(other)]
    Unknown,
}

impl Message {
    /// Wire tag of this message
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ConnectionEstablished { .. } => "connection-established",
            Message::ConnectionValidation { .. } => "connection-validation",
            Message::Login { .. } => "login",
            Message::LoginSuccessful => "login-successful",
            Message::IncorrectPassword => "incorrect-password",
            Message::NoUsernameGiven => "no-username-given",
            Message::UsernameAlreadyTaken => "username-already-taken",
            Message::Chat { .. } => "chat",
            Message::ChatRelay { .. } => "chat-relay",
            Message::HnwBurst { .. } => "hnw-burst",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::KeepAlive => "keep-alive",
            Message::ByeBye => "bye-bye",
            Message::Relay { .. } => "relay",
            Message::InitialModel { .. } => "initial-model",
            Message::Unknown => "unknown",
        }
    }

    /// Out-of-band messages skip ID assignment and chunking
    pub fn is_oob(&self) -> bool {
        matches!(
            self,
            Message::Ping { .. } | Message::Pong { .. } | Message::KeepAlive | Message::ByeBye
        )
    }
}

/// A message as it travels on a channel
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Per-channel sequence number, absent for out-of-band messages
    pub id: Option<u64>,

    pub message: Message,

    /// Original `type` tag when `message` is [`Message::Unknown`]
    pub unrecognized: Option<String>,
}

impl Envelope {
    /// Envelope without an ID
    pub fn bare(message: Message) -> Self {
        Self {
            id: None,
            message,
            unrecognized: None,
        }
    }

    /// Envelope carrying a sequence number
    ///
    /// The ID is dropped for out-of-band messages.
    pub fn with_id(id: u64, message: Message) -> Self {
        let id = (!message.is_oob()).then_some(id);
        Self {
            id,
            message,
            unrecognized: None,
        }
    }

    /// Wire tag, preferring the original tag of unrecognized messages
    pub fn type_name(&self) -> &str {
        match &self.unrecognized {
            Some(tag) => tag,
            None => self.message.type_name(),
        }
    }

    /// Flatten into the `{ type, id?, ...fields }` object sent on the wire
    pub fn to_value(&self) -> Result<Value> {
        if self.message == Message::Unknown {
            return Err(Error::SerializationError(format!(
                "cannot send unrecognized message type '{}'",
                self.type_name()
            )));
        }

        let mut value = serde_json::to_value(&self.message)?;
        if let (Some(id), Value::Object(fields)) = (self.id, &mut value) {
            if !self.message.is_oob() {
                fields.insert("id".to_string(), Value::from(id));
            }
        }
        Ok(value)
    }

    /// Parse a wire object, keeping the tag of types this host does not know
    pub fn from_value(value: Value) -> Result<Self> {
        let fields: &Map<String, Value> = value.as_object().ok_or_else(|| {
            Error::SerializationError("message is not a JSON object".to_string())
        })?;
        let tag = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::SerializationError("message has no 'type'".to_string()))?
            .to_string();
        let id = fields.get("id").and_then(Value::as_u64);

        let message: Message = serde_json::from_value(value)?;
        let unrecognized = (message == Message::Unknown).then_some(tag);
        let id = if message.is_oob() { None } else { id };

        Ok(Self {
            id,
            message,
            unrecognized,
        })
    }

    /// JSON text form, used on plain sockets
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    /// Parse the JSON text form
    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Envelope::from_value(value).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
