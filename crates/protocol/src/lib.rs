//! Wire protocol shared by the relay gateway and its clients.
//!
//! Every frame is a JSON object tagged by `type`. Clients send
//! [`ClientFrame`]s over the WebSocket; the gateway answers with
//! [`ServerFrame`]s. Message records have exactly five fields and are the
//! only durable artifact of the relay.

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

pub const PROTOCOL_VERSION: u32 = 1;

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const UNAUTHENTICATED: &str = "unauthenticated";
    pub const INVALID_MESSAGE: &str = "invalid_message";
    pub const PERSISTENCE_ERROR: &str = "persistence_error";
    pub const DELIVERY_FAILED: &str = "delivery_failed";
    pub const INVALID_REQUEST: &str = "invalid_request";
}

// ── Identities ───────────────────────────────────────────────────────────────

/// Identity ids arrive as JSON strings or integers depending on the issuer.
/// Both decode to the same string id.
pub mod id_format {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(id) => id,
            RawId::Unsigned(n) => n.to_string(),
            RawId::Signed(n) => n.to_string(),
        })
    }
}

/// A verified participant, as decoded from the connection token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// Public view of a presence entry, as broadcast in `presence_snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl From<&Identity> for PresenceUser {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            email: identity.email.clone(),
        }
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// A persisted one-to-one message. Content is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// The conversation this message belongs to.
    pub fn conversation(&self) -> Conversation {
        Conversation::between(&self.sender_id, &self.recipient_id)
    }

    pub fn involves(&self, identity_id: &str) -> bool {
        self.sender_id == identity_id || self.recipient_id == identity_id
    }
}

/// Unordered pair of participants. `between(a, b) == between(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Conversation {
    low: String,
    high: String,
}

impl Conversation {
    pub fn between(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }
}

impl std::fmt::Display for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Events a connected client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    RequestHistory,
    /// Missing fields decode as empty strings so that validation, not
    /// deserialization, reports them as an invalid message.
    SubmitMessage {
        #[serde(default)]
        content: String,
        #[serde(
            default,
            rename = "recipientId",
            deserialize_with = "id_format::deserialize"
        )]
        recipient_id: String,
    },
    Logout,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Events the gateway sends to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    PresenceSnapshot {
        users: Vec<PresenceUser>,
    },
    HistorySnapshot {
        messages: Vec<Message>,
    },
    MessagePushed {
        message: Message,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            message_id: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
