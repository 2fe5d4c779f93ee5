//! Wire frames exchanged with the chat service and the typed events decoded
//! from them.
//!
//! Every frame is a JSON object discriminated by its `type` field. Inbound
//! frames decode into [`ServerFrame`], which [`decode`] then lowers into a
//! [`ProtocolEvent`]. A frame that fails structural validation never becomes
//! any other variant: it is reported as [`ProtocolEvent::Error`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Ai,
}

/// Message body as carried by `user_message` and `ai_message_complete`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageMsg {
    #[serde(deserialize_with = "message_id")]
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Open {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    UserMessage {
        message: MessageMsg,
    },
    AiMessageStart {
        #[serde(deserialize_with = "message_id")]
        message_id: String,
    },
    AiMessageToken {
        #[serde(
            default,
            deserialize_with = "optional_message_id",
            skip_serializing_if = "Option::is_none"
        )]
        message_id: Option<String>,
        token: String,
    },
    AiThinking {
        #[serde(
            default,
            deserialize_with = "optional_message_id",
            skip_serializing_if = "Option::is_none"
        )]
        message_id: Option<String>,
        thinking: String,
    },
    AiMessageComplete {
        #[serde(
            default,
            deserialize_with = "optional_message_id",
            skip_serializing_if = "Option::is_none"
        )]
        message_id: Option<String>,
        message: MessageMsg,
    },
    Typing {
        is_typing: bool,
    },
    Error {
        #[serde(default, alias = "detail", skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Close {},
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { message: String },
    Typing { is_typing: bool },
}

impl ServerFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Typed inbound event. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Open,
    UserMessage { message: MessageMsg },
    AiStart { message_id: String },
    AiToken { text: String },
    AiThinking { text: String },
    AiComplete { message: MessageMsg },
    Typing { is_typing: bool },
    Error { detail: String },
    Close,
}

impl ProtocolEvent {
    fn decode_failure(err: &serde_json::Error) -> Self {
        Self::Error {
            detail: format!("{DECODE_FAILURE_PREFIX}{err}"),
        }
    }

    /// Returns true when this is the error produced for an undecodable frame.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Error { detail } if detail.starts_with(DECODE_FAILURE_PREFIX))
    }
}

const DECODE_FAILURE_PREFIX: &str = "decode failure: ";

impl From<ServerFrame> for ProtocolEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::Open { .. } => Self::Open,
            ServerFrame::UserMessage { message } => Self::UserMessage { message },
            ServerFrame::AiMessageStart { message_id } => Self::AiStart { message_id },
            ServerFrame::AiMessageToken { token, .. } => Self::AiToken { text: token },
            ServerFrame::AiThinking { thinking, .. } => Self::AiThinking { text: thinking },
            ServerFrame::AiMessageComplete { message, .. } => Self::AiComplete { message },
            ServerFrame::Typing { is_typing } => Self::Typing { is_typing },
            ServerFrame::Error { message } => Self::Error {
                detail: message.unwrap_or_else(|| "unspecified server error".to_string()),
            },
            ServerFrame::Close {} => Self::Close,
        }
    }
}

/// Decodes one raw text frame.
///
/// Never fails: malformed payloads come back as [`ProtocolEvent::Error`] so the
/// caller can absorb them without touching the connection.
pub fn decode(raw: &str) -> ProtocolEvent {
    match ServerFrame::from_text(raw) {
        Ok(frame) => frame.into(),
        Err(err) => ProtocolEvent::decode_failure(&err),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMessageId {
    Text(String),
    Number(u64),
}

impl From<RawMessageId> for String {
    fn from(raw: RawMessageId) -> Self {
        match raw {
            RawMessageId::Text(text) => text,
            RawMessageId::Number(number) => number.to_string(),
        }
    }
}

fn message_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawMessageId::deserialize(deserializer).map(String::from)
}

fn optional_message_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawMessageId>::deserialize(deserializer)?.map(String::from))
}

/// RFC 3339, or a naive ISO timestamp taken as UTC. Anything else is treated
/// as absent rather than failing the whole frame.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    Ok(NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc()))
}
