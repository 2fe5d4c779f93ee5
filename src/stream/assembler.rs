//! Reassembles streamed AI responses from protocol events.
//!
//! `SessionAssembler` holds at most one in-flight AI message. Content tokens
//! and thinking segments are appended in arrival order; the message is emitted
//! exactly once when the server completes it, when a newer `AiStart` flushes
//! it, or never if the connection drops first. User messages bypass the state
//! machine entirely.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::stream::proto::{MessageMsg, ProtocolEvent, Sender};

/// A finished chat message. Immutable once handed to a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledMessage {
    pub id: String,
    pub sender: Sender,
    pub content: String,
    pub thinking: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// The AI message currently being streamed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingMessage {
    pub id: String,
    pub content: String,
    pub thinking: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl StreamingMessage {
    fn new(id: String) -> Self {
        Self {
            id,
            content: String::new(),
            thinking: Vec::new(),
            started_at: Utc::now(),
        }
    }

    fn finish(self, timestamp: DateTime<Utc>) -> AssembledMessage {
        AssembledMessage {
            id: self.id,
            sender: Sender::Ai,
            content: self.content,
            thinking: self.thinking,
            timestamp,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssemblerState {
    Idle,
    Streaming,
}

/// Incremental change to the in-flight message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamDelta {
    Started,
    Token(String),
    Thinking(String),
}

/// Result of feeding one event to the assembler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assembly {
    /// A message was finalized.
    Completed(AssembledMessage),
    /// The in-flight message changed. Only the delta is carried; the full
    /// buffer stays readable through [`SessionAssembler::in_flight`].
    Progress {
        message_id: String,
        delta: StreamDelta,
    },
    /// The in-flight message was dropped without completing.
    Discarded { message_id: String },
}

#[derive(Debug, Default)]
pub struct SessionAssembler {
    in_flight: Option<StreamingMessage>,
}

impl SessionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AssemblerState {
        if self.in_flight.is_some() {
            AssemblerState::Streaming
        } else {
            AssemblerState::Idle
        }
    }

    pub fn in_flight(&self) -> Option<&StreamingMessage> {
        self.in_flight.as_ref()
    }

    /// Drops any in-flight message without emitting it.
    pub fn reset(&mut self) -> Option<Assembly> {
        self.in_flight
            .take()
            .map(|message| Assembly::Discarded {
                message_id: message.id,
            })
    }

    /// Applies one event and returns what it produced, in emission order.
    pub fn apply(&mut self, event: &ProtocolEvent) -> Vec<Assembly> {
        let mut out = Vec::new();
        match event {
            ProtocolEvent::UserMessage { message } => {
                out.push(Assembly::Completed(user_message(message)));
            }
            ProtocolEvent::AiStart { message_id } => {
                if let Some(previous) = self.in_flight.take() {
                    debug!(
                        event = "in_flight_message_flushed",
                        message_id = %previous.id,
                        next_message_id = %message_id
                    );
                    out.push(Assembly::Completed(previous.finish(Utc::now())));
                }
                out.push(Assembly::Progress {
                    message_id: message_id.clone(),
                    delta: StreamDelta::Started,
                });
                self.in_flight = Some(StreamingMessage::new(message_id.clone()));
            }
            ProtocolEvent::AiToken { text } => match self.in_flight.as_mut() {
                Some(message) => {
                    message.content.push_str(text);
                    out.push(Assembly::Progress {
                        message_id: message.id.clone(),
                        delta: StreamDelta::Token(text.clone()),
                    });
                }
                None => debug!(event = "token_without_message_dropped", len = text.len()),
            },
            ProtocolEvent::AiThinking { text } => match self.in_flight.as_mut() {
                Some(message) => {
                    message.thinking.push(text.clone());
                    out.push(Assembly::Progress {
                        message_id: message.id.clone(),
                        delta: StreamDelta::Thinking(text.clone()),
                    });
                }
                None => debug!(event = "thinking_without_message_dropped", len = text.len()),
            },
            ProtocolEvent::AiComplete { message } => {
                out.push(Assembly::Completed(self.complete(message)));
            }
            ProtocolEvent::Close | ProtocolEvent::Error { .. } => {
                if let Some(discarded) = self.reset() {
                    debug!(event = "in_flight_message_discarded", ?discarded);
                    out.push(discarded);
                }
            }
            ProtocolEvent::Open | ProtocolEvent::Typing { .. } => {}
        }
        out
    }

    fn complete(&mut self, server: &MessageMsg) -> AssembledMessage {
        let timestamp = server.timestamp.unwrap_or_else(Utc::now);
        let Some(local) = self.in_flight.take() else {
            debug!(event = "complete_without_start", message_id = %server.id);
            return AssembledMessage {
                id: server.id.clone(),
                sender: Sender::Ai,
                content: server.content.clone(),
                thinking: server.thinking.clone().unwrap_or_default(),
                timestamp,
            };
        };

        if local.id != server.id {
            warn!(
                event = "complete_id_mismatch",
                started_id = %local.id,
                completed_id = %server.id
            );
        }
        if local.content != server.content {
            debug!(
                event = "complete_content_differs",
                message_id = %local.id,
                local_len = local.content.len(),
                server_len = server.content.len()
            );
        }
        local.finish(timestamp)
    }
}

fn user_message(message: &MessageMsg) -> AssembledMessage {
    AssembledMessage {
        id: message.id.clone(),
        sender: Sender::User,
        content: message.content.clone(),
        thinking: Vec::new(),
        timestamp: message.timestamp.unwrap_or_else(Utc::now),
    }
}
