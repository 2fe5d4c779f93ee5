//! Public session surface for one conversation.
//!
//! `ChatSession` composes the connection manager, the protocol decoder and the
//! message assembler behind a single consumer loop: [`ChatSession::recv`]
//! pulls transport events strictly in arrival order, applies them, notifies
//! the active listener and returns a typed [`SessionEvent`].

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use crate::stream::assembler::{
    AssembledMessage, Assembly, SessionAssembler, StreamDelta, StreamingMessage,
};
use crate::stream::client::{
    ChatClient, ConnectionEvent, ConnectionFailed, ConnectionManager, ConnectionState,
    ReconnectOutcome, StreamClientError,
};
use crate::stream::proto::{decode, ClientFrame, ProtocolEvent};

/// Read-only view for progressive rendering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveProjection {
    pub connection_state: ConnectionState,
    pub streaming_message_id: Option<String>,
    pub streaming_content: String,
    pub streaming_thinking: Vec<String>,
}

/// Session-level event returned by [`ChatSession::recv`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection moved to `Connecting` or `Open`.
    StateChanged(ConnectionState),
    /// Connection was lost; a reconnect attempt is pending.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts are exhausted. Terminal.
    ConnectionFailed(ConnectionFailed),
    /// The in-flight AI message changed by `delta`. Read the accumulated
    /// state through [`ChatSession::projection`].
    Progress {
        message_id: String,
        delta: StreamDelta,
    },
    /// A message was finalized.
    Completed(AssembledMessage),
    /// The in-flight AI message was dropped without completing.
    Discarded { message_id: String },
    Typing { is_typing: bool },
    /// Server error frame or undecodable frame. The connection stays open.
    ProtocolError { detail: String },
}

/// Receives completed messages and, optionally, streaming progress.
pub trait SessionListener: Send {
    fn on_message(&mut self, message: &AssembledMessage);

    /// Called after every change to the in-flight message, with the message
    /// as accumulated so far.
    fn on_progress(&mut self, _message: &StreamingMessage) {}
}

impl<F> SessionListener for F
where
    F: FnMut(&AssembledMessage) + Send,
{
    fn on_message(&mut self, message: &AssembledMessage) {
        (*self)(message)
    }
}

/// Handle for the listener registered by [`ChatSession::subscribe`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Subscription {
    id: u64,
}

struct ActiveListener {
    id: u64,
    listener: Box<dyn SessionListener>,
}

/// A chat session for one conversation at a time.
pub struct ChatSession {
    connection: ConnectionManager,
    assembler: SessionAssembler,
    listener: Option<ActiveListener>,
    next_subscription: u64,
    pending: VecDeque<SessionEvent>,
}

impl ChatSession {
    pub fn new(client: ChatClient) -> Self {
        Self {
            connection: ConnectionManager::new(client),
            assembler: SessionAssembler::new(),
            listener: None,
            next_subscription: 0,
            pending: VecDeque::new(),
        }
    }

    /// Connects to a conversation, replacing any current connection.
    ///
    /// Switching conversations discards the in-flight message and any
    /// undelivered events of the previous one. Must be called within a tokio
    /// runtime.
    pub fn connect(&mut self, conversation_id: &str) {
        if self.connection.conversation_id() != Some(conversation_id) {
            self.assembler.reset();
            self.pending.clear();
        }
        self.connection.connect(conversation_id);
    }

    /// Closes the connection. No event is delivered after this returns.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
        self.assembler.reset();
        self.pending.clear();
    }

    /// Sends a chat message on the open connection.
    ///
    /// Fails with [`StreamClientError::NotConnected`] unless the connection is
    /// open; nothing is buffered for later delivery.
    pub fn send(&self, text: &str) -> Result<(), StreamClientError> {
        self.connection.send(ClientFrame::Message {
            message: text.to_string(),
        })
    }

    pub fn send_typing(&self, is_typing: bool) -> Result<(), StreamClientError> {
        self.connection.send(ClientFrame::Typing { is_typing })
    }

    /// Registers the single active listener, replacing any previous one.
    pub fn subscribe<L>(&mut self, listener: L) -> Subscription
    where
        L: SessionListener + 'static,
    {
        self.next_subscription += 1;
        let id = self.next_subscription;
        self.listener = Some(ActiveListener {
            id,
            listener: Box::new(listener),
        });
        Subscription { id }
    }

    /// Removes the listener if `subscription` is still the active one.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        match &self.listener {
            Some(active) if active.id == subscription.id => {
                self.listener = None;
                true
            }
            _ => false,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.connection.reconnect_attempt()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.connection.conversation_id()
    }

    pub fn projection(&self) -> LiveProjection {
        let in_flight = self.assembler.in_flight();
        LiveProjection {
            connection_state: self.connection.state(),
            streaming_message_id: in_flight.map(|message| message.id.clone()),
            streaming_content: in_flight
                .map(|message| message.content.clone())
                .unwrap_or_default(),
            streaming_thinking: in_flight
                .map(|message| message.thinking.clone())
                .unwrap_or_default(),
        }
    }

    /// Receives the next session event.
    ///
    /// Returns `None` once the session is idle, closed or failed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let event = self.connection.next_event().await?;
            self.apply_connection_event(event);
        }
    }

    /// Drives the session until it goes quiet.
    ///
    /// Completed messages reach the listener as they are produced. Returns the
    /// terminal failure if reconnect attempts run out.
    pub async fn run(&mut self) -> Result<(), StreamClientError> {
        while let Some(event) = self.recv().await {
            if let SessionEvent::ConnectionFailed(failed) = event {
                return Err(failed.into());
            }
        }
        Ok(())
    }

    fn apply_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connecting { .. } => {
                self.pending
                    .push_back(SessionEvent::StateChanged(ConnectionState::Connecting));
            }
            ConnectionEvent::Opened => {
                self.pending
                    .push_back(SessionEvent::StateChanged(ConnectionState::Open));
            }
            ConnectionEvent::Frame(text) => {
                let event = decode(&text);
                if let ProtocolEvent::Error { detail } = &event {
                    if event.is_decode_failure() {
                        warn!(event = "frame_decode_failed", frame_len = text.len());
                        self.pending.push_back(SessionEvent::ProtocolError {
                            detail: detail.clone(),
                        });
                        return;
                    }
                }
                self.apply_protocol_event(event);
            }
            ConnectionEvent::Closed { reason, outcome } => {
                debug!(event = "connection_lost", reason = %reason);
                self.assemble(&ProtocolEvent::Close);
                self.push_reconnect_outcome(outcome);
            }
        }
    }

    fn apply_protocol_event(&mut self, event: ProtocolEvent) {
        self.assemble(&event);
        match event {
            ProtocolEvent::Close => {
                let outcome = self.connection.handle_remote_close();
                self.push_reconnect_outcome(outcome);
            }
            ProtocolEvent::Error { detail } => {
                self.pending.push_back(SessionEvent::ProtocolError { detail });
            }
            ProtocolEvent::Typing { is_typing } => {
                self.pending.push_back(SessionEvent::Typing { is_typing });
            }
            ProtocolEvent::Open
            | ProtocolEvent::UserMessage { .. }
            | ProtocolEvent::AiStart { .. }
            | ProtocolEvent::AiToken { .. }
            | ProtocolEvent::AiThinking { .. }
            | ProtocolEvent::AiComplete { .. } => {}
        }
    }

    fn assemble(&mut self, event: &ProtocolEvent) {
        for output in self.assembler.apply(event) {
            match output {
                Assembly::Completed(message) => {
                    if let Some(active) = self.listener.as_mut() {
                        active.listener.on_message(&message);
                    }
                    self.pending.push_back(SessionEvent::Completed(message));
                }
                Assembly::Progress { message_id, delta } => {
                    if let (Some(active), Some(message)) =
                        (self.listener.as_mut(), self.assembler.in_flight())
                    {
                        active.listener.on_progress(message);
                    }
                    self.pending
                        .push_back(SessionEvent::Progress { message_id, delta });
                }
                Assembly::Discarded { message_id } => {
                    self.pending
                        .push_back(SessionEvent::Discarded { message_id });
                }
            }
        }
    }

    fn push_reconnect_outcome(&mut self, outcome: ReconnectOutcome) {
        match outcome {
            ReconnectOutcome::Scheduled { attempt, delay } => {
                self.pending
                    .push_back(SessionEvent::Reconnecting { attempt, delay });
            }
            ReconnectOutcome::Failed(failed) => {
                self.pending.push_back(SessionEvent::ConnectionFailed(failed));
            }
            ReconnectOutcome::Ignored => {}
        }
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("connection", &self.connection)
            .field("assembler", &self.assembler)
            .field("subscribed", &self.listener.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}
