//! Websocket transport and connection lifecycle.
//!
//! [`ChatClient`] carries endpoint and reconnect configuration.
//! [`ConnectionManager`] owns at most one physical connection per
//! conversation and applies the bounded linear reconnect policy. Each physical
//! connection is serviced by a short-lived link task; the manager itself only
//! advances when its owner polls [`ConnectionManager::next_event`], so every
//! state change happens on the consumer's side.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::retry::ReconnectPolicy;
use crate::stream::proto::ClientFrame;

/// Default websocket endpoint of the chat service. Conversations live at
/// `{endpoint}/{conversation_id}/`.
pub const CHAT_ENDPOINT: &str = "ws://localhost:8000/ws/chat";

/// Entry point for creating chat sessions.
#[derive(Clone, Debug)]
pub struct ChatClient {
    api_key: Option<SecretString>,
    endpoint: String,
    reconnect: ReconnectPolicy,
}

impl ChatClient {
    pub fn new() -> Self {
        Self {
            api_key: None,
            endpoint: CHAT_ENDPOINT.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Sends the key as an `x-api-key` header on every connection.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Overrides the websocket endpoint. Trailing whitespace and slashes are
    /// stripped.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().trim_end_matches('/').to_string();
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }

    pub fn conversation_url(&self, conversation_id: &str) -> String {
        format!("{}/{}/", self.endpoint, conversation_id)
    }

    /// Creates an unconnected session bound to this client's configuration.
    pub fn session(&self) -> crate::stream::session::ChatSession {
        crate::stream::session::ChatSession::new(self.clone())
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a conversation connection.
///
/// ```text
/// Idle -> Connecting -> Open -> Reconnecting -> Connecting -> ...
///                                    \-> Failed (attempts exhausted)
/// any  -> Closed (disconnect)
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match next {
            Connecting | Closed => true,
            Open => self == Connecting,
            Reconnecting => matches!(self, Connecting | Open),
            Failed => matches!(self, Connecting | Open | Reconnecting),
            Idle => false,
        }
    }
}

/// Terminal failure after the reconnect policy is exhausted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("connection to conversation {conversation_id} failed after {attempts} reconnect attempts")]
pub struct ConnectionFailed {
    pub conversation_id: String,
    pub attempts: u32,
}

/// Errors produced by the realtime transport and session surface.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    /// Outbound frame attempted while the connection is not open. Nothing is
    /// queued.
    #[error("not connected (connection is {state:?})")]
    NotConnected { state: ConnectionState },

    /// Outbound queue of the current link is gone.
    #[error("send queue is closed")]
    SendQueueClosed,

    #[error(transparent)]
    ConnectionFailed(#[from] ConnectionFailed),
}

/// What the manager did after losing its link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Scheduled { attempt: u32, delay: Duration },
    Failed(ConnectionFailed),
    /// No live connection to recover (closed, failed or never opened).
    Ignored,
}

/// Transport-level event surfaced by [`ConnectionManager::next_event`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A backoff elapsed and a new physical connection is being opened.
    Connecting { attempt: u32 },
    /// Handshake completed; the connection is open.
    Opened,
    /// One raw inbound text frame.
    Frame(String),
    /// The physical connection went away. `outcome` is the reconnect decision
    /// that was already applied.
    Closed {
        reason: String,
        outcome: ReconnectOutcome,
    },
}

/// Owns the physical connection of one conversation.
#[derive(Debug)]
pub struct ConnectionManager {
    client: ChatClient,
    conversation_id: Option<String>,
    state: ConnectionState,
    reconnect_attempt: u32,
    suppress_reconnect: bool,
    link: Option<Link>,
    backoff: Option<Pin<Box<Sleep>>>,
}

impl ConnectionManager {
    pub fn new(client: ChatClient) -> Self {
        Self {
            client,
            conversation_id: None,
            state: ConnectionState::Idle,
            reconnect_attempt: 0,
            suppress_reconnect: false,
            link: None,
            backoff: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Opens a connection to `conversation_id`.
    ///
    /// Returns `false` when already open to the same conversation. Otherwise
    /// any existing connection or pending reconnect is torn down first, the
    /// attempt counter is reset, and the state restarts at `Connecting`.
    /// Must be called within a tokio runtime.
    pub fn connect(&mut self, conversation_id: &str) -> bool {
        if self.state == ConnectionState::Open
            && self.conversation_id.as_deref() == Some(conversation_id)
        {
            debug!(event = "connect_already_open", conversation_id);
            return false;
        }

        self.backoff = None;
        self.link = None;
        self.conversation_id = Some(conversation_id.to_string());
        self.reconnect_attempt = 0;
        self.suppress_reconnect = false;
        self.open_link();
        true
    }

    /// Closes the connection and cancels any pending reconnect.
    ///
    /// Once this returns the manager yields no further events.
    pub fn disconnect(&mut self) {
        self.suppress_reconnect = true;
        self.backoff = None;
        self.link = None;
        self.transition(ConnectionState::Closed);
    }

    /// Queues a frame on the open connection. Fails fast when not open.
    pub fn send(&self, frame: ClientFrame) -> Result<(), StreamClientError> {
        let link = match (&self.link, self.state) {
            (Some(link), ConnectionState::Open) => link,
            (_, state) => return Err(StreamClientError::NotConnected { state }),
        };
        link.outbound
            .send(frame)
            .map_err(|_| StreamClientError::SendQueueClosed)
    }

    /// Drops the current link at the server's request and schedules a
    /// reconnect.
    pub fn handle_remote_close(&mut self) -> ReconnectOutcome {
        self.link = None;
        self.schedule_reconnect()
    }

    /// Waits for the next transport event.
    ///
    /// Returns `None` when there is neither a live link nor a pending reconnect
    /// (idle, closed or failed). Cancel safe.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        if self.link.is_none() && self.backoff.is_none() {
            return None;
        }

        let wake = tokio::select! {
            event = recv_link(self.link.as_mut()) => Wake::Link(event),
            () = wait_backoff(self.backoff.as_mut()) => Wake::Backoff,
        };

        match wake {
            Wake::Backoff => {
                self.backoff = None;
                self.open_link();
                Some(ConnectionEvent::Connecting {
                    attempt: self.reconnect_attempt,
                })
            }
            Wake::Link(Some(LinkEvent::Connected)) => {
                self.reconnect_attempt = 0;
                self.transition(ConnectionState::Open);
                Some(ConnectionEvent::Opened)
            }
            Wake::Link(Some(LinkEvent::Text(text))) => Some(ConnectionEvent::Frame(text)),
            Wake::Link(Some(LinkEvent::Closed { reason })) => {
                self.link = None;
                let outcome = self.schedule_reconnect();
                Some(ConnectionEvent::Closed { reason, outcome })
            }
            Wake::Link(None) => {
                self.link = None;
                let outcome = self.schedule_reconnect();
                Some(ConnectionEvent::Closed {
                    reason: "link task ended".to_string(),
                    outcome,
                })
            }
        }
    }

    fn schedule_reconnect(&mut self) -> ReconnectOutcome {
        if self.suppress_reconnect
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Open
            )
        {
            return ReconnectOutcome::Ignored;
        }
        let conversation_id = self.conversation_id.clone().unwrap_or_default();
        let policy = self.client.reconnect_policy();

        self.reconnect_attempt += 1;
        if !policy.allows(self.reconnect_attempt) {
            let failed = ConnectionFailed {
                conversation_id,
                attempts: self.reconnect_attempt - 1,
            };
            warn!(
                event = "connection_failed",
                conversation_id = %failed.conversation_id,
                attempts = failed.attempts
            );
            self.transition(ConnectionState::Failed);
            return ReconnectOutcome::Failed(failed);
        }

        let delay = policy.delay_for_attempt(self.reconnect_attempt);
        debug!(
            event = "reconnect_scheduled",
            conversation_id = %conversation_id,
            attempt = self.reconnect_attempt,
            delay_ms = delay.as_millis() as u64
        );
        self.backoff = Some(Box::pin(tokio::time::sleep(delay)));
        self.transition(ConnectionState::Reconnecting);
        ReconnectOutcome::Scheduled {
            attempt: self.reconnect_attempt,
            delay,
        }
    }

    fn open_link(&mut self) {
        let Some(conversation_id) = self.conversation_id.as_deref() else {
            return;
        };
        let url = self.client.conversation_url(conversation_id);
        self.link = Some(Link::spawn(url, self.client.api_key.clone()));
        self.transition(ConnectionState::Connecting);
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal connection transition {:?} -> {next:?}",
            self.state
        );
        debug!(
            event = "connection_state",
            from = ?self.state,
            to = ?next,
            attempt = self.reconnect_attempt
        );
        self.state = next;
    }

    #[cfg(test)]
    pub(crate) fn force_open(&mut self, conversation_id: &str) {
        self.conversation_id = Some(conversation_id.to_string());
        self.state = ConnectionState::Open;
    }
}

enum Wake {
    Link(Option<LinkEvent>),
    Backoff,
}

async fn recv_link(link: Option<&mut Link>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => pending().await,
    }
}

async fn wait_backoff(backoff: Option<&mut Pin<Box<Sleep>>>) {
    match backoff {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

#[derive(Debug)]
enum LinkEvent {
    Connected,
    Text(String),
    Closed { reason: String },
}

/// Channels to the task servicing one physical websocket.
///
/// Dropping the link closes both channels: the task then closes the socket and
/// nothing it produces afterwards can reach the manager.
#[derive(Debug)]
struct Link {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    fn spawn(url: String, api_key: Option<SecretString>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            link_worker(url, api_key, outbound_rx, inbound_tx).await;
        });

        Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
        }
    }
}

async fn link_worker(
    url: String,
    api_key: Option<SecretString>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    inbound_tx: mpsc::UnboundedSender<LinkEvent>,
) {
    let reason = match run_link(&url, api_key.as_ref(), &mut outbound_rx, &inbound_tx).await {
        Ok(reason) => reason,
        Err(err) => err.to_string(),
    };
    debug!(event = "link_closed", url = %url, reason = %reason);
    let _ = inbound_tx.send(LinkEvent::Closed { reason });
}

async fn run_link(
    url: &str,
    api_key: Option<&SecretString>,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    inbound_tx: &mpsc::UnboundedSender<LinkEvent>,
) -> Result<String, StreamClientError> {
    let mut request = url.into_client_request()?;
    if let Some(api_key) = api_key {
        let header = api_key.expose_secret().parse()?;
        request.headers_mut().insert("x-api-key", header);
    }

    let (mut socket, _) = connect_async(request).await?;
    if inbound_tx.send(LinkEvent::Connected).is_err() {
        let _ = socket.close(None).await;
        return Ok("session dropped during handshake".to_string());
    }

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        let text = frame.to_text()?;
                        socket.send(Message::Text(text.into())).await?;
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return Ok("closed by client".to_string());
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound_tx.send(LinkEvent::Text(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        let text = String::from_utf8_lossy(&payload).into_owned();
                        let _ = inbound_tx.send(LinkEvent::Text(text));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| format!("closed by server ({})", frame.code))
                            .unwrap_or_else(|| "closed by server".to_string());
                        return Ok(reason);
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok("socket ended".to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn client() -> ChatClient {
        ChatClient::new().with_reconnect_policy(ReconnectPolicy::new(Duration::from_millis(10), 5))
    }

    #[test]
    fn conversation_url_appends_id_with_trailing_slash() {
        let client = ChatClient::new();
        assert_eq!(
            client.conversation_url("abc"),
            "ws://localhost:8000/ws/chat/abc/"
        );
    }

    #[test]
    fn endpoint_override_is_normalised() {
        let client = ChatClient::new().with_endpoint("wss://chat.example/ws/chat/  \n");
        assert_eq!(client.conversation_url("7"), "wss://chat.example/ws/chat/7/");
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use ConnectionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Open));
        assert!(Open.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(Open.can_transition_to(Closed));
        assert!(!Idle.can_transition_to(Open));
        assert!(!Reconnecting.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Reconnecting));
        assert!(!Failed.can_transition_to(Reconnecting));
        assert!(!Open.can_transition_to(Idle));
    }

    #[test]
    fn send_requires_open_connection() {
        let manager = ConnectionManager::new(client());
        let err = manager
            .send(ClientFrame::Message {
                message: "hi".to_string(),
            })
            .expect_err("idle manager must reject sends");
        assert!(matches!(
            err,
            StreamClientError::NotConnected {
                state: ConnectionState::Idle
            }
        ));
    }

    #[tokio::test]
    async fn reconnect_schedule_is_linear_and_bounded() {
        let mut manager = ConnectionManager::new(client());
        manager.force_open("c-1");

        for attempt in 1..=5 {
            let outcome = manager.handle_remote_close();
            assert_eq!(
                outcome,
                ReconnectOutcome::Scheduled {
                    attempt,
                    delay: Duration::from_millis(10) * attempt,
                }
            );
            assert_eq!(manager.state(), ConnectionState::Reconnecting);
            // The backoff would reopen the link; pretend the attempt is
            // in flight again.
            manager.backoff = None;
            manager.state = ConnectionState::Connecting;
        }

        let outcome = manager.handle_remote_close();
        assert_eq!(
            outcome,
            ReconnectOutcome::Failed(ConnectionFailed {
                conversation_id: "c-1".to_string(),
                attempts: 5,
            })
        );
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.next_event().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let mut manager = ConnectionManager::new(client());
        manager.force_open("c-1");
        assert!(matches!(
            manager.handle_remote_close(),
            ReconnectOutcome::Scheduled { attempt: 1, .. }
        ));

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.next_event().await.is_none());
        assert_eq!(manager.handle_remote_close(), ReconnectOutcome::Ignored);
    }
}
