//! Request/response collaborators of the chat session: conversation storage and
//! message reactions.
//!
//! The realtime core only needs these through the [`ConversationRepository`]
//! and [`MessageReactions`] traits. [`ConversationApiClient`] implements both
//! against the chat service's REST API.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::proto::Sender;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Default REST base URL of the chat service.
pub const API_BASE_URL: &str = "http://localhost:8000/api";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConversationApiDefaults;

impl ConversationApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(1);
    pub const JITTER: Duration = Duration::from_millis(50);
}

#[derive(Clone, Debug)]
pub struct ConversationApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ConversationApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ConversationApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ConversationApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: ConversationApiDefaults::MAX_ATTEMPTS,
                initial_backoff: ConversationApiDefaults::BACKOFF,
                max_backoff: ConversationApiDefaults::MAX_BACKOFF,
                jitter: ConversationApiDefaults::JITTER,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Ended,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

/// A message as stored by the service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub content: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactions: BTreeMap<String, u64>,
    #[serde(default)]
    pub is_bookmarked: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: ConversationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Markdown,
    Pdf,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "md",
            Self::Pdf => "pdf",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareLink {
    pub share_token: String,
    pub share_url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalyticsFilter {
    pub status: Option<ConversationStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl AnalyticsFilter {
    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(status) = self.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(date) = self.date_from {
            query.push(("date_from", date.format("%Y-%m-%d").to_string()));
        }
        if let Some(date) = self.date_to {
            query.push(("date_to", date.format("%Y-%m-%d").to_string()));
        }
        query
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateStats {
    pub count: u64,
    pub messages: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Analytics {
    pub total_conversations: u64,
    pub total_messages: u64,
    #[serde(default)]
    pub date_stats: BTreeMap<String, DateStats>,
    #[serde(default)]
    pub sentiment_distribution: BTreeMap<String, u64>,
    #[serde(default)]
    pub average_messages_per_conversation: f64,
}

/// A search hit: the conversation summary plus its similarity to the query.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoredConversation {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default)]
    pub similarity_score: f64,
}

/// Question about past conversations, answered by the service.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<DateTime<Utc>>,
    /// Server default is 5, accepted range 1..=20.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueryExcerpt {
    pub conversation_id: String,
    #[serde(default)]
    pub conversation_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    pub message: String,
    pub sender: Sender,
    #[serde(default)]
    pub similarity: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RelatedConversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub similarity: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryAnswer {
    pub answer: String,
    #[serde(default)]
    pub excerpts: Vec<QueryExcerpt>,
    #[serde(default)]
    pub related_conversations: Vec<RelatedConversation>,
}

/// Conversation storage consumed by the chat UI around a session.
pub trait ConversationRepository {
    fn create(&self, title: &str) -> impl Future<Output = Result<Conversation, ApiError>> + Send;

    fn get(&self, conversation_id: &str)
        -> impl Future<Output = Result<Conversation, ApiError>> + Send;

    fn list(
        &self,
        status: Option<ConversationStatus>,
    ) -> impl Future<Output = Result<Vec<Conversation>, ApiError>> + Send;

    fn end(&self, conversation_id: &str)
        -> impl Future<Output = Result<Conversation, ApiError>> + Send;

    fn add_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender: Sender,
    ) -> impl Future<Output = Result<StoredMessage, ApiError>> + Send;

    fn export(
        &self,
        conversation_id: &str,
        format: ExportFormat,
    ) -> impl Future<Output = Result<Vec<u8>, ApiError>> + Send;

    fn share(&self, conversation_id: &str)
        -> impl Future<Output = Result<ShareLink, ApiError>> + Send;

    fn get_shared(&self, share_token: &str)
        -> impl Future<Output = Result<Conversation, ApiError>> + Send;

    fn analytics(
        &self,
        filter: &AnalyticsFilter,
    ) -> impl Future<Output = Result<Analytics, ApiError>> + Send;

    /// Semantic search over stored conversations, best match first.
    fn search(
        &self,
        query: &str,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<ScoredConversation>, ApiError>> + Send;

    /// Asks the service a question answered from past conversations.
    fn query(
        &self,
        request: &QueryRequest,
    ) -> impl Future<Output = Result<QueryAnswer, ApiError>> + Send;
}

/// Per-message reactions and bookmarks.
pub trait MessageReactions {
    fn react(
        &self,
        message_id: &str,
        emoji: &str,
    ) -> impl Future<Output = Result<StoredMessage, ApiError>> + Send;

    fn toggle_bookmark(
        &self,
        message_id: &str,
    ) -> impl Future<Output = Result<StoredMessage, ApiError>> + Send;
}

#[derive(Clone, Debug)]
pub struct ConversationApiClient {
    http: Client,
    api_key: Option<SecretString>,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ConversationApiClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(None, ConversationApiClientOptions::default())
    }

    pub fn with_api_key(api_key: SecretString) -> Result<Self, ApiError> {
        Self::with_options(Some(api_key), ConversationApiClientOptions::default())
    }

    pub fn with_options(
        api_key: Option<SecretString>,
        options: ConversationApiClientOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            api_key,
            base_url: API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim_end().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let body = self.call_raw(request).await?;
        serde_json::from_slice(&body).map_err(|err| ApiError::Parse(err.to_string()))
    }

    async fn call_raw(&self, request: ApiRequest) -> Result<Vec<u8>, ApiError> {
        let request = ApiRequest {
            path: self.endpoint(&request.path),
            ..request
        };
        let should_retry: fn(&ApiError) -> bool = if request.idempotent {
            ApiError::is_retryable
        } else {
            ApiError::never_reached_server
        };
        retry_async(
            &self.retry_policy,
            |_| self.send_attempt(&request),
            should_retry,
        )
        .await
    }

    async fn send_attempt(&self, request: &ApiRequest) -> Result<Vec<u8>, ApiError> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.path)
            .timeout(self.attempt_timeout)
            .query(&request.query);
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }
        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&String::from_utf8_lossy(&body)),
            });
        }
        Ok(body.to_vec())
    }
}

struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(&'static str, String)>,
    body: Option<Value>,
    /// Safe to resend after the server may have seen it.
    idempotent: bool,
}

impl ApiRequest {
    fn get(path: String) -> Self {
        Self {
            method: Method::GET,
            path,
            query: Vec::new(),
            body: None,
            idempotent: true,
        }
    }

    fn post(path: String, body: Option<Value>) -> Self {
        Self {
            method: Method::POST,
            path,
            query: Vec::new(),
            body,
            idempotent: false,
        }
    }

    /// Marks a read-only POST as safe to resend.
    fn read_only(mut self) -> Self {
        self.idempotent = true;
        self
    }

    fn with_query(mut self, query: Vec<(&'static str, String)>) -> Self {
        self.query = query;
        self
    }
}

/// List endpoints answer either with a bare array or a paginated envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListResponse<T> {
    Paginated { results: Vec<T> },
    Bare(Vec<T>),
}

impl<T> ListResponse<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            Self::Paginated { results } => results,
            Self::Bare(items) => items,
        }
    }
}

impl ConversationRepository for ConversationApiClient {
    async fn create(&self, title: &str) -> Result<Conversation, ApiError> {
        self.call(ApiRequest::post(
            "/conversations/".to_string(),
            Some(json!({ "title": title })),
        ))
        .await
    }

    async fn get(&self, conversation_id: &str) -> Result<Conversation, ApiError> {
        self.call(ApiRequest::get(format!("/conversations/{conversation_id}/")))
            .await
    }

    async fn list(&self, status: Option<ConversationStatus>) -> Result<Vec<Conversation>, ApiError> {
        let query = status
            .map(|status| vec![("status", status.as_str().to_string())])
            .unwrap_or_default();
        let response: ListResponse<Conversation> = self
            .call(ApiRequest::get("/conversations/".to_string()).with_query(query))
            .await?;
        Ok(response.into_items())
    }

    async fn end(&self, conversation_id: &str) -> Result<Conversation, ApiError> {
        self.call(ApiRequest::post(
            format!("/conversations/{conversation_id}/end/"),
            None,
        ))
        .await
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender: Sender,
    ) -> Result<StoredMessage, ApiError> {
        self.call(ApiRequest::post(
            format!("/conversations/{conversation_id}/messages/"),
            Some(json!({ "content": content, "sender": sender })),
        ))
        .await
    }

    async fn export(&self, conversation_id: &str, format: ExportFormat) -> Result<Vec<u8>, ApiError> {
        self.call_raw(
            ApiRequest::post(
                format!("/conversations/{conversation_id}/export/"),
                Some(json!({ "format": format })),
            )
            .read_only(),
        )
        .await
    }

    async fn share(&self, conversation_id: &str) -> Result<ShareLink, ApiError> {
        self.call(ApiRequest::post(
            format!("/conversations/{conversation_id}/share/"),
            None,
        ))
        .await
    }

    async fn get_shared(&self, share_token: &str) -> Result<Conversation, ApiError> {
        self.call(ApiRequest::get(format!(
            "/conversations/shared/{share_token}/"
        )))
        .await
    }

    async fn analytics(&self, filter: &AnalyticsFilter) -> Result<Analytics, ApiError> {
        self.call(ApiRequest::get("/conversations/analytics/".to_string()).with_query(filter.query()))
            .await
    }

    async fn search(
        &self,
        query: &str,
        limit: Option<u32>,
    ) -> Result<Vec<ScoredConversation>, ApiError> {
        let mut params = vec![("q", query.to_string())];
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        let response: ListResponse<ScoredConversation> = self
            .call(ApiRequest::get("/conversations/search/".to_string()).with_query(params))
            .await?;
        Ok(response.into_items())
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryAnswer, ApiError> {
        let body = serde_json::to_value(request).map_err(|err| ApiError::Parse(err.to_string()))?;
        self.call(ApiRequest::post("/conversations/query/".to_string(), Some(body)).read_only())
            .await
    }
}

impl MessageReactions for ConversationApiClient {
    async fn react(&self, message_id: &str, emoji: &str) -> Result<StoredMessage, ApiError> {
        self.call(ApiRequest::post(
            format!("/messages/{message_id}/react/"),
            Some(json!({ "emoji": emoji })),
        ))
        .await
    }

    async fn toggle_bookmark(&self, message_id: &str) -> Result<StoredMessage, ApiError> {
        self.call(ApiRequest::post(
            format!("/messages/{message_id}/bookmark/"),
            None,
        ))
        .await
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }

    /// True only when the request provably never reached the server, so a
    /// state-changing call can be resent without applying it twice.
    pub fn never_reached_server(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_connect())
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.detail).or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
