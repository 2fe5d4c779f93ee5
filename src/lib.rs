//! Client SDK for a streaming AI chat service.
//!
//! The crate is organized by transport surface:
//! - `stream`: realtime websocket connection, protocol decoding, and
//!   reassembly of token-streamed AI responses.
//! - `api`: HTTP client for conversation storage, sharing, and reactions.
//! - `retry`: request retry and reconnect timing.

/// Conversation API client and request/response types.
pub mod api;
/// Retry and reconnect timing used across the SDK.
pub mod retry;
/// Realtime chat client, protocol types, and session helpers.
pub mod stream;
