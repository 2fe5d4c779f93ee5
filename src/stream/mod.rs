//! Realtime chat modules.
//!
//! - `client`: websocket transport, connection state, and reconnect handling.
//! - `proto`: wire frames exchanged with the chat service.
//! - `assembler`: reassembly of streamed AI responses.
//! - `session`: single entry point that ties the above together and notifies
//!   a subscriber of completed messages.

/// Streamed response reassembly.
pub mod assembler;
/// Websocket connection manager.
pub mod client;
/// Chat protocol frames.
pub mod proto;
/// Session facade with subscriber delivery.
pub mod session;
