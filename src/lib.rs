//! Multiplexed websocket subscription client.
//!
//! The crate is organized by transport surface:
//! - `stream`: subscription client, routing rules, and the subscription
//!   registry.
//! - `retry`: shared retry and timeout utilities.

/// Retry and timeout helpers used across the crate.
pub mod retry;
/// Stream subscription client, routing, and user-data helpers.
pub mod stream;
