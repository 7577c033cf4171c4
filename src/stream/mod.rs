//! Stream subscription modules.
//!
//! - `client`: websocket connections, receive loops, and cancellation.
//! - `proto`: topic routing and handshake payloads.
//! - `registry`: active subscriptions and their cancellation signals.
//! - `user_data`: listen-key helpers for account streams.

/// Websocket subscription client.
pub mod client;
/// Topic routing and handshake payloads.
pub mod proto;
/// Subscription registry and cancellation signals.
pub mod registry;
/// Listen-key driven user-data subscriptions.
pub mod user_data;
