//! Account (user-data) stream helpers.
//!
//! User-data streams are keyed by an ephemeral listen key issued by the
//! exchange REST API. Obtaining the key stays with the caller; these helpers
//! parse it out of the REST response and subscribe with it as the only topic.

use std::fmt::Display;
use std::future::Future;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::warn;

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::client::{StreamClient, StreamClientError, SubscriptionEnd};
use crate::stream::proto::ExtraParams;

#[derive(Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: Option<String>,
}

/// Extracts the `listenKey` field from a listen-key REST response body.
pub fn parse_listen_key(body: &str) -> Result<SecretString, StreamClientError> {
    let response: ListenKeyResponse = serde_json::from_str(body)?;
    match response.listen_key {
        Some(key) if !key.trim().is_empty() => Ok(SecretString::new(key)),
        Some(_) => Err(StreamClientError::ListenKey(
            "listenKey field is empty".to_string(),
        )),
        None => Err(StreamClientError::ListenKey(
            "response has no listenKey field".to_string(),
        )),
    }
}

impl StreamClient {
    /// Subscribes to the user-data stream identified by `listen_key`.
    pub async fn user_data<H>(
        &self,
        listen_key: &SecretString,
        id: u64,
        handler: H,
    ) -> Result<SubscriptionEnd, StreamClientError>
    where
        H: FnMut(&str) + Send,
    {
        self.live_subscribe(
            listen_key.expose_secret().as_str(),
            id,
            handler,
            ExtraParams::new(),
        )
        .await
    }

    /// Fetches a listen key with `fetch_listen_key`, then subscribes with it.
    ///
    /// `fetch_listen_key` receives the 1-based attempt number and is retried
    /// according to `policy`. When every attempt fails, the last error is
    /// returned as [`StreamClientError::ListenKey`] and nothing is registered.
    /// Pass [`RetryPolicy::no_retry`] when the provider already retries.
    pub async fn user_data_with_provider<H, F, Fut, E>(
        &self,
        policy: &RetryPolicy,
        fetch_listen_key: F,
        id: u64,
        handler: H,
    ) -> Result<SubscriptionEnd, StreamClientError>
    where
        H: FnMut(&str) + Send,
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<SecretString, E>>,
        E: Display,
    {
        let listen_key = retry_async(policy, fetch_listen_key, |_| true)
            .await
            .map_err(|err| {
                warn!(event = "listen_key_fetch_failed", id, error = %err);
                StreamClientError::ListenKey(err.to_string())
            })?;
        self.user_data(&listen_key, id, handler).await
    }
}
