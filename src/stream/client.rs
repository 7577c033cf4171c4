//! Multiplexed websocket subscription client.
//!
//! Every subscription owns one websocket connection and runs its own receive
//! loop inside the future returned by [`StreamClient::live_subscribe`] or
//! [`StreamClient::instant_subscribe`]. Run several of them concurrently by
//! spawning those futures; [`StreamClient::cancel`] stops one of them from
//! anywhere else.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::retry::with_timeout;
use crate::stream::proto::{resolve_route, ExtraParams, StreamRoute, SubscribeMode, Topics};
use crate::stream::registry::{CancelSignal, SubscriptionInfo, SubscriptionRegistry};

const MIN_RECV_TIMEOUT: Duration = Duration::from_millis(10);
/// Public spot market stream endpoint.
pub const SPOT_STREAM_ENDPOINT: &str = "wss://stream.binance.com:9443";
/// Public spot testnet stream endpoint.
pub const SPOT_TESTNET_STREAM_ENDPOINT: &str = "wss://testnet.binance.vision";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default timeouts used by [`StreamClientOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Upper bound for the TCP/TLS connect and websocket upgrade.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Bounded frame wait between cancel checks.
    pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);
}

/// Timeouts applied to every subscription opened by a client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamClientOptions {
    /// Upper bound for opening the websocket connection.
    pub connect_timeout: Duration,
    /// Bounded wait for a single frame before the cancel flag is rechecked.
    pub recv_timeout: Duration,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            recv_timeout: StreamDefaults::RECV_TIMEOUT,
        }
    }
}

/// How a subscription's receive loop ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriptionEnd {
    /// The subscription was cancelled by the caller.
    Cancelled,
    /// The connection was closed or failed after it was established.
    Closed {
        /// Human-readable cause.
        reason: String,
    },
}

/// Entry point for opening and cancelling stream subscriptions.
///
/// Clones share the same subscription registry.
#[derive(Clone)]
pub struct StreamClient {
    endpoint: String,
    options: StreamClientOptions,
    registry: Arc<SubscriptionRegistry>,
}

impl StreamClient {
    /// Creates a client for `endpoint` (scheme and host, no path).
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end().trim_end_matches('/').to_string(),
            options: StreamClientOptions::default(),
            registry: Arc::new(SubscriptionRegistry::default()),
        }
    }

    /// Creates a client for the public spot stream endpoint.
    pub fn spot() -> Self {
        Self::new(SPOT_STREAM_ENDPOINT)
    }

    /// Creates a client for the spot testnet stream endpoint.
    pub fn spot_testnet() -> Self {
        Self::new(SPOT_TESTNET_STREAM_ENDPOINT)
    }

    /// Replaces connection and receive timeouts.
    pub fn with_options(mut self, options: StreamClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Base endpoint that subscription URLs are derived from.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Timeouts applied to subscriptions opened by this client.
    pub fn options(&self) -> &StreamClientOptions {
        &self.options
    }

    /// Subscribes by sending a `SUBSCRIBE` handshake frame.
    ///
    /// A single topic (or a one-element sequence) connects to `<base>/ws`;
    /// several topics connect to `<base>/stream`. The handshake is
    /// `{"method":"SUBSCRIBE","params":[topics],"id":id}` with `params` merged
    /// on top, so caller keys win on collision.
    ///
    /// The future runs the receive loop and resolves once the subscription
    /// was cancelled or its connection dropped. Cancelling while the
    /// connection is still being opened resolves with
    /// [`SubscriptionEnd::Cancelled`] and no handshake is sent. Connection and
    /// handshake failures are returned as errors; `id` is free again
    /// afterwards.
    pub async fn live_subscribe<T, H>(
        &self,
        topics: T,
        id: u64,
        handler: H,
        params: ExtraParams,
    ) -> Result<SubscriptionEnd, StreamClientError>
    where
        T: Into<Topics>,
        H: FnMut(&str) + Send,
    {
        let topics = topics.into();
        let route = resolve_route(&self.endpoint, &topics, SubscribeMode::Live, id, &params)?;
        self.run_subscription(id, topics, route, handler).await
    }

    /// Subscribes through the URL alone; the first frame sent is `{}`.
    ///
    /// A single topic connects to `<base>/ws/<topic>`. Several topics connect
    /// to `<base>/stream?streams=<first topic>`: only the first topic is
    /// requested, the rest are ignored.
    pub async fn instant_subscribe<T, H>(
        &self,
        topics: T,
        id: u64,
        handler: H,
    ) -> Result<SubscriptionEnd, StreamClientError>
    where
        T: Into<Topics>,
        H: FnMut(&str) + Send,
    {
        let topics = topics.into();
        let route = resolve_route(
            &self.endpoint,
            &topics,
            SubscribeMode::Instant,
            id,
            &ExtraParams::new(),
        )?;
        self.run_subscription(id, topics, route, handler).await
    }

    /// Requests cancellation of subscription `id`.
    ///
    /// Returns `false` when no such subscription is active. Cancelling twice
    /// has the same effect as cancelling once.
    pub fn cancel(&self, id: u64) -> bool {
        let found = self.registry.cancel(id);
        if found {
            debug!(event = "subscription_cancel_requested", id);
        } else {
            warn!(event = "subscription_not_found", id, "no active subscription with this id");
        }
        found
    }

    /// Requests cancellation of every active subscription.
    ///
    /// Returns the ids whose flag was set.
    pub fn cancel_all(&self) -> Vec<u64> {
        let ids = self.registry.cancel_all();
        info!(event = "subscriptions_cancelled", ?ids);
        ids
    }

    /// Cancels everything and waits until every receive loop has exited.
    ///
    /// Subscriptions started while waiting are waited for as well.
    pub async fn cancel_all_and_wait(&self) {
        self.cancel_all();
        self.registry.wait_idle().await;
    }

    /// Returns `true` while subscription `id` is registered.
    pub fn is_active(&self, id: u64) -> bool {
        self.registry.contains(id)
    }

    /// Returns a snapshot of all registered subscriptions, ordered by id.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.snapshot()
    }

    async fn run_subscription<H>(
        &self,
        id: u64,
        topics: Topics,
        route: StreamRoute,
        mut handler: H,
    ) -> Result<SubscriptionEnd, StreamClientError>
    where
        H: FnMut(&str) + Send,
    {
        let registration = match self.registry.register(id, &topics) {
            Ok(registration) => registration,
            Err(err) => {
                warn!(
                    event = "subscription_rejected",
                    id,
                    "subscription id is already active"
                );
                return Err(err);
            }
        };
        let mut signal = registration.signal();

        let opened = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                drop(registration);
                info!(event = "subscription_cancelled_before_connect", id, url = %route.url);
                return Ok(SubscriptionEnd::Cancelled);
            }
            opened = self.open(&route) => opened,
        };
        let mut socket = match opened {
            Ok(socket) => socket,
            Err(err) => {
                warn!(event = "subscription_connect_failed", id, url = %route.url, error = %err);
                return Err(err);
            }
        };
        info!(event = "subscription_connected", id, url = %route.url);

        let end = receive_loop(
            &mut socket,
            &mut signal,
            &mut handler,
            self.options.recv_timeout.max(MIN_RECV_TIMEOUT),
            id,
        )
        .await;

        if let Err(err) = socket.close(None).await {
            debug!(event = "subscription_close_failed", id, error = %err);
        }
        drop(registration);

        info!(event = "subscription_ended", id, combined = topics.is_combined(), ?end);
        Ok(end)
    }

    async fn open(&self, route: &StreamRoute) -> Result<Socket, StreamClientError> {
        let handshake = route.handshake_text()?;
        let timeout = self.options.connect_timeout;

        let (mut socket, _) = with_timeout(timeout, connect_async(route.url.as_str()))
            .await
            .map_err(|_| StreamClientError::ConnectTimeout {
                url: route.url.clone(),
                timeout,
            })?
            .map_err(|source| StreamClientError::Connect {
                url: route.url.clone(),
                source,
            })?;

        if let Err(err) = socket.send(Message::Text(handshake)).await {
            let _ = socket.close(None).await;
            return Err(StreamClientError::Handshake(err));
        }
        Ok(socket)
    }
}

/// Errors produced while starting a subscription.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Another subscription with the same id is still active.
    #[error("subscription id {0} is already active")]
    DuplicateSubscription(u64),

    /// No topic was given.
    #[error("at least one topic is required")]
    EmptyTopics,

    /// Websocket connection could not be opened.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: WsError,
    },

    /// Websocket connection was not established in time.
    #[error("timed out after {timeout:?} connecting to {url}")]
    ConnectTimeout { url: String, timeout: Duration },

    /// The handshake frame could not be sent.
    #[error("failed to send subscribe handshake: {0}")]
    Handshake(#[source] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A listen key could not be obtained or was malformed.
    #[error("listen key error: {0}")]
    ListenKey(String),
}

/// Result of one bounded read from a subscription socket.
#[derive(Debug, PartialEq, Eq)]
enum ReceiveOutcome {
    Message(String),
    Timeout,
    Ignored,
    Closed(String),
}

async fn receive_loop<H>(
    socket: &mut Socket,
    signal: &mut CancelSignal,
    handler: &mut H,
    recv_timeout: Duration,
    id: u64,
) -> SubscriptionEnd
where
    H: FnMut(&str) + Send,
{
    loop {
        if signal.is_cancelled() {
            return SubscriptionEnd::Cancelled;
        }

        let outcome = tokio::select! {
            biased;
            _ = signal.cancelled() => return SubscriptionEnd::Cancelled,
            outcome = recv_next(socket, recv_timeout) => outcome,
        };

        match outcome {
            ReceiveOutcome::Message(text) => dispatch(handler, &text, id),
            ReceiveOutcome::Timeout | ReceiveOutcome::Ignored => {}
            ReceiveOutcome::Closed(reason) => {
                warn!(event = "subscription_connection_closed", id, %reason);
                return SubscriptionEnd::Closed { reason };
            }
        }
    }
}

async fn recv_next(socket: &mut Socket, timeout: Duration) -> ReceiveOutcome {
    let Ok(frame) = with_timeout(timeout, socket.next()).await else {
        return ReceiveOutcome::Timeout;
    };

    match frame {
        Some(Ok(Message::Text(text))) => ReceiveOutcome::Message(text),
        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
            Ok(text) => ReceiveOutcome::Message(text),
            Err(err) => {
                let len = err.as_bytes().len();
                debug!(event = "subscription_binary_frame_skipped", len);
                ReceiveOutcome::Ignored
            }
        },
        Some(Ok(Message::Ping(payload))) => match socket.send(Message::Pong(payload)).await {
            Ok(()) => ReceiveOutcome::Ignored,
            Err(err) => ReceiveOutcome::Closed(format!("failed to answer ping: {err}")),
        },
        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => ReceiveOutcome::Ignored,
        Some(Ok(Message::Close(frame))) => ReceiveOutcome::Closed(match frame {
            Some(frame) => format!(
                "server sent close frame {}: {}",
                u16::from(frame.code),
                frame.reason
            ),
            None => "server sent close frame".to_string(),
        }),
        Some(Err(err)) => ReceiveOutcome::Closed(err.to_string()),
        None => ReceiveOutcome::Closed("stream ended".to_string()),
    }
}

fn dispatch<H>(handler: &mut H, message: &str, id: u64)
where
    H: FnMut(&str),
{
    if panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
        error!(event = "subscription_handler_panicked", id);
    }
}
