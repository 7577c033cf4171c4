//! Subscription routing and handshake payloads.
//!
//! Payloads received on a subscription are never parsed here; this module
//! only decides which URL a subscription connects to and which frame it
//! sends first.

use serde_json::{Map, Value};

use crate::stream::client::StreamClientError;

/// Extra handshake fields merged into a live `SUBSCRIBE` payload.
pub type ExtraParams = Map<String, Value>;

/// Path used for single-topic connections.
pub const PLAIN_PATH: &str = "/ws";
/// Path used for combined (multi-topic) connections.
pub const COMBINED_PATH: &str = "/stream";

/// Topic selection for one subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topics {
    /// A single topic, routed to the plain `/ws` endpoint.
    Single(String),
    /// Several topics multiplexed on the combined `/stream` endpoint.
    Combined(Vec<String>),
}

impl Topics {
    /// Returns `true` when more than one topic is requested.
    pub fn is_combined(&self) -> bool {
        matches!(self, Topics::Combined(topics) if topics.len() > 1)
    }

    /// Returns the topics in request order.
    pub fn as_slice(&self) -> &[String] {
        match self {
            Topics::Single(topic) => std::slice::from_ref(topic),
            Topics::Combined(topics) => topics,
        }
    }

    /// Returns the first requested topic, if any.
    pub fn first(&self) -> Option<&str> {
        self.as_slice().first().map(String::as_str)
    }

    /// Returns `true` when no topic was requested.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl From<String> for Topics {
    fn from(topic: String) -> Self {
        Topics::Single(topic)
    }
}

impl From<&str> for Topics {
    fn from(topic: &str) -> Self {
        Topics::Single(topic.to_string())
    }
}

impl From<&String> for Topics {
    fn from(topic: &String) -> Self {
        Topics::Single(topic.clone())
    }
}

impl From<Vec<String>> for Topics {
    fn from(mut topics: Vec<String>) -> Self {
        if topics.len() == 1 {
            return Topics::Single(topics.remove(0));
        }
        Topics::Combined(topics)
    }
}

impl From<Vec<&str>> for Topics {
    fn from(topics: Vec<&str>) -> Self {
        topics
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into()
    }
}

impl<const N: usize> From<[&str; N]> for Topics {
    fn from(topics: [&str; N]) -> Self {
        Vec::from(topics).into()
    }
}

/// How a subscription announces its topics to the server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscribeMode {
    /// Topics are sent in a `SUBSCRIBE` handshake frame.
    Live,
    /// Topics are encoded in the URL; the handshake frame is `{}`.
    Instant,
}

/// Resolved connection target and first frame for a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRoute {
    pub url: String,
    pub handshake: Value,
}

impl StreamRoute {
    /// Encodes the handshake as a JSON text frame.
    pub fn handshake_text(&self) -> Result<String, StreamClientError> {
        serde_json::to_string(&self.handshake).map_err(StreamClientError::Json)
    }
}

/// Builds the live `SUBSCRIBE` payload.
///
/// Keys in `extra` override the defaults; key order follows insertion.
pub fn subscribe_payload(topics: &Topics, id: u64, extra: &ExtraParams) -> Value {
    let mut payload = Map::new();
    payload.insert("method".to_string(), Value::from("SUBSCRIBE"));
    payload.insert("params".to_string(), Value::from(topics.as_slice().to_vec()));
    payload.insert("id".to_string(), Value::from(id));
    for (key, value) in extra {
        payload.insert(key.clone(), value.clone());
    }
    Value::Object(payload)
}

/// Resolves the URL and handshake for a subscription against `base`.
///
/// In instant combined mode only the first topic is placed in the
/// `streams` query parameter.
pub fn resolve_route(
    base: &str,
    topics: &Topics,
    mode: SubscribeMode,
    id: u64,
    extra: &ExtraParams,
) -> Result<StreamRoute, StreamClientError> {
    let first = topics.first().ok_or(StreamClientError::EmptyTopics)?;
    let combined = topics.is_combined();
    let path = if combined { COMBINED_PATH } else { PLAIN_PATH };

    let route = match mode {
        SubscribeMode::Live => StreamRoute {
            url: format!("{base}{path}"),
            handshake: subscribe_payload(topics, id, extra),
        },
        SubscribeMode::Instant if combined => StreamRoute {
            url: format!("{base}{path}?streams={first}"),
            handshake: Value::Object(Map::new()),
        },
        SubscribeMode::Instant => StreamRoute {
            url: format!("{base}{path}/{first}"),
            handshake: Value::Object(Map::new()),
        },
    };
    Ok(route)
}
