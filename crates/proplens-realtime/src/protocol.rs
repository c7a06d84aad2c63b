//! graphql-ws frames (AppSync flavour).
//!
//! Client → server: `connection_init`, `start`, `stop`.
//! Server → client: `connection_ack`, `ka`, `start_ack`, `data`, `error`,
//! `complete`. Anything else decodes to [`ServerFrame::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::auth::AuthBundle;

/// Subprotocol every connection negotiates.
pub const GRAPHQL_WS: &str = "graphql-ws";

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Opens the handshake.
    ConnectionInit,
    /// Registers a subscription.
    Start {
        /// Subscription id.
        id: String,
        /// Operation and authorization.
        payload: StartPayload,
    },
    /// Cancels a subscription.
    Stop {
        /// Subscription id.
        id: String,
    },
}

/// Payload of a `start` frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StartPayload {
    /// JSON text of `{query, variables}`.
    pub data: String,
    /// Per-operation authorization.
    pub extensions: StartExtensions,
}

/// `extensions` of a `start` frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StartExtensions {
    /// Same bundle as the connection subprotocol header.
    pub authorization: AuthBundle,
}

impl ClientFrame {
    /// Build a `start` frame for an operation.
    pub fn start(
        id: impl Into<String>,
        query: &str,
        variables: &Map<String, Value>,
        authorization: AuthBundle,
    ) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_string(&json!({
            "query": query,
            "variables": variables,
        }))?;
        Ok(Self::Start {
            id: id.into(),
            payload: StartPayload {
                data,
                extensions: StartExtensions { authorization },
            },
        })
    }

    /// Wire encoding.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Frame type for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
        }
    }
}

/// Frames sent by the server.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted.
    ConnectionAck {
        /// Negotiated parameters.
        #[serde(default)]
        payload: Option<AckPayload>,
    },
    /// Keepalive.
    Ka,
    /// A `start` was registered.
    StartAck {
        /// Subscription id.
        id: String,
    },
    /// A subscription update.
    Data {
        /// Subscription id.
        id: String,
        /// Update body, usually `{"data": {...}}`.
        #[serde(default)]
        payload: Value,
    },
    /// An error, tagged with a subscription id or connection-wide.
    Error {
        /// Subscription id, absent for connection errors.
        #[serde(default)]
        id: Option<String>,
        /// Error body.
        #[serde(default)]
        payload: Value,
    },
    /// The server finished a subscription.
    Complete {
        /// Subscription id.
        id: String,
    },
    /// Any other frame type.
    #[serde(other)]
    Unknown,
}

/// Payload of `connection_ack`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Keepalive interval the server promises.
    #[serde(default)]
    pub connection_timeout_ms: Option<u64>,
}

impl ServerFrame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Keepalive interval carried by a `connection_ack`, if any.
    pub fn keepalive_ms(&self) -> Option<u64> {
        match self {
            Self::ConnectionAck {
                payload: Some(payload),
            } => payload.connection_timeout_ms,
            _ => None,
        }
    }
}
