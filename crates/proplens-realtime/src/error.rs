//! Transport error type.
//!
//! Errors are values delivered to subscriptions and connection observers,
//! so the type is `Clone` and carries no source chains.

use serde_json::Value;
use thiserror::Error;

/// Errors raised by the realtime transport.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransportError {
    /// No credential is configured for the socket.
    #[error("no credential configured for the realtime connection")]
    Unauthenticated,

    /// TCP/TLS/WebSocket handshake failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Endpoint we tried.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// Handshake did not finish in time.
    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The server rejected a single subscription.
    #[error("subscription {id} failed: {payload}")]
    Subscription {
        /// Wire id of the subscription.
        id: String,
        /// Error payload as sent by the server.
        payload: Value,
    },

    /// The server sent an error not tied to any subscription.
    #[error("connection error: {payload}")]
    Connection {
        /// Error payload as sent by the server.
        payload: Value,
    },

    /// No keepalive arrived within the negotiated interval.
    #[error("no keepalive within {interval_ms}ms")]
    KeepaliveTimeout {
        /// Negotiated keepalive interval.
        interval_ms: u64,
    },

    /// The socket closed.
    #[error("connection closed: {reason}")]
    Closed {
        /// Close reason, if any.
        reason: String,
    },

    /// The client was disconnected explicitly.
    #[error("client disconnected")]
    Disconnected,

    /// A `data` payload did not match the subscription's selector.
    #[error("selector did not match payload: {reason}")]
    Selector {
        /// What was missing.
        reason: String,
    },

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Short stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Connect { .. } => "connect",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Subscription { .. } => "subscription",
            Self::Connection { .. } => "connection",
            Self::KeepaliveTimeout { .. } => "keepalive_timeout",
            Self::Closed { .. } => "closed",
            Self::Disconnected => "disconnected",
            Self::Selector { .. } => "selector",
            Self::Protocol(_) => "protocol",
        }
    }

    /// Whether the error took the whole socket down (as opposed to a single
    /// subscription).
    pub fn is_connection_level(&self) -> bool {
        !matches!(self, Self::Subscription { .. } | Self::Selector { .. })
    }
}
