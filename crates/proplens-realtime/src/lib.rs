//! # proplens-realtime
//!
//! Client for the GraphQL-over-WebSocket subscription protocol (`graphql-ws`,
//! AppSync flavour).
//!
//! One [`RealtimeClient`] per session multiplexes every subscription over a
//! single socket:
//!
//! - **Handshake**: `connection_init` → `connection_ack`; subscriptions made
//!   earlier are queued and flushed in order on ack
//! - **Keepalive**: the socket is force-closed when `ka` frames stop for
//!   longer than the negotiated interval
//! - **Routing**: each `data` frame goes to its subscription's [`Selector`]
//!   and sink; connection-level failures reach every sent subscription
//! - **Keyed registrations**: [`SubscriptionTransport`] is the seam the job
//!   monitor drives

#![deny(unsafe_code)]

pub mod auth;
pub mod client;
mod connection;
pub mod error;
pub mod keepalive;
pub mod protocol;
pub mod registry;
pub mod selector;
pub mod subscription;

pub use auth::{AuthBundle, Credential};
pub use client::{
    ConnectionEvent, HandshakeState, RealtimeClient, RealtimeConfig, Subscription,
    SubscriptionTransport,
};
pub use error::TransportError;
pub use selector::Selector;
pub use subscription::{SubscriptionEvent, SubscriptionEvents, SubscriptionRequest};
