//! Subscription requests and the events delivered for them.

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::selector::Selector;

/// An operation to subscribe to.
#[derive(Clone, Debug)]
pub struct SubscriptionRequest {
    /// GraphQL subscription document.
    pub query: String,
    /// Operation variables.
    pub variables: Map<String, Value>,
    /// How to extract the value from each `data` payload.
    pub selector: Selector,
}

impl SubscriptionRequest {
    /// Request with no variables and the identity selector.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Map::new(),
            selector: Selector::Identity,
        }
    }

    /// Add a variable.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.variables.insert(name.into(), value.into());
        self
    }

    /// Set the selector.
    #[must_use]
    pub fn select(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }
}

/// What a subscription observes.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    /// The server acknowledged the `start`.
    Started,
    /// A selected `data` value.
    Data(Value),
    /// A subscription-level or connection-level failure.
    ///
    /// Connection-level errors end a subscription whose `start` went out.
    /// A keyed subscription still waiting for the handshake stays queued.
    /// Selector misses end nothing.
    Error(TransportError),
    /// The server completed the subscription. No further events follow.
    Complete,
}

/// Receiving end of a keyed subscription.
pub type SubscriptionEvents = mpsc::UnboundedReceiver<SubscriptionEvent>;

/// Sending end held by the registry.
pub(crate) type EventSink = mpsc::UnboundedSender<SubscriptionEvent>;
