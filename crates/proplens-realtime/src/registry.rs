//! Subscription registry.
//!
//! Owns every live registration: wire id → entry, the pre-handshake queue in
//! registration order, and the caller key → wire id mapping. Purely
//! synchronous; the client keeps it behind its link mutex so that every
//! check-then-act on the queue and the sinks is atomic.
//!
//! An entry is either queued or sent, never both. Queued entries produce no
//! wire traffic when removed.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::error::TransportError;
use crate::subscription::{EventSink, SubscriptionEvent, SubscriptionRequest};

/// Whether the `start` frame went out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for `connection_ack`.
    Queued,
    /// `start` was sent on the current connection.
    Sent,
}

/// One registration.
#[derive(Debug)]
pub struct Entry {
    /// What was subscribed.
    pub request: SubscriptionRequest,
    /// Where events go.
    pub(crate) sink: EventSink,
    /// Queued or sent.
    pub phase: Phase,
    /// Caller key for keyed registrations.
    pub key: Option<String>,
}

/// An entry taken out of the registry.
#[derive(Debug, PartialEq, Eq)]
pub struct Removed {
    /// Phase at removal time; `Sent` means a `stop` is owed.
    pub phase: Phase,
    /// Caller key, if any.
    pub key: Option<String>,
}

impl Removed {
    /// Whether the server still thinks the subscription is live.
    pub fn needs_stop(&self) -> bool {
        self.phase == Phase::Sent
    }
}

/// Outcome of routing an inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the sink.
    Delivered,
    /// No registration with that id (late frame after unsubscribe).
    Unknown,
    /// The receiver was gone; the entry has been removed.
    ReceiverGone(Removed),
}

/// Every registration of one client.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
    queue: VecDeque<String>,
    keys: HashMap<String, String>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration. `phase` is `Sent` when the caller transmits the
    /// `start` frame itself right away.
    pub(crate) fn insert(
        &mut self,
        id: String,
        request: SubscriptionRequest,
        sink: EventSink,
        key: Option<String>,
        phase: Phase,
    ) {
        if phase == Phase::Queued {
            self.queue.push_back(id.clone());
        }
        if let Some(key) = &key {
            let _ = self.keys.insert(key.clone(), id.clone());
        }
        let _ = self.entries.insert(
            id,
            Entry {
                request,
                sink,
                phase,
                key,
            },
        );
    }

    /// Remove a registration by wire id.
    pub fn remove(&mut self, id: &str) -> Option<Removed> {
        let entry = self.entries.remove(id)?;
        if entry.phase == Phase::Queued {
            self.queue.retain(|queued| queued != id);
        }
        if let Some(key) = &entry.key {
            if self.keys.get(key).is_some_and(|mapped| mapped == id) {
                let _ = self.keys.remove(key);
            }
        }
        Some(Removed {
            phase: entry.phase,
            key: entry.key,
        })
    }

    /// Wire id registered under a caller key.
    pub fn id_for_key(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    /// Look up a registration.
    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.entries.get(id)
    }

    /// Mark every queued entry as sent and return their ids in registration
    /// order. Each queued entry is returned exactly once.
    pub fn flush_queue(&mut self) -> Vec<String> {
        let mut flushed = Vec::with_capacity(self.queue.len());
        while let Some(id) = self.queue.pop_front() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.phase = Phase::Sent;
                flushed.push(id);
            }
        }
        flushed
    }

    /// Route an event to one registration.
    pub fn dispatch(&mut self, id: &str, event: SubscriptionEvent) -> Delivery {
        let Some(entry) = self.entries.get(id) else {
            return Delivery::Unknown;
        };
        if entry.sink.send(event).is_ok() {
            return Delivery::Delivered;
        }
        match self.remove(id) {
            Some(removed) => Delivery::ReceiverGone(removed),
            None => Delivery::Unknown,
        }
    }

    /// Route a `data` payload through the registration's selector.
    pub fn deliver_data(&mut self, id: &str, payload: &Value) -> Delivery {
        let Some(entry) = self.entries.get(id) else {
            return Delivery::Unknown;
        };
        let event = match entry.request.selector.apply(payload) {
            Ok(value) => SubscriptionEvent::Data(value),
            Err(reason) => SubscriptionEvent::Error(TransportError::Selector { reason }),
        };
        self.dispatch(id, event)
    }

    /// Deliver a terminal event and drop the registration.
    pub fn finish(&mut self, id: &str, event: SubscriptionEvent) -> Option<Removed> {
        let entry = self.entries.get(id)?;
        let _ = entry.sink.send(event);
        self.remove(id)
    }

    /// Fail and drop every sent registration; queued ones stay queued.
    ///
    /// Returns how many were failed.
    pub fn fail_sent(&mut self, error: &TransportError) -> usize {
        let sent: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.phase == Phase::Sent)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &sent {
            let _ = self.finish(id, SubscriptionEvent::Error(error.clone()));
        }
        sent.len()
    }

    /// Tell keyed registrations still waiting for the handshake that the
    /// connection attempt failed. They stay queued for the next connection;
    /// ones whose receiver is gone are dropped.
    ///
    /// Returns how many were told.
    pub fn notify_queued(&mut self, error: &TransportError) -> usize {
        let keyed: Vec<String> = self
            .queue
            .iter()
            .filter(|id| self.entries.get(*id).is_some_and(|entry| entry.key.is_some()))
            .cloned()
            .collect();
        let mut notified = 0;
        for id in keyed {
            if self.dispatch(&id, SubscriptionEvent::Error(error.clone())) == Delivery::Delivered {
                notified += 1;
            }
        }
        notified
    }

    /// Fail and drop everything.
    pub fn fail_all(&mut self, error: &TransportError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.sink.send(SubscriptionEvent::Error(error.clone()));
        }
        self.queue.clear();
        self.keys.clear();
        count
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no registrations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registrations waiting for the handshake.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }
}
