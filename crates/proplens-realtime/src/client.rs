//! Realtime client: one multiplexed graphql-ws socket per session.
//!
//! [`RealtimeClient`] is cheap to clone and shares one link: the handshake
//! state, the subscription [`Registry`] and the outbound channel of the live
//! connection task, all behind a single `parking_lot::Mutex` that is never
//! held across an `.await`.
//!
//! Connections are opened lazily. `subscribe`, `add_subscription`, `ready`
//! and `connect` start one when none is live; nothing reconnects on its own
//! after a socket dies.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use proplens_settings::ProplensSettings;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::{AuthBundle, Credential};
use crate::connection;
use crate::error::TransportError;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::registry::{Delivery, Phase, Registry};
use crate::subscription::{EventSink, SubscriptionEvent, SubscriptionEvents, SubscriptionRequest};

const EVENT_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and observable state
// ─────────────────────────────────────────────────────────────────────────────

/// Connection parameters.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// Realtime WebSocket endpoint.
    pub url: Url,
    /// GraphQL API host carried in the authorization bundle.
    pub host: String,
    /// Upper bound for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Keepalive interval when `connection_ack` does not carry one.
    pub default_keepalive: Duration,
    /// Floor for the keepalive check period.
    pub min_keepalive_check: Duration,
}

impl RealtimeConfig {
    /// Config with default timeouts.
    pub fn new(url: Url, host: impl Into<String>) -> Self {
        let transport = proplens_settings::TransportSettings::default();
        Self {
            url,
            host: host.into(),
            connect_timeout: transport.connect_timeout(),
            default_keepalive: Duration::from_millis(transport.default_keepalive_ms),
            min_keepalive_check: Duration::from_millis(transport.min_keepalive_check_ms),
        }
    }

    /// Build from loaded settings.
    pub fn from_settings(settings: &ProplensSettings) -> proplens_settings::Result<Self> {
        Ok(Self {
            url: settings.endpoint.realtime_endpoint()?,
            host: settings.endpoint.api_host()?,
            connect_timeout: settings.transport.connect_timeout(),
            default_keepalive: Duration::from_millis(settings.transport.default_keepalive_ms),
            min_keepalive_check: Duration::from_millis(
                settings.transport.min_keepalive_check_ms,
            ),
        })
    }
}

/// Handshake state of the current connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// No live socket.
    Disconnected,
    /// Socket opening or `connection_init` sent.
    Connecting,
    /// `connection_ack` received.
    Acked,
}

/// Connection lifecycle notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// A new connection instance started.
    Connecting {
        /// Connection instance.
        generation: u64,
    },
    /// The handshake completed.
    Connected {
        /// Connection instance.
        generation: u64,
        /// Negotiated keepalive interval.
        keepalive: Duration,
    },
    /// A connection-fatal error frame, or a missing credential.
    Error(TransportError),
    /// The connection instance is gone.
    Closed {
        /// Connection instance.
        generation: u64,
        /// Why.
        reason: TransportError,
    },
}

/// Settlement of `ready()` for one connection instance.
#[derive(Clone, Debug)]
enum ReadyState {
    Pending,
    Acked,
    Failed(TransportError),
}

fn settle(ready: &watch::Sender<ReadyState>, outcome: ReadyState) {
    let _ = ready.send_if_modified(|state| {
        if matches!(state, ReadyState::Pending) {
            *state = outcome;
            true
        } else {
            false
        }
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared link
// ─────────────────────────────────────────────────────────────────────────────

struct Link {
    state: HandshakeState,
    generation: u64,
    registry: Registry,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    auth: Option<AuthBundle>,
    ready: watch::Sender<ReadyState>,
    cancel: Option<CancellationToken>,
}

impl Link {
    fn send(&self, frame: ClientFrame) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        let kind = frame.kind();
        if outbound.send(frame).is_err() {
            debug!(kind, "connection task gone, frame dropped");
        }
    }

    fn send_start(&mut self, id: &str) {
        let frame = match (&self.auth, self.registry.get(id)) {
            (Some(auth), Some(entry)) => ClientFrame::start(
                id,
                &entry.request.query,
                &entry.request.variables,
                auth.clone(),
            ),
            _ => return,
        };
        match frame {
            Ok(frame) => self.send(frame),
            Err(err) => {
                warn!(id, error = %err, "failed to encode start frame");
                let _ = self.registry.finish(
                    id,
                    SubscriptionEvent::Error(TransportError::Protocol(err.to_string())),
                );
            }
        }
    }

    fn register(
        &mut self,
        id: String,
        request: SubscriptionRequest,
        sink: EventSink,
        key: Option<String>,
    ) {
        if self.state == HandshakeState::Acked {
            self.registry.insert(id.clone(), request, sink, key, Phase::Sent);
            self.send_start(&id);
        } else {
            debug!(%id, ?key, "queueing subscription until handshake");
            self.registry.insert(id, request, sink, key, Phase::Queued);
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(removed) = self.registry.remove(id) else {
            return false;
        };
        if removed.needs_stop() {
            self.send(ClientFrame::Stop { id: id.to_string() });
        }
        true
    }
}

pub(crate) struct Shared {
    pub(crate) config: RealtimeConfig,
    credential: RwLock<Option<Credential>>,
    link: Mutex<Link>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_error(&self, error: TransportError) {
        self.emit(ConnectionEvent::Error(error));
    }

    fn remove_id(&self, id: &str) -> bool {
        self.link.lock().remove(id)
    }

    /// `connection_ack`: flush the queue in registration order.
    pub(crate) fn on_ack(&self, generation: u64, keepalive: Duration) {
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.state = HandshakeState::Acked;
            let flushed = link.registry.flush_queue();
            for id in &flushed {
                link.send_start(id);
            }
            settle(&link.ready, ReadyState::Acked);
            info!(
                generation,
                flushed = flushed.len(),
                keepalive_ms = keepalive.as_millis(),
                "realtime connection acknowledged"
            );
        }
        self.emit(ConnectionEvent::Connected {
            generation,
            keepalive,
        });
    }

    /// Subscription-scoped frames.
    pub(crate) fn route(&self, generation: u64, frame: ServerFrame) {
        let mut link = self.link.lock();
        if link.generation != generation {
            return;
        }
        let delivery = match frame {
            ServerFrame::StartAck { id } => {
                debug!(%id, "start acknowledged");
                let delivery = link.registry.dispatch(&id, SubscriptionEvent::Started);
                (id, delivery)
            }
            ServerFrame::Data { id, payload } => {
                let delivery = link.registry.deliver_data(&id, &payload);
                (id, delivery)
            }
            ServerFrame::Error {
                id: Some(id),
                payload,
            } => {
                warn!(%id, %payload, "subscription error");
                let error = TransportError::Subscription {
                    id: id.clone(),
                    payload,
                };
                let _ = link.registry.finish(&id, SubscriptionEvent::Error(error));
                return;
            }
            ServerFrame::Complete { id } => {
                debug!(%id, "subscription completed by server");
                let _ = link.registry.finish(&id, SubscriptionEvent::Complete);
                return;
            }
            other => {
                debug!(?other, "frame not routed to a subscription");
                return;
            }
        };
        match delivery {
            (id, Delivery::ReceiverGone(removed)) => {
                debug!(%id, "subscriber dropped, cleaning up");
                if removed.needs_stop() {
                    link.send(ClientFrame::Stop { id });
                }
            }
            (id, Delivery::Unknown) => debug!(%id, "frame for unknown subscription"),
            (_, Delivery::Delivered) => {}
        }
    }

    /// Socket gone. Idempotent per connection instance.
    pub(crate) fn teardown(&self, generation: u64, reason: TransportError) {
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.generation += 1;
            link.state = HandshakeState::Disconnected;
            link.outbound = None;
            link.auth = None;
            link.cancel = None;
            let failed = link.registry.fail_sent(&reason);
            let notified = link.registry.notify_queued(&reason);
            settle(&link.ready, ReadyState::Failed(reason.clone()));
            info!(
                generation,
                failed,
                notified,
                queued = link.registry.queued_len(),
                reason = %reason,
                "realtime connection closed"
            );
        }
        self.emit(ConnectionEvent::Closed { generation, reason });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to the shared realtime connection.
#[derive(Clone)]
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl RealtimeClient {
    /// Create a client. No socket is opened until first use.
    pub fn new(config: RealtimeConfig, credential: Option<Credential>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(ReadyState::Pending);
        Self {
            shared: Arc::new(Shared {
                config,
                credential: RwLock::new(credential),
                link: Mutex::new(Link {
                    state: HandshakeState::Disconnected,
                    generation: 0,
                    registry: Registry::new(),
                    outbound: None,
                    auth: None,
                    ready,
                    cancel: None,
                }),
                events,
            }),
        }
    }

    /// Replace the credential. Takes effect on the next connection.
    pub fn set_credential(&self, credential: Credential) {
        *self.shared.credential.write() = Some(credential);
    }

    /// Current handshake state.
    pub fn connection_state(&self) -> HandshakeState {
        self.shared.link.lock().state
    }

    /// Lifecycle notifications from now on.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Number of live registrations (queued and sent).
    pub fn subscription_count(&self) -> usize {
        self.shared.link.lock().registry.len()
    }

    /// Start a connection if none is live.
    pub fn connect(&self) {
        let mut link = self.shared.link.lock();
        self.ensure_connected(&mut link);
    }

    /// Resolve once the current connection instance is acknowledged.
    ///
    /// Fails if that socket closes first. Starts a connection if none is
    /// live.
    pub async fn ready(&self) -> Result<(), TransportError> {
        let mut rx = {
            let mut link = self.shared.link.lock();
            self.ensure_connected(&mut link);
            link.ready.subscribe()
        };
        let state = rx
            .wait_for(|state| !matches!(state, ReadyState::Pending))
            .await
            .map_err(|_| TransportError::Closed {
                reason: "connection replaced before handshake".into(),
            })?;
        match &*state {
            ReadyState::Failed(err) => Err(err.clone()),
            ReadyState::Acked | ReadyState::Pending => Ok(()),
        }
    }

    /// Subscribe with a fresh id. Dropping the handle unsubscribes.
    pub fn subscribe(&self, request: SubscriptionRequest) -> Subscription {
        let id = Uuid::new_v4().to_string();
        let (sink, events) = mpsc::unbounded_channel();
        {
            let mut link = self.shared.link.lock();
            link.register(id.clone(), request, sink, None);
            self.ensure_connected(&mut link);
        }
        Subscription {
            id,
            events,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register a long-lived subscription under a caller key, replacing any
    /// existing registration for that key.
    pub fn add_subscription(&self, key: &str, request: SubscriptionRequest) -> SubscriptionEvents {
        let id = Uuid::new_v4().to_string();
        let (sink, events) = mpsc::unbounded_channel();
        let mut link = self.shared.link.lock();
        if let Some(previous) = link.registry.id_for_key(key).map(str::to_string) {
            debug!(key, %previous, "replacing keyed subscription");
            let _ = link.remove(&previous);
        }
        link.register(id, request, sink, Some(key.to_string()));
        self.ensure_connected(&mut link);
        events
    }

    /// Remove the registration for `key`. Sends `stop` if its `start` went
    /// out. Returns whether anything was registered.
    pub fn remove_subscription(&self, key: &str) -> bool {
        let mut link = self.shared.link.lock();
        match link.registry.id_for_key(key).map(str::to_string) {
            Some(id) => link.remove(&id),
            None => false,
        }
    }

    /// Close the socket and fail every registration.
    pub fn disconnect(&self) {
        let generation = {
            let mut link = self.shared.link.lock();
            if let Some(cancel) = link.cancel.take() {
                cancel.cancel();
            }
            let generation = link.generation;
            link.generation += 1;
            link.state = HandshakeState::Disconnected;
            link.outbound = None;
            link.auth = None;
            let failed = link.registry.fail_all(&TransportError::Disconnected);
            settle(&link.ready, ReadyState::Failed(TransportError::Disconnected));
            info!(generation, failed, "realtime client disconnected");
            generation
        };
        self.shared.emit(ConnectionEvent::Closed {
            generation,
            reason: TransportError::Disconnected,
        });
    }

    fn ensure_connected(&self, link: &mut Link) {
        if link.outbound.is_some() {
            return;
        }
        let Some(credential) = self.shared.credential.read().clone() else {
            warn!("realtime connection requested without a credential");
            let (ready, _) = watch::channel(ReadyState::Failed(TransportError::Unauthenticated));
            link.ready = ready;
            let _ = link.registry.notify_queued(&TransportError::Unauthenticated);
            self.shared.emit_error(TransportError::Unauthenticated);
            return;
        };

        link.generation += 1;
        let generation = link.generation;
        let auth = AuthBundle::new(self.shared.config.host.clone(), &credential);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(ReadyState::Pending);
        let cancel = CancellationToken::new();

        link.state = HandshakeState::Connecting;
        link.outbound = Some(outbound);
        link.auth = Some(auth.clone());
        link.ready = ready;
        link.cancel = Some(cancel.clone());

        info!(generation, url = %self.shared.config.url, "opening realtime connection");
        self.shared.emit(ConnectionEvent::Connecting { generation });
        let _ = tokio::spawn(connection::run(
            Arc::downgrade(&self.shared),
            self.shared.config.clone(),
            generation,
            auth,
            outbound_rx,
            cancel,
        ));
    }
}

/// Transport seam used by the job monitor.
pub trait SubscriptionTransport: Send + Sync {
    /// See [`RealtimeClient::add_subscription`].
    fn add_subscription(&self, key: &str, request: SubscriptionRequest) -> SubscriptionEvents;

    /// See [`RealtimeClient::remove_subscription`].
    fn remove_subscription(&self, key: &str) -> bool;

    /// See [`RealtimeClient::set_credential`].
    fn set_credential(&self, credential: Credential);
}

impl SubscriptionTransport for RealtimeClient {
    fn add_subscription(&self, key: &str, request: SubscriptionRequest) -> SubscriptionEvents {
        Self::add_subscription(self, key, request)
    }

    fn remove_subscription(&self, key: &str) -> bool {
        Self::remove_subscription(self, key)
    }

    fn set_credential(&self, credential: Credential) {
        Self::set_credential(self, credential);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription handle
// ─────────────────────────────────────────────────────────────────────────────

/// An anonymous subscription. Unsubscribes on drop.
pub struct Subscription {
    id: String,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Wire id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event; `None` once the subscription is finished.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Unsubscribe now.
    ///
    /// Before the handshake this only drops the queued frame; afterwards a
    /// `stop` is sent. Local delivery stops immediately either way.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(shared) = std::mem::take(&mut self.shared).upgrade() {
            let _ = shared.remove_id(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn client(credential: Option<Credential>) -> RealtimeClient {
        let url = Url::parse("ws://127.0.0.1:9/graphql").unwrap();
        let mut config = RealtimeConfig::new(url, "127.0.0.1:9");
        config.connect_timeout = Duration::from_millis(200);
        RealtimeClient::new(config, credential)
    }

    #[tokio::test]
    async fn ready_without_credential_fails() {
        let client = client(None);
        let mut events = client.connection_events();

        assert_eq!(client.ready().await, Err(TransportError::Unauthenticated));
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Error(TransportError::Unauthenticated)
        );
        assert_eq!(client.connection_state(), HandshakeState::Disconnected);
    }

    #[tokio::test]
    async fn queued_subscription_survives_failed_connect() {
        let client = client(Some(Credential::ApiKey("k".into())));
        let mut sub = client.subscribe(SubscriptionRequest::new("subscription { x }"));

        assert_matches!(client.ready().await, Err(_));
        assert_eq!(client.subscription_count(), 1);
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_before_handshake_removes_queued() {
        let client = client(None);
        let sub = client.subscribe(SubscriptionRequest::new("subscription { x }"));
        assert_eq!(client.subscription_count(), 1);

        drop(sub);
        assert_eq!(client.subscription_count(), 0);
    }

    #[tokio::test]
    async fn keyed_replace_and_remove() {
        let client = client(None);
        let mut first = client.add_subscription("job-1", SubscriptionRequest::new("s"));
        let _second = client.add_subscription("job-1", SubscriptionRequest::new("s"));

        assert_eq!(client.subscription_count(), 1);
        assert_eq!(
            first.recv().await,
            Some(SubscriptionEvent::Error(TransportError::Unauthenticated))
        );
        // The replaced registration's sink is gone.
        assert!(first.recv().await.is_none());

        assert!(client.remove_subscription("job-1"));
        assert!(!client.remove_subscription("job-1"));
    }

    #[tokio::test]
    async fn failed_connect_tells_keyed_subscription_and_keeps_it() {
        let client = client(Some(Credential::ApiKey("k".into())));
        let mut events = client.add_subscription("job-1", SubscriptionRequest::new("s"));

        assert_matches!(
            events.recv().await,
            Some(SubscriptionEvent::Error(
                TransportError::Connect { .. } | TransportError::ConnectTimeout { .. }
            ))
        );
        assert_eq!(client.subscription_count(), 1);
        assert_eq!(client.connection_state(), HandshakeState::Disconnected);
        assert!(client.remove_subscription("job-1"));
    }

    #[tokio::test]
    async fn disconnect_fails_everything() {
        let client = client(None);
        let mut events = client.add_subscription("job-1", SubscriptionRequest::new("s"));
        assert_eq!(
            events.recv().await,
            Some(SubscriptionEvent::Error(TransportError::Unauthenticated))
        );
        assert_eq!(client.subscription_count(), 1);

        client.disconnect();
        assert_eq!(
            events.recv().await,
            Some(SubscriptionEvent::Error(TransportError::Disconnected))
        );
        assert_eq!(client.subscription_count(), 0);
    }
}
