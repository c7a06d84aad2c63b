//! Connection task: owns one socket for its whole life.
//!
//! Opens the WebSocket with the graphql-ws subprotocols, sends
//! `connection_init`, then multiplexes three inputs until the socket dies:
//! outbound frames from the client, inbound frames from the server, and the
//! keepalive watchdog tick. Its last act is the generation-checked teardown.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::auth::AuthBundle;
use crate::client::{RealtimeConfig, Shared};
use crate::error::TransportError;
use crate::keepalive::KeepaliveWatchdog;
use crate::protocol::{ClientFrame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[allow(clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Run one connection instance to completion.
pub(crate) async fn run(
    shared: Weak<Shared>,
    config: RealtimeConfig,
    generation: u64,
    auth: AuthBundle,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    cancel: CancellationToken,
) {
    let reason = tokio::select! {
        opened = open(&config, &auth) => match opened {
            Ok(ws) => {
                let task = ConnectionTask {
                    shared: shared.clone(),
                    config: &config,
                    generation,
                };
                task.drive(ws, &mut outbound, &cancel).await
            }
            Err(err) => {
                warn!(generation, error = %err, "realtime connect failed");
                err
            }
        },
        () = cancel.cancelled() => TransportError::Disconnected,
    };
    if let Some(shared) = shared.upgrade() {
        shared.teardown(generation, reason);
    }
}

async fn open(config: &RealtimeConfig, auth: &AuthBundle) -> Result<WsStream, TransportError> {
    let url = config.url.to_string();
    let connect_err = |reason: String| TransportError::Connect {
        url: url.clone(),
        reason,
    };

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| connect_err(e.to_string()))?;
    let protocols = auth
        .subprotocols()
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    let header = HeaderValue::from_str(&protocols).map_err(|e| connect_err(e.to_string()))?;
    let _ = request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, header);

    let (ws, _response) = time::timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            timeout_ms: millis(config.connect_timeout),
        })?
        .map_err(|e| connect_err(e.to_string()))?;
    debug!(%url, "realtime socket open");
    Ok(ws)
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), TransportError> {
    let text = frame
        .encode()
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    debug!(kind = frame.kind(), "sending frame");
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::Closed {
            reason: e.to_string(),
        })
}

async fn close(sink: &mut WsSink) {
    if let Err(err) = sink.send(Message::Close(None)).await {
        debug!(error = %err, "close frame not delivered");
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            let _ = ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

struct ConnectionTask<'a> {
    shared: Weak<Shared>,
    config: &'a RealtimeConfig,
    generation: u64,
}

impl ConnectionTask<'_> {
    fn shared(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    async fn drive(
        &self,
        ws: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
        cancel: &CancellationToken,
    ) -> TransportError {
        let (mut ws_tx, mut ws_rx) = ws.split();
        if let Err(err) = send_frame(&mut ws_tx, &ClientFrame::ConnectionInit).await {
            return err;
        }

        let mut watchdog: Option<KeepaliveWatchdog> = None;
        let mut ticker: Option<Interval> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    close(&mut ws_tx).await;
                    return TransportError::Disconnected;
                }
                // Frames from the client side
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        close(&mut ws_tx).await;
                        return TransportError::Disconnected;
                    };
                    if let Err(err) = send_frame(&mut ws_tx, &frame).await {
                        return err;
                    }
                }
                // Frames from the server
                msg = ws_rx.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map_or_else(|| "closed by server".to_string(), |f| f.reason.as_str().to_owned());
                            return TransportError::Closed { reason };
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return TransportError::Closed { reason: err.to_string() },
                        None => return TransportError::Closed { reason: "stream ended".into() },
                    };
                    let frame = match ServerFrame::decode(&text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "ignoring undecodable frame");
                            continue;
                        }
                    };
                    match frame {
                        ServerFrame::ConnectionAck { .. } => {
                            let keepalive = frame
                                .keepalive_ms()
                                .filter(|ms| *ms > 0)
                                .map_or(self.config.default_keepalive, Duration::from_millis);
                            let armed = KeepaliveWatchdog::new(
                                keepalive,
                                self.config.min_keepalive_check,
                                Instant::now(),
                            );
                            let period = armed.check_period();
                            let mut interval = time::interval_at(Instant::now() + period, period);
                            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            ticker = Some(interval);
                            watchdog = Some(armed);
                            if let Some(shared) = self.shared() {
                                shared.on_ack(self.generation, keepalive);
                            }
                        }
                        ServerFrame::Ka => {
                            if let Some(watchdog) = watchdog.as_mut() {
                                watchdog.observe_ka(Instant::now());
                            }
                        }
                        ServerFrame::Error { id: None, payload } => {
                            let err = TransportError::Connection { payload };
                            error!(generation = self.generation, error = %err, "connection-level error frame");
                            if let Some(shared) = self.shared() {
                                shared.emit_error(err.clone());
                            }
                            close(&mut ws_tx).await;
                            return err;
                        }
                        ServerFrame::Unknown => debug!(raw = %text.as_str(), "ignoring unknown frame type"),
                        routed => {
                            if let Some(shared) = self.shared() {
                                shared.route(self.generation, routed);
                            }
                        }
                    }
                }
                () = tick(&mut ticker) => {
                    if let Some(watchdog) = watchdog.as_mut() {
                        if watchdog.fire(Instant::now()) {
                            let interval_ms = millis(watchdog.interval());
                            warn!(generation = self.generation, interval_ms, "keepalive missed, closing socket");
                            close(&mut ws_tx).await;
                            return TransportError::KeepaliveTimeout { interval_ms };
                        }
                    }
                }
            }
        }
    }
}
