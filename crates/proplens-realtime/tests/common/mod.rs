//! In-process graphql-ws server for transport tests.

#![allow(dead_code, missing_docs)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use proplens_realtime::{Credential, RealtimeClient, RealtimeConfig};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use url::Url;

pub const API_HOST: &str = "api.test";
pub const TOKEN: &str = "test-token";
const WAIT: Duration = Duration::from_secs(5);

enum ServerCmd {
    Text(String),
    Close,
}

/// Accepts graphql-ws connections and hands each to the test.
pub struct MockServer {
    pub url: Url,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

/// Server side of one accepted connection.
pub struct ServerConn {
    pub protocol_header: Option<String>,
    inbound: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::UnboundedSender<ServerCmd>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();
        let _ = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = tokio::spawn(serve(stream, tx.clone()));
            }
        });
        Self {
            url: Url::parse(&format!("ws://{addr}/graphql")).unwrap(),
            connections,
        }
    }

    pub fn config(&self) -> RealtimeConfig {
        let mut config = RealtimeConfig::new(self.url.clone(), API_HOST);
        config.connect_timeout = Duration::from_secs(2);
        config.min_keepalive_check = Duration::from_millis(20);
        config
    }

    pub fn client(&self) -> RealtimeClient {
        RealtimeClient::new(self.config(), Some(Credential::Token(TOKEN.into())))
    }

    pub async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection within timeout")
            .expect("server stopped")
    }

    /// Accept, read `connection_init`, reply with `connection_ack`.
    pub async fn accept_acked(&mut self, keepalive_ms: u64) -> ServerConn {
        let mut conn = self.accept().await;
        let _ = conn.recv_type("connection_init").await;
        conn.ack(keepalive_ms);
        conn
    }
}

impl ServerConn {
    pub async fn recv(&mut self) -> Value {
        timeout(WAIT, self.inbound.recv())
            .await
            .expect("no frame within timeout")
            .expect("connection closed")
    }

    pub async fn recv_type(&mut self, kind: &str) -> Value {
        let frame = self.recv().await;
        assert_eq!(frame["type"], kind, "unexpected frame: {frame}");
        frame
    }

    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(frame) = timeout(window, self.inbound.recv()).await {
            panic!("expected no frame, got {frame:?}");
        }
    }

    /// Wait until the client side is gone, skipping frames.
    pub async fn closed(&mut self) {
        timeout(WAIT, async {
            while self.inbound.recv().await.is_some() {}
        })
        .await
        .expect("connection still open");
    }

    pub fn send(&self, frame: Value) {
        let _ = self.outbound.send(ServerCmd::Text(frame.to_string()));
    }

    pub fn ack(&self, keepalive_ms: u64) {
        self.send(json!({"type": "connection_ack", "payload": {"connectionTimeoutMs": keepalive_ms}}));
    }

    pub fn ka(&self) {
        self.send(json!({"type": "ka"}));
    }

    pub fn data(&self, id: &str, payload: Value) {
        self.send(json!({"type": "data", "id": id, "payload": payload}));
    }

    pub fn close(&self) {
        let _ = self.outbound.send(ServerCmd::Close);
    }
}

/// `{query, variables}` carried by a `start` frame.
pub fn start_operation(frame: &Value) -> Value {
    serde_json::from_str(frame["payload"]["data"].as_str().unwrap()).unwrap()
}

async fn serve(stream: TcpStream, connections: mpsc::UnboundedSender<ServerConn>) {
    let (header_tx, header_rx) = oneshot::channel();
    let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let header = req
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if header.is_some() {
            let _ = resp
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("graphql-ws"));
        }
        let _ = header_tx.send(header);
        Ok(resp)
    };
    let Ok(ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let protocol_header = header_rx.await.ok().flatten();

    let (in_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, mut out_rx) = mpsc::unbounded_channel();
    let _ = connections.send(ServerConn {
        protocol_header,
        inbound,
        outbound,
    });

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            cmd = out_rx.recv() => match cmd {
                Some(ServerCmd::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCmd::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = in_tx.send(value);
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
