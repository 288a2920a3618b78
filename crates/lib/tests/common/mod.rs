//! Shared fixtures: an in-process mock gateway, a relay on a free port, and polling helpers.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether::client::ClientStore;
use tether::config::{ClientConfig, GatewayConfig};
use tether::credentials::StaticToken;
use tether::gateway::GatewayLink;
use tether::relay::{self, RelayState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const GATEWAY_TOKEN: &str = "gw-secret";
pub const UI_TOKEN: &str = "ui-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct MockOptions {
    /// How many `connect.challenge` events to send on open.
    pub challenges: usize,
    pub hello: Value,
    /// When set, `connect` is answered with `ok: false` and this error.
    pub reject: Option<Value>,
    /// When false, the `connect` reply carries the payload but no `ok` field.
    pub confirm: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            challenges: 1,
            hello: json!({ "protocol": 3, "server": { "name": "mock" } }),
            reject: None,
            confirm: true,
        }
    }
}

/// Gateway stand-in. Methods: `connect`, `echo`, `echo.legacy` (long-form response),
/// `fail`, `slow` (never answers), `chat.send` (streams a reply); anything else is an error.
pub struct MockGateway {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    accept: JoinHandle<()>,
}

struct MockState {
    opts: MockOptions,
    connections: AtomicUsize,
    connects: AtomicUsize,
    last_connect: Mutex<Option<Value>>,
    broadcast: broadcast::Sender<String>,
    drop_all: broadcast::Sender<()>,
}

impl MockGateway {
    pub async fn start() -> Self {
        Self::with_options(MockOptions::default()).await
    }

    pub async fn with_options(opts: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock gateway");
        let addr = listener.local_addr().expect("local_addr");
        let (broadcast, _) = broadcast::channel(64);
        let (drop_all, _) = broadcast::channel(4);
        let state = Arc::new(MockState {
            opts,
            connections: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            last_connect: Mutex::new(None),
            broadcast,
            drop_all,
        });
        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, accept_state.clone()));
            }
        });
        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn hello(&self) -> Value {
        self.state.opts.hello.clone()
    }

    /// Sockets accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// `connect` requests received so far.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn last_connect(&self) -> Option<Value> {
        self.state.last_connect.lock().clone()
    }

    /// Send `text` to every open connection.
    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.state.broadcast.send(text.into());
    }

    pub fn emit(&self, event: &str, payload: Value) {
        self.send_raw(json!({ "type": "event", "event": event, "payload": payload }).to_string());
    }

    /// Close every open connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        let _ = self.state.drop_all.send(());
    }

    /// Stop accepting and close every open connection.
    pub async fn stop(&self) {
        self.accept.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.drop_connections();
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<MockState>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut broadcast = state.broadcast.subscribe();
    let mut drop_all = state.drop_all.subscribe();
    let (mut sink, mut source) = ws.split();

    for i in 0..state.opts.challenges {
        let challenge = json!({
            "type": "event",
            "event": "connect.challenge",
            "payload": { "nonce": format!("nonce-{}", i), "ts": 0 }
        });
        if sink.send(Message::Text(challenge.to_string())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = drop_all.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            text = broadcast.recv() => {
                let Ok(text) = text else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            msg = source.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                for reply in state.respond(&text) {
                    if sink.send(Message::Text(reply)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl MockState {
    fn respond(&self, text: &str) -> Vec<String> {
        let Ok(req) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        let id = req["id"].clone();
        let params = req.get("params").cloned().unwrap_or(Value::Null);
        let ok = |payload: Value| {
            json!({ "type": "res", "id": id, "ok": true, "payload": payload }).to_string()
        };
        match req["method"].as_str().unwrap_or_default() {
            "connect" => {
                self.connects.fetch_add(1, Ordering::SeqCst);
                *self.last_connect.lock() = Some(params);
                match &self.opts.reject {
                    Some(error) => vec![json!({ "type": "res", "id": id, "ok": false, "error": error }).to_string()],
                    None if !self.opts.confirm => {
                        vec![json!({ "type": "res", "id": id, "payload": self.opts.hello }).to_string()]
                    }
                    None => vec![ok(self.opts.hello.clone())],
                }
            }
            "echo" => vec![ok(params)],
            "echo.legacy" => {
                vec![json!({ "type": "response", "id": id, "result": params }).to_string()]
            }
            "fail" => vec![json!({
                "type": "res",
                "id": id,
                "ok": false,
                "error": { "code": "E_FAIL", "message": "boom" }
            })
            .to_string()],
            "slow" => Vec::new(),
            "chat.send" => {
                let session = params["sessionKey"].clone();
                let chat = |state: &str, text: &str| {
                    json!({
                        "type": "event",
                        "event": "chat",
                        "payload": {
                            "state": state,
                            "sessionKey": session,
                            "message": { "role": "assistant", "content": [{ "type": "text", "text": text }] }
                        }
                    })
                    .to_string()
                };
                vec![
                    ok(json!({ "runId": "run-1" })),
                    chat("delta", "Hel"),
                    chat("delta", "Hello"),
                    chat("final", "Hello"),
                ]
            }
            other => vec![json!({
                "type": "res",
                "id": id,
                "ok": false,
                "error": { "message": format!("unknown method {}", other) }
            })
            .to_string()],
        }
    }
}

/// Listener that accepts TCP and never answers the WebSocket upgrade.
/// Returns its `ws://` URL; the accept task ends with the runtime.
pub async fn blackhole() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind blackhole");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    format!("ws://{}", addr)
}

/// Gateway settings with short timers for tests.
pub fn gateway_config(url: &str) -> GatewayConfig {
    GatewayConfig {
        url: url.to_string(),
        token: Some(GATEWAY_TOKEN.to_string()),
        origin: None,
        reconnect_delay_ms: 50,
        request_timeout_ms: 2_000,
        handshake_timeout_ms: 1_000,
        ..GatewayConfig::default()
    }
}

pub async fn connected_link(mock: &MockGateway) -> GatewayLink {
    let link = GatewayLink::new(gateway_config(&mock.url()));
    link.connect().await.expect("link connects");
    link
}

/// Serve a relay for `link` on a free port. Returns its base `ws://` URL and state.
pub async fn start_relay(link: GatewayLink) -> (String, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("local_addr");
    let state = RelayState::new(link, Some(UI_TOKEN.to_string()));
    tokio::spawn(relay::serve(listener, state.clone()));
    (format!("ws://{}", addr), state)
}

pub fn client_config(relay_url: &str) -> ClientConfig {
    ClientConfig {
        relay_url: relay_url.to_string(),
        request_timeout_ms: 2_000,
        ..ClientConfig::default()
    }
}

pub fn client(relay_url: &str) -> ClientStore {
    ClientStore::new(client_config(relay_url), StaticToken(Some(UI_TOKEN.to_string())))
}

pub async fn connected_client(relay_url: &str) -> ClientStore {
    let store = client(relay_url);
    store.connect().expect("client connect starts");
    store
        .wait_connected(Duration::from_secs(5))
        .await
        .expect("client connects");
    store
}

/// Raw WebSocket to the relay's `/ws`, for checking what the relay sends.
pub async fn raw_client(relay_url: &str, token: Option<&str>) -> WsClient {
    let url = match token {
        Some(t) => format!("{}/ws?token={}", relay_url, t),
        None => format!("{}/ws", relay_url),
    };
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("websocket upgrade");
    ws
}

/// Next text frame as JSON; panics on close or after 5s.
pub async fn next_frame(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .expect("socket ok");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("JSON frame"),
            Message::Close(frame) => panic!("socket closed: {:?}", frame),
            _ => continue,
        }
    }
}

/// Close code of the next close frame; panics on a text frame or after 5s.
pub async fn close_code(ws: &mut WsClient) -> u16 {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("close within 5s")
            .expect("socket open")
            .expect("socket ok");
        match msg {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame without code"),
            Message::Text(text) => panic!("expected close, got {}", text),
            _ => continue,
        }
    }
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

/// Poll `cond` every 25 ms for up to 5 s.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}
