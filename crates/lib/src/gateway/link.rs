//! The relay's single persistent connection to the gateway.
//!
//! One socket task owns the live WebSocket. It answers the challenge with a
//! single `connect` request, then settles pending requests and fans out
//! everything else to listeners. When the socket closes, pending requests fail
//! and a reconnect is scheduled after a fixed delay.

use crate::config::GatewayConfig;
use crate::device::DeviceAuth;
use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::gateway::handshake;
use crate::ids::RequestIds;
use crate::pending::PendingRequests;
use crate::protocol::{EventFrame, Frame, CHALLENGE_EVENT, CONNECT_METHOD};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Handshaking,
    Authenticated,
}

/// A frame the link did not consume itself, with its original text for verbatim forwarding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame: Frame,
    pub text: String,
}

/// Handle to the gateway link. Clones share one connection.
#[derive(Clone)]
pub struct GatewayLink {
    shared: Arc<Shared>,
}

struct Shared {
    config: GatewayConfig,
    device: Option<DeviceAuth>,
    ids: RequestIds,
    conn: Mutex<Conn>,
    pending: PendingRequests,
    hello: Mutex<Option<Value>>,
    events: Listeners<EventFrame>,
    frames: Listeners<RawFrame>,
    state_tx: watch::Sender<LinkState>,
    shutdown: CancellationToken,
}

struct Conn {
    state: LinkState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl GatewayLink {
    pub fn new(config: GatewayConfig) -> Self {
        Self::build(config, None)
    }

    /// Link that signs every handshake with `device`.
    pub fn with_device(config: GatewayConfig, device: DeviceAuth) -> Self {
        Self::build(config, Some(device))
    }

    fn build(config: GatewayConfig, device: Option<DeviceAuth>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                device,
                ids: RequestIds::new(),
                conn: Mutex::new(Conn {
                    state: LinkState::Idle,
                    outbound: None,
                }),
                pending: PendingRequests::new(),
                hello: Mutex::new(None),
                events: Listeners::new(),
                frames: Listeners::new(),
                state_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open the socket and complete the handshake. Resolves with the handshake snapshot.
    pub async fn connect(&self) -> Result<Value> {
        let shared = &self.shared;
        let token = match shared
            .config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            Some(t) => t.to_string(),
            None => {
                log::warn!("gateway token not configured; not connecting");
                return Err(Error::Config("gateway token".to_string()));
            }
        };
        if shared.shutdown.is_cancelled() {
            return Err(Error::Disconnected);
        }
        {
            let mut conn = shared.conn.lock();
            if conn.state != LinkState::Idle {
                return Err(Error::AlreadyConnecting);
            }
            shared.set_state(&mut conn, LinkState::Connecting);
        }
        let dialing = DialGuard {
            shared: Some(shared.clone()),
        };

        let dialed = tokio::time::timeout(shared.config.handshake_timeout(), shared.dial())
            .await
            .unwrap_or(Err(Error::HandshakeTimeout));
        let ws = match dialed {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("gateway connect to {} failed: {}", shared.config.url, e);
                drop(dialing);
                schedule_reconnect(shared.clone());
                return Err(e);
            }
        };
        log::info!("gateway socket open: {}", shared.config.url);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        shared.conn.lock().outbound = Some(out_tx.clone());
        let task = SocketTask {
            shared: shared.clone(),
            token,
            out_tx,
            connect_id: None,
            handshake: Some(done_tx),
        };
        dialing.disarm();
        tokio::spawn(task.run(ws, out_rx));
        done_rx.await.unwrap_or(Err(Error::Disconnected))
    }

    /// Send a request and wait for its response.
    pub async fn rpc(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let shared = &self.shared;
        let reply = {
            let conn = shared.conn.lock();
            let Some(outbound) = conn.outbound.as_ref() else {
                return Err(Error::NotConnected);
            };
            if conn.state != LinkState::Authenticated {
                return Err(Error::NotConnected);
            }
            let id = shared.ids.next("rpc");
            let reply = shared.pending.register(&id);
            let text = Frame::request(id, method, params).to_json();
            if outbound.send(Message::Text(text)).is_err() {
                return Err(Error::NotConnected);
            }
            reply
        };
        reply.wait(shared.config.request_timeout(), method).await
    }

    /// Fire-and-forget send of an already-serialized frame. Dropped when not authenticated.
    pub fn send_raw(&self, text: impl Into<String>) {
        let conn = self.shared.conn.lock();
        if conn.state != LinkState::Authenticated {
            log::debug!("gateway not authenticated; dropping outbound frame");
            return;
        }
        if let Some(outbound) = conn.outbound.as_ref() {
            let _ = outbound.send(Message::Text(text.into()));
        }
    }

    /// Listen for every event after the handshake.
    pub fn on_event(&self, listener: impl Fn(&EventFrame) + Send + Sync + 'static) -> Subscription {
        self.shared.events.add(listener)
    }

    /// Listen for frames the link does not consume: events, and responses to requests it did not send.
    pub fn on_frame(&self, listener: impl Fn(&RawFrame) + Send + Sync + 'static) -> Subscription {
        self.shared.frames.add(listener)
    }

    /// Payload of the last successful handshake.
    pub fn hello(&self) -> Option<Value> {
        self.shared.hello.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Authenticated
    }

    pub fn state(&self) -> LinkState {
        self.shared.conn.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Close the socket and stop reconnecting. The link cannot be reused.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn set_state(&self, conn: &mut Conn, state: LinkState) {
        conn.state = state;
        self.state_tx.send_replace(state);
    }

    async fn dial(&self) -> Result<GatewaySocket> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(origin) = self.config.origin.as_deref() {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| Error::Transport(format!("invalid origin: {}", e)))?;
            request.headers_mut().insert(header::ORIGIN, value);
        }
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws)
    }

    fn on_socket_closed(self: &Arc<Self>) {
        let failed = {
            let mut conn = self.conn.lock();
            conn.outbound = None;
            self.set_state(&mut conn, LinkState::Idle);
            self.pending.fail_all(Error::Disconnected)
        };
        log::info!("gateway socket closed; {} pending request(s) failed", failed);
        schedule_reconnect(self.clone());
    }
}

/// Returns the link to `Idle` if `connect` fails or is dropped while dialing.
struct DialGuard {
    shared: Option<Arc<Shared>>,
}

impl DialGuard {
    /// The socket task owns the state from here on.
    fn disarm(mut self) {
        self.shared = None;
    }
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let mut conn = shared.conn.lock();
        if conn.state == LinkState::Connecting {
            shared.set_state(&mut conn, LinkState::Idle);
        }
    }
}

fn schedule_reconnect(shared: Arc<Shared>) {
    if shared.shutdown.is_cancelled() {
        return;
    }
    let delay = shared.config.reconnect_delay();
    log::info!("reconnecting to gateway in {:?}", delay);
    tokio::spawn(reconnect_after(GatewayLink { shared }, delay));
}

// Boxed so the reconnect future does not name `connect`'s own future type.
fn reconnect_after(link: GatewayLink, delay: Duration) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let shutdown = link.shared.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        match link.connect().await {
            Ok(_) => log::info!("gateway link re-established"),
            Err(Error::AlreadyConnecting) => {}
            Err(e) => log::warn!("gateway reconnect failed: {}", e),
        }
    })
}

/// Owns one live gateway socket until it closes.
struct SocketTask {
    shared: Arc<Shared>,
    token: String,
    out_tx: mpsc::UnboundedSender<Message>,
    connect_id: Option<String>,
    handshake: Option<oneshot::Sender<Result<Value>>>,
}

impl SocketTask {
    async fn run(mut self, ws: GatewaySocket, mut out_rx: mpsc::UnboundedReceiver<Message>) {
        let (mut sink, mut stream) = ws.split();
        let shutdown = self.shared.shutdown.clone();
        let deadline = tokio::time::sleep(self.shared.config.handshake_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                _ = &mut deadline, if self.handshake.is_some() => {
                    log::warn!("gateway handshake timed out");
                    self.finish_handshake(Err(Error::HandshakeTimeout));
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(msg) = out_rx.recv() => {
                    if let Err(e) = sink.send(msg).await {
                        log::warn!("gateway write failed: {}", e);
                        break;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !self.handle_text(&text) {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("gateway closed the connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("gateway socket error: {}", e);
                        self.finish_handshake(Err(e.into()));
                        break;
                    }
                    None => break,
                }
            }
        }

        self.shared.on_socket_closed();
        self.finish_handshake(Err(Error::Disconnected));
    }

    /// Apply one inbound text frame. Returns false when the socket should close.
    fn handle_text(&mut self, text: &str) -> bool {
        let Some(frame) = Frame::parse(text) else {
            return true;
        };
        if self.handshake.is_some() {
            return self.handle_handshake(frame);
        }
        match &frame {
            Frame::Response(res) => {
                if self.shared.pending.resolve(&res.id, res.clone().into_result()) {
                    return true;
                }
            }
            Frame::Event(ev) if ev.event == CHALLENGE_EVENT => {
                log::debug!("ignoring connect challenge after handshake");
                return true;
            }
            Frame::Event(ev) => self.shared.events.emit(ev),
            Frame::Request(_) => {}
        }
        self.shared.frames.emit(&RawFrame {
            frame,
            text: text.to_string(),
        });
        true
    }

    fn handle_handshake(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Event(ev) if ev.event == CHALLENGE_EVENT => {
                if self.connect_id.is_some() {
                    log::debug!("ignoring duplicate connect challenge");
                    return true;
                }
                let nonce = handshake::challenge_nonce(&ev.payload);
                let params = match handshake::connect_params(
                    &self.shared.config,
                    &self.token,
                    self.shared.device.as_ref(),
                    nonce,
                ) {
                    Ok(params) => params,
                    Err(e) => {
                        log::warn!("building connect params failed: {:#}", e);
                        self.finish_handshake(Err(Error::Transport(e.to_string())));
                        return false;
                    }
                };
                let id = self.shared.ids.next(CONNECT_METHOD);
                let request =
                    Frame::request(id.clone(), CONNECT_METHOD, serde_json::to_value(&params).ok());
                self.connect_id = Some(id);
                self.shared
                    .set_state(&mut self.shared.conn.lock(), LinkState::Handshaking);
                let _ = self.out_tx.send(Message::Text(request.to_json()));
                true
            }
            Frame::Response(res) if self.connect_id.as_deref() == Some(res.id.as_str()) => {
                // The handshake needs an explicit `ok: true`; a bare response is a rejection.
                if !res.is_confirmed() {
                    let message = res.error_message("connect rejected");
                    log::warn!("gateway rejected handshake: {}", message);
                    self.finish_handshake(Err(Error::HandshakeRejected(message)));
                    return false;
                }
                let hello = res.payload.unwrap_or(Value::Null);
                if let (Some(device), Some(token)) =
                    (&self.shared.device, handshake::issued_device_token(&hello))
                {
                    if let Err(e) = device.token_store.save(token) {
                        log::warn!("saving device token failed: {}", e);
                    }
                }
                *self.shared.hello.lock() = Some(hello.clone());
                self.shared
                    .set_state(&mut self.shared.conn.lock(), LinkState::Authenticated);
                log::info!("gateway link authenticated");
                self.finish_handshake(Ok(hello));
                true
            }
            other => {
                log::debug!("dropping frame received before handshake: {:?}", other);
                true
            }
        }
    }

    fn finish_handshake(&mut self, result: Result<Value>) {
        if let Some(tx) = self.handshake.take() {
            let _ = tx.send(result);
        }
    }
}
