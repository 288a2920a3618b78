//! Client connection store: owns the relay connection, correlates requests,
//! reconnects with backoff and dispatches events to subscribers.
//!
//! Connection state is published on a `watch` channel as a [`ConnectionSnapshot`].
//! Subscriptions survive reconnects; pending requests do not.

use crate::client::backoff::reconnect_delay;
use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::events::{EventRegistry, Listeners, Subscription};
use crate::ids::RequestIds;
use crate::pending::PendingRequests;
use crate::protocol::{Frame, SNAPSHOT_ID};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts; 0 after a successful open.
    pub reconnect_attempt: u32,
    /// Handshake snapshot from the relay's `proxy-hello` response.
    pub gateway_info: Option<Value>,
    pub error: Option<String>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempt: 0,
            gateway_info: None,
            error: None,
        }
    }
}

/// Handle to one relay connection. Clones share it.
#[derive(Clone)]
pub struct ClientStore {
    shared: Arc<Shared>,
}

struct Shared {
    config: ClientConfig,
    credentials: Arc<dyn CredentialStore>,
    ids: RequestIds,
    conn: Mutex<Conn>,
    pending: PendingRequests,
    registry: EventRegistry,
    frames: Listeners<Frame>,
    state_tx: watch::Sender<ConnectionSnapshot>,
}

#[derive(Default)]
struct Conn {
    /// Set while a socket task is dialing or open; cancelled by `disconnect`.
    socket: Option<CancellationToken>,
    /// Set while the socket is open.
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reconnect: Option<CancellationToken>,
}

impl ClientStore {
    pub fn new(config: ClientConfig, credentials: impl CredentialStore + 'static) -> Self {
        let (state_tx, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                config,
                credentials: Arc::new(credentials),
                ids: RequestIds::new(),
                conn: Mutex::new(Conn::default()),
                pending: PendingRequests::new(),
                registry: EventRegistry::new(),
                frames: Listeners::new(),
                state_tx,
            }),
        }
    }

    /// Start connecting in the background. No-op while connecting or connected.
    /// Fails fast with [`Error::Config`] when no credential is stored.
    pub fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let mut conn = shared.conn.lock();
        if conn.socket.is_some() {
            return Ok(());
        }
        let Some(token) = shared.credentials.token() else {
            shared.update(|s| {
                s.status = ConnectionStatus::Disconnected;
                s.error = Some("no UI token".to_string());
            });
            return Err(Error::Config("UI token".to_string()));
        };
        let url = ws_url(&shared.config.relay_url, &token)?;
        if let Some(timer) = conn.reconnect.take() {
            timer.cancel();
        }
        let cancel = CancellationToken::new();
        conn.socket = Some(cancel.clone());
        shared.update(|s| {
            s.status = if s.reconnect_attempt > 0 {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            };
            s.error = None;
        });
        tokio::spawn(run_socket(shared.clone(), url, cancel));
        Ok(())
    }

    /// Close the connection and stop reconnecting. Pending requests fail with [`Error::Disconnected`].
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut conn = shared.conn.lock();
        if let Some(timer) = conn.reconnect.take() {
            timer.cancel();
        }
        if let Some(socket) = conn.socket.take() {
            socket.cancel();
        }
        conn.outbound = None;
        shared.pending.fail_all(Error::Disconnected);
        shared.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.reconnect_attempt = 0;
        });
        log::info!("disconnected from relay");
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let shared = &self.shared;
        let reply = {
            let conn = shared.conn.lock();
            let Some(outbound) = conn.outbound.as_ref() else {
                return Err(Error::NotConnected);
            };
            let id = shared.ids.next("ui");
            let reply = shared.pending.register(&id);
            let text = Frame::request(id, method, params).to_json();
            if outbound.send(Message::Text(text)).is_err() {
                return Err(Error::NotConnected);
            }
            reply
        };
        reply.wait(shared.config.request_timeout(), method).await
    }

    /// Best-effort send of an already-serialized frame; dropped when not connected.
    pub fn send_raw(&self, text: impl Into<String>) {
        if let Some(outbound) = self.shared.conn.lock().outbound.as_ref() {
            let _ = outbound.send(Message::Text(text.into()));
        }
    }

    /// Listen for events named `event` (`"*"` for all).
    pub fn on(&self, event: &str, listener: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.shared.registry.subscribe(event, listener)
    }

    /// Listen for every event; the payload has `"event": <name>` merged in.
    pub fn on_any(&self, listener: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.shared.registry.subscribe_any(listener)
    }

    /// Listen for every parsed frame, before dispatch.
    pub fn on_frame(&self, listener: impl Fn(&Frame) + Send + Sync + 'static) -> Subscription {
        self.shared.frames.add(listener)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state_tx.borrow().status
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.shared.state_tx.subscribe()
    }

    pub fn gateway_info(&self) -> Option<Value> {
        self.shared.state_tx.borrow().gateway_info.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Wait until the socket is open, failing with [`Error::NotConnected`] after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.state_tx.subscribe();
        let opened = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.status == ConnectionStatus::Connected)
                .await
                .is_ok()
        })
        .await;
        match opened {
            Ok(true) => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }
}

/// `<relay_url>/ws?token=<token>`
fn ws_url(base: &str, token: &str) -> Result<Url> {
    let mut url =
        Url::parse(base).map_err(|e| Error::Transport(format!("invalid relay url {}: {}", base, e)))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut ConnectionSnapshot)) {
        self.state_tx.send_modify(f);
    }

    fn handle_text(&self, text: &str) {
        let Some(frame) = Frame::parse(text) else {
            return;
        };
        self.frames.emit(&frame);
        match frame {
            Frame::Response(res) => {
                if res.id == SNAPSHOT_ID {
                    let info = res.payload.clone();
                    self.update(|s| s.gateway_info = info);
                }
                let id = res.id.clone();
                if !self.pending.resolve(&id, res.into_result()) {
                    log::debug!("dropping response with unknown id {}", id);
                }
            }
            Frame::Event(ev) => self.registry.dispatch(&ev.event, &ev.payload),
            Frame::Request(req) => log::debug!("ignoring request frame from relay: {}", req.method),
        }
    }

    /// Socket closed without `disconnect`: fail pending requests and schedule the next attempt.
    fn on_closed(self: &Arc<Self>, cancel: &CancellationToken, reason: Option<String>) {
        let mut conn = self.conn.lock();
        if cancel.is_cancelled() {
            return;
        }
        conn.socket = None;
        conn.outbound = None;
        let mut previous = 0;
        self.update(|s| {
            previous = s.reconnect_attempt;
            s.status = ConnectionStatus::Reconnecting;
            s.reconnect_attempt += 1;
            if reason.is_some() {
                s.error = reason;
            }
        });
        let failed = self.pending.fail_all(Error::Disconnected);
        let delay = reconnect_delay(previous);
        let timer = CancellationToken::new();
        conn.reconnect = Some(timer.clone());
        log::info!(
            "relay connection lost ({} pending request(s) failed); reconnecting in {:?}",
            failed,
            delay
        );
        tokio::spawn(reconnect_after(
            ClientStore {
                shared: self.clone(),
            },
            delay,
            timer,
        ));
    }
}

async fn reconnect_after(store: ClientStore, delay: Duration, timer: CancellationToken) {
    tokio::select! {
        _ = timer.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    {
        let mut conn = store.shared.conn.lock();
        if timer.is_cancelled() {
            return;
        }
        conn.reconnect = None;
    }
    if let Err(e) = store.connect() {
        log::warn!("relay reconnect failed: {}", e);
    }
}

async fn run_socket(shared: Arc<Shared>, url: Url, cancel: CancellationToken) {
    let dial = tokio::time::timeout(
        shared.config.connect_timeout(),
        tokio_tungstenite::connect_async(url.as_str()),
    );
    let dialed = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = dial => dialed,
    };
    let ws = match dialed {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            log::warn!("relay connect failed: {}", e);
            shared.on_closed(&cancel, Some(e.to_string()));
            return;
        }
        Err(_) => {
            log::warn!("relay connect timed out after {:?}", shared.config.connect_timeout());
            shared.on_closed(&cancel, Some("connect timed out".to_string()));
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    {
        let mut conn = shared.conn.lock();
        if cancel.is_cancelled() {
            return;
        }
        conn.outbound = Some(out_tx);
        shared.update(|s| {
            s.status = ConnectionStatus::Connected;
            s.reconnect_attempt = 0;
            s.error = None;
        });
    }
    log::info!("connected to relay");

    let (mut sink, mut stream) = ws.split();
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            Some(msg) = out_rx.recv() => {
                if let Err(e) = sink.send(msg).await {
                    break Some(e.to_string());
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            }
        }
    };
    shared.on_closed(&cancel, reason);
}
