//! One client session bridged onto the shared gateway link.

use crate::protocol::{Frame, ResponseFrame, CONNECT_METHOD, SNAPSHOT_ID};
use crate::relay::auth;
use crate::relay::server::RelayState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use serde_json::{json, Value};
use std::borrow::Cow;
use tokio::sync::mpsc;

const SHUTDOWN_EVENT: &str = "shutdown";

/// What to do with one inbound client frame.
#[derive(Debug, PartialEq)]
enum Inbound {
    /// Handshake attempt; answered locally under this id.
    Connect(String),
    Forward,
    Drop,
}

fn classify(text: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        log::debug!("dropping non-JSON client frame");
        return Inbound::Drop;
    };
    if value.get("method").and_then(Value::as_str) == Some(CONNECT_METHOD) {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Inbound::Connect(id);
    }
    Inbound::Forward
}

fn snapshot_response(id: &str, hello: Value) -> String {
    Frame::Response(ResponseFrame::ok(id, hello)).to_json()
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}

pub(crate) async fn handle_client(mut socket: WebSocket, state: RelayState, token: Option<String>) {
    if !auth::validate_ws_token(state.ui_token.as_deref(), token.as_deref()) {
        log::info!("rejecting client: bad credential");
        close(&mut socket, close_code::POLICY, "unauthorized").await;
        return;
    }
    if !state.link.is_connected() {
        log::info!("rejecting client: gateway not connected");
        close(&mut socket, close_code::AGAIN, "gateway not connected").await;
        return;
    }
    log::info!("client connected");

    let hello = state.link.hello().unwrap_or(Value::Null);
    if socket
        .send(Message::Text(snapshot_response(SNAPSHOT_ID, hello.clone())))
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let _subscription = state.link.on_frame(move |raw| {
        let _ = tx.send(raw.text.clone());
    });

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let event = Frame::event(SHUTDOWN_EVENT, json!({})).to_json();
                let _ = socket.send(Message::Text(event)).await;
                close(&mut socket, close_code::NORMAL, "relay shutting down").await;
                break;
            }
            Some(text) = rx.recv() => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                match classify(&text) {
                    Inbound::Connect(id) => {
                        let hello = state.link.hello().unwrap_or_else(|| hello.clone());
                        if socket.send(Message::Text(snapshot_response(&id, hello))).await.is_err() {
                            break;
                        }
                    }
                    Inbound::Forward => state.link.send_raw(text),
                    Inbound::Drop => {}
                }
            }
        }
    }
    log::info!("client disconnected");
}
