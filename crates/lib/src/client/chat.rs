//! Chat turns over the client store: `chat.send`, `chat.abort`, and folding
//! streamed `chat` events into complete text.
//!
//! Gateways differ in what a `delta` carries. [`DeltaMode::Cumulative`] treats
//! each delta as the full text so far (a shorter one never truncates);
//! [`DeltaMode::Incremental`] appends each delta.

use crate::client::store::ClientStore;
use crate::error::Result;
use crate::events::Subscription;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

const CHAT_EVENT: &str = "chat";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaMode {
    #[default]
    Cumulative,
    Incremental,
}

/// Text of one streaming reply.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    mode: DeltaMode,
    text: String,
}

impl StreamAccumulator {
    pub fn new(mode: DeltaMode) -> Self {
        Self {
            mode,
            text: String::new(),
        }
    }

    /// Fold one delta in. Returns true if the text changed.
    pub fn push(&mut self, delta: &str) -> bool {
        match self.mode {
            DeltaMode::Cumulative => {
                if delta.len() <= self.text.len() {
                    return false;
                }
                self.text = delta.to_string();
                true
            }
            DeltaMode::Incremental => {
                if delta.is_empty() {
                    return false;
                }
                self.text.push_str(delta);
                true
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}

/// Text of a message: a string, an array of `{type:"text", text}` parts, or an object with `content`.
pub fn extract_text(message: &Value) -> Option<String> {
    match message {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect(),
        ),
        Value::Object(fields) => fields.get("content").and_then(extract_text),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    /// Streamed text so far.
    Delta { session_key: String, text: String },
    Final { session_key: String, text: String },
    Aborted { session_key: String, text: String },
    Error { session_key: String, message: String },
}

/// Chat helper bound to one store. Dropping it stops listening for `chat` events.
pub struct ChatSession {
    store: ClientStore,
    _subscription: Subscription,
}

impl ChatSession {
    pub fn new(store: ClientStore, mode: DeltaMode) -> (Self, mpsc::UnboundedReceiver<ChatUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let streams: Arc<Mutex<HashMap<String, StreamAccumulator>>> = Arc::default();
        let subscription = store.on(CHAT_EVENT, move |payload| {
            if let Some(update) = fold_chat_event(&streams, mode, payload) {
                let _ = tx.send(update);
            }
        });
        (
            Self {
                store,
                _subscription: subscription,
            },
            rx,
        )
    }

    /// Send a user message; the reply arrives as `chat` events.
    pub async fn send(&self, session_key: &str, message: &str) -> Result<Value> {
        let idempotency_key = format!("tether-{}", uuid::Uuid::new_v4().simple());
        self.store
            .request(
                "chat.send",
                Some(json!({
                    "sessionKey": session_key,
                    "message": message,
                    "deliver": false,
                    "idempotencyKey": idempotency_key,
                })),
            )
            .await
    }

    /// Ask the gateway to stop the running turn.
    pub async fn abort(&self, session_key: &str) -> Result<Value> {
        self.store
            .request("chat.abort", Some(json!({ "session": session_key })))
            .await
    }
}

fn fold_chat_event(
    streams: &Mutex<HashMap<String, StreamAccumulator>>,
    mode: DeltaMode,
    payload: &Value,
) -> Option<ChatUpdate> {
    let session_key = payload
        .get("sessionKey")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let state = payload.get("state").and_then(Value::as_str)?;
    let mut streams = streams.lock();
    match state {
        "delta" => {
            let text = payload.get("message").and_then(extract_text)?;
            let acc = streams
                .entry(session_key.clone())
                .or_insert_with(|| StreamAccumulator::new(mode));
            if !acc.push(&text) {
                return None;
            }
            Some(ChatUpdate::Delta {
                session_key,
                text: acc.text().to_string(),
            })
        }
        "final" | "aborted" => {
            let mut text = streams
                .remove(&session_key)
                .map(|mut acc| acc.take())
                .unwrap_or_default();
            if text.is_empty() {
                text = payload
                    .get("message")
                    .and_then(extract_text)
                    .unwrap_or_default();
            }
            Some(if state == "final" {
                ChatUpdate::Final { session_key, text }
            } else {
                ChatUpdate::Aborted { session_key, text }
            })
        }
        "error" => {
            streams.remove(&session_key);
            let message = payload
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("chat error")
                .to_string();
            Some(ChatUpdate::Error {
                session_key,
                message,
            })
        }
        other => {
            log::debug!("ignoring chat event state {}", other);
            None
        }
    }
}
