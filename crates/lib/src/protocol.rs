//! Wire protocol: request, response and event frames exchanged as JSON text
//! over the relay and gateway WebSockets, plus the typed `connect` params.
//!
//! Parsing is lenient about the `type` tag (`req`/`request`, `res`/`response`)
//! and about the response body (`payload` or `result`). Serialization always
//! emits the short tags and `payload`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Method name of the handshake request.
pub const CONNECT_METHOD: &str = "connect";

/// Event the gateway sends right after the socket opens; answered by one `connect` request.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Id of the synthetic response the relay pushes to each client on accept (handshake snapshot).
pub const SNAPSHOT_ID: &str = "proxy-hello";

/// Event name that subscribes to every event.
pub const WILDCARD: &str = "*";

/// Fallback message when a failed response carries no usable error message.
const RPC_ERROR_FALLBACK: &str = "RPC error";

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// `{ "type": "req", "id", "method", "params"? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// `{ "type": "res", "id", "ok"?, "payload"? | "error"? }`. `result` is accepted for `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, alias = "result", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// `{ "type": "event", "event", "payload" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// Error body of a failed response. The wire form is either an object
/// `{ "code"?, "message" }` or a bare string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ErrorRepr")]
pub struct ErrorShape {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
}

/// Machine-readable error code; gateways use both numeric and string codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorRepr {
    Text(String),
    Shape {
        #[serde(default)]
        code: Option<ErrorCode>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl From<ErrorRepr> for ErrorShape {
    fn from(repr: ErrorRepr) -> Self {
        match repr {
            ErrorRepr::Text(message) => Self {
                code: None,
                message,
            },
            ErrorRepr::Shape { code, message } => Self {
                code,
                message: message.unwrap_or_default(),
            },
        }
    }
}

impl ErrorShape {
    pub fn new(code: Option<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The peer's message, or `fallback` when it is empty.
    pub fn message_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        let m = self.message.trim();
        if m.is_empty() {
            fallback
        } else {
            m
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Number(n) => write!(f, "{}", n),
            ErrorCode::Text(s) => f.write_str(s),
        }
    }
}

enum FrameKind {
    Request,
    Response,
    Event,
}

impl Frame {
    /// Parse one text frame. Malformed JSON, an unknown `type` or a shape
    /// mismatch yields `None`; the frame is meant to be dropped.
    pub fn parse(text: &str) -> Option<Frame> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                log::debug!("dropping malformed frame: {}", e);
                None
            }
        }
    }

    /// Same as [`Frame::parse`] for an already-decoded JSON value.
    pub fn from_value(value: Value) -> Option<Frame> {
        let kind = match value.get("type").and_then(Value::as_str) {
            Some("req") | Some("request") => FrameKind::Request,
            Some("res") | Some("response") => FrameKind::Response,
            Some("event") => FrameKind::Event,
            other => {
                log::debug!("dropping frame with unknown type {:?}", other);
                return None;
            }
        };
        let parsed = match kind {
            FrameKind::Request => serde_json::from_value(value).map(Frame::Request),
            FrameKind::Response => serde_json::from_value(value).map(Frame::Response),
            FrameKind::Event => serde_json::from_value(value).map(Frame::Event),
        };
        match parsed {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::debug!("dropping frame with invalid shape: {}", e);
                None
            }
        }
    }

    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Frame::Request(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Frame::Event(EventFrame {
            event: event.into(),
            payload,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: Some(true),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: Some(false),
            payload: None,
            error: Some(error),
        }
    }

    /// Explicit `ok` wins; without it a response succeeded iff it carries no error.
    pub fn is_ok(&self) -> bool {
        self.ok.unwrap_or(self.error.is_none())
    }

    /// True only when the peer sent `ok: true`.
    pub fn is_confirmed(&self) -> bool {
        self.ok == Some(true)
    }

    /// Error message for a failed response, falling back to `fallback`.
    pub fn error_message(&self, fallback: &str) -> String {
        self.error
            .as_ref()
            .map(|e| e.message_or(fallback).to_string())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Settle a pending request with this response.
    pub fn into_result(self) -> crate::Result<Value> {
        if self.is_ok() {
            return Ok(self.payload.unwrap_or(Value::Null));
        }
        let message = self.error_message(RPC_ERROR_FALLBACK);
        Err(crate::Error::Rpc {
            message,
            code: self.error.and_then(|e| e.code),
        })
    }
}

/// Params of the `connect` handshake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ConnectClient,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: serde_json::Map<String, Value>,
    pub auth: ConnectAuth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<ConnectDevice>,
    pub locale: String,
    pub user_agent: String,
}

/// Identity the relay presents to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Token issued by the gateway after a previous device-signed handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

/// Signed device identity attached to `connect` when device signing is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectDevice {
    pub id: String,
    pub public_key: String, // base64 Ed25519 public key
    pub signature: String,  // base64 signature over the canonical payload
    pub signed_at: u64,     // Unix ms
    pub nonce: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_long_and_short_type_tags() {
        let a = Frame::parse(r#"{"type":"req","id":"1","method":"echo","params":{"x":1}}"#);
        let b = Frame::parse(r#"{"type":"request","id":"1","method":"echo","params":{"x":1}}"#);
        assert_eq!(a, b);
        assert!(matches!(a, Some(Frame::Request(ref r)) if r.method == "echo"));

        let res = Frame::parse(r#"{"type":"response","id":"7","result":{"x":1}}"#);
        let Some(Frame::Response(res)) = res else {
            panic!("expected response");
        };
        assert_eq!(res.payload, Some(json!({"x": 1})));
        assert!(res.is_ok());
        assert!(!res.is_confirmed());
        assert!(ResponseFrame::ok("7", json!(1)).is_confirmed());
    }

    #[test]
    fn malformed_and_unknown_frames_are_dropped() {
        assert_eq!(Frame::parse("not json"), None);
        assert_eq!(Frame::parse(r#"{"type":"hello"}"#), None);
        assert_eq!(Frame::parse(r#"{"id":"1"}"#), None);
        assert_eq!(Frame::parse(r#"{"type":"res","ok":true}"#), None);
        assert_eq!(Frame::parse("[1,2,3]"), None);
    }

    #[test]
    fn error_accepts_string_or_object() {
        let Some(Frame::Response(a)) =
            Frame::parse(r#"{"type":"res","id":"1","ok":false,"error":"nope"}"#)
        else {
            panic!("expected response");
        };
        assert_eq!(a.error_message("fallback"), "nope");

        let Some(Frame::Response(b)) = Frame::parse(
            r#"{"type":"res","id":"1","ok":false,"error":{"code":"NOT_FOUND","message":"missing"}}"#,
        ) else {
            panic!("expected response");
        };
        assert_eq!(
            b.error.as_ref().and_then(|e| e.code.clone()),
            Some(ErrorCode::Text("NOT_FOUND".into()))
        );

        let Some(Frame::Response(c)) =
            Frame::parse(r#"{"type":"res","id":"1","ok":false,"error":{"code":42}}"#)
        else {
            panic!("expected response");
        };
        assert_eq!(c.error_message("fallback"), "fallback");
        assert_eq!(
            c.into_result(),
            Err(crate::Error::Rpc {
                message: "RPC error".into(),
                code: Some(ErrorCode::Number(42)),
            })
        );
    }

    #[test]
    fn ok_defaults_to_absence_of_error() {
        let Some(Frame::Response(res)) =
            Frame::parse(r#"{"type":"response","id":"1","error":{"message":"boom"}}"#)
        else {
            panic!("expected response");
        };
        assert!(!res.is_ok());
        assert_eq!(
            res.into_result(),
            Err(crate::Error::Rpc {
                message: "boom".into(),
                code: None,
            })
        );
    }

    #[test]
    fn event_payload_defaults_to_null() {
        let Some(Frame::Event(ev)) = Frame::parse(r#"{"type":"event","event":"tick"}"#) else {
            panic!("expected event");
        };
        assert_eq!(ev.payload, Value::Null);
    }

    #[test]
    fn serializes_short_tags_and_payload() {
        let req = Frame::request("a", "chat.send", Some(json!({"m": "hi"})));
        let v: Value = serde_json::from_str(&req.to_json()).unwrap();
        assert_eq!(v, json!({"type": "req", "id": "a", "method": "chat.send", "params": {"m": "hi"}}));

        let res = Frame::Response(ResponseFrame::ok(SNAPSHOT_ID, json!({"protocol": 3})));
        let v: Value = serde_json::from_str(&res.to_json()).unwrap();
        assert_eq!(v, json!({"type": "res", "id": "proxy-hello", "ok": true, "payload": {"protocol": 3}}));

        let ev = Frame::event("ping", json!({"t": 1}));
        let v: Value = serde_json::from_str(&ev.to_json()).unwrap();
        assert_eq!(v, json!({"type": "event", "event": "ping", "payload": {"t": 1}}));
    }

    #[test]
    fn connect_params_use_camel_case() {
        let params = ConnectParams {
            min_protocol: 3,
            max_protocol: 3,
            client: ConnectClient {
                id: "c".into(),
                version: "1".into(),
                platform: "linux".into(),
                mode: "webchat".into(),
            },
            role: "operator".into(),
            scopes: vec!["operator.admin".into()],
            caps: vec![],
            commands: vec![],
            permissions: Default::default(),
            auth: ConnectAuth {
                token: Some("secret".into()),
                device_token: None,
            },
            device: None,
            locale: "en-US".into(),
            user_agent: "ua".into(),
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["minProtocol"], 3);
        assert_eq!(v["userAgent"], "ua");
        assert_eq!(v["auth"], json!({"token": "secret"}));
        assert_eq!(v["permissions"], json!({}));
        assert!(v.get("device").is_none());
    }
}
