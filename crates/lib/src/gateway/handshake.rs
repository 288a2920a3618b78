//! Building the `connect` request answered to the gateway's challenge.

use crate::config::GatewayConfig;
use crate::device::DeviceAuth;
use crate::protocol::{ConnectAuth, ConnectParams};
use anyhow::Result;
use serde_json::Value;

/// Nonce from a `connect.challenge` payload (`{ nonce, ts }`), if any.
pub fn challenge_nonce(payload: &Value) -> Option<&str> {
    payload.get("nonce").and_then(Value::as_str)
}

/// Device token issued in the handshake response (`payload.auth.deviceToken`).
pub fn issued_device_token(hello: &Value) -> Option<&str> {
    hello
        .get("auth")
        .and_then(|a| a.get("deviceToken"))
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Params for the single `connect` request of one handshake.
pub fn connect_params(
    config: &GatewayConfig,
    token: &str,
    device: Option<&DeviceAuth>,
    nonce: Option<&str>,
) -> Result<ConnectParams> {
    let mut params = ConnectParams {
        min_protocol: config.min_protocol,
        max_protocol: config.max_protocol,
        client: config.client.clone(),
        role: config.role.clone(),
        scopes: config.scopes.clone(),
        caps: Vec::new(),
        commands: Vec::new(),
        permissions: Default::default(),
        auth: ConnectAuth {
            token: Some(token.to_string()),
            device_token: None,
        },
        device: None,
        locale: config.locale.clone(),
        user_agent: config.user_agent(),
    };
    if let Some(device) = device {
        params.auth.device_token = device.token_store.load();
        let nonce = nonce.unwrap_or("");
        params.device = Some(device.identity.sign_connect(&params, nonce, now_ms())?);
    }
    Ok(params)
}
