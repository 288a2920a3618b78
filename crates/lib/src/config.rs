//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tether/config.json`) and environment.
//! Secrets (the client credential and the gateway token) can come from either;
//! the environment wins.

use crate::client::DeltaMode;
use crate::protocol::ConnectClient;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Relay server settings (where clients connect).
    #[serde(default)]
    pub relay: RelayConfig,

    /// Outbound link to the gateway.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Client-side settings used by `tether call`, `watch` and `chat`.
    #[serde(default)]
    pub client: ClientConfig,
}

/// Relay bind, port, and client auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Port for HTTP and WebSocket (default 3100).
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    #[serde(default)]
    pub auth: RelayAuthConfig,
}

/// Credential every client must present as `?token=` on `/ws` (and as a bearer token on `/api`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAuthConfig {
    /// Overridden by TETHER_UI_TOKEN env.
    pub token: Option<String>,
}

/// Gateway endpoint, handshake identity and link timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway. Overridden by TETHER_GATEWAY_URL env.
    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// Shared secret sent in the handshake. Overridden by TETHER_GATEWAY_TOKEN env.
    pub token: Option<String>,

    /// Origin header sent on the upgrade request; gateways that check origins expect their own.
    #[serde(default = "default_gateway_origin")]
    pub origin: Option<String>,

    #[serde(default = "default_min_protocol")]
    pub min_protocol: u32,

    #[serde(default = "default_max_protocol")]
    pub max_protocol: u32,

    #[serde(default = "default_client_identity")]
    pub client: ConnectClient,

    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    #[serde(default = "default_locale")]
    pub locale: String,

    /// Defaults to `tether-relay/<version>`.
    pub user_agent: Option<String>,

    /// Fixed delay before reconnecting after the gateway socket closes.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long to wait for the challenge and the `connect` response after the socket opens.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default)]
    pub device: DeviceConfig,
}

/// Optional Ed25519 device identity signed into the handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Identity file (default ~/.tether/device.json). The issued device token is stored next to it.
    pub path: Option<PathBuf>,
}

/// Client connection store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Base WebSocket URL of the relay; `/ws?token=` is appended.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Upper bound on opening the relay socket before the attempt counts as failed.
    #[serde(default = "default_handshake_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Where `tether login` stores the client credential (default ~/.tether/ui_token).
    pub token_path: Option<PathBuf>,

    /// How streaming chat deltas are folded: "cumulative" (each delta is the full text so far) or "incremental".
    #[serde(default)]
    pub delta_mode: DeltaMode,
}

fn default_relay_port() -> u16 {
    3100
}

fn default_relay_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:18789".to_string()
}

fn default_gateway_origin() -> Option<String> {
    Some("http://127.0.0.1:18789".to_string())
}

fn default_min_protocol() -> u32 {
    3
}

fn default_max_protocol() -> u32 {
    3
}

fn default_client_identity() -> ConnectClient {
    ConnectClient {
        id: "openclaw-control-ui".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
        mode: "webchat".to_string(),
    }
}

fn default_role() -> String {
    "operator".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![
        "operator.admin".to_string(),
        "operator.approvals".to_string(),
        "operator.pairing".to_string(),
    ]
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:3100".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            bind: default_relay_bind(),
            auth: RelayAuthConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: None,
            origin: default_gateway_origin(),
            min_protocol: default_min_protocol(),
            max_protocol: default_max_protocol(),
            client: default_client_identity(),
            role: default_role(),
            scopes: default_scopes(),
            locale: default_locale(),
            user_agent: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            device: DeviceConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_handshake_timeout_ms(),
            token_path: None,
            delta_mode: DeltaMode::default(),
        }
    }
}

impl GatewayConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("tether-relay/{}", env!("CARGO_PKG_VERSION")))
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Non-empty trimmed value of env `var`, else the non-empty trimmed fallback.
fn env_or(var: &str, fallback: Option<&str>) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            fallback
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the client credential: env TETHER_UI_TOKEN overrides config.
pub fn resolve_ui_token(config: &Config) -> Option<String> {
    env_or("TETHER_UI_TOKEN", config.relay.auth.token.as_deref())
}

/// Resolve the gateway token: env TETHER_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_or("TETHER_GATEWAY_TOKEN", config.gateway.token.as_deref())
}

/// Resolve the gateway URL: env TETHER_GATEWAY_URL overrides config.
pub fn resolve_gateway_url(config: &Config) -> String {
    env_or("TETHER_GATEWAY_URL", Some(&config.gateway.url)).unwrap_or_else(default_gateway_url)
}

/// Gateway settings with env overrides applied; what the relay hands to the link.
pub fn resolved_gateway(config: &Config) -> GatewayConfig {
    let mut gateway = config.gateway.clone();
    gateway.url = resolve_gateway_url(config);
    gateway.token = resolve_gateway_token(config);
    gateway
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

fn tether_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".tether"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TETHER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| tether_dir().join("config.json"))
}

/// Where the client credential is stored.
pub fn resolve_token_path(config: &Config) -> PathBuf {
    config
        .client
        .token_path
        .clone()
        .unwrap_or_else(|| tether_dir().join("ui_token"))
}

/// Where the relay's device identity is stored.
pub fn resolve_device_path(config: &GatewayConfig) -> PathBuf {
    config
        .device
        .path
        .clone()
        .unwrap_or_else(|| tether_dir().join("device.json"))
}

/// Load config from the default path (or TETHER_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
