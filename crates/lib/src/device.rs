//! Device identity for the gateway handshake: keypair load/generate, canonical payload, and signing.
//!
//! Payload format must match the gateway's verifier (deviceId, client id/mode,
//! role, scopes, signedAt, token, nonce, newline-separated).

use crate::credentials::FileTokenStore;
use crate::protocol::{ConnectDevice, ConnectParams};
use anyhow::Result;
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persisted device identity (deviceId, public key, private key). Stored at e.g. ~/.tether/device.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub public_key: String,
    pub private_key: String,
}

/// Canonical string the gateway verifies the signature against.
pub fn canonical_payload(
    device_id: &str,
    params: &ConnectParams,
    signed_at: u64,
    nonce: &str,
) -> String {
    let token = params.auth.token.as_deref().unwrap_or("");
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
        device_id,
        params.client.id,
        params.client.mode,
        params.role,
        params.scopes.join(","),
        signed_at,
        token,
        nonce
    )
}

impl DeviceIdentity {
    /// Generate a new keypair. device_id is the first 16 chars of base64(public_key).
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {}", e))?;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&bytes);
        let b64 = base64::engine::general_purpose::STANDARD;
        let public_key = b64.encode(signing_key.verifying_key().as_bytes());
        let private_key = b64.encode(signing_key.as_bytes());
        let device_id = public_key.chars().take(16).collect::<String>();
        Ok(Self {
            device_id,
            public_key,
            private_key,
        })
    }

    /// Load from JSON file. Returns None if file missing or invalid.
    pub fn load(path: &Path) -> Option<Self> {
        let s = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&s).ok()
    }

    /// Save to JSON file. Creates parent dirs if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load the identity at `path`, generating and saving a fresh one if absent.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if let Some(identity) = Self::load(path) {
            return Ok(identity);
        }
        let identity = Self::generate()?;
        identity.save(path)?;
        log::info!("generated device identity {} at {}", identity.device_id, path.display());
        Ok(identity)
    }

    fn signing_key(&self) -> Result<ed25519_dalek::SigningKey> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(self.private_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("decode private key: {}", e))?;
        let key_arr: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid private key length"))?;
        Ok(ed25519_dalek::SigningKey::from_bytes(&key_arr))
    }

    /// Sign `params` for the challenge `nonce` and return the `device` block of the handshake.
    pub fn sign_connect(
        &self,
        params: &ConnectParams,
        nonce: &str,
        signed_at: u64,
    ) -> Result<ConnectDevice> {
        let payload = canonical_payload(&self.device_id, params, signed_at, nonce);
        let sig = self.signing_key()?.sign(payload.as_bytes());
        Ok(ConnectDevice {
            id: self.device_id.clone(),
            public_key: self.public_key.clone(),
            signature: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
            signed_at,
            nonce: nonce.to_string(),
        })
    }
}

/// Device identity plus the token the gateway issued to it, as used by the gateway link.
#[derive(Debug, Clone)]
pub struct DeviceAuth {
    pub identity: DeviceIdentity,
    pub token_store: FileTokenStore,
}

impl DeviceAuth {
    /// Load (or create) the identity at `path`; the device token lives next to it.
    pub fn open(path: &Path) -> Result<Self> {
        let identity = DeviceIdentity::load_or_generate(path)?;
        let token_path = path
            .parent()
            .map(|p| p.join("device_token"))
            .unwrap_or_else(|| PathBuf::from("device_token"));
        Ok(Self {
            identity,
            token_store: FileTokenStore::new(token_path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectAuth, ConnectClient};
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    fn params() -> ConnectParams {
        ConnectParams {
            min_protocol: 3,
            max_protocol: 3,
            client: ConnectClient {
                id: "cli".into(),
                version: "1".into(),
                platform: "linux".into(),
                mode: "webchat".into(),
            },
            role: "operator".into(),
            scopes: vec!["operator.admin".into(), "operator.pairing".into()],
            caps: vec![],
            commands: vec![],
            permissions: Default::default(),
            auth: ConnectAuth {
                token: Some("gw".into()),
                device_token: None,
            },
            device: None,
            locale: "en-US".into(),
            user_agent: "ua".into(),
        }
    }

    #[test]
    fn payload_field_order() {
        let p = canonical_payload("dev", &params(), 42, "n1");
        assert_eq!(p, "dev\ncli\nwebchat\noperator\noperator.admin,operator.pairing\n42\ngw\nn1");
    }

    #[test]
    fn signature_verifies_against_public_key() {
        let identity = DeviceIdentity::generate().unwrap();
        assert_eq!(identity.device_id.len(), 16);
        let device = identity.sign_connect(&params(), "nonce-1", 1_700_000_000_000).unwrap();

        let b64 = base64::engine::general_purpose::STANDARD;
        let pk: [u8; 32] = b64.decode(&device.public_key).unwrap().try_into().unwrap();
        let sig: [u8; 64] = b64.decode(&device.signature).unwrap().try_into().unwrap();
        let key = VerifyingKey::from_bytes(&pk).unwrap();
        let payload = canonical_payload(&device.id, &params(), device.signed_at, &device.nonce);
        assert!(key.verify(payload.as_bytes(), &Signature::from_bytes(&sig)).is_ok());
    }

    #[test]
    fn load_or_generate_is_stable() {
        let dir = std::env::temp_dir().join(format!("tether-device-{}", uuid::Uuid::new_v4()));
        let path = dir.join("device.json");
        let a = DeviceAuth::open(&path).unwrap();
        let b = DeviceAuth::open(&path).unwrap();
        assert_eq!(a.identity.device_id, b.identity.device_id);
        assert_eq!(a.token_store.path(), dir.join("device_token").as_path());
        let _ = std::fs::remove_dir_all(dir);
    }
}
