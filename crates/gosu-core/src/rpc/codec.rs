//! JSON-RPC framing and the optional stream cipher.
//!
//! Requests and responses use the classic JSON-RPC 1.0 shape. When a secret
//! is configured, non-loopback payloads stream through AES-256-OFB keyed by
//! `SHA256(seed || secret)` with a per-connection 16-byte IV; the same IV
//! seeds both directions.

use aes::Aes256;
use ofb::cipher::{KeyIvInit, StreamCipher};
use ofb::Ofb;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: &str, arg: Value) -> RpcRequest {
        RpcRequest {
            method: method.to_string(),
            params: Value::Array(vec![arg]),
            id: Value::from(1),
        }
    }

    /// The first element of the params array, which is how arguments are
    /// framed.
    pub fn param(&self) -> Value {
        match &self.params {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> RpcResponse {
        RpcResponse {
            id,
            result,
            error: None,
        }
    }

    pub fn error(id: Value, error: String) -> RpcResponse {
        RpcResponse {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

/// One direction of an OFB keystream. Apply is symmetric; keeping the
/// state across messages lets WebSocket frames continue the stream.
pub struct OfbState(Ofb<Aes256>);

impl OfbState {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> OfbState {
        OfbState(Ofb::new(key.into(), iv.into()))
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

/// Encrypt or decrypt one standalone payload (HTTP POST framing restarts
/// the stream at the IV for each body).
pub fn apply_once(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    OfbState::new(key, iv).apply(data);
}
