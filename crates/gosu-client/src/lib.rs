//! Client for the gosu daemon's JSON-RPC endpoint.
//!
//! Calls go over HTTP POST. A transport failure is retried once after a
//! short pause; a connection failure can optionally auto-spawn the daemon
//! binary and wait for it to answer pings.

use std::time::Duration;

use base64::Engine;
use gosu_core::rpc::codec::{apply_once, RpcRequest, RpcResponse};
use gosu_core::{lock, settings};
use rand::RngCore;
use reqwest::header as http_header;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the daemon.
    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    /// The daemon answered with an RPC-level error.
    #[error("{0}")]
    Remote(String),

    /// The reply payload did not decode.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The daemon did not come up after being spawned.
    #[error("daemon did not answer after spawn")]
    SpawnTimeout,

    #[error("{0}")]
    Other(String),
}

/// Connection settings resolved once per client.
struct Transport {
    url: String,
    /// `(X-Secret header value, cipher key)` for non-loopback endpoints.
    secure: Option<(String, [u8; 32])>,
}

pub struct Client {
    http: reqwest::Client,
    transport: Transport,
}

impl Client {
    /// A client for the given base address (e.g. `http://localhost:24511`).
    pub fn new(address: &str) -> Client {
        let local = ["localhost", "127.0.0.1", "[::1]"]
            .iter()
            .any(|host| address.contains(host));
        let secure = if local {
            None
        } else {
            let rpc = settings::RPC.get();
            match (rpc.secret.clone(), rpc.cipher_key()) {
                (secret, Some(key)) if secret.len() >= 8 => Some((secret[..8].to_string(), key)),
                _ => None,
            }
        };
        Client {
            http: reqwest::Client::new(),
            transport: Transport {
                url: format!("{}/rpc", address.trim_end_matches('/')),
                secure,
            },
        }
    }

    /// A client for the locally configured daemon address.
    pub fn local() -> Client {
        Client::new(&settings::RPC.get().local_address)
    }

    /// Call `method` with one argument; transport failures get one
    /// transparent retry.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        arg: impl Serialize,
    ) -> ClientResult<T> {
        let arg = serde_json::to_value(arg)?;
        match self.attempt(method, arg.clone()).await {
            Err(ClientError::Connection(_)) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.attempt(method, arg).await
            }
            other => other,
        }
    }

    async fn attempt<T: DeserializeOwned>(&self, method: &str, arg: Value) -> ClientResult<T> {
        let mut body = serde_json::to_vec(&RpcRequest::new(method, arg))?;

        let mut request = self
            .http
            .post(&self.transport.url)
            .header(http_header::CONTENT_TYPE, "application/json");
        let mut iv = [0u8; 16];
        if let Some((secret, key)) = &self.transport.secure {
            rand::thread_rng().fill_bytes(&mut iv);
            apply_once(key, &iv, &mut body);
            request = request
                .header("X-Secret", secret)
                .header(
                    "X-IV",
                    base64::engine::general_purpose::STANDARD.encode(iv),
                )
                .header(http_header::CONTENT_TYPE, "application/octet-stream");
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Other(format!(
                "HTTP error {}",
                response.status()
            )));
        }
        let mut data = response.bytes().await?.to_vec();
        if let Some((_, key)) = &self.transport.secure {
            apply_once(key, &iv, &mut data);
        }

        let reply: RpcResponse = serde_json::from_slice(&data)?;
        if let Some(error) = reply.error {
            return Err(ClientError::Remote(error));
        }
        Ok(serde_json::from_value(reply.result)?)
    }

    pub async fn ping(&self) -> ClientResult<i64> {
        self.call("daemon.Ping", 7).await
    }

    /// Make sure a daemon is reachable: when the instance lock is free,
    /// spawn `<current exe> daemon` detached and ping until it answers.
    pub async fn ensure_daemon(&self) -> ClientResult<()> {
        if self.ping().await.is_ok() {
            return Ok(());
        }
        if !lock::running() {
            let exe = std::env::current_exe()
                .map_err(|e| ClientError::Other(format!("cannot locate own binary: {e}")))?;
            let child = std::process::Command::new(exe)
                .arg("daemon")
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
                .map_err(|e| ClientError::Other(format!("failed to spawn daemon: {e}")))?;
            tracing::info!(pid = child.id(), "spawned daemon");
        }
        for _ in 0..50 {
            if self.ping().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(ClientError::SpawnTimeout)
    }
}
