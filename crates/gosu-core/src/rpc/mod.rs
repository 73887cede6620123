//! The daemon's RPC endpoint.
//!
//! One axum router serves every configured address:
//!
//! - `POST /rpc`: a single JSON-RPC call per request;
//! - `GET /rpc`: WebSocket upgrade carrying a persistent JSON-RPC stream;
//! - `GET /logs`: a chunked stream of formatted log lines, filtered by an
//!   id pattern, starting with a tail of the matched jobs' log files.
//!
//! Loopback requests without `X-Secret` pass in plaintext. Anything else
//! must present the first 8 bytes of the shared secret in `X-Secret` and a
//! base64 16-byte IV in `X-IV`; payloads then stream through AES-256-OFB.

pub mod codec;

pub use codec::{OfbState, RpcRequest, RpcResponse};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::logging::{self, LogHook, Stream};
use crate::session::{services, Session};
use crate::settings;

/// Handle to the listening endpoint; closing cancels every listener.
pub struct RpcServer {
    shutdown: CancellationToken,
    local_addrs: Vec<SocketAddr>,
}

impl RpcServer {
    /// The bound addresses, useful when listening on an ephemeral port.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Bind every address (of the form `http://host:port`) and serve the RPC
/// router. A bind failure is returned immediately and is fatal to the
/// caller.
pub async fn serve(session: Arc<Session>, addresses: &[String]) -> anyhow::Result<RpcServer> {
    let shutdown = CancellationToken::new();
    let app = Router::new()
        .route("/rpc", get(rpc_upgrade).post(rpc_post))
        .route("/logs", get(logs_stream))
        .with_state(session);

    let mut local_addrs = Vec::new();
    for address in addresses {
        let host = address
            .strip_prefix("http://")
            .ok_or_else(|| anyhow::anyhow!("invalid rpc address: {address}"))?;
        let listener = tokio::net::TcpListener::bind(host)
            .await
            .with_context(|| format!("binding rpc listener on {host}"))?;
        local_addrs.push(listener.local_addr()?);
        tracing::info!(address = %listener.local_addr()?, "rpc listening");

        let app = app.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "rpc server error");
            }
        });
    }

    Ok(RpcServer {
        shutdown,
        local_addrs,
    })
}

enum Authorized {
    Plain,
    Secure([u8; 32], [u8; 16]),
}

/// Gate a request: loopback peers may skip authentication; everyone else
/// proves knowledge of the secret and supplies an IV.
fn authorize(headers: &HeaderMap, peer: SocketAddr) -> Result<Authorized, Response> {
    let forbidden = || {
        Response::builder()
            .status(StatusCode::from_u16(444).unwrap_or(StatusCode::FORBIDDEN))
            .body(Body::empty())
            .unwrap_or_default()
    };

    let secret_header = headers
        .get("x-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if secret_header.is_empty() {
        if peer.ip().is_loopback() {
            return Ok(Authorized::Plain);
        }
        return Err(forbidden());
    }

    let rpc = settings::RPC.get();
    if rpc.secret.is_empty() {
        return Ok(Authorized::Plain);
    }
    if rpc.secret.len() < 8 || !rpc.secret.as_bytes().starts_with(secret_header.as_bytes()) || secret_header.len() != 8 {
        return Err(forbidden());
    }
    let Some(key) = rpc.cipher_key() else {
        return Ok(Authorized::Plain);
    };
    let iv = headers
        .get("x-iv")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v).ok())
        .filter(|iv| iv.len() == 16);
    match iv {
        Some(iv) => {
            let mut fixed = [0u8; 16];
            fixed.copy_from_slice(&iv);
            Ok(Authorized::Secure(key, fixed))
        }
        None => Err(forbidden()),
    }
}

async fn handle_request(session: &Arc<Session>, data: &[u8]) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_slice(data) {
        Ok(request) => request,
        Err(err) => return RpcResponse::error(serde_json::Value::Null, format!("bad request: {err}")),
    };
    match services::dispatch(session, &request.method, request.param()).await {
        Ok(result) => RpcResponse::result(request.id, result),
        Err(error) => RpcResponse::error(request.id, error),
    }
}

async fn rpc_post(
    State(session): State<Arc<Session>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let auth = match authorize(&headers, peer) {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let mut data = body.to_vec();
    if let Authorized::Secure(key, iv) = &auth {
        codec::apply_once(key, iv, &mut data);
    }

    let response = handle_request(&session, &data).await;
    let mut out = match serde_json::to_vec(&response) {
        Ok(out) => out,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let content_type = match &auth {
        Authorized::Secure(key, iv) => {
            codec::apply_once(key, iv, &mut out);
            "application/octet-stream"
        }
        Authorized::Plain => "application/json",
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, content_type)
        .body(Body::from(out))
        .unwrap_or_default()
}

async fn rpc_upgrade(
    State(session): State<Arc<Session>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let auth = match authorize(&headers, peer) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    upgrade.on_upgrade(move |socket| rpc_ws(session, socket, auth))
}

async fn rpc_ws(session: Arc<Session>, mut socket: WebSocket, auth: Authorized) {
    // The keystream persists across frames in each direction.
    let mut ciphers = match &auth {
        Authorized::Secure(key, iv) => Some((OfbState::new(key, iv), OfbState::new(key, iv))),
        Authorized::Plain => None,
    };

    while let Some(Ok(message)) = socket.recv().await {
        let mut data = match message {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) => data.to_vec(),
            Message::Close(_) => break,
            _ => continue,
        };
        if let Some((decrypt, _)) = ciphers.as_mut() {
            decrypt.apply(&mut data);
        }

        let response = handle_request(&session, &data).await;
        let Ok(mut out) = serde_json::to_vec(&response) else {
            continue;
        };
        out.push(b'\n');
        if let Some((_, encrypt)) = ciphers.as_mut() {
            encrypt.apply(&mut out);
        }
        if socket.send(Message::Binary(out.into())).await.is_err() {
            break;
        }
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default)]
    q: String,
    #[serde(default)]
    t: Option<usize>,
}

struct LogStreamHook {
    pattern: regex::Regex,
    sender: tokio::sync::mpsc::Sender<gosu_types::LogMessage>,
}

impl LogHook for LogStreamHook {
    fn write(&self, namespace: &str, line: &str, stream: Stream) {
        if !self.pattern.is_match(namespace) {
            return;
        }
        // Non-blocking: drop lines when the client cannot keep up.
        let _ = self.sender.try_send(gosu_types::LogMessage {
            kind: stream.name().to_string(),
            line: line.to_string(),
        });
    }
}

async fn logs_stream(
    State(session): State<Arc<Session>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Response {
    let auth = match authorize(&headers, peer) {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let pattern = if query.q.is_empty() { ".*" } else { &query.q };
    let pattern = match regex::Regex::new(&format!("(?i){pattern}")) {
        Ok(pattern) => pattern,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid pattern: {err}")).into_response()
        }
    };
    let tail = query.t.unwrap_or(50);

    // Backlog: the tail of every matched job's log files.
    let mut backlog = Vec::new();
    if let Ok(jobs) = session.matched_jobs("") {
        for job in jobs {
            if !pattern.is_match(&job.id) {
                continue;
            }
            for stream in [Stream::Stdout, Stream::Stderr] {
                if let Ok(lines) = job.logger.tail(tail, stream) {
                    for line in lines {
                        backlog.push(gosu_types::LogMessage {
                            kind: stream.name().to_string(),
                            line,
                        });
                    }
                }
            }
        }
    }

    let (sender, receiver) = tokio::sync::mpsc::channel(128);
    let guard = logging::register_hook(Arc::new(LogStreamHook { pattern, sender }));

    let mut cipher = match &auth {
        Authorized::Secure(key, iv) => Some(OfbState::new(key, iv)),
        Authorized::Plain => None,
    };
    let mut encode = move |message: &gosu_types::LogMessage| -> Bytes {
        let mut data = serde_json::to_vec(message).unwrap_or_default();
        data.push(b'\n');
        if let Some(cipher) = cipher.as_mut() {
            cipher.apply(&mut data);
        }
        Bytes::from(data)
    };

    let mut head = Vec::new();
    for message in &backlog {
        head.push(Ok::<Bytes, std::convert::Infallible>(encode(message)));
    }

    let live = futures::stream::unfold(
        (receiver, guard, encode),
        |(mut receiver, guard, mut encode)| async move {
            let message = receiver.recv().await?;
            let chunk = encode(&message);
            Some((Ok(chunk), (receiver, guard, encode)))
        },
    );
    let stream = futures::StreamExt::chain(futures::stream::iter(head), live);

    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .unwrap_or_default()
}
