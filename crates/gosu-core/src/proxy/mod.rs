//! The in-process reverse-proxy load balancer.
//!
//! Clustered subprocesses register an [`Upstream`] once they answer HTTP on
//! their IPC address; the balancer spreads client requests across the
//! registered set by least-connections, random, or client-IP hash, with
//! optional sticky sessions. A failed upstream hop is retried against an
//! alternative selection up to `retry_max` times before answering 502.

mod upstream;

pub use upstream::Upstream;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use gosu_types::timespan;
use http::{HeaderValue, StatusCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbMethod {
    Conn,
    #[default]
    Random,
    Hash,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Host header override for proxied requests.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Listen address for the balancer itself.
    pub listen: String,
    /// Preserve client→upstream affinity while the upstream lives.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub sticky: bool,
    pub method: LbMethod,
    /// Per-request retry budget across upstream errors.
    pub retry_max: u32,
    /// Wait between retries of one request.
    #[serde(rename = "retry_delay", with = "timespan", skip_serializing_if = "timespan::is_zero")]
    pub retry_backoff: Duration,
}

/// Sticky-session slot for one client IP. The slot atomically prefers a
/// live upstream installed by a competing request over a stale candidate.
#[derive(Default)]
struct ClientSession {
    upstream: Mutex<Option<Arc<Upstream>>>,
}

pub struct LoadBalancer {
    options: ProxyOptions,
    upstreams: RwLock<Vec<Arc<Upstream>>>,
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    shutdown: CancellationToken,
    bound: std::sync::OnceLock<SocketAddr>,
}

impl LoadBalancer {
    pub fn new(options: ProxyOptions) -> Arc<LoadBalancer> {
        Arc::new(LoadBalancer {
            options,
            upstreams: RwLock::new(Vec::new()),
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            bound: std::sync::OnceLock::new(),
        })
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn add_upstream(&self, upstream: Arc<Upstream>) {
        self.upstreams.write().unwrap().push(upstream);
    }

    /// Drop an upstream and purge it from any sticky reference.
    pub fn remove_upstream(&self, upstream: &Arc<Upstream>) {
        self.upstreams
            .write()
            .unwrap()
            .retain(|u| !Arc::ptr_eq(u, upstream));
        let sessions = self.sessions.read().unwrap();
        for session in sessions.values() {
            let mut slot = session.upstream.lock().unwrap();
            if slot
                .as_ref()
                .map(|u| Arc::ptr_eq(u, upstream))
                .unwrap_or(false)
            {
                *slot = None;
            }
        }
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.read().unwrap().len()
    }

    fn session_for(&self, ip: &str) -> Arc<ClientSession> {
        if let Some(session) = self.sessions.read().unwrap().get(ip) {
            return session.clone();
        }
        self.sessions
            .write()
            .unwrap()
            .entry(ip.to_string())
            .or_default()
            .clone()
    }

    /// Select the upstream for `ip`, excluding `retry` (the upstream that
    /// just failed for this request) where possible.
    pub fn next(&self, ip: &str, retry: Option<&Arc<Upstream>>) -> Option<Arc<Upstream>> {
        let session = if self.options.sticky {
            Some(self.session_for(ip))
        } else {
            None
        };

        // Sticky fast path: reuse the bound upstream unless it is the one
        // being retried, in which case unbind it and fall through.
        if let Some(session) = &session {
            let mut slot = session.upstream.lock().unwrap();
            if let Some(bound) = slot.clone() {
                if retry.map(|r| Arc::ptr_eq(&bound, r)).unwrap_or(false) {
                    *slot = None;
                } else {
                    return Some(bound);
                }
            }
        }

        let picked = {
            let upstreams = self.upstreams.read().unwrap();
            match upstreams.len() {
                0 => None,
                1 => Some(upstreams[0].clone()),
                n => match self.options.method {
                    LbMethod::Conn => {
                        let best = upstreams
                            .iter()
                            .filter(|u| !retry.map(|r| Arc::ptr_eq(u, r)).unwrap_or(false))
                            .min_by_key(|u| u.connections());
                        best.cloned()
                    }
                    method => {
                        let start = match method {
                            LbMethod::Hash => crc32c::crc32c(ip.as_bytes()) as usize % n,
                            _ => rand::thread_rng().gen_range(0..n),
                        };
                        let mut pick = upstreams[start].clone();
                        if retry.map(|r| Arc::ptr_eq(&pick, r)).unwrap_or(false) {
                            for i in 1..n {
                                let candidate = upstreams[(start + i) % n].clone();
                                if !retry.map(|r| Arc::ptr_eq(&candidate, r)).unwrap_or(false) {
                                    pick = candidate;
                                    break;
                                }
                            }
                        }
                        Some(pick)
                    }
                },
            }
        };

        // Sticky install: a competing request may have bound a different
        // live upstream in the meantime; prefer that over our candidate.
        if let (Some(session), Some(picked)) = (&session, &picked) {
            let mut slot = session.upstream.lock().unwrap();
            match slot.clone() {
                Some(bound) if !retry.map(|r| Arc::ptr_eq(&bound, r)).unwrap_or(false) => {
                    return Some(bound);
                }
                _ => {
                    *slot = Some(picked.clone());
                    tracing::debug!(ip, upstream = picked.name(), "sticky session bound");
                }
            }
        }
        picked
    }

    /// Serve one client request, retrying alternate upstreams on error.
    pub async fn serve(&self, request: Request, peer: Option<SocketAddr>) -> Response {
        let ip = client_ip(request.headers(), peer);
        let (mut parts, body) = request.into_parts();

        // Buffer the body so a retry can replay it.
        let body = match axum::body::to_bytes(body, 16 * 1024 * 1024).await {
            Ok(body) => body,
            Err(_) => return bad_gateway(),
        };

        if let Ok(value) = HeaderValue::from_str(&ip) {
            parts.headers.insert("cf-connecting-ip", value.clone());
            parts.headers.insert("x-forwarded-for", value);
        }
        if !self.options.host.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.options.host) {
                parts.headers.insert(http::header::HOST, value);
            }
        }

        let mut previous: Option<Arc<Upstream>> = None;
        let mut retries: u32 = 0;
        loop {
            let Some(upstream) = self.next(&ip, previous.as_ref()) else {
                return bad_gateway();
            };
            match upstream.forward(&parts, Bytes::clone(&body)).await {
                Ok(response) => return response,
                Err(err) => {
                    tracing::debug!(upstream = upstream.name(), error = %err, "upstream error");
                    previous = Some(upstream);
                    retries += 1;
                    if retries >= self.options.retry_max {
                        tracing::debug!(ip, "retry count exceeded");
                        return bad_gateway();
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return bad_gateway(),
                        _ = tokio::time::sleep(self.options.retry_backoff) => {}
                    }
                }
            }
        }
    }

    /// The bound listen address, once [`listen`](Self::listen) is up.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    /// Bind the listen address and serve until closed.
    pub async fn listen(self: Arc<Self>) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.options.listen).await?;
        let _ = self.bound.set(listener.local_addr()?);
        let shutdown = self.shutdown.clone();
        let app = Router::new()
            .fallback(proxy_handler)
            .with_state(self.clone());
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn proxy_handler(
    State(lb): State<Arc<LoadBalancer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    lb.serve(request, Some(peer)).await
}

fn bad_gateway() -> Response {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::empty())
        .unwrap_or_default()
}

/// Resolve the client IP: trust forwarding headers first, then fall back
/// to the peer address without its port.
fn client_ip(headers: &http::HeaderMap, peer: Option<SocketAddr>) -> String {
    for header in ["cf-connecting-ip", "x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}
