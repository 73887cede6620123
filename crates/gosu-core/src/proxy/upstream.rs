//! One backend endpoint known to the load balancer.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::request::Parts;
use http::Request;
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use thiserror::Error;

use crate::ipc;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("dial failed: {0}")]
    Dial(#[from] std::io::Error),
    #[error("request failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("bad request: {0}")]
    Request(#[from] http::Error),
}

/// A dialable backend with a live connection count.
///
/// The count is bumped exactly once per served request: incremented before
/// the hop and decremented when the response headers arrive (or the hop
/// fails), which is what the least-connections method balances on.
pub struct Upstream {
    name: String,
    address: String,
    connections: AtomicI32,
}

impl Upstream {
    /// An upstream dialed over an IPC address.
    pub fn over_ipc(name: String, address: String) -> Arc<Upstream> {
        Arc::new(Upstream {
            name,
            address,
            connections: AtomicI32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connections(&self) -> i32 {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn track_connections(&self, n: i32) {
        self.connections.fetch_add(n, Ordering::SeqCst);
    }

    /// Forward one buffered request over a fresh connection.
    pub async fn forward(&self, parts: &Parts, body: Bytes) -> Result<Response, UpstreamError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let result = self.forward_inner(parts, body).await;
        self.connections.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn forward_inner(&self, parts: &Parts, body: Bytes) -> Result<Response, UpstreamError> {
        let stream = ipc::dial(&self.address).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut builder = Request::builder().method(parts.method.clone()).uri(path);
        for (key, value) in &parts.headers {
            builder = builder.header(key, value);
        }
        if !parts.headers.contains_key(http::header::HOST) {
            builder = builder.header(http::header::HOST, "localhost");
        }
        let request = builder.body(Full::new(body))?;

        let response = sender.send_request(request).await?;
        Ok(response.map(Body::new))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn fake_http_server(listener: ipc::IpcListener, reply: &'static str) {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = conn.read(&mut buf).await;
                let body = reply.as_bytes();
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n",
                    body.len()
                );
                let _ = conn.write_all(head.as_bytes()).await;
                let _ = conn.write_all(body).await;
            });
        }
    }

    #[tokio::test]
    async fn forwards_and_counts() {
        let addr = ipc::new_address("");
        let listener = ipc::bind(&addr).unwrap();
        tokio::spawn(fake_http_server(listener, "pong"));

        let upstream = Upstream::over_ipc("test".into(), addr.clone());
        assert_eq!(upstream.connections(), 0);

        let (parts, _) = Request::builder()
            .method("GET")
            .uri("/ping")
            .body(())
            .unwrap()
            .into_parts();
        let response = upstream.forward(&parts, Bytes::new()).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"pong");
        assert_eq!(upstream.connections(), 0);
        std::fs::remove_file(&addr).ok();
    }

    #[tokio::test]
    async fn dial_failure_is_an_error() {
        let upstream = Upstream::over_ipc("gone".into(), ipc::new_address(""));
        let (parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        assert!(upstream.forward(&parts, Bytes::new()).await.is_err());
    }
}
