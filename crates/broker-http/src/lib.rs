//! Worker HTTP client.
//!
//! Issues a synchronous POST per delivery attempt, `application/json`, no
//! authentication, no HTTP-layer retries — retry policy belongs entirely to
//! the Dispatcher. Built directly on `reqwest`, with no adapter trait
//! hierarchy in front of it.

use std::time::Duration;

use async_trait::async_trait;
use broker_core::WorkerClient;
use serde_json::Value;
use tracing::warn;

/// Synthetic status used whenever the HTTP layer itself fails — connect
/// refused, DNS failure, TLS error, or timeout — rather than the worker
/// returning a response. The Dispatcher never sees these as a distinct
/// error channel; they fold into the same retry/dead-letter decision as
/// any other non-2xx response.
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

/// A [`WorkerClient`] backed by a shared `reqwest::Client`.
pub struct ReqwestWorkerClient {
    client: reqwest::Client,
}

impl ReqwestWorkerClient {
    /// Build a client with the given per-request timeout. Callers should
    /// keep this below the Dispatcher's lease timeout (`broker_core::DEFAULT_HTTP_TIMEOUT_SECS`
    /// is kept below `DEFAULT_LEASE_TIMEOUT_SECS` for exactly this reason).
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_default_timeout() -> anyhow::Result<Self> {
        Self::new(Duration::from_secs(broker_core::DEFAULT_HTTP_TIMEOUT_SECS))
    }
}

#[async_trait]
impl WorkerClient for ReqwestWorkerClient {
    async fn deliver(&self, endpoint: &str, body: &Value) -> u16 {
        match self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
        {
            Ok(response) => response.status().as_u16(),
            Err(err) => {
                warn!(endpoint, error = %err, "worker delivery transport error");
                TRANSPORT_FAILURE_STATUS
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Spawn a one-shot HTTP/1.1 server on localhost that replies with
    /// `status` to the first request it receives, then shuts down.
    fn spawn_one_shot_server(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let body = "{}";
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
                    reason = reason_phrase(status),
                    len = body.len(),
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        format!("http://{addr}/hook")
    }

    fn reason_phrase(status: u16) -> &'static str {
        match status {
            200 => "OK",
            500 => "Internal Server Error",
            _ => "Status",
        }
    }

    #[tokio::test]
    async fn successful_post_returns_2xx_status() {
        let endpoint = spawn_one_shot_server(200);
        let client = ReqwestWorkerClient::new(Duration::from_secs(5)).unwrap();
        let status = client.deliver(&endpoint, &serde_json::json!({"n": 1})).await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn server_error_status_is_passed_through() {
        let endpoint = spawn_one_shot_server(500);
        let client = ReqwestWorkerClient::new(Duration::from_secs(5)).unwrap();
        let status = client.deliver(&endpoint, &serde_json::json!({})).await;
        assert_eq!(status, 500);
    }

    #[tokio::test]
    async fn connect_failure_is_normalized_to_synthetic_500() {
        // Nothing listens on this port (bind-then-drop to get a free, dead
        // port without a well-known "connection refused" flake).
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ReqwestWorkerClient::new(Duration::from_secs(2)).unwrap();
        let status = client
            .deliver(&format!("http://{addr}/hook"), &serde_json::json!({}))
            .await;
        assert_eq!(status, TRANSPORT_FAILURE_STATUS);
    }
}
