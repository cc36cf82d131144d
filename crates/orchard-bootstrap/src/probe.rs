//! Readiness probe primitives.
//!
//! TCP connect checks for "port bound", HTTP checks for "health endpoint
//! passes", and a tracker that spaces repeated probes with exponential
//! backoff.

use std::time::Duration;

use tracing::debug;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint accepted the connection (and answered 2xx, for HTTP).
    Ready,
    /// The endpoint answered, but not with success.
    NotReady,
    /// The probe could not be executed (connection refused, timeout).
    Failed,
}

/// Spaces repeated readiness probes for a single resource.
#[derive(Debug)]
pub struct ReadinessTracker {
    attempts: u32,
    /// Consecutive unsuccessful probes.
    consecutive_failures: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl ReadinessTracker {
    pub fn new(base_interval: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: 0,
            consecutive_failures: 0,
            current_backoff: base_interval,
            base_interval,
            max_backoff: max_backoff.max(base_interval),
        }
    }

    /// Record a probe result; returns true once the resource is ready.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        self.attempts += 1;
        match result {
            ProbeResult::Ready => {
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                true
            }
            ProbeResult::NotReady | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                // Exponential backoff: double the interval up to max.
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
                false
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Check whether something accepts TCP connections at `address` (host:port).
pub async fn tcp_probe(address: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
        Ok(Ok(_)) => ProbeResult::Ready,
        Ok(Err(e)) => {
            debug!(error = %e, %address, "tcp probe connection failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%address, "tcp probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Perform an HTTP GET against `address` + `path`.
///
/// Returns `Ready` if the response is 2xx, `NotReady` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "http probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "http probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "orchard-host/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "http probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Ready,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "http probe non-2xx");
                ProbeResult::NotReady
            }
            Err(e) => {
                debug!(error = %e, %uri, "http probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "http probe timed out");
        ProbeResult::Failed
    })
}
