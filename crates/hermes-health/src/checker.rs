//! Health check probe logic.
//!
//! Performs one HTTP request per active check using the check's method,
//! URL, and headers, bounded by the check's timeout.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use hermes_state::HealthCheck;

/// Deadline used when a check carries a non-positive timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = "hermes-health/0.1";

/// Classification of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// A response arrived and its status matched (or no status was expected).
    Passed,
    /// A response arrived with a status other than `expected_status`.
    StatusMismatch,
    /// The request could not be built or the transport failed.
    Failed,
    /// No response within the check's timeout.
    TimedOut,
}

/// Result of a single probe plus what was measured along the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub result: ProbeResult,
    /// Response status, zero when no response arrived.
    pub status_code: u16,
    pub response_time_ms: u64,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        self.result == ProbeResult::Passed
    }

    fn without_response(result: ProbeResult, response_time_ms: u64) -> Self {
        Self {
            result,
            status_code: 0,
            response_time_ms,
        }
    }
}

/// Executes active health checks.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, check: &HealthCheck) -> ProbeOutcome;
}

/// [`Prober`] backed by a pooled hyper client.
#[derive(Clone)]
pub struct HttpProber {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpProber {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, check: &HealthCheck) -> ProbeOutcome {
        let request = match build_request(check) {
            Ok(request) => request,
            Err(e) => {
                debug!(check_id = check.id, endpoint = %check.endpoint, error = %e, "health probe request invalid");
                return ProbeOutcome::without_response(ProbeResult::Failed, 0);
            }
        };

        let deadline = probe_timeout(check.timeout);
        let started = Instant::now();
        let result = tokio::time::timeout(deadline, self.client.request(request)).await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(Ok(resp)) => {
                let status_code = resp.status().as_u16();
                let result = if check.expected_status > 0 && status_code != check.expected_status {
                    debug!(
                        check_id = check.id,
                        expected = check.expected_status,
                        got = status_code,
                        "health probe status mismatch"
                    );
                    ProbeResult::StatusMismatch
                } else {
                    ProbeResult::Passed
                };
                ProbeOutcome {
                    result,
                    status_code,
                    response_time_ms: elapsed,
                }
            }
            Ok(Err(e)) => {
                debug!(check_id = check.id, endpoint = %check.endpoint, error = %e, "health probe request failed");
                ProbeOutcome::without_response(ProbeResult::Failed, elapsed)
            }
            Err(_) => {
                debug!(check_id = check.id, endpoint = %check.endpoint, "health probe timed out");
                ProbeOutcome::without_response(ProbeResult::TimedOut, elapsed)
            }
        }
    }
}

fn build_request(check: &HealthCheck) -> Result<http::Request<Empty<Bytes>>, http::Error> {
    let method = if check.method.is_empty() {
        http::Method::GET
    } else {
        http::Method::from_bytes(check.method.to_ascii_uppercase().as_bytes())?
    };
    let mut builder = http::Request::builder()
        .method(method)
        .uri(check.endpoint.as_str())
        .header(http::header::USER_AGENT, USER_AGENT);
    for (name, value) in &check.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Empty::new())
}

/// Probe deadline for a check timeout given in seconds.
pub fn probe_timeout(timeout_secs: i64) -> Duration {
    u64::try_from(timeout_secs)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT)
}
