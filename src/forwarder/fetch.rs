//! Outbound HTTP execution with bounded retries and a streaming size cap.
//!
//! The retry budget covers transport-level failures only: DNS, refused
//! connections, resets, timeouts. HTTP status codes — 5xx included — pass
//! through verbatim and are never retried; the client on the far side of
//! the gap is entitled to see exactly what the origin said.
//!
//! Response bodies are streamed and cut at the request envelope's
//! `max_response_size`; truncation is reported so the envelope can carry
//! `content_filtered = true`.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::error::FetchError;
use crate::envelope::{HeaderList, RequestPayload};

/// Retry and timeout policy for outbound calls.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Total per-attempt timeout.
    pub request_timeout: Duration,
    /// Maximum redirect hops.
    pub max_redirects: usize,
    /// Transport-failure attempts before giving up.
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_redirects: 10,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Outcome of a successful outbound call.
#[derive(Debug)]
pub struct FetchedResponse {
    /// Origin status code.
    pub status_code: u16,
    /// Canonical reason phrase for the status.
    pub reason: String,
    /// Origin headers in arrival order.
    pub headers: HeaderList,
    /// Body bytes, cut at the size cap.
    pub body: Vec<u8>,
    /// True when the body was cut.
    pub truncated: bool,
    /// Negotiated HTTP version.
    pub http_version: String,
}

/// Headers never replayed upstream: hop-by-hop and framing headers the
/// client addressed to the proxy, plus Host and Content-Length which the
/// HTTP client derives itself.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "transfer-encoding",
    "content-length",
];

/// Build the shared outbound client from a policy.
pub fn build_client(policy: &FetchPolicy) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(policy.connect_timeout)
        .timeout(policy.request_timeout)
        .redirect(reqwest::redirect::Policy::limited(policy.max_redirects))
        .build()
}

/// Execute one envelope's request with retries, streaming the body up to
/// `max_response_size` bytes.
pub async fn fetch(
    client: &reqwest::Client,
    policy: &FetchPolicy,
    request: &RequestPayload,
    max_response_size: u64,
) -> Result<FetchedResponse, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| FetchError::Malformed(format!("invalid method {:?}", request.method)))?;
    let headers = replay_headers(&request.headers)?;

    let mut backoff = policy.initial_backoff;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = attempt_fetch(
            client,
            method.clone(),
            &request.url,
            headers.clone(),
            request.body.clone(),
            max_response_size,
        )
        .await;

        match result {
            Ok(fetched) => return Ok(fetched),
            Err(e) if is_retryable(&e) && attempt < policy.max_attempts => {
                warn!(
                    attempt,
                    url = %request.url,
                    error = %e,
                    "transport failure, backing off {:?}",
                    backoff
                );
                sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(e) if is_retryable(&e) => {
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => return Err(FetchError::Upstream(e)),
        }
    }
}

/// One attempt: send the request and drain the body up to the cap.
async fn attempt_fetch(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    headers: reqwest::header::HeaderMap,
    body: Vec<u8>,
    max_response_size: u64,
) -> Result<FetchedResponse, reqwest::Error> {
    let mut response = client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let http_version = version_string(response.version());
    let response_headers: HeaderList = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let mut collected: Vec<u8> = Vec::new();
    let mut truncated = false;
    while let Some(chunk) = response.chunk().await? {
        let room = max_response_size.saturating_sub(collected.len() as u64);
        if (chunk.len() as u64) > room {
            collected.extend_from_slice(&chunk[..room as usize]);
            truncated = true;
            debug!(url, cap = max_response_size, "response body truncated at cap");
            break;
        }
        collected.extend_from_slice(&chunk);
    }

    Ok(FetchedResponse {
        status_code: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_string(),
        headers: response_headers,
        body: collected,
        truncated,
        http_version,
    })
}

/// Convert envelope headers into a replayable header map.
fn replay_headers(headers: &HeaderList) -> Result<reqwest::header::HeaderMap, FetchError> {
    use reqwest::header::{HeaderName, HeaderValue};

    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if SKIPPED_REQUEST_HEADERS.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::Malformed(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| FetchError::Malformed(format!("invalid value for header {name}")))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Transport-level failures worth another attempt. HTTP statuses never
/// reach this function: a delivered response is final.
fn is_retryable(error: &reqwest::Error) -> bool {
    if error.is_connect() || error.is_timeout() {
        return true;
    }
    // walk the chain for socket-level trouble (reset mid-body, etc.)
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}

/// Render reqwest's HTTP version as the envelope string.
fn version_string(version: reqwest::Version) -> String {
    match version {
        reqwest::Version::HTTP_09 => "HTTP/0.9".into(),
        reqwest::Version::HTTP_10 => "HTTP/1.0".into(),
        reqwest::Version::HTTP_11 => "HTTP/1.1".into(),
        reqwest::Version::HTTP_2 => "HTTP/2.0".into(),
        reqwest::Version::HTTP_3 => "HTTP/3.0".into(),
        other => format!("{other:?}"),
    }
}
