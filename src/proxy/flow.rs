//! Per-flow store-and-forward handling.
//!
//! One client HTTP exchange maps to one correlation id and walks the flow
//! machine: parse → encode → publish → await → reply. Every terminal error
//! surfaces as exactly one HTTP response to the client:
//!
//! - parse failure → 400
//! - publish/decode/integrity failure → 502
//! - response deadline passed → 504 (the request file is left for the
//!   sweeper)
//!
//! The wait is cooperative: when the client disconnects, hyper drops the
//! service future and the flow is abandoned mid-await; the published request
//! becomes an orphan the forwarder-side sweeper eventually answers and
//! archives.

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode, Version};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{
    decode_response, encode_request, RequestEnvelope, RequestMeta, RequestPayload,
    RequestSecurity, ResponseEnvelope, SecurityStatus,
};
use crate::filter::host_of;
use crate::store::{Kind, RendezvousStore, StoreError};

/// Version string stamped into request envelopes.
pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `source_process` stamped when the proxy runs without a launcher.
pub const DEFAULT_SOURCE_PROCESS: &str = "target_script";

/// Response body type used throughout the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe the proxy hop or HTTP/1.1 message framing; they
/// are not replayed to the client (hyper re-frames the reconstructed body).
const SKIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-connection",
    "transfer-encoding",
    "content-length",
];

/// Terminal failure states of a flow, each owning its client status.
#[derive(Debug)]
pub enum FlowFailure {
    /// The client request could not be parsed into an envelope.
    BadRequest(String),
    /// The rendezvous or the returned envelope failed.
    BadGateway(String),
    /// No response arrived before the configured deadline.
    GatewayTimeout,
}

impl FlowFailure {
    /// HTTP status surfaced to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            FlowFailure::BadRequest(_) => StatusCode::BAD_REQUEST,
            FlowFailure::BadGateway(_) => StatusCode::BAD_GATEWAY,
            FlowFailure::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn message(&self) -> String {
        match self {
            FlowFailure::BadRequest(m) => format!("Bad Request: {m}"),
            FlowFailure::BadGateway(m) => format!("Bad Gateway: {m}"),
            FlowFailure::GatewayTimeout => "Gateway Timeout: no response from relay".into(),
        }
    }

    fn into_response(self) -> Response<ProxyBody> {
        text_response(self.status(), &self.message())
    }
}

/// Shared per-process flow state: the store plus flow policy knobs.
pub struct FlowHandler {
    store: Arc<RendezvousStore>,
    /// How long a flow waits from publish to response commit.
    pub response_timeout: Duration,
    /// Response-size ceiling advertised in every request envelope.
    pub max_response_size: u64,
    /// Name recorded as the envelope's originating process.
    pub source_process: String,
}

impl FlowHandler {
    /// Create a handler over a rendezvous store.
    pub fn new(
        store: Arc<RendezvousStore>,
        response_timeout: Duration,
        max_response_size: u64,
        source_process: String,
    ) -> Self {
        Self {
            store,
            response_timeout,
            max_response_size,
            source_process,
        }
    }

    /// Drive one client exchange through the rendezvous.
    ///
    /// `tunnel_authority` is `Some(host[:port])` for requests arriving
    /// inside an intercepted CONNECT tunnel; their origin-form URIs are
    /// rebuilt into absolute `https://` URLs.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        tunnel_authority: Option<&str>,
    ) -> Response<ProxyBody> {
        match self.run_flow(req, tunnel_authority).await {
            Ok(response) => response,
            Err(failure) => {
                info!(status = %failure.status(), "flow failed: {}", failure.message());
                failure.into_response()
            }
        }
    }

    async fn run_flow(
        &self,
        req: Request<Incoming>,
        tunnel_authority: Option<&str>,
    ) -> Result<Response<ProxyBody>, FlowFailure> {
        // parse: absolute target URL plus the request line pieces
        let url = absolute_url(&req, tunnel_authority)?;
        let method = req.method().as_str().to_string();
        let http_version = version_string(req.version());
        let headers: Vec<(String, String)> = req
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| FlowFailure::BadRequest(format!("failed to read request body: {e}")))?
            .to_bytes();

        // encode + publish
        let id = Uuid::new_v4().to_string();
        let envelope = RequestEnvelope {
            metadata: RequestMeta {
                request_id: id.clone(),
                timestamp: Utc::now(),
                source_process: self.source_process.clone(),
                proxy_version: PROXY_VERSION.to_string(),
            },
            request: RequestPayload {
                method: method.clone(),
                url: url.clone(),
                headers,
                body: body.to_vec(),
                http_version,
            },
            security: RequestSecurity {
                content_hash: String::new(), // stamped by the codec
                allowed_domains: host_of(&url).map(|h| vec![h]),
                max_response_size: self.max_response_size,
            },
        };

        let bytes = encode_request(&envelope)
            .map_err(|e| FlowFailure::BadGateway(format!("failed to encode request: {e}")))?;
        self.store
            .publish(Kind::Requests, &id, &bytes)
            .map_err(|e| FlowFailure::BadGateway(format!("failed to publish request: {e}")))?;

        debug!(%id, %method, %url, "request published, awaiting response");

        // await the matching response commit
        let deadline = Instant::now() + self.response_timeout;
        let reply_bytes = match self.store.wait_for(Kind::Responses, &id, deadline).await {
            Ok(bytes) => bytes,
            Err(StoreError::Timeout { .. }) => {
                warn!(%id, "response deadline passed");
                return Err(FlowFailure::GatewayTimeout);
            }
            Err(e) => {
                return Err(FlowFailure::BadGateway(format!(
                    "failed to read response: {e}"
                )))
            }
        };

        // The response file is consumed whether or not it decodes; a poison
        // file must not wedge every retry of the same flow.
        if let Err(e) = self.store.consume(Kind::Responses, &id) {
            warn!(%id, error = %e, "failed to delete response file");
        }

        let reply = decode_response(&reply_bytes)
            .map_err(|e| FlowFailure::BadGateway(format!("response envelope invalid: {e}")))?;
        if reply.metadata.request_id != id {
            return Err(FlowFailure::BadGateway(format!(
                "response correlates to {}, not {id}",
                reply.metadata.request_id
            )));
        }

        debug!(
            %id,
            status = ?reply.metadata.security_status,
            filtered = reply.security.content_filtered,
            "response received"
        );

        Ok(client_response(reply))
    }
}

/// Reconstruct the absolute target URL for a flow.
fn absolute_url(
    req: &Request<Incoming>,
    tunnel_authority: Option<&str>,
) -> Result<String, FlowFailure> {
    match tunnel_authority {
        Some(authority) => {
            // inside a CONNECT tunnel the URI is origin-form
            let path = req
                .uri()
                .path_and_query()
                .map_or("/", |pq| pq.as_str());
            let host = authority.strip_suffix(":443").unwrap_or(authority);
            Ok(format!("https://{host}{path}"))
        }
        None => {
            // a proxy client must send absolute-form
            let uri = req.uri();
            if uri.scheme().is_some() && uri.authority().is_some() {
                Ok(uri.to_string())
            } else {
                Err(FlowFailure::BadRequest(
                    "proxy requests must use an absolute URL".into(),
                ))
            }
        }
    }
}

/// Turn a decoded response envelope into the client-facing HTTP response.
///
/// Blocked and error envelopes without a response section map to 403 and
/// 502; otherwise the (possibly synthetic) section is replayed with framing
/// headers stripped so hyper can re-frame the reconstructed body.
fn client_response(reply: ResponseEnvelope) -> Response<ProxyBody> {
    let Some(payload) = reply.response else {
        return match reply.metadata.security_status {
            SecurityStatus::Blocked => {
                text_response(StatusCode::FORBIDDEN, "Blocked by security policy")
            }
            // decode_response guarantees approved envelopes carry a payload
            _ => text_response(StatusCode::BAD_GATEWAY, "Relay error"),
        };
    };

    let status =
        StatusCode::from_u16(payload.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &payload.headers {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(full_body(Bytes::from(payload.body)))
        .unwrap_or_else(|e| {
            warn!(error = %e, "stored response headers were unusable");
            text_response(StatusCode::BAD_GATEWAY, "Relay returned malformed headers")
        })
}

/// Render an HTTP version as the envelope string.
fn version_string(version: Version) -> String {
    match version {
        Version::HTTP_09 => "HTTP/0.9".into(),
        Version::HTTP_10 => "HTTP/1.0".into(),
        Version::HTTP_11 => "HTTP/1.1".into(),
        Version::HTTP_2 => "HTTP/2.0".into(),
        Version::HTTP_3 => "HTTP/3.0".into(),
        other => format!("{other:?}"),
    }
}

/// An empty response body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A response body with content.
pub fn full_body(content: Bytes) -> ProxyBody {
    Full::new(content).map_err(|never| match never {}).boxed()
}

/// A plain-text response with the given status.
pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from(message.to_string())))
        .expect("static response construction cannot fail")
}
