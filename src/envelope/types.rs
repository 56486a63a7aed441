//! Envelope data model.
//!
//! Field names on the wire follow the rendezvous format: bodies are base64
//! strings, timestamps are RFC-3339 UTC, headers are ordered `[name, value]`
//! pairs. Unknown fields are tolerated everywhere for forward compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default response-size ceiling advertised in request envelopes (10 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// Ordered list of header `(name, value)` pairs.
///
/// Repeated names stay repeated and order is preserved verbatim, which a
/// JSON object representation could not guarantee.
pub type HeaderList = Vec<(String, String)>;

/// Serialized HTTP request crossing the gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation and provenance metadata.
    pub metadata: RequestMeta,
    /// The HTTP request itself.
    pub request: RequestPayload,
    /// Integrity and policy hints.
    pub security: RequestSecurity,
}

/// Metadata section of a request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Correlation id binding this request to its response.
    pub request_id: String,
    /// When the proxy intercepted the flow.
    pub timestamp: DateTime<Utc>,
    /// Name of the process the flow originated from.
    pub source_process: String,
    /// Version of the proxy that serialized the flow.
    pub proxy_version: String,
}

/// The HTTP request section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// HTTP method, uppercase.
    pub method: String,
    /// Absolute-form URL of the target resource.
    pub url: String,
    /// Ordered header pairs, repeated entries preserved.
    pub headers: HeaderList,
    /// Request body, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// HTTP version string, e.g. `HTTP/1.1`.
    pub http_version: String,
}

/// Security section of a request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSecurity {
    /// SHA-256 hex digest of the raw body bytes.
    pub content_hash: String,
    /// Advisory list of domains the client expected to reach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,
    /// Ceiling on the response body the forwarder may return.
    pub max_response_size: u64,
}

/// Outcome class recorded by the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityStatus {
    /// The request was executed against the real network.
    Approved,
    /// The security filter refused the request.
    Blocked,
    /// The request could not be executed (integrity or upstream failure).
    Error,
}

/// Serialized HTTP response crossing the gap back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation and processing metadata.
    pub metadata: ResponseMeta,
    /// The HTTP response. Synthetic for blocked/error envelopes; decoders
    /// must tolerate its absence when `security_status != approved`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponsePayload>,
    /// Integrity and filtering annotations.
    pub security: ResponseSecurity,
}

/// Metadata section of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Correlation id matching the request envelope.
    pub request_id: String,
    /// When the forwarder finished handling the request.
    pub processed_at: DateTime<Utc>,
    /// Version of the forwarder that produced this envelope. Informational;
    /// envelopes from other producers may omit it.
    #[serde(default)]
    pub forwarder_version: String,
    /// Outcome class of the security pipeline.
    pub security_status: SecurityStatus,
}

/// The HTTP response section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// HTTP status code.
    pub status_code: u16,
    /// Reason phrase accompanying the status code.
    pub reason: String,
    /// Ordered header pairs as received from the origin.
    pub headers: HeaderList,
    /// Response body, base64 on the wire, possibly truncated.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// HTTP version string.
    pub http_version: String,
}

/// Security section of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSecurity {
    /// True when the body was truncated or a scan pattern matched.
    pub content_filtered: bool,
    /// SHA-256 hex digest of the (possibly truncated) body bytes.
    pub response_hash: String,
    /// Results of the content scan.
    #[serde(default)]
    pub scan_results: ScanResults,
}

/// Annotations produced by the content scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanResults {
    /// Reserved for malware scanning integrations; always false today.
    #[serde(default)]
    pub malware: bool,
    /// True when a configured content pattern matched either body.
    #[serde(default)]
    pub suspicious_content: bool,
}

/// Serde adapter encoding byte bodies as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
