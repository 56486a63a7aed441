//! Encode/decode helpers enforcing the envelope integrity law.
//!
//! `decode(encode(x)) == x` for every well-formed envelope; the body hash is
//! stamped during encode and verified during decode so a corrupted file is
//! caught before it reaches either side of the gap.

use sha2::{Digest, Sha256};

use super::error::{CodecError, CodecResult};
use super::types::{RequestEnvelope, ResponseEnvelope, SecurityStatus};

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Serialize a request envelope, stamping `content_hash` from the body.
pub fn encode_request(envelope: &RequestEnvelope) -> CodecResult<Vec<u8>> {
    let mut envelope = envelope.clone();
    envelope.security.content_hash = sha256_hex(&envelope.request.body);
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Parse a request envelope and verify `content_hash` against the body.
pub fn decode_request(bytes: &[u8]) -> CodecResult<RequestEnvelope> {
    let envelope: RequestEnvelope = serde_json::from_slice(bytes)?;
    let computed = sha256_hex(&envelope.request.body);
    if computed != envelope.security.content_hash {
        return Err(CodecError::Integrity {
            id: envelope.metadata.request_id,
            stored: envelope.security.content_hash,
            computed,
        });
    }
    Ok(envelope)
}

/// Serialize a response envelope, stamping `response_hash` from the body.
///
/// Envelopes without a response section hash the empty byte string, so the
/// field is always present and verifiable.
pub fn encode_response(envelope: &ResponseEnvelope) -> CodecResult<Vec<u8>> {
    let mut envelope = envelope.clone();
    let body: &[u8] = envelope.response.as_ref().map_or(&[], |r| &r.body);
    envelope.security.response_hash = sha256_hex(body);
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Parse a response envelope and verify `response_hash` against the body.
///
/// An approved envelope must carry a response section; blocked and error
/// envelopes may omit it (the proxy then synthesizes the status itself).
pub fn decode_response(bytes: &[u8]) -> CodecResult<ResponseEnvelope> {
    let envelope: ResponseEnvelope = serde_json::from_slice(bytes)?;
    if envelope.response.is_none() && envelope.metadata.security_status == SecurityStatus::Approved
    {
        return Err(CodecError::MissingResponse(envelope.metadata.request_id));
    }
    let body: &[u8] = envelope.response.as_ref().map_or(&[], |r| &r.body);
    let computed = sha256_hex(body);
    if computed != envelope.security.response_hash {
        return Err(CodecError::Integrity {
            id: envelope.metadata.request_id,
            stored: envelope.security.response_hash,
            computed,
        });
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::types::*;
    use chrono::{TimeZone, Utc};

    fn sample_request() -> RequestEnvelope {
        RequestEnvelope {
            metadata: RequestMeta {
                request_id: "4dc8ac26-5bb0-4cf4-9b1c-8a91f06b2a7d".into(),
                timestamp: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
                source_process: "target_script".into(),
                proxy_version: "1.0.0".into(),
            },
            request: RequestPayload {
                method: "POST".into(),
                url: "https://api.example.invalid/v1/items?page=2".into(),
                headers: vec![
                    ("Host".into(), "api.example.invalid".into()),
                    ("Accept".into(), "application/json".into()),
                    ("Accept".into(), "text/plain".into()),
                ],
                body: b"{\"name\":\"widget\"}".to_vec(),
                http_version: "HTTP/1.1".into(),
            },
            security: RequestSecurity {
                content_hash: String::new(),
                allowed_domains: Some(vec!["api.example.invalid".into()]),
                max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            },
        }
    }

    fn sample_response() -> ResponseEnvelope {
        ResponseEnvelope {
            metadata: ResponseMeta {
                request_id: "4dc8ac26-5bb0-4cf4-9b1c-8a91f06b2a7d".into(),
                processed_at: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 55).unwrap(),
                forwarder_version: "1.0.0".into(),
                security_status: SecurityStatus::Approved,
            },
            response: Some(ResponsePayload {
                status_code: 200,
                reason: "OK".into(),
                headers: vec![("Content-Type".into(), "application/json".into())],
                body: b"{\"ok\":true}".to_vec(),
                http_version: "HTTP/1.1".into(),
            }),
            security: ResponseSecurity {
                content_filtered: false,
                response_hash: String::new(),
                scan_results: ScanResults::default(),
            },
        }
    }

    #[test]
    fn test_request_round_trip() {
        let original = sample_request();
        let bytes = encode_request(&original).unwrap();
        let decoded = decode_request(&bytes).unwrap();

        // encode stamps the hash, so compare against the stamped original
        let mut expected = original;
        expected.security.content_hash = sha256_hex(&expected.request.body);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_response_round_trip() {
        let original = sample_response();
        let bytes = encode_response(&original).unwrap();
        let decoded = decode_response(&bytes).unwrap();

        let mut expected = original;
        expected.security.response_hash =
            sha256_hex(&expected.response.as_ref().unwrap().body);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_request_hash_mismatch_rejected() {
        let bytes = encode_request(&sample_request()).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        // tamper with the body without updating the hash
        value["request"]["body"] = serde_json::json!("dGFtcGVyZWQ=");
        let tampered = serde_json::to_vec(&value).unwrap();

        match decode_request(&tampered) {
            Err(CodecError::Integrity { .. }) => {}
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[test]
    fn test_response_hash_mismatch_rejected() {
        let bytes = encode_response(&sample_response()).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["response"]["body"] = serde_json::json!("dGFtcGVyZWQ=");
        let tampered = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            decode_response(&tampered),
            Err(CodecError::Integrity { .. })
        ));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let bytes = encode_request(&sample_request()).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["future_extension"] = serde_json::json!({"v": 2});
        value["metadata"]["trace_id"] = serde_json::json!("abc123");
        let extended = serde_json::to_vec(&value).unwrap();

        assert!(decode_request(&extended).is_ok());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let bytes = encode_request(&sample_request()).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["request"].as_object_mut().unwrap().remove("method");
        let broken = serde_json::to_vec(&value).unwrap();

        assert!(matches!(decode_request(&broken), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_blocked_envelope_without_response_section() {
        let mut envelope = sample_response();
        envelope.metadata.security_status = SecurityStatus::Blocked;
        envelope.response = None;
        let bytes = encode_response(&envelope).unwrap();

        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded.metadata.security_status, SecurityStatus::Blocked);
        assert!(decoded.response.is_none());
        assert_eq!(decoded.security.response_hash, sha256_hex(b""));
    }

    #[test]
    fn test_approved_envelope_requires_response_section() {
        let mut envelope = sample_response();
        envelope.response = None;
        let bytes = encode_response(&envelope).unwrap();

        assert!(matches!(
            decode_response(&bytes),
            Err(CodecError::MissingResponse(_))
        ));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"pong"),
            "9795c5ff8937f23526ccb207a5684c1fc94a7854e19c021b39d944e51f5baef2"
        );
    }
}
