//! Security filter applied by the forwarder before any outbound call.
//!
//! Three checks gate a request: the domain blocklist, the request size cap,
//! and the request hash (verified by the codec before the filter runs). The
//! content pattern scan never blocks; it only annotates the response
//! envelope (`content_filtered`, `scan_results.suspicious_content`).
//!
//! The filter is built once at forwarder startup and immutable afterwards.
//!
//! # Blocklist matching
//!
//! Hosts are case-folded. An entry matches when the host equals it or when
//! the host is a dot-separated suffix of it: `evil.test` blocks both
//! `evil.test` and `sub.evil.test`, but not `notevil.test`.

use regex::RegexSet;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::envelope::RequestEnvelope;

/// Default ceiling on request bodies (10 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 10 * 1024 * 1024;

/// Patterns flagged in bodies: credential-shaped assignments and privileged
/// account names. Matches annotate the envelope, they never block.
const DEFAULT_SCAN_PATTERNS: &[&str] = &[
    r"(?i)\b(password|token|secret|key)\b=",
    r"(?i)\b(admin|root|administrator)\b",
];

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The target host matched the blocklist.
    Domain {
        /// The offending host, case-folded.
        host: String,
    },
    /// The request body exceeded the size cap.
    RequestSize {
        /// Actual body length.
        actual: u64,
        /// Configured ceiling.
        limit: u64,
    },
    /// The request URL could not be parsed into a host.
    BadUrl,
}

impl BlockReason {
    /// Synthetic status code the client should see for this refusal.
    pub fn status_code(&self) -> u16 {
        match self {
            BlockReason::Domain { .. } => 403,
            BlockReason::RequestSize { .. } => 413,
            BlockReason::BadUrl => 400,
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Domain { host } => write!(f, "domain {host} is blocked"),
            BlockReason::RequestSize { actual, limit } => {
                write!(f, "request size {actual} exceeds limit {limit}")
            }
            BlockReason::BadUrl => write!(f, "request URL has no parseable host"),
        }
    }
}

/// Result of validating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Execute the request against the real network.
    Allow,
    /// Refuse with a synthetic response.
    Block(BlockReason),
}

/// Immutable security policy for one forwarder process.
pub struct SecurityFilter {
    blocked_domains: HashSet<String>,
    scan_patterns: RegexSet,
    max_request_size: u64,
}

impl SecurityFilter {
    /// Build a filter from blocklist entries and extra scan patterns.
    ///
    /// Domains are case-folded; patterns extend the built-in set. Invalid
    /// extra patterns are rejected so misconfiguration fails at startup,
    /// not mid-flight.
    pub fn new(
        blocked_domains: &[String],
        extra_patterns: &[String],
        max_request_size: u64,
    ) -> Result<Self, regex::Error> {
        let blocked: HashSet<String> = blocked_domains
            .iter()
            .map(|d| d.trim_end_matches('.').to_lowercase())
            .collect();

        let patterns: Vec<&str> = DEFAULT_SCAN_PATTERNS
            .iter()
            .copied()
            .chain(extra_patterns.iter().map(String::as_str))
            .collect();
        let scan_patterns = RegexSet::new(patterns)?;

        debug!(
            blocked = blocked.len(),
            patterns = scan_patterns.len(),
            max_request_size,
            "security filter configured"
        );

        Ok(Self {
            blocked_domains: blocked,
            scan_patterns,
            max_request_size,
        })
    }

    /// Validate a request envelope against the blocklist and size cap.
    pub fn validate_request(&self, envelope: &RequestEnvelope) -> Verdict {
        let Some(host) = host_of(&envelope.request.url) else {
            return Verdict::Block(BlockReason::BadUrl);
        };

        if self.domain_is_blocked(&host) {
            warn!(%host, id = %envelope.metadata.request_id, "blocked domain");
            return Verdict::Block(BlockReason::Domain { host });
        }

        let actual = envelope.request.body.len() as u64;
        if actual > self.max_request_size {
            warn!(
                actual,
                limit = self.max_request_size,
                id = %envelope.metadata.request_id,
                "request too large"
            );
            return Verdict::Block(BlockReason::RequestSize {
                actual,
                limit: self.max_request_size,
            });
        }

        Verdict::Allow
    }

    /// True when `host` equals or is a dot-suffix of a blocklist entry.
    pub fn domain_is_blocked(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        self.blocked_domains.iter().any(|blocked| {
            host == *blocked
                || (host.len() > blocked.len()
                    && host.ends_with(blocked)
                    && host.as_bytes()[host.len() - blocked.len() - 1] == b'.')
        })
    }

    /// Scan a body for the configured patterns. Lossy UTF-8 so binary
    /// bodies are still inspected for embedded text.
    pub fn scan_body(&self, body: &[u8]) -> bool {
        if body.is_empty() {
            return false;
        }
        let text = String::from_utf8_lossy(body);
        self.scan_patterns.is_match(&text)
    }
}

/// Extract the host from an absolute URL without pulling in a URL crate:
/// strip the scheme, cut at the first `/`, `?` or `#`, drop userinfo and
/// port, unbracket IPv6.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r)?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    if authority.is_empty() {
        return None;
    }

    let host = if let Some(stripped) = authority.strip_prefix('[') {
        stripped.split_once(']').map(|(h, _)| h)?
    } else {
        authority.rsplit_once(':').map_or(authority, |(h, p)| {
            // only treat the tail as a port when it is numeric
            if p.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                authority
            }
        })
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{
        RequestEnvelope, RequestMeta, RequestPayload, RequestSecurity,
    };
    use chrono::Utc;

    fn filter(blocked: &[&str]) -> SecurityFilter {
        let blocked: Vec<String> = blocked.iter().map(|s| s.to_string()).collect();
        SecurityFilter::new(&blocked, &[], DEFAULT_MAX_REQUEST_SIZE).unwrap()
    }

    fn envelope_for(url: &str, body: Vec<u8>) -> RequestEnvelope {
        RequestEnvelope {
            metadata: RequestMeta {
                request_id: "test".into(),
                timestamp: Utc::now(),
                source_process: "target_script".into(),
                proxy_version: "1.0.0".into(),
            },
            request: RequestPayload {
                method: "GET".into(),
                url: url.into(),
                headers: vec![],
                body,
                http_version: "HTTP/1.1".into(),
            },
            security: RequestSecurity {
                content_hash: String::new(),
                allowed_domains: None,
                max_response_size: 1024,
            },
        }
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(host_of("http://example.com/a"), Some("example.com".into()));
        assert_eq!(
            host_of("https://Example.COM:8443/x?q=1"),
            Some("example.com".into())
        );
        assert_eq!(
            host_of("https://user:pw@example.com/"),
            Some("example.com".into())
        );
        assert_eq!(host_of("http://[::1]:8080/"), Some("::1".into()));
        assert_eq!(host_of("not-a-url"), None);
    }

    #[test]
    fn test_exact_domain_blocked() {
        let f = filter(&["evil.test"]);
        assert!(f.domain_is_blocked("evil.test"));
        assert!(f.domain_is_blocked("EVIL.TEST"));
    }

    #[test]
    fn test_dot_suffix_blocked() {
        let f = filter(&["evil.test"]);
        assert!(f.domain_is_blocked("sub.evil.test"));
        assert!(f.domain_is_blocked("deep.sub.evil.test"));
    }

    #[test]
    fn test_lookalike_domain_not_blocked() {
        let f = filter(&["evil.test"]);
        assert!(!f.domain_is_blocked("notevil.test"));
        assert!(!f.domain_is_blocked("evil.test.example"));
    }

    #[test]
    fn test_blocked_domain_verdict() {
        let f = filter(&["evil.test"]);
        let verdict = f.validate_request(&envelope_for("https://sub.evil.test/x", vec![]));
        match verdict {
            Verdict::Block(BlockReason::Domain { host }) => assert_eq!(host, "sub.evil.test"),
            other => panic!("expected domain block, got {other:?}"),
        }
    }

    #[test]
    fn test_allowed_domain_verdict() {
        let f = filter(&["evil.test"]);
        let verdict = f.validate_request(&envelope_for("http://fine.example/x", vec![]));
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn test_oversized_request_blocked() {
        let blocked: Vec<String> = vec![];
        let f = SecurityFilter::new(&blocked, &[], 8).unwrap();
        let verdict = f.validate_request(&envelope_for("http://a.example/", vec![0u8; 9]));
        match verdict {
            Verdict::Block(BlockReason::RequestSize { actual, limit }) => {
                assert_eq!(actual, 9);
                assert_eq!(limit, 8);
            }
            other => panic!("expected size block, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_url_blocked() {
        let f = filter(&[]);
        let verdict = f.validate_request(&envelope_for("garbage", vec![]));
        assert_eq!(verdict, Verdict::Block(BlockReason::BadUrl));
        assert_eq!(BlockReason::BadUrl.status_code(), 400);
    }

    #[test]
    fn test_scan_flags_credential_shapes() {
        let f = filter(&[]);
        assert!(f.scan_body(b"password=hunter2"));
        assert!(f.scan_body(b"the root account"));
        assert!(!f.scan_body(b"perfectly innocuous text"));
        assert!(!f.scan_body(b""));
    }

    #[test]
    fn test_extra_patterns_appended() {
        let blocked: Vec<String> = vec![];
        let extra = vec![r"ssn:\d{3}-\d{2}-\d{4}".to_string()];
        let f = SecurityFilter::new(&blocked, &extra, DEFAULT_MAX_REQUEST_SIZE).unwrap();
        assert!(f.scan_body(b"ssn:123-45-6789"));
    }

    #[test]
    fn test_invalid_extra_pattern_rejected() {
        let blocked: Vec<String> = vec![];
        let extra = vec!["(unclosed".to_string()];
        assert!(SecurityFilter::new(&blocked, &extra, DEFAULT_MAX_REQUEST_SIZE).is_err());
    }

    #[test]
    fn test_block_reason_status_codes() {
        assert_eq!(BlockReason::Domain { host: "x".into() }.status_code(), 403);
        assert_eq!(
            BlockReason::RequestSize { actual: 2, limit: 1 }.status_code(),
            413
        );
    }
}
