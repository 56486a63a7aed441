//! Audit event types for the forwarder's security trail.

use serde::Serialize;

/// Security-relevant events recorded to the shared audit log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Forwarder came up and began claiming requests.
    ForwarderStart {
        /// Rendezvous root being served.
        shared_dir: String,
        /// Number of configured blocklist entries.
        blocked_domains: usize,
        /// Worker-pool size.
        workers: usize,
    },

    /// Forwarder drained and exited.
    ForwarderStop {
        /// Requests handled during this run.
        handled: u64,
    },

    /// A request passed the security filter and was executed.
    RequestAllowed {
        /// Correlation id.
        request_id: String,
        /// Target URL.
        url: String,
    },

    /// A request was refused by the security filter.
    RequestBlocked {
        /// Correlation id.
        request_id: String,
        /// Human-readable refusal reason.
        reason: String,
    },

    /// A response body was truncated or matched a scan pattern.
    ContentFiltered {
        /// Correlation id.
        request_id: String,
        /// True when the body was cut at the size cap.
        truncated: bool,
        /// True when a scan pattern matched.
        pattern_match: bool,
    },

    /// The outbound call failed after all retries.
    UpstreamFailed {
        /// Correlation id.
        request_id: String,
        /// Final error text.
        error: String,
    },

    /// A stale request was answered synthetically and archived.
    RequestSwept {
        /// Correlation id.
        request_id: String,
        /// Age in seconds when swept.
        age_secs: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_tag_with_snake_case() {
        let event = AuditEvent::UpstreamFailed {
            request_id: "x".into(),
            error: "connection refused".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "upstream_failed");
        assert_eq!(json["error"], "connection refused");
    }
}
