//! Audit trail for the forwarder.
//!
//! Security-relevant decisions (allowed, blocked, filtered, failed) are
//! appended as JSON lines to `<shared>/logs/audit.jsonl`, one object per
//! event with an RFC-3339 timestamp. The shared directory is the system's
//! only persisted state, so the audit trail lives there too, readable from
//! both sides of the gap.
//!
//! Debug logging is a separate concern and goes through `tracing`.
//!
//! # Event format
//!
//! ```json
//! {"ts":"2026-03-14T09:26:55Z","event":"request_blocked","request_id":"...","reason":"domain evil.test is blocked"}
//! ```

mod events;

pub use events::AuditEvent;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error};

/// File name of the audit trail under the shared `logs/` directory.
pub const AUDIT_LOG_NAME: &str = "audit.jsonl";

/// Appends audit events to the shared audit log.
///
/// Interior mutability (Mutex around the open file) lets workers log from
/// shared references. The null variant discards events, for tests.
pub struct AuditLogger {
    sink: Option<Mutex<std::fs::File>>,
    path: Option<PathBuf>,
}

#[derive(Serialize)]
struct Timestamped<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

impl AuditLogger {
    /// Open (creating if needed) the audit log under `shared_root/logs/`.
    pub fn open(shared_root: &Path) -> std::io::Result<Self> {
        let path = shared_root.join("logs").join(AUDIT_LOG_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "audit log opened");
        Ok(Self {
            sink: Some(Mutex::new(file)),
            path: Some(path),
        })
    }

    /// A logger that discards every event.
    pub fn new_null() -> Self {
        Self {
            sink: None,
            path: None,
        }
    }

    /// Path of the audit log, when one is open.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event. Failures are logged and swallowed: the audit trail
    /// must never take the relay down with it.
    pub fn log(&self, event: AuditEvent) {
        let Some(ref sink) = self.sink else {
            return;
        };

        let line = Timestamped {
            ts: Utc::now(),
            event: &event,
        };
        match serde_json::to_string(&line) {
            Ok(mut json) => {
                json.push('\n');
                match sink.lock() {
                    Ok(mut file) => {
                        if let Err(e) = file.write_all(json.as_bytes()) {
                            error!("failed to append audit event: {e}");
                        }
                    }
                    Err(e) => error!("audit log lock poisoned: {e}"),
                }
            }
            Err(e) => error!("failed to serialize audit event: {e}"),
        }
    }
}
