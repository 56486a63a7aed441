//! The forwarder: the Internet-side half of the relay.
//!
//! A single supervisory loop discovers committed request envelopes, runs
//! each through the security filter, executes approved requests against the
//! real network, and publishes a response envelope under the same
//! correlation id. Exactly one envelope is produced per claimed request —
//! synthetic when blocked or failed, verbatim-from-origin when approved.
//!
//! Requests are processed by a bounded worker pool; ordering across
//! correlation ids is not guaranteed and does not matter, flows are
//! independent. A background sweeper answers stale orphaned requests with a
//! synthetic timeout and clears crash debris, which keeps the rendezvous
//! directory bounded under client-disconnect churn.
//!
//! # Example
//!
//! ```ignore
//! use della_wonders::forwarder::{Forwarder, ForwarderConfig};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let forwarder = Forwarder::new(ForwarderConfig::new("/tmp/shared"), shutdown_rx)?;
//! forwarder.run().await?;
//! ```

mod error;
mod fetch;

pub use error::{ForwarderError, FetchError};
pub use fetch::{build_client, fetch, FetchPolicy, FetchedResponse};

use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::envelope::{
    decode_request, encode_response, CodecError, RequestEnvelope, ResponseEnvelope, ResponseMeta,
    ResponsePayload, ResponseSecurity, ScanResults, SecurityStatus,
};
use crate::filter::{SecurityFilter, Verdict, DEFAULT_MAX_REQUEST_SIZE};
use crate::store::{DirWatcher, Kind, RendezvousStore, StoreError};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Version string stamped into response envelopes.
pub const FORWARDER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long in-flight workers get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Claim-loop wakeup bound; a directory event usually fires much earlier.
const SCAN_TICK: Duration = Duration::from_millis(250);

/// Grace before crash-debris staging files are deleted.
const TMP_GRACE: Duration = Duration::from_secs(60);

/// Configuration for a forwarder process.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Rendezvous root shared with the proxy.
    pub shared_dir: PathBuf,
    /// Domains refused outright (exact or dot-suffix match).
    pub blocked_domains: Vec<String>,
    /// Extra scan patterns appended to the built-in set.
    pub extra_patterns: Vec<String>,
    /// Request body ceiling.
    pub max_request_size: u64,
    /// Worker-pool size.
    pub workers: usize,
    /// Age at which unanswered requests are swept.
    pub stale_after: Duration,
    /// Sweeper cadence.
    pub sweep_interval: Duration,
    /// Outbound retry/timeout policy.
    pub fetch: FetchPolicy,
}

impl ForwarderConfig {
    /// Defaults over a shared directory.
    pub fn new(shared_dir: impl Into<PathBuf>) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            blocked_domains: Vec::new(),
            extra_patterns: Vec::new(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            workers: 8,
            stale_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            fetch: FetchPolicy::default(),
        }
    }
}

/// The forwarder daemon.
pub struct Forwarder {
    store: Arc<RendezvousStore>,
    filter: Arc<SecurityFilter>,
    client: reqwest::Client,
    audit: Arc<AuditLogger>,
    config: ForwarderConfig,
    shutdown_rx: watch::Receiver<bool>,
    handled: Arc<AtomicU64>,
}

impl Forwarder {
    /// Build a forwarder: opens the store, compiles the filter, constructs
    /// the outbound client and the audit log.
    pub fn new(
        config: ForwarderConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ForwarderError> {
        let store = Arc::new(RendezvousStore::open(&config.shared_dir)?);
        let filter = Arc::new(SecurityFilter::new(
            &config.blocked_domains,
            &config.extra_patterns,
            config.max_request_size,
        )?);
        let client = build_client(&config.fetch)?;
        let audit = Arc::new(
            AuditLogger::open(&config.shared_dir).map_err(ForwarderError::Audit)?,
        );

        Ok(Self {
            store,
            filter,
            client,
            audit,
            config,
            shutdown_rx,
            handled: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Run until the shutdown signal fires, then drain in-flight work.
    pub async fn run(self) -> Result<(), ForwarderError> {
        info!(
            shared_dir = %self.config.shared_dir.display(),
            workers = self.config.workers,
            blocked = self.config.blocked_domains.len(),
            "forwarder started"
        );
        self.audit.log(AuditEvent::ForwarderStart {
            shared_dir: self.config.shared_dir.display().to_string(),
            blocked_domains: self.config.blocked_domains.len(),
            workers: self.config.workers,
        });

        let sweeper = self.spawn_sweeper();

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut watcher = DirWatcher::new(self.store.dir(Kind::Requests));
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            // drain everything currently committed before sleeping; a scan
            // failure is logged and retried on the next tick, never fatal
            loop {
                let (id, bytes) = match self.claim_next() {
                    Ok(Some(claimed)) => claimed,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "request scan failed");
                        break;
                    }
                };
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
                let worker = Worker {
                    store: self.store.clone(),
                    filter: self.filter.clone(),
                    client: self.client.clone(),
                    audit: self.audit.clone(),
                    fetch_policy: self.config.fetch.clone(),
                    handled: self.handled.clone(),
                };
                workers.spawn(async move {
                    worker.handle(id, bytes).await;
                    drop(permit);
                });
            }

            // opportunistically reap finished workers
            while workers.try_join_next().is_some() {}

            tokio::select! {
                _ = watcher.changed(SCAN_TICK) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("forwarder draining in-flight requests");
        sweeper.abort();
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("drain grace expired, aborting remaining workers");
            workers.abort_all();
        }

        let handled = self.handled.load(Ordering::Relaxed);
        info!(handled, "forwarder stopped");
        self.audit.log(AuditEvent::ForwarderStop { handled });
        Ok(())
    }

    /// Claim the next unseen request, skipping ids that already have a
    /// committed response (a previous run published but did not archive).
    fn claim_next(&self) -> Result<Option<(String, Vec<u8>)>, ForwarderError> {
        loop {
            match self.store.claim(Kind::Requests)? {
                Some((id, _)) if self.store.committed_path(Kind::Responses, &id).exists() => {
                    debug!(%id, "response already committed, archiving leftover request");
                    let _ = self.store.archive(&id);
                }
                other => return Ok(other),
            }
        }
    }

    /// Background task answering stale requests and clearing debris.
    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let audit = self.audit.clone();
        let stale_after = self.config.stale_after;
        let interval = self.config.sweep_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        sweep_once(&store, &audit, stale_after);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// One sweeper pass: debris cleanup first, then synthetic 504s for stale
/// requests. Orphan responses are scanned before new ones are published so
/// a pass never eats its own output.
fn sweep_once(store: &RendezvousStore, audit: &AuditLogger, stale_after: Duration) {
    // responses nobody will ever read (their flow was abandoned and the
    // request already archived) are deleted once stale
    match store.sweep_orphan_responses(stale_after) {
        Ok(orphans) => {
            for id in orphans {
                debug!(%id, "removing unclaimed response");
                let _ = store.consume(Kind::Responses, &id);
            }
        }
        Err(e) => warn!(error = %e, "orphan response scan failed"),
    }

    if let Err(e) = store.sweep_tmp(TMP_GRACE) {
        warn!(error = %e, "tmp sweep failed");
    }

    match store.sweep(stale_after) {
        Ok(stale) => {
            for id in stale {
                let age_secs = stale_after.as_secs();
                warn!(%id, "sweeping stale request");
                let envelope = synthetic_response(
                    &id,
                    SecurityStatus::Error,
                    504,
                    "Gateway Timeout: request expired unanswered",
                );
                if let Err(e) = publish_response(store, &id, &envelope) {
                    warn!(%id, error = %e, "failed to publish sweep response");
                    continue;
                }
                let _ = store.archive(&id);
                audit.log(AuditEvent::RequestSwept {
                    request_id: id,
                    age_secs,
                });
            }
        }
        Err(e) => warn!(error = %e, "sweep scan failed"),
    }
}

/// Per-request worker state.
struct Worker {
    store: Arc<RendezvousStore>,
    filter: Arc<SecurityFilter>,
    client: reqwest::Client,
    audit: Arc<AuditLogger>,
    fetch_policy: FetchPolicy,
    handled: Arc<AtomicU64>,
}

impl Worker {
    /// Handle one claimed request end to end. Never panics the pool; every
    /// outcome becomes a response envelope or a logged store failure.
    async fn handle(&self, id: String, bytes: Vec<u8>) {
        let envelope = match decode_request(&bytes) {
            Ok(envelope) => envelope,
            Err(CodecError::Integrity { .. }) => {
                warn!(%id, "request failed its integrity check");
                let reply = synthetic_response(
                    &id,
                    SecurityStatus::Error,
                    400,
                    "Bad Request: content hash mismatch",
                );
                self.finish(&id, &reply).await;
                return;
            }
            Err(e) => {
                warn!(%id, error = %e, "request envelope undecodable");
                let reply = synthetic_response(
                    &id,
                    SecurityStatus::Error,
                    502,
                    &format!("Bad Gateway: request envelope invalid: {e}"),
                );
                self.finish(&id, &reply).await;
                return;
            }
        };

        let reply = self.execute(&envelope).await;
        self.finish(&id, &reply).await;
    }

    /// Filter and (when approved) execute the request.
    async fn execute(&self, envelope: &RequestEnvelope) -> ResponseEnvelope {
        let id = &envelope.metadata.request_id;

        if let Verdict::Block(reason) = self.filter.validate_request(envelope) {
            info!(%id, %reason, "request blocked");
            self.audit.log(AuditEvent::RequestBlocked {
                request_id: id.clone(),
                reason: reason.to_string(),
            });
            return synthetic_response(
                id,
                SecurityStatus::Blocked,
                reason.status_code(),
                &format!("Blocked: {reason}"),
            );
        }

        info!(
            %id,
            method = %envelope.request.method,
            url = %envelope.request.url,
            "executing request"
        );
        self.audit.log(AuditEvent::RequestAllowed {
            request_id: id.clone(),
            url: envelope.request.url.clone(),
        });

        let request_suspicious = self.filter.scan_body(&envelope.request.body);

        let fetched = match fetch(
            &self.client,
            &self.fetch_policy,
            &envelope.request,
            envelope.security.max_response_size,
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(%id, error = %e, "upstream call failed");
                self.audit.log(AuditEvent::UpstreamFailed {
                    request_id: id.clone(),
                    error: e.to_string(),
                });
                return synthetic_response(
                    id,
                    SecurityStatus::Error,
                    502,
                    &format!("Bad Gateway: {e}"),
                );
            }
        };

        let response_suspicious = self.filter.scan_body(&fetched.body);
        let suspicious = request_suspicious || response_suspicious;
        let content_filtered = fetched.truncated || suspicious;
        if content_filtered {
            self.audit.log(AuditEvent::ContentFiltered {
                request_id: id.clone(),
                truncated: fetched.truncated,
                pattern_match: suspicious,
            });
        }

        ResponseEnvelope {
            metadata: ResponseMeta {
                request_id: id.clone(),
                processed_at: Utc::now(),
                forwarder_version: FORWARDER_VERSION.to_string(),
                security_status: SecurityStatus::Approved,
            },
            response: Some(ResponsePayload {
                status_code: fetched.status_code,
                reason: fetched.reason,
                headers: fetched.headers,
                body: fetched.body,
                http_version: fetched.http_version,
            }),
            security: ResponseSecurity {
                content_filtered,
                response_hash: String::new(), // stamped by the codec
                scan_results: ScanResults {
                    malware: false,
                    suspicious_content: suspicious,
                },
            },
        }
    }

    /// Publish the reply and archive the request.
    async fn finish(&self, id: &str, reply: &ResponseEnvelope) {
        match publish_response(&self.store, id, reply) {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                // lost a race against another forwarder; the outbound call
                // was wasted but the committed reply stands
                warn!(id, "response already committed by someone else");
            }
            Err(e) => {
                error!(id, error = %e, "failed to publish response, releasing claim");
                self.store.unclaim(id);
                return;
            }
        }
        let _ = self.store.archive(id);
        self.handled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Encode and publish a response envelope.
fn publish_response(
    store: &RendezvousStore,
    id: &str,
    reply: &ResponseEnvelope,
) -> Result<(), StoreError> {
    let bytes = match encode_response(reply) {
        Ok(bytes) => bytes,
        Err(e) => {
            // encoding a value we just built cannot realistically fail, but
            // never let it take the worker down
            error!(id, error = %e, "failed to encode response envelope");
            return Ok(());
        }
    };
    store.publish(Kind::Responses, id, &bytes)
}

/// Build a synthetic response envelope carrying an error or block status.
pub fn synthetic_response(
    id: &str,
    status: SecurityStatus,
    status_code: u16,
    message: &str,
) -> ResponseEnvelope {
    let body = message.as_bytes().to_vec();
    ResponseEnvelope {
        metadata: ResponseMeta {
            request_id: id.to_string(),
            processed_at: Utc::now(),
            forwarder_version: FORWARDER_VERSION.to_string(),
            security_status: status,
        },
        response: Some(ResponsePayload {
            status_code,
            reason: reason_phrase(status_code).to_string(),
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body,
            http_version: "HTTP/1.1".to_string(),
        }),
        security: ResponseSecurity {
            content_filtered: false,
            response_hash: String::new(), // stamped by the codec
            scan_results: ScanResults::default(),
        },
    }
}

/// Reason phrase for the synthetic statuses the relay produces.
fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        400 => "Bad Request",
        403 => "Forbidden",
        413 => "Payload Too Large",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}
