//! The rendezvous store: a shared directory behaving like a reliable
//! request/response channel.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/requests/<id>.json     published request; readable = committed
//! <root>/responses/<id>.json    published response; readable = committed
//! <root>/processed/<id>.json    archived request after the forwarder is done
//! <root>/logs/audit.jsonl       forwarder audit trail
//! <root>/*/<id>.json.tmp        staging names; never opened by readers
//! ```
//!
//! The commit point for every publish is an atomic rename from the staging
//! name to the final name, so a reader that can open a `.json` file always
//! sees a complete envelope. The directory permission model is the trust
//! boundary; no lock files or advisory locks exist.
//!
//! # Example
//!
//! ```ignore
//! use della_wonders::store::{Kind, RendezvousStore};
//!
//! let store = RendezvousStore::open("/tmp/shared")?;
//! store.publish(Kind::Requests, "4dc8...", &bytes)?;
//! let reply = store.wait_for(Kind::Responses, "4dc8...", deadline).await?;
//! ```

mod error;
mod watch;

pub use error::StoreError;
pub use watch::DirWatcher;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, trace, warn};

/// The two committed message kinds plus the forwarder archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Requests published by the proxy.
    Requests,
    /// Responses published by the forwarder.
    Responses,
    /// Requests the forwarder has finished with.
    Processed,
}

impl Kind {
    /// Subdirectory name under the rendezvous root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Kind::Requests => "requests",
            Kind::Responses => "responses",
            Kind::Processed => "processed",
        }
    }
}

/// Counters reported by [`RendezvousStore::status`].
#[derive(Debug, Clone, Default)]
pub struct StoreStatus {
    /// Committed request files not yet consumed.
    pub pending_requests: usize,
    /// Committed response files not yet consumed.
    pub pending_responses: usize,
    /// Archived requests.
    pub processed: usize,
    /// Age of the oldest pending request, if any.
    pub oldest_pending: Option<Duration>,
}

/// Handle to a rendezvous directory.
///
/// Cloneable only by wrapping in `Arc`; the seen-set used by [`claim`]
/// is per-instance state.
///
/// [`claim`]: RendezvousStore::claim
pub struct RendezvousStore {
    root: PathBuf,
    /// Ids already handed out by `claim`, per kind is unnecessary: ids are
    /// unique across the root's lifetime.
    seen: Mutex<HashSet<String>>,
}

impl RendezvousStore {
    /// Open a store rooted at `root`, creating the directory layout.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for kind in [Kind::Requests, Kind::Responses, Kind::Processed] {
            fs::create_dir_all(root.join(kind.dir_name()))
                .map_err(|source| StoreError::Io {
                    path: root.join(kind.dir_name()),
                    source,
                })?;
        }
        fs::create_dir_all(root.join("logs")).map_err(|source| StoreError::Io {
            path: root.join("logs"),
            source,
        })?;
        debug!(root = %root.display(), "rendezvous store opened");
        Ok(Self {
            root,
            seen: Mutex::new(HashSet::new()),
        })
    }

    /// The rendezvous root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a kind.
    pub fn dir(&self, kind: Kind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Committed path for an id.
    pub fn committed_path(&self, kind: Kind, id: &str) -> PathBuf {
        self.dir(kind).join(format!("{id}.json"))
    }

    fn staging_path(&self, kind: Kind, id: &str) -> PathBuf {
        self.dir(kind).join(format!("{id}.json.tmp"))
    }

    /// Atomically publish an envelope.
    ///
    /// Stages to `<kind>/<id>.json.tmp`, flushes the file and its parent
    /// directory, then renames into place. Publishing an id that is already
    /// committed fails with [`StoreError::Duplicate`]: a repeated correlation
    /// id is an invariant violation, not a retry.
    pub fn publish(&self, kind: Kind, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let final_path = self.committed_path(kind, id);
        if final_path.exists() {
            return Err(StoreError::Duplicate {
                id: id.to_string(),
                path: final_path,
            });
        }

        let staging = self.staging_path(kind, id);
        let mut file = File::create(&staging).map_err(|source| StoreError::Io {
            path: staging.clone(),
            source,
        })?;
        file.write_all(bytes).map_err(|source| StoreError::Io {
            path: staging.clone(),
            source,
        })?;
        file.sync_all().map_err(|source| StoreError::Io {
            path: staging.clone(),
            source,
        })?;

        fs::rename(&staging, &final_path).map_err(|source| StoreError::Io {
            path: final_path.clone(),
            source,
        })?;
        sync_dir(&self.dir(kind));

        trace!(id, kind = kind.dir_name(), "published");
        Ok(())
    }

    /// Read a committed envelope.
    pub fn read(&self, kind: Kind, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.committed_path(kind, id);
        fs::read(&path).map_err(|source| StoreError::Io { path, source })
    }

    /// Return one committed id the store has not handed out before.
    ///
    /// Enumeration is lexicographic; `*.tmp` staging files are never
    /// returned. `None` means nothing new is committed right now.
    pub fn claim(&self, kind: Kind) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        let mut seen = self.seen.lock().expect("seen set poisoned");
        for id in self.list_ids(kind)? {
            if seen.contains(&id) {
                continue;
            }
            match self.read(kind, &id) {
                Ok(bytes) => {
                    seen.insert(id.clone());
                    return Ok(Some((id, bytes)));
                }
                // Committed file vanished between listing and read: another
                // process archived it. Skip, do not mark seen.
                Err(StoreError::Io { ref source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Forget a claimed id so a later [`claim`] can return it again.
    ///
    /// Used when handling fails before any response is published.
    ///
    /// [`claim`]: RendezvousStore::claim
    pub fn unclaim(&self, id: &str) {
        self.seen.lock().expect("seen set poisoned").remove(id);
    }

    /// Block until `<kind>/<id>.json` is committed or the deadline passes.
    ///
    /// Wakes on a filesystem event from a [`DirWatcher`] when the platform
    /// provides one, and polls every 200 ms regardless, which keeps the
    /// ≤250 ms latency bound even when the watcher is degraded.
    pub async fn wait_for(
        &self,
        kind: Kind,
        id: &str,
        deadline: Instant,
    ) -> Result<Vec<u8>, StoreError> {
        let path = self.committed_path(kind, id);
        let mut watcher = DirWatcher::new(self.dir(kind));

        loop {
            if path.exists() {
                return fs::read(&path).map_err(|source| StoreError::Io {
                    path: path.clone(),
                    source,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Timeout { id: id.to_string() });
            }
            let tick = Duration::from_millis(200).min(deadline - now);
            watcher.changed(tick).await;
        }
    }

    /// Remove a committed file (proxy side consumption).
    pub fn consume(&self, kind: Kind, id: &str) -> Result<(), StoreError> {
        let path = self.committed_path(kind, id);
        fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })
    }

    /// Move a request into `processed/` (forwarder side consumption).
    ///
    /// Returns `Ok(false)` when the request file is already gone — another
    /// forwarder won the race and the move is moot.
    pub fn archive(&self, id: &str) -> Result<bool, StoreError> {
        let from = self.committed_path(Kind::Requests, id);
        let to = self.committed_path(Kind::Processed, id);
        match fs::rename(&from, &to) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(id, "request already archived by another process");
                Ok(false)
            }
            Err(source) => Err(StoreError::Io { path: from, source }),
        }
    }

    /// Request ids older than `max_age` with no committed response and no
    /// processed entry. These are orphans left by disconnected clients.
    pub fn sweep(&self, max_age: Duration) -> Result<Vec<String>, StoreError> {
        let now = SystemTime::now();
        let mut stale = Vec::new();
        for id in self.list_ids(Kind::Requests)? {
            if self.committed_path(Kind::Responses, &id).exists()
                || self.committed_path(Kind::Processed, &id).exists()
            {
                continue;
            }
            let path = self.committed_path(Kind::Requests, &id);
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            if age > max_age {
                stale.push(id);
            }
        }
        Ok(stale)
    }

    /// Response ids older than `max_age` that nothing is waiting on.
    ///
    /// The proxy deletes each response moments after it commits; one that
    /// has sat for longer than the stale ceiling belongs to an abandoned
    /// flow (client disconnect, proxy exit) and will never be consumed.
    pub fn sweep_orphan_responses(&self, max_age: Duration) -> Result<Vec<String>, StoreError> {
        let now = SystemTime::now();
        let mut orphans = Vec::new();
        for id in self.list_ids(Kind::Responses)? {
            let path = self.committed_path(Kind::Responses, &id);
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            if age > max_age {
                orphans.push(id);
            }
        }
        Ok(orphans)
    }

    /// Delete staging files older than `grace` in every kind directory.
    ///
    /// These are debris from writers that crashed between staging and
    /// rename; no reader ever opens them.
    pub fn sweep_tmp(&self, grace: Duration) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for kind in [Kind::Requests, Kind::Responses, Kind::Processed] {
            let dir = self.dir(kind);
            let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                    continue;
                }
                let old_enough = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .is_some_and(|age| age > grace);
                if old_enough && fs::remove_file(&path).is_ok() {
                    debug!(path = %path.display(), "removed orphaned staging file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Gather the counters shown by `wonder_status`.
    pub fn status(&self) -> Result<StoreStatus, StoreError> {
        let requests = self.list_ids(Kind::Requests)?;
        let now = SystemTime::now();
        let oldest_pending = requests
            .iter()
            .filter_map(|id| fs::metadata(self.committed_path(Kind::Requests, id)).ok())
            .filter_map(|meta| meta.modified().ok())
            .filter_map(|mtime| now.duration_since(mtime).ok())
            .max();

        Ok(StoreStatus {
            pending_requests: requests.len(),
            pending_responses: self.list_ids(Kind::Responses)?.len(),
            processed: self.list_ids(Kind::Processed)?.len(),
            oldest_pending,
        })
    }

    /// Committed ids for a kind, lexicographically sorted, `*.tmp` skipped.
    pub fn list_ids(&self, kind: Kind) -> Result<Vec<String>, StoreError> {
        let dir = self.dir(kind);
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut ids: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Flush a directory so a just-renamed entry survives power loss.
///
/// Failure is non-fatal: some filesystems refuse fsync on directories, and
/// the rename itself already gives readers the partial-write guarantee.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            trace!(dir = %dir.display(), error = %e, "directory fsync unsupported");
        }
    }
}
