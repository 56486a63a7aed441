//! Filesystem-event wakeups for rendezvous waits.
//!
//! Wraps a `notify` watcher so waiters can sleep until the watched directory
//! changes instead of spinning. The watcher is best-effort: if the platform
//! backend cannot be created (exotic filesystems, watch limits), waiters
//! silently fall back to pure polling, which the store caps at 200 ms.

use std::path::PathBuf;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

/// Event-driven wakeup source for one directory.
pub struct DirWatcher {
    /// Keeps the platform watcher alive; `None` when polling-only.
    _watcher: Option<RecommendedWatcher>,
    events: Option<mpsc::UnboundedReceiver<()>>,
}

impl DirWatcher {
    /// Watch `dir` for any change. Never fails: on watcher errors the
    /// instance degrades to a pure timer.
    pub fn new(dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                // Receiver gone just means the wait finished first.
                let _ = tx.send(());
            }
        })
        .and_then(|mut w| {
            w.watch(&dir, RecursiveMode::NonRecursive)?;
            Ok(w)
        });

        match watcher {
            Ok(w) => Self {
                _watcher: Some(w),
                events: Some(rx),
            },
            Err(e) => {
                debug!(error = %e, "file-event watcher unavailable, polling only");
                Self {
                    _watcher: None,
                    events: None,
                }
            }
        }
    }

    /// Wait until the directory changes or `max_wait` elapses, whichever
    /// comes first. Callers re-check their condition after every return.
    pub async fn changed(&mut self, max_wait: Duration) {
        match self.events.as_mut() {
            Some(rx) => {
                let _ = tokio::time::timeout(max_wait, rx.recv()).await;
            }
            None => tokio::time::sleep(max_wait).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_changed_returns_after_timeout_without_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DirWatcher::new(dir.path().to_path_buf());

        let start = Instant::now();
        watcher.changed(Duration::from_millis(100)).await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_changed_wakes_on_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DirWatcher::new(dir.path().to_path_buf());

        let file = dir.path().join("new.json");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(file, b"x").unwrap();
        });

        // Either the event fires early or the timeout lapses; both are
        // acceptable, the store re-checks existence in its loop.
        watcher.changed(Duration::from_millis(500)).await;
    }
}
