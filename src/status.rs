//! Rendezvous directory inspection for `wonder_status`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::{RendezvousStore, StoreError, StoreStatus};

/// Snapshot of a rendezvous directory.
#[derive(Debug)]
pub struct StatusReport {
    /// The inspected root.
    pub shared_dir: PathBuf,
    /// Whether the root existed before inspection.
    pub exists: bool,
    /// Counters; `None` when the root did not exist.
    pub counts: Option<StoreStatus>,
}

/// Inspect a rendezvous directory without modifying it.
///
/// A missing directory is not an error — the report just says so. An
/// existing but unreadable directory is.
pub fn gather(shared_dir: &Path) -> Result<StatusReport, StoreError> {
    if !shared_dir.exists() {
        return Ok(StatusReport {
            shared_dir: shared_dir.to_path_buf(),
            exists: false,
            counts: None,
        });
    }

    // open() creates missing subdirectories, which doubles as the
    // readability check the exit code hinges on
    let store = RendezvousStore::open(shared_dir)?;
    Ok(StatusReport {
        shared_dir: shared_dir.to_path_buf(),
        exists: true,
        counts: Some(store.status()?),
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Della Wonders Status")?;
        writeln!(f, "===================")?;
        writeln!(f, "Shared directory: {}", self.shared_dir.display())?;
        writeln!(f, "Exists: {}", self.exists)?;

        match &self.counts {
            Some(counts) => {
                writeln!(f, "Pending requests:  {}", counts.pending_requests)?;
                writeln!(f, "Pending responses: {}", counts.pending_responses)?;
                writeln!(f, "Processed:         {}", counts.processed)?;
                match counts.oldest_pending {
                    Some(age) => {
                        writeln!(f, "Oldest pending:    {}", format_age(age))
                    }
                    None => writeln!(f, "Oldest pending:    -"),
                }
            }
            None => writeln!(
                f,
                "Shared directory does not exist. Run wonder_run or start_wonders to create it."
            ),
        }
    }
}

/// Render an age as a compact human figure.
fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
