//! Ticket tracker backends for the coordination ledger.
//!
//! A tracker is an append-only comment store keyed by task id. The ledger
//! owns the entry format; trackers only move entries in and out.

mod bones;
mod file;
mod http;
mod memory;

use std::path::Path;

pub use bones::{AdapterError, BonesTracker, parse_comments};
pub use file::FileTracker;
pub use http::HttpTracker;
pub use memory::InMemoryTracker;

use super::error::{CoordError, Result};
use super::ledger::LedgerEntry;
use crate::config::{Config, TrackerKind};

pub trait TicketTracker: Send + Sync {
    /// Backend name for logs and status output.
    fn name(&self) -> &'static str;

    /// Append one entry to the task's record. Rejects (`Conflict`) an entry
    /// whose `seq` is not one past the last recorded entry.
    fn append(&self, entry: &LedgerEntry) -> Result<()>;

    /// Every entry recorded for the task, in append order.
    fn entries(&self, task_id: &str) -> Result<Vec<LedgerEntry>>;

    /// Every task id with at least one entry.
    fn task_ids(&self) -> Result<Vec<String>> {
        Err(CoordError::Unsupported("listing tasks"))
    }
}

/// Highest sequence number among `entries`, 0 when empty.
pub(crate) fn last_seq(entries: &[LedgerEntry]) -> u64 {
    entries.iter().map(|e| e.seq).max().unwrap_or(0)
}

pub(crate) fn check_next_seq(entry: &LedgerEntry, last: u64) -> Result<()> {
    if entry.seq == last + 1 {
        Ok(())
    } else {
        Err(CoordError::Conflict {
            task: entry.task_id.clone(),
            expected: last + 1,
            attempted: entry.seq,
        })
    }
}

/// Build the tracker configured in `[tracker]`.
pub fn from_config(config: &Config, root: &Path) -> Result<Box<dyn TicketTracker>> {
    let tracker = &config.tracker;
    Ok(match tracker.kind {
        TrackerKind::File => Box::new(FileTracker::new(config.ledger_dir(root))),
        TrackerKind::Bones => Box::new(BonesTracker::new(tracker.workspace.clone(), tracker.timeout_secs)),
        TrackerKind::Http => {
            let url = tracker
                .url
                .as_deref()
                .ok_or_else(|| CoordError::InvalidInput("tracker.url is required for the http tracker".into()))?;
            let token = match &tracker.token_env {
                Some(var) => Some(std::env::var(var).map_err(|_| {
                    CoordError::InvalidInput(format!("tracker token variable {var} is not set"))
                })?),
                None => None,
            };
            Box::new(HttpTracker::new(url, token, tracker.timeout_secs))
        }
    })
}
