use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{TicketTracker, check_next_seq, last_seq};
use crate::coord::error::{CoordError, Result};
use crate::coord::ledger::LedgerEntry;

/// Process-local tracker for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    entries: Mutex<BTreeMap<String, Vec<LedgerEntry>>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<LedgerEntry>>>> {
        self.entries
            .lock()
            .map_err(|_| CoordError::Tracker("in-memory tracker lock poisoned".into()))
    }
}

impl TicketTracker for InMemoryTracker {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let mut entries = self.lock()?;
        let log = entries.entry(entry.task_id.clone()).or_default();
        check_next_seq(entry, last_seq(log))?;
        log.push(entry.clone());
        Ok(())
    }

    fn entries(&self, task_id: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self.lock()?.get(task_id).cloned().unwrap_or_default())
    }

    fn task_ids(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}
