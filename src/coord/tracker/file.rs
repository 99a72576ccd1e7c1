use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use super::{TicketTracker, check_next_seq, last_seq};
use crate::coord::error::{CoordError, Result};
use crate::coord::ledger::LedgerEntry;
use crate::coord::task::validate_id;

const LOCK_RETRY_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);
/// A lock older than this is left over from a crashed process.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// One JSON-lines file per task under a directory.
///
/// Appends take `<task>.lock` (created exclusively) around the
/// read-check-append, so two processes cannot both write the next sequence
/// number.
#[derive(Debug, Clone)]
pub struct FileTracker {
    dir: PathBuf,
}

impl FileTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, task_id: &str) -> Result<PathBuf> {
        validate_id(task_id)?;
        Ok(self.dir.join(format!("{task_id}.jsonl")))
    }

    fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoordError::io(path, e)),
        };
        let mut entries = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping malformed ledger line"),
            }
        }
        Ok(entries)
    }
}

/// Exclusive per-task append lock. Removed on drop.
#[derive(Debug)]
struct AppendLock {
    path: PathBuf,
}

impl AppendLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        for attempt in 0..LOCK_RETRY_ATTEMPTS {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    debug!(lock = %path.display(), "ledger lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        info!(lock = %path.display(), "removing stale ledger lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if attempt + 1 < LOCK_RETRY_ATTEMPTS {
                        std::thread::sleep(LOCK_RETRY_DELAY);
                    }
                }
                Err(e) => return Err(CoordError::io(&path, e)),
            }
        }
        Err(CoordError::Tracker(format!(
            "{} is held by another relay process",
            path.display()
        )))
    }
}

impl Drop for AppendLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

impl TicketTracker for FileTracker {
    fn name(&self) -> &'static str {
        "file"
    }

    fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let path = self.path_for(&entry.task_id)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| CoordError::io(&self.dir, e))?;
        let _lock = AppendLock::acquire(self.dir.join(format!("{}.lock", entry.task_id)))?;

        check_next_seq(entry, last_seq(&Self::read_entries(&path)?))?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CoordError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| CoordError::io(&path, e))
    }

    fn entries(&self, task_id: &str) -> Result<Vec<LedgerEntry>> {
        Self::read_entries(&self.path_for(task_id)?)
    }

    fn task_ids(&self) -> Result<Vec<String>> {
        let read = match std::fs::read_dir(&self.dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoordError::io(&self.dir, e)),
        };
        let mut ids: Vec<String> = read
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .strip_suffix(".jsonl")
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::coord::ledger::{Event, Ledger};
    use crate::coord::task::TaskStatus;

    fn entry(task: &str, seq: u64) -> LedgerEntry {
        LedgerEntry {
            task_id: task.into(),
            seq,
            event_type: "status_changed".into(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"from": "pending", "to": "assigned", "reason": "test"}),
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path().join("ledger"));
        tracker.append(&entry("tk-a", 1)).unwrap();
        tracker.append(&entry("tk-a", 2)).unwrap();
        tracker.append(&entry("tk-b", 1)).unwrap();

        let entries = tracker.entries("tk-a").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].seq, 2);
        assert_eq!(tracker.task_ids().unwrap(), vec!["tk-a", "tk-b"]);
    }

    #[test]
    fn missing_task_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        assert!(tracker.entries("tk-none").unwrap().is_empty());
        assert!(FileTracker::new(dir.path().join("nope")).task_ids().unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        tracker.append(&entry("tk-a", 1)).unwrap();
        let path = dir.path().join("tk-a.jsonl");
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{not json\n");
        std::fs::write(&path, contents).unwrap();
        tracker.append(&entry("tk-a", 2)).unwrap();
        assert_eq!(tracker.entries("tk-a").unwrap().len(), 2);
    }

    fn change(reason: &str) -> Event {
        Event::StatusChanged {
            from: TaskStatus::Pending,
            to: TaskStatus::Assigned,
            reason: reason.into(),
        }
    }

    #[test]
    fn append_rejects_a_stale_sequence_number() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        tracker.append(&entry("tk-a", 1)).unwrap();
        let err = tracker.append(&entry("tk-a", 1)).unwrap_err();
        assert!(matches!(
            err,
            CoordError::Conflict {
                expected: 2,
                attempted: 1,
                ..
            }
        ));
        assert!(tracker.append(&entry("tk-a", 3)).is_err());
        assert_eq!(tracker.entries("tk-a").unwrap().len(), 1);
        assert!(!dir.path().join("tk-a.lock").exists());
    }

    #[test]
    fn second_writer_from_the_same_snapshot_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = Ledger::new(Box::new(FileTracker::new(dir.path())));
        let reporter = Ledger::new(Box::new(FileTracker::new(dir.path())));
        let mut seen_by_watcher = watcher.load_state("tk-a").unwrap();
        let mut seen_by_reporter = reporter.load_state("tk-a").unwrap();

        reporter.record(&mut seen_by_reporter, change("report")).unwrap();
        let err = watcher
            .record(&mut seen_by_watcher, change("timeout sweep"))
            .unwrap_err();
        assert!(matches!(err, CoordError::Conflict { .. }));
        assert_eq!(seen_by_watcher.seq, 0);

        let entries = watcher.entries("tk-a").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["reason"], "report");
    }

    #[test]
    fn concurrent_writers_get_distinct_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let writers: Vec<_> = (0..4)
            .map(|n| {
                let path = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let ledger = Ledger::new(Box::new(FileTracker::new(path)));
                    for i in 0..5 {
                        loop {
                            let mut state = ledger.load_state("tk-a").unwrap();
                            match ledger.record(&mut state, change(&format!("w{n}-{i}"))) {
                                Ok(_) => break,
                                Err(CoordError::Conflict { .. }) => {}
                                Err(e) => panic!("unexpected ledger error: {e}"),
                            }
                        }
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let seqs: Vec<u64> = FileTracker::new(dir.path())
            .entries("tk-a")
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("tk-a.lock");
        std::fs::write(&lock, "4242\n").unwrap();
        let old = SystemTime::now() - LOCK_STALE_AFTER - Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(old)
            .unwrap();
        FileTracker::new(dir.path()).append(&entry("tk-a", 1)).unwrap();
        assert!(!lock.exists());
    }

    #[test]
    fn path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        assert!(tracker.entries("../etc/passwd").is_err());
    }
}
