//! External memory: tiered context snapshots for handoff between workers.
//!
//! Snapshots are JSON files at `<root>/<task>/<snapshot>.json`. A handoff is
//! verified against the digests recorded at compression time, so a snapshot
//! edited or truncated on disk fails its transfer check.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::{CoordError, Result};
use super::task::{generate_id, validate_id};
use crate::config::MemoryConfig;

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Constant context, preloaded into the receiver's working state.
    Critical,
    Important,
    Reference,
    /// Addressable on demand, never preloaded.
    Archive,
}

impl MemoryTier {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryTier::Critical => "critical",
            MemoryTier::Important => "important",
            MemoryTier::Reference => "reference",
            MemoryTier::Archive => "archive",
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of a worker's context with its access count over the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextElement {
    pub key: String,
    pub content: String,
    #[serde(default)]
    pub accesses: u32,
}

/// Everything the producing worker held, as submitted for compression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullContext {
    pub producer: String,
    /// Number of observations the access counts were taken over.
    pub window: u32,
    pub elements: Vec<ContextElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub content: String,
    pub digest: String,
    pub preload: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: String,
    pub tier: MemoryTier,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMemorySnapshot {
    pub id: String,
    pub task_id: String,
    pub producer: String,
    #[serde(default)]
    pub consumer: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
    /// Every critical entry was non-empty and unambiguous at compression.
    pub complete: bool,
    pub tiers: BTreeMap<MemoryTier, Vec<MemoryEntry>>,
    pub manifest: Vec<ManifestEntry>,
}

impl ExternalMemorySnapshot {
    pub fn entries(&self, tier: MemoryTier) -> &[MemoryEntry] {
        self.tiers.get(&tier).map_or(&[], Vec::as_slice)
    }

    /// Entries the receiver loads before starting work.
    pub fn preloaded(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.tiers.values().flatten().filter(|e| e.preload)
    }

    pub fn entry_count(&self) -> usize {
        self.tiers.values().map(Vec::len).sum()
    }

    pub fn is_claimed(&self) -> bool {
        self.consumer.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    Missing,
    Empty,
    DigestMismatch,
    Ambiguous,
    ProducerMismatch,
    AlreadyClaimed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryGap {
    pub key: String,
    pub kind: GapKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReport {
    pub snapshot_id: String,
    pub from: String,
    pub to: String,
    pub critical_total: usize,
    pub critical_verified: usize,
    pub ratio: f64,
    pub gaps: Vec<MemoryGap>,
    pub accepted: bool,
}

pub fn digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct ExternalMemoryStore {
    root: PathBuf,
    config: MemoryConfig,
}

impl ExternalMemoryStore {
    pub fn new(root: impl Into<PathBuf>, config: MemoryConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Tier for an access ratio (accesses / window).
    pub fn classify(&self, ratio: f64) -> MemoryTier {
        if ratio + EPS >= self.config.critical_ratio {
            MemoryTier::Critical
        } else if ratio + EPS >= self.config.important_ratio {
            MemoryTier::Important
        } else if ratio + EPS >= self.config.reference_ratio {
            MemoryTier::Reference
        } else {
            MemoryTier::Archive
        }
    }

    fn is_ambiguous(&self, content: &str) -> bool {
        self.config
            .ambiguity_markers
            .iter()
            .any(|m| !m.is_empty() && content.contains(m.as_str()))
    }

    /// Compress a full context into a tiered snapshot and persist it.
    pub fn compress(&self, task_id: &str, context: &FullContext) -> Result<ExternalMemorySnapshot> {
        validate_id(task_id)?;
        let window = f64::from(context.window.max(1));
        let mut tiers: BTreeMap<MemoryTier, Vec<MemoryEntry>> = BTreeMap::new();
        let mut manifest = Vec::with_capacity(context.elements.len());

        for element in &context.elements {
            let ratio = f64::from(element.accesses) / window;
            let tier = self.classify(ratio.min(1.0));
            let entry = MemoryEntry {
                key: element.key.clone(),
                content: element.content.clone(),
                digest: digest(&element.content),
                preload: tier == MemoryTier::Critical,
            };
            manifest.push(ManifestEntry {
                key: entry.key.clone(),
                tier,
                digest: entry.digest.clone(),
            });
            tiers.entry(tier).or_default().push(entry);
        }

        let mut snapshot = ExternalMemorySnapshot {
            id: generate_id("ms"),
            task_id: task_id.to_string(),
            producer: context.producer.clone(),
            consumer: None,
            created_at: Utc::now(),
            consumed_at: None,
            complete: false,
            tiers,
            manifest,
        };
        snapshot.complete = self.critical_gaps(&snapshot).is_empty();
        self.save(&snapshot)?;
        info!(
            task = task_id,
            snapshot = %snapshot.id,
            entries = snapshot.entry_count(),
            critical = snapshot.entries(MemoryTier::Critical).len(),
            complete = snapshot.complete,
            "context compressed"
        );
        Ok(snapshot)
    }

    fn path_for(&self, task_id: &str, snapshot_id: &str) -> PathBuf {
        self.root.join(task_id).join(format!("{snapshot_id}.json"))
    }

    pub fn save(&self, snapshot: &ExternalMemorySnapshot) -> Result<()> {
        validate_id(&snapshot.task_id)?;
        validate_id(&snapshot.id)?;
        let path = self.path_for(&snapshot.task_id, &snapshot.id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| CoordError::io(dir, e))?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&path, json).map_err(|e| CoordError::io(&path, e))
    }

    pub fn load(&self, task_id: &str, snapshot_id: &str) -> Result<ExternalMemorySnapshot> {
        validate_id(task_id)?;
        validate_id(snapshot_id)?;
        let path = self.path_for(task_id, snapshot_id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoordError::SnapshotNotFound(snapshot_id.to_string()));
            }
            Err(e) => return Err(CoordError::io(&path, e)),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// Snapshot ids stored for a task, oldest file name first.
    pub fn list(&self, task_id: &str) -> Result<Vec<String>> {
        validate_id(task_id)?;
        let dir = self.root.join(task_id);
        let read = match std::fs::read_dir(&dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoordError::io(&dir, e)),
        };
        let mut ids: Vec<String> = read
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Check every critical manifest entry against the snapshot body.
    fn critical_gaps(&self, snapshot: &ExternalMemorySnapshot) -> Vec<MemoryGap> {
        let mut by_key: BTreeMap<&str, Vec<&MemoryEntry>> = BTreeMap::new();
        for entry in snapshot.tiers.values().flatten() {
            by_key.entry(entry.key.as_str()).or_default().push(entry);
        }

        let mut gaps = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for item in snapshot.manifest.iter().filter(|m| m.tier == MemoryTier::Critical) {
            if !seen.insert(item.key.as_str()) {
                continue;
            }
            let gap = |kind, detail: String| MemoryGap {
                key: item.key.clone(),
                kind,
                detail,
            };
            let Some(entries) = by_key.get(item.key.as_str()) else {
                gaps.push(gap(GapKind::Missing, "entry not present in snapshot".into()));
                continue;
            };
            let first = entries[0];
            if entries.iter().any(|e| e.content != first.content) {
                gaps.push(gap(
                    GapKind::Ambiguous,
                    format!("{} conflicting values", entries.len()),
                ));
            } else if first.content.trim().is_empty() {
                gaps.push(gap(GapKind::Empty, "content is empty".into()));
            } else if digest(&first.content) != item.digest {
                gaps.push(gap(
                    GapKind::DigestMismatch,
                    "content changed since compression".into(),
                ));
            } else if self.is_ambiguous(&first.content) {
                gaps.push(gap(GapKind::Ambiguous, unresolved_marker(&first.content)));
            }
        }
        gaps
    }

    /// Verify a snapshot for handoff from `from` to `to`. Re-reads the
    /// snapshot from disk. Does not claim it.
    pub fn transfer(
        &self,
        task_id: &str,
        snapshot_id: &str,
        from: &str,
        to: &str,
    ) -> Result<TransferReport> {
        let snapshot = self.load(task_id, snapshot_id)?;
        let mut gaps = Vec::new();

        if snapshot.producer != from {
            gaps.push(MemoryGap {
                key: String::new(),
                kind: GapKind::ProducerMismatch,
                detail: format!("produced by {}, not {from}", snapshot.producer),
            });
        }
        if let Some(consumer) = &snapshot.consumer {
            gaps.push(MemoryGap {
                key: String::new(),
                kind: GapKind::AlreadyClaimed,
                detail: format!("already claimed by {consumer}"),
            });
        }
        let blocking = !gaps.is_empty();

        let mut critical_keys: Vec<&str> = snapshot
            .manifest
            .iter()
            .filter(|m| m.tier == MemoryTier::Critical)
            .map(|m| m.key.as_str())
            .collect();
        critical_keys.sort_unstable();
        critical_keys.dedup();
        let critical_total = critical_keys.len();

        let entry_gaps = self.critical_gaps(&snapshot);
        let critical_verified = critical_total - entry_gaps.len();
        #[allow(clippy::cast_precision_loss)]
        let ratio = if critical_total == 0 {
            1.0
        } else {
            critical_verified as f64 / critical_total as f64
        };
        gaps.extend(entry_gaps);

        let accepted = !blocking && ratio + EPS >= self.config.critical_presence_ratio;
        let report = TransferReport {
            snapshot_id: snapshot.id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            critical_total,
            critical_verified,
            ratio,
            gaps,
            accepted,
        };
        if report.accepted {
            debug!(snapshot = %report.snapshot_id, ratio, "transfer verified");
        } else {
            warn!(
                snapshot = %report.snapshot_id,
                ratio,
                gaps = report.gaps.len(),
                "transfer incomplete; handoff blocked"
            );
        }
        Ok(report)
    }

    /// Mark a snapshot as read by its receiving worker. Only once.
    pub fn claim(&self, task_id: &str, snapshot_id: &str, worker: &str) -> Result<ExternalMemorySnapshot> {
        let mut snapshot = self.load(task_id, snapshot_id)?;
        if let Some(consumer) = &snapshot.consumer {
            return Err(CoordError::SnapshotClaimed {
                snapshot: snapshot_id.to_string(),
                consumer: consumer.clone(),
            });
        }
        snapshot.consumer = Some(worker.to_string());
        snapshot.consumed_at = Some(Utc::now());
        self.save(&snapshot)?;
        info!(snapshot = snapshot_id, worker, "snapshot claimed");
        Ok(snapshot)
    }
}

fn unresolved_marker(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or_default();
    let excerpt: String = first_line.chars().take(40).collect();
    format!("unresolved marker in {excerpt:?}")
}
