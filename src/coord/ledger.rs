//! The append-only coordination ledger and state replay.
//!
//! Every decision, assignment, attempt, transition and verdict is an `Event`.
//! Events are stored as `LedgerEntry` rows (`taskId`, `seq`, `eventType`,
//! `timestamp`, `payload`) in a ticket tracker. `TaskState` is a pure fold
//! over a task's entries; the coordinator keeps no other state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{FailureKind, Result};
use super::memory::TransferReport;
use super::planner::PlanDecision;
use super::recovery::{RecoveryState, Transition};
use super::task::{AttemptKey, AttemptOutcome, AttemptRecord, Task, TaskId, TaskStatus, WorkerHandle};
use super::tracker::TicketTracker;
use super::validator::{Verdict, VerdictRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload", rename_all = "snake_case")]
pub enum Event {
    TaskSubmitted {
        task: Task,
    },
    Planned {
        plan: PlanDecision,
    },
    Decomposed {
        children: Vec<TaskId>,
    },
    MemoryCompressed {
        snapshot_id: String,
        producer: String,
        complete: bool,
    },
    MemoryTransferred {
        report: TransferReport,
    },
    Assigned {
        handle: WorkerHandle,
    },
    AttemptStarted {
        attempt_id: String,
        started_at: DateTime<Utc>,
    },
    AttemptRecorded {
        attempt: AttemptRecord,
    },
    Verdict {
        verdict: VerdictRecord,
    },
    Recovery {
        transition: Transition,
        #[serde(default)]
        plan: Option<PlanDecision>,
    },
    Failure {
        kind: FailureKind,
        detail: String,
        #[serde(default)]
        key: Option<AttemptKey>,
    },
    StatusChanged {
        from: TaskStatus,
        to: TaskStatus,
        reason: String,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::TaskSubmitted { .. } => "task_submitted",
            Event::Planned { .. } => "planned",
            Event::Decomposed { .. } => "decomposed",
            Event::MemoryCompressed { .. } => "memory_compressed",
            Event::MemoryTransferred { .. } => "memory_transferred",
            Event::Assigned { .. } => "assigned",
            Event::AttemptStarted { .. } => "attempt_started",
            Event::AttemptRecorded { .. } => "attempt_recorded",
            Event::Verdict { .. } => "verdict",
            Event::Recovery { .. } => "recovery",
            Event::Failure { .. } => "failure",
            Event::StatusChanged { .. } => "status_changed",
        }
    }
}

/// One immutable row in a task's ticket record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub task_id: TaskId,
    pub seq: u64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl LedgerEntry {
    pub fn new(task_id: &str, seq: u64, event: &Event, timestamp: DateTime<Utc>) -> Result<Self> {
        let mut value = serde_json::to_value(event)?;
        let payload = value
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or_default();
        Ok(Self {
            task_id: task_id.to_string(),
            seq,
            event_type: event.event_type().to_string(),
            timestamp,
            payload,
        })
    }

    pub fn event(&self) -> Result<Event> {
        let value = serde_json::json!({
            "eventType": self.event_type,
            "payload": self.payload,
        });
        Ok(serde_json::from_value(value)?)
    }
}

/// Everything known about one task, derived from its ledger entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskState {
    pub task_id: TaskId,
    pub task: Option<Task>,
    pub plan: Option<PlanDecision>,
    pub open_attempt: Option<WorkerHandle>,
    pub started_at: Option<DateTime<Utc>>,
    pub recovery: RecoveryState,
    /// Failed attempts, rejected verdicts and blocked handoffs.
    pub failures: u32,
    /// Anti-loop penalty steps taken on top of `failures`.
    pub loop_bumps: u32,
    /// (worker type, tier) of the most recent failure, cleared by a
    /// confirmed verdict.
    pub last_failed: Option<AttemptKey>,
    pub verdicts: Vec<VerdictRecord>,
    /// Successful attempt waiting for an independent verdict.
    pub awaiting_validation: Option<String>,
    pub last_transfer: Option<TransferReport>,
    pub escalation: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Sequence number of the last applied entry.
    pub seq: u64,
}

impl TaskState {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            ..Self::default()
        }
    }

    /// Fold entries into state. Entries are applied in `seq` order; entries
    /// that do not decode are skipped but still advance `seq`. When two
    /// entries share a sequence number the first one appended wins.
    pub fn replay(task_id: &str, entries: &[LedgerEntry]) -> Self {
        let mut ordered: Vec<&LedgerEntry> = entries.iter().filter(|e| e.task_id == task_id).collect();
        ordered.sort_by_key(|e| e.seq);
        let mut state = Self::new(task_id);
        for entry in ordered {
            if entry.seq <= state.seq {
                warn!(
                    task = task_id,
                    seq = entry.seq,
                    event_type = %entry.event_type,
                    "skipping ledger entry with duplicate sequence number"
                );
                continue;
            }
            match entry.event() {
                Ok(event) => state.apply(&event, entry.seq, entry.timestamp),
                Err(e) => {
                    warn!(
                        task = task_id,
                        seq = entry.seq,
                        event_type = %entry.event_type,
                        error = %e,
                        "skipping undecodable ledger entry"
                    );
                    state.seq = entry.seq;
                }
            }
        }
        debug!(task = task_id, seq = state.seq, "state replayed");
        state
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.task.as_ref().map(|t| t.status)
    }

    /// Failure count fed into the planner's `prior-failure` modifier.
    pub fn planning_failures(&self) -> u32 {
        self.failures + self.loop_bumps
    }

    pub fn apply(&mut self, event: &Event, seq: u64, at: DateTime<Utc>) {
        self.seq = self.seq.max(seq);
        self.last_activity = Some(at);
        match event {
            Event::TaskSubmitted { task } => {
                self.task = Some(task.clone());
            }
            Event::Planned { plan } => {
                self.plan = Some(plan.clone());
            }
            Event::Decomposed { children } => {
                if let Some(task) = &mut self.task {
                    task.children.clone_from(children);
                }
            }
            Event::MemoryCompressed { snapshot_id, .. } => {
                if let Some(task) = &mut self.task {
                    task.snapshot = Some(snapshot_id.clone());
                }
            }
            Event::MemoryTransferred { report } => {
                // A snapshot that failed verification is never offered again.
                if let Some(task) = &mut self.task
                    && !report.accepted
                    && task.snapshot.as_deref() == Some(report.snapshot_id.as_str())
                {
                    task.snapshot = None;
                }
                self.last_transfer = Some(report.clone());
            }
            Event::Assigned { handle } => {
                if let (Some(task), Some(snapshot)) = (&mut self.task, &handle.snapshot) {
                    task.snapshot = Some(snapshot.clone());
                }
                self.open_attempt = Some(handle.clone());
                self.started_at = None;
            }
            Event::AttemptStarted {
                attempt_id,
                started_at,
            } => {
                if self
                    .open_attempt
                    .as_ref()
                    .is_some_and(|h| h.attempt_id == *attempt_id)
                {
                    self.started_at = Some(*started_at);
                }
            }
            Event::AttemptRecorded { attempt } => {
                if self
                    .open_attempt
                    .as_ref()
                    .is_some_and(|h| h.attempt_id == attempt.attempt_id)
                {
                    self.open_attempt = None;
                    self.started_at = None;
                }
                match attempt.outcome {
                    AttemptOutcome::Success => {
                        self.awaiting_validation = Some(attempt.attempt_id.clone());
                    }
                    AttemptOutcome::Cancelled => {}
                    _ => {
                        self.failures += 1;
                        self.last_failed = Some(attempt.key());
                    }
                }
                if let Some(task) = &mut self.task {
                    task.attempts.push(attempt.clone());
                }
            }
            Event::Verdict { verdict } => {
                if self.awaiting_validation.as_deref() == Some(verdict.attempt_id.as_str()) {
                    self.awaiting_validation = None;
                }
                match &verdict.verdict {
                    Verdict::Confirmed => self.last_failed = None,
                    Verdict::Rejected { .. } => {
                        self.failures += 1;
                        self.last_failed = self
                            .task
                            .as_ref()
                            .and_then(|t| t.attempt(&verdict.attempt_id))
                            .map(AttemptRecord::key);
                    }
                }
                self.verdicts.push(verdict.clone());
            }
            Event::Recovery { transition, plan } => {
                transition.apply(&mut self.recovery);
                if let Some(plan) = plan {
                    self.plan = Some(plan.clone());
                }
            }
            Event::Failure { kind, detail, key } => match kind {
                FailureKind::LoopDetected => self.loop_bumps += 1,
                FailureKind::MemoryTransferIncomplete if key.is_some() => {
                    self.failures += 1;
                    self.last_failed.clone_from(key);
                }
                FailureKind::CapacityExhausted => {
                    self.escalation = Some(detail.clone());
                }
                _ => {}
            },
            Event::StatusChanged { to, reason, .. } => {
                if let Some(task) = &mut self.task {
                    task.status = *to;
                }
                if *to == TaskStatus::Escalated && self.escalation.is_none() {
                    self.escalation = Some(reason.clone());
                }
            }
        }
    }
}

/// Writes events through a tracker and replays them into `TaskState`.
pub struct Ledger {
    tracker: Box<dyn TicketTracker>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("tracker", &self.tracker.name())
            .finish()
    }
}

impl Ledger {
    pub fn new(tracker: Box<dyn TicketTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker_name(&self) -> &'static str {
        self.tracker.name()
    }

    /// Append an event, then fold it into `state`. The state only changes
    /// once the tracker has accepted the entry.
    pub fn record(&self, state: &mut TaskState, event: Event) -> Result<LedgerEntry> {
        let now = Utc::now();
        let entry = LedgerEntry::new(&state.task_id, state.seq + 1, &event, now)?;
        self.tracker.append(&entry)?;
        debug!(
            task = %state.task_id,
            seq = entry.seq,
            event_type = %entry.event_type,
            "ledger entry recorded"
        );
        state.apply(&event, entry.seq, now);
        Ok(entry)
    }

    pub fn entries(&self, task_id: &str) -> Result<Vec<LedgerEntry>> {
        self.tracker.entries(task_id)
    }

    pub fn load_state(&self, task_id: &str) -> Result<TaskState> {
        let entries = self.tracker.entries(task_id)?;
        Ok(TaskState::replay(task_id, &entries))
    }

    pub fn task_ids(&self) -> Result<Vec<String>> {
        self.tracker.task_ids()
    }
}
