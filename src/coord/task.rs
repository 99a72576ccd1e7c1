//! Task, attempt and score types shared by every coordination component.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::{CoordError, Result};
use super::evidence::{EvidenceBundle, EvidenceCategory};
use super::recovery::OverloadSignal;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Escalated,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Escalated => "escalated",
        }
    }

    /// Completed, failed and escalated tasks are archived; nothing else may
    /// happen to them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Escalated
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw structural counts describing a task.
///
/// Signed so malformed input (negative counts) can be represented and then
/// clamped by the assessor instead of being rejected at the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralSignals {
    #[serde(default)]
    pub requirements: i64,
    #[serde(default)]
    pub interdependencies: i64,
    #[serde(default)]
    pub context_switches: i64,
    #[serde(default)]
    pub validation_checkpoints: i64,
}

impl StructuralSignals {
    pub fn new(
        requirements: i64,
        interdependencies: i64,
        context_switches: i64,
        validation_checkpoints: i64,
    ) -> Self {
        Self {
            requirements,
            interdependencies,
            context_switches,
            validation_checkpoints,
        }
    }
}

/// Weighted contribution of each factor to the raw score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorBreakdown {
    pub requirements: f64,
    pub interdependencies: f64,
    pub context_switches: f64,
    pub validation: f64,
}

/// Output of the complexity assessor: integer band plus its audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityScore {
    pub band: u8,
    pub raw: f64,
    pub factors: FactorBreakdown,
    /// Signals after clamping.
    pub signals: StructuralSignals,
    /// Inputs that were malformed and clamped to zero.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clamped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub text: String,
    pub category: EvidenceCategory,
}

impl AcceptanceCriterion {
    pub fn new(id: impl Into<String>, text: impl Into<String>, category: EvidenceCategory) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            category,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    FalseCompletionSuspected,
    OverloadDetected,
    Escalated,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::FalseCompletionSuspected => "false-completion-suspected",
            AttemptOutcome::OverloadDetected => "overload-detected",
            AttemptOutcome::Escalated => "escalated",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity tier an attempt ran at, derived from the planner decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityTier {
    Direct,
    MemorySupported,
    Decomposed,
    Escalated,
}

impl CapacityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CapacityTier::Direct => "direct",
            CapacityTier::MemorySupported => "memory_supported",
            CapacityTier::Decomposed => "decomposed",
            CapacityTier::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for CapacityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (worker type, tier) pair the anti-loop rule compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub worker_type: String,
    pub tier: CapacityTier,
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.worker_type, self.tier)
    }
}

/// One finished attempt. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub worker: String,
    pub worker_type: String,
    pub tier: CapacityTier,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub evidence: EvidenceBundle,
    /// Facts the worker asserts about the task context at report time.
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub signals: Vec<OverloadSignal>,
}

impl AttemptRecord {
    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            worker_type: self.worker_type.clone(),
            tier: self.tier,
        }
    }
}

/// Returned by `assign`; identifies the single open attempt on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub task_id: TaskId,
    pub attempt_id: String,
    pub worker: String,
    pub worker_type: String,
    pub tier: CapacityTier,
    #[serde(default)]
    pub snapshot: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

impl WorkerHandle {
    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            worker_type: self.worker_type.clone(),
            tier: self.tier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub score: ComplexityScore,
    pub status: TaskStatus,
    #[serde(default)]
    pub criteria: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Latest external memory snapshot attached to this task.
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub parent: Option<TaskId>,
    #[serde(default)]
    pub children: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn complexity(&self) -> u8 {
        self.score.band
    }

    pub fn last_attempt_by(&self, worker: &str) -> Option<&AttemptRecord> {
        self.attempts.iter().rev().find(|a| a.worker == worker)
    }

    pub fn attempt(&self, attempt_id: &str) -> Option<&AttemptRecord> {
        self.attempts.iter().find(|a| a.attempt_id == attempt_id)
    }
}

/// Submission request for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<TaskId>,
    pub description: String,
    #[serde(default)]
    pub signals: StructuralSignals,
    #[serde(default)]
    pub criteria: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub parent: Option<TaskId>,
}

impl NewTask {
    pub fn new(description: impl Into<String>, signals: StructuralSignals) -> Self {
        Self {
            description: description.into(),
            signals,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Add an acceptance criterion; ids are assigned in order (`c1`, `c2`, ...).
    pub fn criterion(mut self, category: EvidenceCategory, text: &str) -> Self {
        let id = format!("c{}", self.criteria.len() + 1);
        self.criteria.push(AcceptanceCriterion::new(id, text, category));
        self
    }
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a short random identifier such as `tk-3f9a2c`.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| char::from(ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())]))
        .collect();
    format!("{prefix}-{suffix}")
}

/// Validate a task, attempt or snapshot identifier.
///
/// Identifiers become file names and CLI arguments, so they are limited to
/// ASCII alphanumerics, `-` and `_`, must not start with `-`, and are at most
/// 64 bytes.
pub fn validate_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        Some("must not be empty")
    } else if id.len() > 64 {
        Some("must be at most 64 characters")
    } else if id.starts_with('-') {
        Some("must not start with '-'")
    } else if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        Some("only ASCII letters, digits, '-' and '_' are allowed")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(CoordError::InvalidId {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
