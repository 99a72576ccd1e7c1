//! Error types for the coordination engine.
//!
//! `FailureKind` is the persisted failure taxonomy: every kind except
//! `AssessmentError` is written to the ticket record before any retry or
//! escalation decision is taken. `CoordError` covers operational refusals
//! and I/O problems returned to the caller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// Failure taxonomy recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed task input. Clamped, never fatal, never persisted as a failure.
    AssessmentError,
    /// No worker type can take the task even after decomposition.
    CapacityExhausted,
    /// Snapshot failed the completeness check; the handoff was blocked.
    MemoryTransferIncomplete,
    /// Overload symptoms observed on an attempt.
    OverloadDetected,
    /// The evidence validator rejected a claimed completion.
    ValidationRejected,
    /// A re-plan was about to repeat the decision that just failed.
    LoopDetected,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::AssessmentError => "assessment_error",
            FailureKind::CapacityExhausted => "capacity_exhausted",
            FailureKind::MemoryTransferIncomplete => "memory_transfer_incomplete",
            FailureKind::OverloadDetected => "overload_detected",
            FailureKind::ValidationRejected => "validation_rejected",
            FailureKind::LoopDetected => "loop_detected",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {0} already exists")]
    TaskExists(String),

    #[error("unknown worker type: {0}")]
    UnknownWorkerType(String),

    #[error("no active worker types registered")]
    NoWorkers,

    #[error("task {task} already has an open attempt ({attempt})")]
    AttemptAlreadyOpen { task: String, attempt: String },

    #[error("task {task} has no open attempt {attempt}")]
    NoOpenAttempt { task: String, attempt: String },

    #[error("attempt {attempt} not found on task {task}")]
    UnknownAttempt { task: String, attempt: String },

    #[error("{validator} cannot validate its own attempt {attempt}")]
    SelfCertification { validator: String, attempt: String },

    #[error("task {task} is {status}; {action} refused")]
    TaskTerminal {
        task: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("invalid transition for task {task}: {detail}")]
    InvalidTransition { task: String, detail: String },

    #[error("invalid identifier {id:?}: {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("snapshot {snapshot} already claimed by {consumer}")]
    SnapshotClaimed { snapshot: String, consumer: String },

    #[error("ledger for {task} moved on (next seq is {expected}, tried {attempted}); re-run the command")]
    Conflict {
        task: String,
        expected: u64,
        attempted: u64,
    },

    #[error("ticket tracker: {0}")]
    Tracker(String),

    #[error("config: {0}")]
    Config(String),

    #[error("ticket tracker does not support {0}")]
    Unsupported(&'static str),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("template: {0}")]
    Template(String),
}

impl CoordError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoordError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error when it reaches `main`.
    ///
    /// Refusals (the engine declined an operation that would break an
    /// invariant) use 7 so scripts can tell them apart from I/O failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            CoordError::AttemptAlreadyOpen { .. }
            | CoordError::NoOpenAttempt { .. }
            | CoordError::SelfCertification { .. }
            | CoordError::TaskTerminal { .. }
            | CoordError::InvalidTransition { .. }
            | CoordError::SnapshotClaimed { .. }
            | CoordError::TaskExists(_)
            | CoordError::Conflict { .. } => 7,
            CoordError::UnknownTask(_)
            | CoordError::UnknownAttempt { .. }
            | CoordError::UnknownWorkerType(_)
            | CoordError::NoWorkers
            | CoordError::SnapshotNotFound(_) => 8,
            CoordError::InvalidId { .. } | CoordError::InvalidInput(_) => 2,
            CoordError::Tracker(_)
            | CoordError::Config(_)
            | CoordError::Unsupported(_)
            | CoordError::Io { .. }
            | CoordError::Json(_)
            | CoordError::Template(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_exit_seven() {
        let err = CoordError::SelfCertification {
            validator: "w1".into(),
            attempt: "at-1".into(),
        };
        assert_eq!(err.exit_code(), 7);
        assert!(err.to_string().contains("cannot validate its own attempt"));
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::MemoryTransferIncomplete).unwrap();
        assert_eq!(json, "\"memory_transfer_incomplete\"");
        assert_eq!(FailureKind::LoopDetected.to_string(), "loop_detected");
    }
}
