//! The coordination engine.
//!
//! Tasks are scored, matched against worker capacity, handed off with
//! verified external memory, watched for overload, and only closed on
//! independently validated evidence. Every decision is appended to the
//! task's ticket ledger before it takes effect.

pub mod assess;
pub mod capacity;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod evidence;
pub mod ledger;
pub mod memory;
pub mod planner;
pub mod recovery;
pub mod task;
pub mod tracker;
pub mod validator;

pub use coordinator::{
    AssignOutcome, AssignRequest, AttemptReport, Coordinator, ReportOutcome, TaskSummary,
    TimedOut, VerdictOutcome,
};
pub use error::{CoordError, FailureKind};
pub use ledger::{Event, Ledger, LedgerEntry, TaskState};
pub use task::{NewTask, StructuralSignals, TaskStatus};
