//! The coordination facade.
//!
//! Every operation loads the task's state by replaying its ledger, decides,
//! records each resulting event, and only then returns. Nothing here is kept
//! between calls except configuration and the capacity registry; spent
//! modifier uses are written back to the config file when one is attached.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::assess::ComplexityAssessor;
use super::capacity::CapacityRegistry;
use super::dispatch::{self, DispatchVars};
use super::error::{CoordError, FailureKind, Result};
use super::evidence::EvidenceBundle;
use super::ledger::{Event, Ledger, TaskState};
use super::memory::{ExternalMemorySnapshot, ExternalMemoryStore, FullContext, TransferReport};
use super::planner::{AssignmentPlanner, Decision, PlanDecision};
use super::recovery::{self, Observation, OverloadSignal, RecoveryPhase, Transition};
use super::task::{
    AttemptOutcome, AttemptRecord, CapacityTier, NewTask, Task, TaskId, TaskStatus, WorkerHandle,
    generate_id, validate_id,
};
use super::tracker::{self, TicketTracker};
use super::validator::{self, ValidatorFindings, Verdict, VerdictRecord};
use crate::config::{self, Config, RecoveryConfig};
use crate::template::{BriefContext, render_brief};

/// Who takes the task, and optionally the context they are handed.
#[derive(Debug, Clone, Default)]
pub struct AssignRequest {
    pub worker: String,
    /// Plan for this worker type instead of the default or the best fit.
    pub worker_type: Option<String>,
    /// The previous holder's context, compressed into a snapshot before the
    /// handoff.
    pub context: Option<FullContext>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignOutcome {
    Assigned {
        handle: WorkerHandle,
        plan: PlanDecision,
        brief: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Decomposed {
        plan: PlanDecision,
        children: Vec<TaskId>,
    },
    /// The memory handoff failed verification; the task was re-planned.
    Blocked {
        reason: String,
        report: Option<TransferReport>,
        plan: PlanDecision,
    },
    Escalated {
        reason: String,
    },
}

/// A worker's report on its attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptReport {
    pub attempt_id: String,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub evidence: EvidenceBundle,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub signals: Vec<OverloadSignal>,
}

impl AttemptReport {
    pub fn new(attempt_id: &str, outcome: AttemptOutcome) -> Self {
        Self {
            attempt_id: attempt_id.to_string(),
            outcome,
            evidence: EvidenceBundle::new(),
            facts: BTreeMap::new(),
            summary: None,
            signals: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: EvidenceBundle) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn fact(mut self, key: &str, value: &str) -> Self {
        self.facts.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub attempt: AttemptRecord,
    pub status: TaskStatus,
    pub phase: RecoveryPhase,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replan: Option<PlanDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerdictOutcome {
    pub verdict: VerdictRecord,
    pub status: TaskStatus,
    pub phase: RecoveryPhase,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replan: Option<PlanDecision>,
    /// Parent task completed because this was its last open subtask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_completed: Option<TaskId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimedOut {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub report: ReportOutcome,
}

/// One line of `relay status`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub band: u8,
    pub attempts: usize,
    pub failures: u32,
    pub phase: RecoveryPhase,
    pub open_attempt: Option<String>,
    pub worker: Option<String>,
    pub awaiting_validation: Option<String>,
    pub escalation: Option<String>,
    pub parent: Option<TaskId>,
    pub children: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

impl TaskSummary {
    pub fn from_state(state: &TaskState) -> Option<Self> {
        let task = state.task.as_ref()?;
        Some(Self {
            id: task.id.clone(),
            description: task.description.clone(),
            status: task.status,
            band: task.score.band,
            attempts: task.attempts.len(),
            failures: state.failures,
            phase: state.recovery.phase,
            open_attempt: state.open_attempt.as_ref().map(|h| h.attempt_id.clone()),
            worker: state.open_attempt.as_ref().map(|h| h.worker.clone()),
            awaiting_validation: state.awaiting_validation.clone(),
            escalation: state.escalation.clone(),
            parent: task.parent.clone(),
            children: task.children.len(),
            last_activity: state.last_activity,
        })
    }
}

pub struct Coordinator {
    root: PathBuf,
    ledger: Ledger,
    registry: CapacityRegistry,
    planner: AssignmentPlanner,
    memory: ExternalMemoryStore,
    recovery: RecoveryConfig,
    default_worker: Option<String>,
    briefs_dir: PathBuf,
    config_file: Option<PathBuf>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("root", &self.root)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Build a coordinator with the tracker named in config.
    pub fn new(config: &Config, root: &Path) -> Result<Self> {
        let tracker = tracker::from_config(config, root)?;
        Ok(Self::with_tracker(config, root, tracker))
    }

    pub fn with_tracker(config: &Config, root: &Path, tracker: Box<dyn TicketTracker>) -> Self {
        let assessor = ComplexityAssessor::new(config.scoring.clone());
        Self {
            root: root.to_path_buf(),
            ledger: Ledger::new(tracker),
            registry: CapacityRegistry::from_config(&config.workers),
            planner: AssignmentPlanner::new(config.planner.clone(), assessor),
            memory: ExternalMemoryStore::new(config.memory_dir(root), config.memory.clone()),
            recovery: config.recovery.clone(),
            default_worker: config.project.default_worker.clone(),
            briefs_dir: config.state_dir(root).join("briefs"),
            config_file: None,
        }
    }

    /// Persist capacity changes (spent modifier uses) to this config file.
    #[must_use]
    pub fn with_config_file(mut self, path: &Path) -> Self {
        self.config_file = Some(path.to_path_buf());
        self
    }

    pub fn memory(&self) -> &ExternalMemoryStore {
        &self.memory
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Replayed state of a known task.
    pub fn state(&self, task_id: &str) -> Result<TaskState> {
        validate_id(task_id)?;
        let state = self.ledger.load_state(task_id)?;
        if state.task.is_none() {
            return Err(CoordError::UnknownTask(task_id.to_string()));
        }
        Ok(state)
    }

    /// Every task the tracker can list, in id order.
    pub fn list(&self) -> Result<Vec<TaskSummary>> {
        let mut ids = self.ledger.task_ids()?;
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let state = self.ledger.load_state(&id)?;
            out.extend(TaskSummary::from_state(&state));
        }
        Ok(out)
    }

    /// State of a task that is still open for `action`.
    fn live(&self, task_id: &str, action: &'static str) -> Result<TaskState> {
        let state = self.state(task_id)?;
        match state.status() {
            Some(status) if status.is_terminal() => Err(CoordError::TaskTerminal {
                task: task_id.to_string(),
                status,
                action,
            }),
            _ => Ok(state),
        }
    }

    pub fn submit(&self, request: NewTask) -> Result<TaskState> {
        if request.parent.is_some() {
            return Err(CoordError::InvalidInput(
                "parent tasks are assigned by decomposition".into(),
            ));
        }
        self.create(request, None)
    }

    fn create(&self, request: NewTask, parent: Option<&str>) -> Result<TaskState> {
        let id = request.id.clone().unwrap_or_else(|| generate_id("tk"));
        validate_id(&id)?;
        if request.description.trim().is_empty() {
            return Err(CoordError::InvalidInput("task description must not be empty".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some(dup) = request.criteria.iter().find(|c| !seen.insert(c.id.as_str())) {
            return Err(CoordError::InvalidInput(format!(
                "duplicate acceptance criterion id {}",
                dup.id
            )));
        }
        let mut state = self.ledger.load_state(&id)?;
        if state.task.is_some() {
            return Err(CoordError::TaskExists(id));
        }
        let score = self
            .planner
            .assessor()
            .score(&request.description, request.signals);
        let task = Task {
            id: id.clone(),
            description: request.description,
            score,
            status: TaskStatus::Pending,
            criteria: request.criteria,
            attempts: Vec::new(),
            snapshot: None,
            parent: parent.map(str::to_string),
            children: Vec::new(),
            created_at: Utc::now(),
        };
        let band = task.score.band;
        self.ledger.record(&mut state, Event::TaskSubmitted { task })?;
        info!(task = %id, band, parent, "task submitted");
        Ok(state)
    }

    /// Plan a task for `worker_type` (or the default, or the best fit).
    pub fn plan(&mut self, task_id: &str, worker_type: Option<&str>) -> Result<PlanDecision> {
        let mut state = self.live(task_id, "plan")?;
        Self::ensure_plannable(&state)?;
        self.replan(&mut state, worker_type, None)
    }

    fn ensure_plannable(state: &TaskState) -> Result<()> {
        if let Some(open) = &state.open_attempt {
            return Err(CoordError::AttemptAlreadyOpen {
                task: state.task_id.clone(),
                attempt: open.attempt_id.clone(),
            });
        }
        if let Some(waiting) = &state.awaiting_validation {
            return Err(CoordError::InvalidTransition {
                task: state.task_id.clone(),
                detail: format!("attempt {waiting} is awaiting validation"),
            });
        }
        if state.status() == Some(TaskStatus::Blocked) {
            return Err(CoordError::InvalidTransition {
                task: state.task_id.clone(),
                detail: "task was decomposed; work on its subtasks".into(),
            });
        }
        Ok(())
    }

    /// Evaluate, record refused repeats and the decision, then act on it.
    fn replan(
        &mut self,
        state: &mut TaskState,
        worker_type: Option<&str>,
        transition: Option<Transition>,
    ) -> Result<PlanDecision> {
        let now = Utc::now();
        let expired = self.registry.expire(now);
        if expired > 0 {
            debug!(expired, "capacity modifiers expired");
        }
        let task = state
            .task
            .clone()
            .ok_or_else(|| CoordError::UnknownTask(state.task_id.clone()))?;
        let failures = state.planning_failures();
        let avoid = state.last_failed.clone();
        let worker_type = worker_type
            .map(str::to_string)
            .or_else(|| self.default_worker.clone());
        let outcome = match worker_type.as_deref() {
            Some(wt) => self.planner.evaluate_avoiding(
                &task,
                &self.registry,
                wt,
                failures,
                avoid.as_ref(),
                now,
            )?,
            None => self
                .planner
                .plan_any(&task, &self.registry, failures, avoid.as_ref(), now)?,
        };

        for refused in &outcome.loops {
            self.ledger.record(
                state,
                Event::Failure {
                    kind: FailureKind::LoopDetected,
                    detail: format!("re-plan would repeat {} after a failure", refused.key()),
                    key: Some(refused.key()),
                },
            )?;
        }
        let plan = outcome.plan;
        let event = match transition {
            Some(transition) => Event::Recovery {
                transition,
                plan: Some(plan.clone()),
            },
            None => Event::Planned { plan: plan.clone() },
        };
        self.ledger.record(state, event)?;
        if !plan.decision.is_escalation() && self.registry.consume_use(&plan.worker_type)? {
            self.persist_spent_use(&plan.worker_type)?;
        }
        info!(
            task = %task.id,
            worker_type = %plan.worker_type,
            decision = plan.decision.kind(),
            gap = plan.gap,
            loops = outcome.loops.len(),
            "plan recorded"
        );
        self.apply_decision(state, &plan)?;
        Ok(plan)
    }

    /// Spend one use on the config file's copy too, re-read so a concurrent
    /// edit is not overwritten.
    fn persist_spent_use(&self, worker_type: &str) -> Result<()> {
        let Some(path) = &self.config_file else {
            return Ok(());
        };
        config::update_workers(path, |workers| {
            let mut stored = CapacityRegistry::from_config(workers);
            stored.consume_use(worker_type)?;
            stored.write_into(workers);
            Ok(())
        })
        .map_err(|e| CoordError::Config(format!("{}: {e:#}", path.display())))?;
        debug!(worker_type, config = %path.display(), "modifier use recorded");
        Ok(())
    }

    fn apply_decision(&self, state: &mut TaskState, plan: &PlanDecision) -> Result<()> {
        match &plan.decision {
            Decision::Escalate { reason } => {
                self.ledger.record(
                    state,
                    Event::Failure {
                        kind: FailureKind::CapacityExhausted,
                        detail: reason.clone(),
                        key: None,
                    },
                )?;
                self.escalate(state, reason)
            }
            Decision::Decompose { subtasks } => {
                let parent = state.task_id.clone();
                let mut children = Vec::with_capacity(subtasks.len());
                for (i, sub) in subtasks.iter().enumerate() {
                    let mut id = format!("{parent}-s{}", i + 1);
                    if validate_id(&id).is_err() || self.ledger.load_state(&id)?.task.is_some() {
                        id = generate_id("tk");
                    }
                    let request = NewTask {
                        id: Some(id.clone()),
                        description: sub.description.clone(),
                        signals: sub.signals,
                        criteria: sub.criteria.clone(),
                        parent: None,
                    };
                    self.create(request, Some(&parent))?;
                    children.push(id);
                }
                let count = children.len();
                self.ledger.record(state, Event::Decomposed { children })?;
                self.set_status(
                    state,
                    TaskStatus::Blocked,
                    &format!("decomposed into {count} subtasks"),
                )
            }
            Decision::DirectAssign | Decision::AssignWithMemorySupport { .. } => Ok(()),
        }
    }

    fn set_status(&self, state: &mut TaskState, to: TaskStatus, reason: &str) -> Result<()> {
        let from = state
            .status()
            .ok_or_else(|| CoordError::UnknownTask(state.task_id.clone()))?;
        if from == to {
            return Ok(());
        }
        self.ledger.record(
            state,
            Event::StatusChanged {
                from,
                to,
                reason: reason.to_string(),
            },
        )?;
        info!(task = %state.task_id, %from, %to, reason, "status changed");
        Ok(())
    }

    /// Escalate a task. A blocked parent cannot complete without this
    /// subtask, so it escalates too.
    fn escalate(&self, state: &mut TaskState, reason: &str) -> Result<()> {
        if state.status().is_some_and(TaskStatus::is_terminal) {
            return Ok(());
        }
        self.set_status(state, TaskStatus::Escalated, reason)?;
        warn!(task = %state.task_id, reason, "task escalated; needs operator decision");
        self.escalate_parent(state, &format!("subtask {} escalated: {reason}", state.task_id))
    }

    fn escalate_parent(&self, state: &TaskState, reason: &str) -> Result<()> {
        let Some(parent_id) = state.task.as_ref().and_then(|t| t.parent.clone()) else {
            return Ok(());
        };
        let mut parent = self.ledger.load_state(&parent_id)?;
        if parent.status() == Some(TaskStatus::Blocked) {
            self.escalate(&mut parent, reason)?;
        }
        Ok(())
    }

    /// Escalate once real failures reach `max_attempts`. Returns whether it did.
    fn enforce_attempt_budget(&self, state: &mut TaskState) -> Result<bool> {
        if state.failures < self.recovery.max_attempts
            || state.status().is_some_and(TaskStatus::is_terminal)
        {
            return Ok(false);
        }
        let reason = format!(
            "{} failed attempts reached the budget of {}",
            state.failures, self.recovery.max_attempts
        );
        self.escalate(state, &reason)?;
        Ok(true)
    }

    /// The recorded plan, if it was made after the latest failure for the
    /// requested worker type.
    fn current_plan(&self, state: &TaskState, worker_type: Option<&str>) -> Option<PlanDecision> {
        let plan = state.plan.as_ref()?;
        let wanted = worker_type.or(self.default_worker.as_deref());
        let same_type = wanted.is_none_or(|wt| wt == plan.worker_type);
        (same_type && plan.failures == state.planning_failures()).then(|| plan.clone())
    }

    /// Compress a worker's context into a snapshot attached to the task.
    pub fn compress(&self, task_id: &str, context: &FullContext) -> Result<ExternalMemorySnapshot> {
        let mut state = self.live(task_id, "compress")?;
        self.compress_into(&mut state, context)
    }

    fn compress_into(
        &self,
        state: &mut TaskState,
        context: &FullContext,
    ) -> Result<ExternalMemorySnapshot> {
        let snapshot = self.memory.compress(&state.task_id, context)?;
        self.ledger.record(
            state,
            Event::MemoryCompressed {
                snapshot_id: snapshot.id.clone(),
                producer: snapshot.producer.clone(),
                complete: snapshot.complete,
            },
        )?;
        Ok(snapshot)
    }

    /// The task's snapshot if it has not been handed to anyone yet.
    fn pending_snapshot(&self, state: &TaskState) -> Result<Option<ExternalMemorySnapshot>> {
        let Some(task) = &state.task else {
            return Ok(None);
        };
        let Some(snapshot_id) = &task.snapshot else {
            return Ok(None);
        };
        match self.memory.load(&task.id, snapshot_id) {
            Ok(snapshot) if snapshot.is_claimed() => Ok(None),
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(CoordError::SnapshotNotFound(id)) => {
                warn!(task = %task.id, snapshot = %id, "attached snapshot is missing from the store");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Hand the task to a worker: plan if needed, verify and claim any
    /// pending snapshot, open the attempt, write the brief, dispatch.
    ///
    /// The snapshot must come from whoever hands the task over: the
    /// producer of `request.context` when one is supplied, else the worker
    /// of the last attempt, else (first assignment) its own producer.
    pub fn assign(&mut self, task_id: &str, request: AssignRequest) -> Result<AssignOutcome> {
        validate_id(&request.worker)?;
        let mut state = self.live(task_id, "assign")?;
        Self::ensure_plannable(&state)?;

        if let Some(context) = &request.context {
            self.compress_into(&mut state, context)?;
        }
        // A supplied context is handed over by its producer; otherwise by
        // the last worker on the task.
        let handed_over_by = request.context.as_ref().map(|c| c.producer.clone()).or_else(|| {
            state
                .task
                .as_ref()
                .and_then(|t| t.attempts.last())
                .map(|a| a.worker.clone())
        });

        let requested = request.worker_type.as_deref();
        let plan = match self.current_plan(&state, requested) {
            Some(plan) => plan,
            None => self.replan(&mut state, requested, None)?,
        };
        if let Some(outcome) = Self::unassignable(&state, &plan) {
            return Ok(outcome);
        }

        let snapshot = match self.pending_snapshot(&state)? {
            Some(snapshot) => {
                let from = handed_over_by.unwrap_or_else(|| snapshot.producer.clone());
                let report = self
                    .memory
                    .transfer(task_id, &snapshot.id, &from, &request.worker)?;
                self.ledger.record(
                    &mut state,
                    Event::MemoryTransferred {
                        report: report.clone(),
                    },
                )?;
                if !report.accepted {
                    let reason = format!(
                        "snapshot {} verified {:.0}% of critical entries",
                        report.snapshot_id,
                        report.ratio * 100.0
                    );
                    return self.block_handoff(&mut state, &plan, reason, Some(report));
                }
                Some(self.memory.claim(task_id, &snapshot.id, &request.worker)?)
            }
            None if plan.decision.tier() == CapacityTier::MemorySupported => {
                let reason = "memory support planned but no unclaimed snapshot is attached".to_string();
                return self.block_handoff(&mut state, &plan, reason, None);
            }
            None => None,
        };

        let handle = WorkerHandle {
            task_id: task_id.to_string(),
            attempt_id: generate_id("at"),
            worker: request.worker.clone(),
            worker_type: plan.worker_type.clone(),
            tier: plan.decision.tier(),
            snapshot: snapshot.as_ref().map(|s| s.id.clone()),
            assigned_at: Utc::now(),
        };
        self.ledger.record(
            &mut state,
            Event::Assigned {
                handle: handle.clone(),
            },
        )?;
        self.set_status(
            &mut state,
            TaskStatus::Assigned,
            &format!("assigned to {} ({})", handle.worker, handle.key()),
        )?;

        let brief = self.write_brief(&state, &handle, &plan, snapshot.as_ref())?;
        let pid = match self.registry.get(&plan.worker_type)?.dispatch.as_deref() {
            Some(template) => {
                let vars = DispatchVars {
                    handle: &handle,
                    brief: &brief,
                };
                match dispatch::spawn(template, &vars, &self.root) {
                    Ok(pid) => Some(pid),
                    Err(e) => {
                        warn!(task = task_id, attempt = %handle.attempt_id, error = %e, "dispatch failed; attempt stays open");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(AssignOutcome::Assigned {
            handle,
            plan,
            brief,
            pid,
        })
    }

    fn unassignable(state: &TaskState, plan: &PlanDecision) -> Option<AssignOutcome> {
        match &plan.decision {
            Decision::Escalate { reason } => Some(AssignOutcome::Escalated {
                reason: reason.clone(),
            }),
            Decision::Decompose { .. } => Some(AssignOutcome::Decomposed {
                plan: plan.clone(),
                children: state
                    .task
                    .as_ref()
                    .map(|t| t.children.clone())
                    .unwrap_or_default(),
            }),
            Decision::DirectAssign | Decision::AssignWithMemorySupport { .. } => None,
        }
    }

    fn block_handoff(
        &mut self,
        state: &mut TaskState,
        plan: &PlanDecision,
        reason: String,
        report: Option<TransferReport>,
    ) -> Result<AssignOutcome> {
        self.ledger.record(
            state,
            Event::Failure {
                kind: FailureKind::MemoryTransferIncomplete,
                detail: reason.clone(),
                key: Some(plan.key()),
            },
        )?;
        warn!(task = %state.task_id, reason = %reason, "handoff blocked");
        if self.enforce_attempt_budget(state)? {
            return Ok(AssignOutcome::Escalated {
                reason: state.escalation.clone().unwrap_or(reason),
            });
        }
        let replan = self.replan(state, None, None)?;
        if let Some(outcome) = Self::unassignable(state, &replan) {
            return Ok(outcome);
        }
        Ok(AssignOutcome::Blocked {
            reason,
            report,
            plan: replan,
        })
    }

    fn write_brief(
        &self,
        state: &TaskState,
        handle: &WorkerHandle,
        plan: &PlanDecision,
        snapshot: Option<&ExternalMemorySnapshot>,
    ) -> Result<PathBuf> {
        let task = state
            .task
            .as_ref()
            .ok_or_else(|| CoordError::UnknownTask(state.task_id.clone()))?;
        let body = render_brief(&BriefContext::new(task, handle, Some(plan), snapshot))
            .map_err(|e| CoordError::Template(format!("{e:#}")))?;
        std::fs::create_dir_all(&self.briefs_dir)
            .map_err(|e| CoordError::io(&self.briefs_dir, e))?;
        let path = self
            .briefs_dir
            .join(format!("{}-{}.md", task.id, handle.attempt_id));
        std::fs::write(&path, body).map_err(|e| CoordError::io(&path, e))?;
        Ok(path)
    }

    fn open_attempt(state: &TaskState, attempt_id: &str) -> Result<WorkerHandle> {
        state
            .open_attempt
            .clone()
            .filter(|h| h.attempt_id == attempt_id)
            .ok_or_else(|| CoordError::NoOpenAttempt {
                task: state.task_id.clone(),
                attempt: attempt_id.to_string(),
            })
    }

    /// The worker has picked the attempt up.
    pub fn start(&self, task_id: &str, attempt_id: &str) -> Result<TaskState> {
        let mut state = self.live(task_id, "start")?;
        Self::open_attempt(&state, attempt_id)?;
        if state.started_at.is_none() {
            self.ledger.record(
                &mut state,
                Event::AttemptStarted {
                    attempt_id: attempt_id.to_string(),
                    started_at: Utc::now(),
                },
            )?;
            self.set_status(&mut state, TaskStatus::InProgress, "worker started")?;
        }
        Ok(state)
    }

    /// Close the open attempt with the worker's report.
    pub fn report(&mut self, task_id: &str, report: AttemptReport) -> Result<ReportOutcome> {
        if report.outcome == AttemptOutcome::Cancelled {
            return Err(CoordError::InvalidInput(
                "cancelled attempts are recorded by cancel".into(),
            ));
        }
        let mut state = self.live(task_id, "report")?;
        let handle = Self::open_attempt(&state, &report.attempt_id)?;
        self.close_attempt(&mut state, &handle, report, Utc::now())
    }

    fn close_attempt(
        &mut self,
        state: &mut TaskState,
        handle: &WorkerHandle,
        report: AttemptReport,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome> {
        let mut outcome = report.outcome;
        if outcome == AttemptOutcome::Success && report.evidence.is_empty() {
            warn!(task = %state.task_id, attempt = %handle.attempt_id, "completion claimed without evidence");
            outcome = AttemptOutcome::FalseCompletionSuspected;
        }
        let task = state
            .task
            .as_ref()
            .ok_or_else(|| CoordError::UnknownTask(state.task_id.clone()))?;
        let mut attempt = AttemptRecord {
            attempt_id: handle.attempt_id.clone(),
            worker: handle.worker.clone(),
            worker_type: handle.worker_type.clone(),
            tier: handle.tier,
            started_at: state.started_at.unwrap_or(handle.assigned_at),
            ended_at: now,
            outcome,
            evidence: report.evidence,
            facts: report.facts,
            summary: report.summary,
            signals: report.signals,
        };
        attempt.signals = recovery::detect_signals(task.last_attempt_by(&handle.worker), &attempt);
        self.ledger.record(
            state,
            Event::AttemptRecorded {
                attempt: attempt.clone(),
            },
        )?;
        info!(
            task = %state.task_id,
            attempt = %attempt.attempt_id,
            outcome = %attempt.outcome,
            signals = attempt.signals.len(),
            "attempt recorded"
        );

        let mut transitions = Vec::new();
        let mut replan = None;
        match outcome {
            AttemptOutcome::Success | AttemptOutcome::Cancelled => {}
            AttemptOutcome::Escalated => {
                self.record_overload(state, &attempt, "worker escalated the attempt")?;
                self.escalate(state, "worker escalated the attempt")?;
            }
            AttemptOutcome::FalseCompletionSuspected | AttemptOutcome::OverloadDetected => {
                let detail = if attempt.signals.is_empty() {
                    format!("attempt ended {}", attempt.outcome)
                } else {
                    attempt
                        .signals
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                self.record_overload(state, &attempt, &detail)?;
                replan = self.after_failure(state, attempt.signals.clone(), &mut transitions)?;
            }
        }

        Ok(ReportOutcome {
            attempt,
            status: state.status().unwrap_or(TaskStatus::Pending),
            phase: state.recovery.phase,
            transitions,
            replan,
        })
    }

    fn record_overload(&self, state: &mut TaskState, attempt: &AttemptRecord, detail: &str) -> Result<()> {
        self.ledger
            .record(
                state,
                Event::Failure {
                    kind: FailureKind::OverloadDetected,
                    detail: detail.to_string(),
                    key: Some(attempt.key()),
                },
            )
            .map(|_| ())
    }

    /// Run the recovery machine on a failure, enforce the attempt budget,
    /// and return the task to the queue.
    fn after_failure(
        &mut self,
        state: &mut TaskState,
        signals: Vec<OverloadSignal>,
        transitions: &mut Vec<Transition>,
    ) -> Result<Option<PlanDecision>> {
        let observation = Observation {
            signals,
            succeeded: false,
        };
        let replan = self.observe(state, &observation, transitions)?;
        if state.status().is_some_and(TaskStatus::is_terminal) || self.enforce_attempt_budget(state)? {
            return Ok(replan);
        }
        if matches!(
            state.status(),
            Some(TaskStatus::Assigned | TaskStatus::InProgress)
        ) {
            self.set_status(state, TaskStatus::Pending, "attempt failed; awaiting re-assignment")?;
        }
        Ok(replan)
    }

    /// Feed one observation to the recovery machine and record what follows.
    fn observe(
        &mut self,
        state: &mut TaskState,
        observation: &Observation,
        transitions: &mut Vec<Transition>,
    ) -> Result<Option<PlanDecision>> {
        let Some(transition) =
            recovery::observe(state.recovery, observation, self.recovery.retry_ceiling)
        else {
            return Ok(None);
        };
        info!(
            task = %state.task_id,
            from = %transition.from,
            to = %transition.to,
            cycle = transition.cycle,
            "recovery transition"
        );
        self.ledger.record(
            state,
            Event::Recovery {
                transition: transition.clone(),
                plan: None,
            },
        )?;
        transitions.push(transition.clone());

        match transition.to {
            RecoveryPhase::Confirmed => {
                if let Some(selected) = recovery::select_plan(state.recovery) {
                    transitions.push(selected.clone());
                    let plan = self.replan(state, None, Some(selected))?;
                    return Ok(Some(plan));
                }
            }
            RecoveryPhase::Escalated => {
                let reason = format!(
                    "recovery failed after {} cycles",
                    state.recovery.cycles
                );
                self.escalate(state, &reason)?;
            }
            RecoveryPhase::Monitoring
            | RecoveryPhase::OverloadSuspected
            | RecoveryPhase::RecoveryPlanSelected
            | RecoveryPhase::Recovered => {}
        }
        Ok(None)
    }

    /// Independent validation of a successful attempt.
    pub fn validate(
        &mut self,
        task_id: &str,
        attempt_id: &str,
        validator_id: &str,
        findings: &ValidatorFindings,
    ) -> Result<VerdictOutcome> {
        let mut state = self.live(task_id, "validate")?;
        let task = state
            .task
            .clone()
            .ok_or_else(|| CoordError::UnknownTask(task_id.to_string()))?;
        let attempt = task
            .attempt(attempt_id)
            .cloned()
            .ok_or_else(|| CoordError::UnknownAttempt {
                task: task_id.to_string(),
                attempt: attempt_id.to_string(),
            })?;
        if state.awaiting_validation.as_deref() != Some(attempt_id) {
            return Err(CoordError::InvalidTransition {
                task: task_id.to_string(),
                detail: format!("attempt {attempt_id} is not awaiting validation"),
            });
        }

        let verdict = validator::validate(&task, &attempt, validator_id, findings)?;
        self.ledger.record(
            &mut state,
            Event::Verdict {
                verdict: verdict.clone(),
            },
        )?;

        let mut transitions = Vec::new();
        let mut replan = None;
        let mut parent_completed = None;
        match &verdict.verdict {
            Verdict::Confirmed => {
                let observation = Observation {
                    signals: Vec::new(),
                    succeeded: true,
                };
                self.observe(&mut state, &observation, &mut transitions)?;
                self.set_status(
                    &mut state,
                    TaskStatus::Completed,
                    &format!("evidence confirmed by {validator_id}"),
                )?;
                parent_completed = self.complete_parent(&state)?;
            }
            Verdict::Rejected { reasons, .. } => {
                self.ledger.record(
                    &mut state,
                    Event::Failure {
                        kind: FailureKind::ValidationRejected,
                        detail: reasons.join("; "),
                        key: Some(attempt.key()),
                    },
                )?;
                let mut signals = attempt.signals.clone();
                if !signals.contains(&OverloadSignal::FalseCompletion) {
                    signals.push(OverloadSignal::FalseCompletion);
                }
                replan = self.after_failure(&mut state, signals, &mut transitions)?;
            }
        }

        Ok(VerdictOutcome {
            verdict,
            status: state.status().unwrap_or(TaskStatus::Pending),
            phase: state.recovery.phase,
            transitions,
            replan,
            parent_completed,
        })
    }

    /// Complete the parent once every subtask is completed, walking upward.
    fn complete_parent(&self, child: &TaskState) -> Result<Option<TaskId>> {
        let Some(parent_id) = child.task.as_ref().and_then(|t| t.parent.clone()) else {
            return Ok(None);
        };
        let mut parent = self.ledger.load_state(&parent_id)?;
        let Some(children) = parent
            .task
            .as_ref()
            .filter(|t| t.status == TaskStatus::Blocked)
            .map(|t| t.children.clone())
        else {
            return Ok(None);
        };
        for id in &children {
            let status = if *id == child.task_id {
                child.status()
            } else {
                self.ledger.load_state(id)?.status()
            };
            if status != Some(TaskStatus::Completed) {
                debug!(parent = %parent_id, pending = %id, "parent still waiting on subtasks");
                return Ok(None);
            }
        }
        self.set_status(&mut parent, TaskStatus::Completed, "all subtasks completed")?;
        self.complete_parent(&parent)?;
        Ok(Some(parent_id))
    }

    /// Cancel a task and its subtasks. An open attempt is closed as
    /// `cancelled`; the task ends `failed`.
    pub fn cancel(&self, task_id: &str, reason: &str) -> Result<TaskState> {
        let mut state = self.live(task_id, "cancel")?;
        self.cancel_state(&mut state, reason)?;
        self.escalate_parent(&state, &format!("subtask {task_id} was cancelled"))?;
        Ok(state)
    }

    fn cancel_state(&self, state: &mut TaskState, reason: &str) -> Result<()> {
        if let Some(handle) = state.open_attempt.clone() {
            let now = Utc::now();
            let attempt = AttemptRecord {
                attempt_id: handle.attempt_id.clone(),
                worker: handle.worker.clone(),
                worker_type: handle.worker_type.clone(),
                tier: handle.tier,
                started_at: state.started_at.unwrap_or(handle.assigned_at),
                ended_at: now,
                outcome: AttemptOutcome::Cancelled,
                evidence: EvidenceBundle::new(),
                facts: BTreeMap::new(),
                summary: Some(reason.to_string()),
                signals: Vec::new(),
            };
            self.ledger.record(state, Event::AttemptRecorded { attempt })?;
        }
        let children = state
            .task
            .as_ref()
            .map(|t| t.children.clone())
            .unwrap_or_default();
        for id in children {
            let mut child = self.ledger.load_state(&id)?;
            if child.status().is_some_and(|s| !s.is_terminal()) {
                self.cancel_state(&mut child, &format!("parent {} cancelled", state.task_id))?;
            }
        }
        self.set_status(state, TaskStatus::Failed, reason)?;
        info!(task = %state.task_id, reason, "task cancelled");
        Ok(())
    }

    /// Close every open attempt older than `attempt_timeout_secs` as an
    /// overload with a timeout signal.
    pub fn sweep_timeouts(&mut self, now: DateTime<Utc>) -> Result<Vec<TimedOut>> {
        let secs = i64::try_from(self.recovery.attempt_timeout_secs).unwrap_or(i64::MAX);
        let limit = TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX);
        let mut closed = Vec::new();
        for id in self.ledger.task_ids()? {
            let mut state = self.ledger.load_state(&id)?;
            if state.status().is_none_or(TaskStatus::is_terminal) {
                continue;
            }
            let Some(handle) = state.open_attempt.clone() else {
                continue;
            };
            let since = state.started_at.unwrap_or(handle.assigned_at);
            if now.signed_duration_since(since) < limit {
                continue;
            }
            warn!(task = %id, attempt = %handle.attempt_id, "attempt timed out");
            let mut report = AttemptReport::new(&handle.attempt_id, AttemptOutcome::OverloadDetected);
            report.signals.push(OverloadSignal::Timeout);
            report.summary = Some(format!(
                "no report within {}s",
                self.recovery.attempt_timeout_secs
            ));
            let outcome = match self.close_attempt(&mut state, &handle, report, now) {
                Ok(outcome) => outcome,
                Err(CoordError::Conflict { .. }) => {
                    info!(task = %id, attempt = %handle.attempt_id, "attempt closed concurrently; skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            closed.push(TimedOut {
                task_id: id,
                report: outcome,
            });
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::coord::evidence::{ArtifactRef, EvidenceCategory};
    use crate::coord::memory::{ContextElement, GapKind};
    use crate::coord::task::StructuralSignals;
    use crate::coord::tracker::InMemoryTracker;

    fn worker(baseline: f64) -> WorkerConfig {
        WorkerConfig {
            baseline,
            description: None,
            modifiers: Vec::new(),
            dispatch: None,
            active: true,
        }
    }

    fn coordinator(dir: &Path, workers: &[(&str, f64)]) -> Coordinator {
        let mut config = Config::starter("test");
        config.project.default_worker = None;
        config.workers = workers
            .iter()
            .map(|(name, baseline)| ((*name).to_string(), worker(*baseline)))
            .collect();
        Coordinator::with_tracker(&config, dir, Box::new(InMemoryTracker::new()))
    }

    fn proof(criterion: Option<&str>) -> EvidenceBundle {
        let mut artifact = ArtifactRef::new("tests/it.rs").reproduced_by("cargo test it");
        if let Some(c) = criterion {
            artifact = artifact.covering(c);
        }
        EvidenceBundle::new().with(EvidenceCategory::Functional, artifact)
    }

    fn assigned(outcome: AssignOutcome) -> WorkerHandle {
        match outcome {
            AssignOutcome::Assigned { handle, .. } => handle,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    fn submit(c: &Coordinator, id: &str, signals: StructuralSignals) -> TaskState {
        c.submit(NewTask::new(format!("task {id}"), signals).with_id(id))
            .unwrap()
    }

    fn assign(c: &mut Coordinator, task: &str, worker: &str) -> WorkerHandle {
        assigned(
            c.assign(
                task,
                AssignRequest {
                    worker: worker.into(),
                    ..AssignRequest::default()
                },
            )
            .unwrap(),
        )
    }

    fn fail(c: &mut Coordinator, task: &str, handle: &WorkerHandle, extra: &[OverloadSignal]) -> ReportOutcome {
        let mut report = AttemptReport::new(&handle.attempt_id, AttemptOutcome::OverloadDetected);
        report.signals = extra.to_vec();
        c.report(task, report).unwrap()
    }

    #[test]
    fn direct_task_completes_after_independent_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 2.0)]);
        let state = c
            .submit(
                NewTask::new("fix login", StructuralSignals::new(2, 0, 0, 1))
                    .with_id("tk-login")
                    .criterion(EvidenceCategory::Functional, "user can log in"),
            )
            .unwrap();
        assert_eq!(state.task.as_ref().unwrap().score.band, 1);

        let plan = c.plan("tk-login", None).unwrap();
        assert_eq!(plan.decision, Decision::DirectAssign);

        let handle = assign(&mut c, "tk-login", "w1");
        assert_eq!(handle.tier, CapacityTier::Direct);
        let brief = dir
            .path()
            .join(".relay/briefs")
            .join(format!("tk-login-{}.md", handle.attempt_id));
        assert!(std::fs::read_to_string(brief).unwrap().contains("user can log in"));

        c.start("tk-login", &handle.attempt_id).unwrap();
        let report = AttemptReport::new(&handle.attempt_id, AttemptOutcome::Success)
            .with_evidence(proof(Some("c1")));
        let out = c.report("tk-login", report).unwrap();
        assert_eq!(out.status, TaskStatus::InProgress);

        let err = c
            .validate("tk-login", &handle.attempt_id, "w1", &ValidatorFindings::default())
            .unwrap_err();
        assert!(matches!(err, CoordError::SelfCertification { .. }));

        let verdict = c
            .validate("tk-login", &handle.attempt_id, "reviewer", &ValidatorFindings::default())
            .unwrap();
        assert!(verdict.verdict.verdict.is_confirmed());
        assert_eq!(verdict.status, TaskStatus::Completed);
        assert_eq!(c.state("tk-login").unwrap().status(), Some(TaskStatus::Completed));
    }

    #[test]
    fn second_assignment_is_refused_while_attempt_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 2.0)]);
        submit(&c, "tk-1", StructuralSignals::new(2, 0, 0, 1));
        let handle = assign(&mut c, "tk-1", "w1");
        let err = c
            .assign(
                "tk-1",
                AssignRequest {
                    worker: "w2".into(),
                    ..AssignRequest::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoordError::AttemptAlreadyOpen { ref attempt, .. } if *attempt == handle.attempt_id));
    }

    #[test]
    fn success_without_evidence_is_a_false_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 3.0)]);
        submit(&c, "tk-1", StructuralSignals::new(2, 0, 0, 1));
        let handle = assign(&mut c, "tk-1", "w1");
        let out = c
            .report("tk-1", AttemptReport::new(&handle.attempt_id, AttemptOutcome::Success))
            .unwrap();
        assert_eq!(out.attempt.outcome, AttemptOutcome::FalseCompletionSuspected);
        assert_eq!(out.status, TaskStatus::Pending);
        assert_eq!(c.state("tk-1").unwrap().failures, 1);
    }

    #[test]
    fn replan_after_failure_never_repeats_worker_type_and_tier() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 3.0)]);
        submit(&c, "tk-1", StructuralSignals::new(2, 0, 0, 1));
        let handle = assign(&mut c, "tk-1", "w1");
        fail(&mut c, "tk-1", &handle, &[]);

        let plan = c.plan("tk-1", None).unwrap();
        assert_ne!(plan.key(), handle.key());
        assert_eq!(plan.decision.tier(), CapacityTier::MemorySupported);

        let state = c.state("tk-1").unwrap();
        // Each refused repeat costs 0.5; direct holds down to capacity 1.0.
        assert_eq!(state.loop_bumps, 4);
        assert_eq!(state.failures, 1);
        assert_eq!(plan.failures, 5);
    }

    #[test]
    fn oversized_task_escalates_and_refuses_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 2.0)]);
        submit(&c, "tk-big", StructuralSignals::new(8, 4, 3, 2));
        let plan = c.plan("tk-big", None).unwrap();
        assert!(plan.decision.is_escalation());
        let state = c.state("tk-big").unwrap();
        assert_eq!(state.status(), Some(TaskStatus::Escalated));
        assert!(state.escalation.is_some());

        let err = c
            .assign(
                "tk-big",
                AssignRequest {
                    worker: "w1".into(),
                    ..AssignRequest::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoordError::TaskTerminal { .. }));
    }

    #[test]
    fn decomposed_parent_completes_with_its_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 2.0)]);
        submit(&c, "tk-p", StructuralSignals::new(9, 2, 1, 1));
        let outcome = c
            .assign(
                "tk-p",
                AssignRequest {
                    worker: "w1".into(),
                    ..AssignRequest::default()
                },
            )
            .unwrap();
        let AssignOutcome::Decomposed { children, .. } = outcome else {
            panic!("expected decomposition");
        };
        assert_eq!(children, vec!["tk-p-s1", "tk-p-s2", "tk-p-s3"]);
        assert_eq!(c.state("tk-p").unwrap().status(), Some(TaskStatus::Blocked));

        let mut last = None;
        for child in &children {
            let state = c.state(child).unwrap();
            assert_eq!(state.task.as_ref().unwrap().parent.as_deref(), Some("tk-p"));
            let handle = assign(&mut c, child, "w1");
            c.report(
                child,
                AttemptReport::new(&handle.attempt_id, AttemptOutcome::Success).with_evidence(proof(None)),
            )
            .unwrap();
            let verdict = c
                .validate(child, &handle.attempt_id, "reviewer", &ValidatorFindings::default())
                .unwrap();
            assert_eq!(verdict.status, TaskStatus::Completed);
            last = verdict.parent_completed;
        }
        assert_eq!(last.as_deref(), Some("tk-p"));
        assert_eq!(c.state("tk-p").unwrap().status(), Some(TaskStatus::Completed));
    }

    #[test]
    fn recovery_alternates_strategies_then_escalates_at_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::starter("test");
        config.project.default_worker = None;
        config.planner.failure_penalty = 0.0;
        config.workers = [("alpha", worker(3.0)), ("beta", worker(3.0))]
            .into_iter()
            .map(|(n, w)| (n.to_string(), w))
            .collect();
        let mut c = Coordinator::with_tracker(&config, dir.path(), Box::new(InMemoryTracker::new()));
        submit(&c, "tk-r", StructuralSignals::new(2, 0, 0, 1));

        let first = assign(&mut c, "tk-r", "w1");
        let out = fail(&mut c, "tk-r", &first, &[OverloadSignal::DecliningSpecificity]);
        assert_eq!(out.phase, RecoveryPhase::OverloadSuspected);

        let second = assign(&mut c, "tk-r", "w2");
        let out = fail(&mut c, "tk-r", &second, &[]);
        assert_eq!(out.phase, RecoveryPhase::RecoveryPlanSelected);
        assert_eq!(c.state("tk-r").unwrap().recovery.cycles, 1);
        assert!(out.replan.is_some());

        let third = assign(&mut c, "tk-r", "w3");
        let out = fail(&mut c, "tk-r", &third, &[]);
        assert_eq!(c.state("tk-r").unwrap().recovery.cycles, 2);
        assert_eq!(out.status, TaskStatus::Pending);

        let fourth = assign(&mut c, "tk-r", "w4");
        let out = fail(&mut c, "tk-r", &fourth, &[]);
        assert_eq!(out.phase, RecoveryPhase::Escalated);
        assert_eq!(out.status, TaskStatus::Escalated);

        let types: Vec<_> = [&first, &second, &third, &fourth]
            .iter()
            .map(|h| h.worker_type.as_str())
            .collect();
        assert_eq!(types, vec!["alpha", "beta", "alpha", "beta"]);
    }

    #[test]
    fn incomplete_memory_transfer_blocks_handoff_and_replans() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 1.5), ("senior", 3.5)]);
        submit(&c, "tk-m", StructuralSignals::new(4, 0, 0, 1));
        let context = FullContext {
            producer: "w0".into(),
            window: 10,
            elements: vec![ContextElement {
                key: "endpoint".into(),
                content: "POST /reset TBD".into(),
                accesses: 10,
            }],
        };
        let outcome = c
            .assign(
                "tk-m",
                AssignRequest {
                    worker: "w1".into(),
                    worker_type: Some("junior".into()),
                    context: Some(context),
                },
            )
            .unwrap();
        let AssignOutcome::Blocked { report, plan, .. } = outcome else {
            panic!("expected blocked handoff");
        };
        let report = report.unwrap();
        assert!(!report.accepted);
        assert_eq!(report.gaps[0].kind, GapKind::Ambiguous);
        assert_eq!(plan.worker_type, "senior");
        assert_eq!(plan.decision, Decision::DirectAssign);

        let state = c.state("tk-m").unwrap();
        assert!(state.open_attempt.is_none());
        assert!(state.task.as_ref().unwrap().snapshot.is_none());

        let handle = assign(&mut c, "tk-m", "w1");
        assert_eq!(handle.worker_type, "senior");
        assert!(handle.snapshot.is_none());
    }

    #[test]
    fn verified_snapshot_is_claimed_by_the_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 1.5)]);
        submit(&c, "tk-m", StructuralSignals::new(4, 0, 0, 1));
        let context = FullContext {
            producer: "w0".into(),
            window: 10,
            elements: vec![
                ContextElement {
                    key: "endpoint".into(),
                    content: "POST /reset".into(),
                    accesses: 9,
                },
                ContextElement {
                    key: "history".into(),
                    content: "old design notes".into(),
                    accesses: 0,
                },
            ],
        };
        let handle = assigned(
            c.assign(
                "tk-m",
                AssignRequest {
                    worker: "w1".into(),
                    worker_type: None,
                    context: Some(context),
                },
            )
            .unwrap(),
        );
        assert_eq!(handle.tier, CapacityTier::MemorySupported);
        let snapshot_id = handle.snapshot.clone().unwrap();
        let snapshot = c.memory().load("tk-m", &snapshot_id).unwrap();
        assert_eq!(snapshot.consumer.as_deref(), Some("w1"));
        assert!(c.state("tk-m").unwrap().last_transfer.unwrap().accepted);
    }

    #[test]
    fn operator_supplied_context_hands_over_from_its_producer() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::starter("test");
        config.project.default_worker = None;
        config.planner.failure_penalty = 0.0;
        config.workers = [("alpha", worker(3.0)), ("beta", worker(3.0))]
            .into_iter()
            .map(|(n, w)| (n.to_string(), w))
            .collect();
        let mut c = Coordinator::with_tracker(&config, dir.path(), Box::new(InMemoryTracker::new()));
        submit(&c, "tk-h", StructuralSignals::new(2, 0, 0, 1));
        let first = assign(&mut c, "tk-h", "w1");
        fail(&mut c, "tk-h", &first, &[]);

        let context = FullContext {
            producer: "lead".into(),
            window: 10,
            elements: vec![ContextElement {
                key: "endpoint".into(),
                content: "POST /reset".into(),
                accesses: 9,
            }],
        };
        let handle = assigned(
            c.assign(
                "tk-h",
                AssignRequest {
                    worker: "w2".into(),
                    worker_type: None,
                    context: Some(context),
                },
            )
            .unwrap(),
        );
        let transfer = c.state("tk-h").unwrap().last_transfer.unwrap();
        assert!(transfer.accepted, "{:?}", transfer.gaps);
        assert_eq!(transfer.from, "lead");
        let snapshot = c.memory().load("tk-h", &handle.snapshot.unwrap()).unwrap();
        assert_eq!(snapshot.consumer.as_deref(), Some("w2"));
    }

    #[test]
    fn rejected_evidence_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 3.0)]);
        c.submit(
            NewTask::new("reset", StructuralSignals::new(2, 0, 0, 1))
                .with_id("tk-v")
                .criterion(EvidenceCategory::Functional, "reset mail is sent"),
        )
        .unwrap();
        let handle = assign(&mut c, "tk-v", "w1");
        let bare = EvidenceBundle::new()
            .with(EvidenceCategory::Functional, ArtifactRef::new("screenshot.png").covering("c1"));
        c.report(
            "tk-v",
            AttemptReport::new(&handle.attempt_id, AttemptOutcome::Success).with_evidence(bare),
        )
        .unwrap();
        let out = c
            .validate("tk-v", &handle.attempt_id, "reviewer", &ValidatorFindings::default())
            .unwrap();
        let Verdict::Rejected { unmet_criteria, .. } = &out.verdict.verdict else {
            panic!("expected rejection");
        };
        assert_eq!(unmet_criteria, &vec!["reset mail is sent".to_string()]);
        assert_eq!(out.status, TaskStatus::Pending);
        let state = c.state("tk-v").unwrap();
        assert_eq!(state.failures, 1);
        assert_eq!(state.last_failed, Some(handle.key()));
    }

    #[test]
    fn cancel_closes_open_attempt_and_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(dir.path(), &[("junior", 2.0)]);
        submit(&c, "tk-c", StructuralSignals::new(2, 0, 0, 1));
        let handle = assign(&mut c, "tk-c", "w1");
        let state = c.cancel("tk-c", "no longer needed").unwrap();
        assert_eq!(state.status(), Some(TaskStatus::Failed));
        let task = state.task.unwrap();
        assert_eq!(task.attempts.last().unwrap().outcome, AttemptOutcome::Cancelled);
        assert!(state.open_attempt.is_none());

        let err = c
            .report("tk-c", AttemptReport::new(&handle.attempt_id, AttemptOutcome::Success))
            .unwrap_err();
        assert!(matches!(err, CoordError::TaskTerminal { .. }));
    }

    #[test]
    fn sweep_times_out_stale_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::starter("test");
        config.recovery.attempt_timeout_secs = 60;
        let tracker = crate::coord::tracker::FileTracker::new(dir.path().join("ledger"));
        let mut c = Coordinator::with_tracker(&config, dir.path(), Box::new(tracker));
        submit(&c, "tk-t", StructuralSignals::new(2, 0, 0, 1));
        let handle = assign(&mut c, "tk-t", "w1");

        assert!(c.sweep_timeouts(Utc::now()).unwrap().is_empty());
        let closed = c.sweep_timeouts(Utc::now() + TimeDelta::minutes(5)).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].report.attempt.attempt_id, handle.attempt_id);
        assert_eq!(closed[0].report.attempt.signals, vec![OverloadSignal::Timeout]);
        assert_eq!(closed[0].report.phase, RecoveryPhase::OverloadSuspected);
        assert!(c.state("tk-t").unwrap().open_attempt.is_none());
    }

    #[test]
    fn duplicate_submission_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), &[("junior", 2.0)]);
        submit(&c, "tk-1", StructuralSignals::new(1, 0, 0, 0));
        let err = c
            .submit(NewTask::new("again", StructuralSignals::default()).with_id("tk-1"))
            .unwrap_err();
        assert!(matches!(err, CoordError::TaskExists(_)));
        assert!(matches!(c.state("tk-none").unwrap_err(), CoordError::UnknownTask(_)));
    }

    #[test]
    fn two_coordinators_on_one_ledger_close_an_attempt_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::starter("test");
        config.recovery.attempt_timeout_secs = 60;
        let open = |config: &Config| {
            let tracker = crate::coord::tracker::FileTracker::new(dir.path().join("ledger"));
            Coordinator::with_tracker(config, dir.path(), Box::new(tracker))
        };
        let mut watcher = open(&config);
        let mut reporter = open(&config);
        submit(&watcher, "tk-s", StructuralSignals::new(2, 0, 0, 1));
        let handle = assign(&mut reporter, "tk-s", "w1");

        let err = watcher
            .assign(
                "tk-s",
                AssignRequest {
                    worker: "w2".into(),
                    ..AssignRequest::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoordError::AttemptAlreadyOpen { .. }));

        fail(&mut reporter, "tk-s", &handle, &[]);
        assert!(watcher.sweep_timeouts(Utc::now() + TimeDelta::minutes(5)).unwrap().is_empty());
        let err = watcher
            .report("tk-s", AttemptReport::new(&handle.attempt_id, AttemptOutcome::OverloadDetected))
            .unwrap_err();
        assert!(matches!(err, CoordError::NoOpenAttempt { .. }));

        let entries = watcher.ledger().entries("tk-s").unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=entries.len() as u64).collect::<Vec<u64>>());
        assert_eq!(watcher.state("tk-s").unwrap().task.unwrap().attempts.len(), 1);
    }

    #[test]
    fn use_limited_modifier_lapses_across_coordinators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::config::CONFIG_TOML);
        let mut config = Config::starter("test");
        config.workers.get_mut("generalist").unwrap().modifiers.push(crate::config::ModifierConfig {
            name: "pairing".into(),
            delta: 0.5,
            expires_at: None,
            task: None,
            uses: Some(1),
        });
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();
        let open = || {
            let config = Config::load(&path).unwrap();
            let tracker = crate::coord::tracker::FileTracker::new(dir.path().join("ledger"));
            Coordinator::with_tracker(&config, dir.path(), Box::new(tracker)).with_config_file(&path)
        };

        let mut first = open();
        submit(&first, "tk-a", StructuralSignals::new(2, 0, 0, 1));
        let plan = first.plan("tk-a", Some("generalist")).unwrap();
        assert!(plan.capacity.applied.iter().any(|m| m.name == "pairing"));

        let mut second = open();
        submit(&second, "tk-b", StructuralSignals::new(2, 0, 0, 1));
        let plan = second.plan("tk-b", Some("generalist")).unwrap();
        assert!(plan.capacity.applied.is_empty(), "{:?}", plan.capacity.applied);
        assert!(Config::load(&path).unwrap().workers["generalist"].modifiers.is_empty());
    }
}
