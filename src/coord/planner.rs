//! Assignment planning: capacity gap to decision.
//!
//! The decision table is data (`[planner.table]`), not branches; this module
//! only walks it. Decomposition is attempted once per plan and either fits
//! every child within capacity or escalates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::assess::ComplexityAssessor;
use super::capacity::{CapacityBreakdown, CapacityRegistry, PRIOR_FAILURE};
use super::error::{CoordError, Result};
use super::task::{AcceptanceCriterion, AttemptKey, CapacityTier, ComplexityScore, StructuralSignals, Task};
use crate::config::{PlannerConfig, SuccessBand};

const EPS: f64 = 1e-9;

/// Upper bound on anti-loop penalty bumps for one plan.
const MAX_LOOP_STEPS: u32 = 32;

/// One child of a decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskPlan {
    pub description: String,
    pub signals: StructuralSignals,
    pub criteria: Vec<AcceptanceCriterion>,
    pub score: ComplexityScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    DirectAssign,
    AssignWithMemorySupport { memory_bonus: f64 },
    Decompose { subtasks: Vec<SubtaskPlan> },
    Escalate { reason: String },
}

impl Decision {
    pub fn tier(&self) -> CapacityTier {
        match self {
            Decision::DirectAssign => CapacityTier::Direct,
            Decision::AssignWithMemorySupport { .. } => CapacityTier::MemorySupported,
            Decision::Decompose { .. } => CapacityTier::Decomposed,
            Decision::Escalate { .. } => CapacityTier::Escalated,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decision::DirectAssign => "direct_assign",
            Decision::AssignWithMemorySupport { .. } => "assign_with_memory_support",
            Decision::Decompose { .. } => "decompose",
            Decision::Escalate { .. } => "escalate",
        }
    }

    pub fn is_escalation(&self) -> bool {
        matches!(self, Decision::Escalate { .. })
    }
}

/// A planner decision with the arithmetic that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDecision {
    pub task_id: String,
    pub worker_type: String,
    pub complexity: u8,
    pub capacity: CapacityBreakdown,
    pub gap: f64,
    #[serde(flatten)]
    pub decision: Decision,
    /// Reported, never enforced.
    pub expected_success: SuccessBand,
    /// Failures counted into the `prior-failure` modifier.
    pub failures: u32,
    pub decided_at: DateTime<Utc>,
}

impl PlanDecision {
    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            worker_type: self.worker_type.clone(),
            tier: self.decision.tier(),
        }
    }
}

/// A plan plus the candidate decisions the anti-loop rule refused.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: PlanDecision,
    pub loops: Vec<PlanDecision>,
}

#[derive(Debug, Clone)]
pub struct AssignmentPlanner {
    config: PlannerConfig,
    assessor: ComplexityAssessor,
}

impl AssignmentPlanner {
    pub fn new(config: PlannerConfig, assessor: ComplexityAssessor) -> Self {
        Self { config, assessor }
    }

    pub fn assessor(&self) -> &ComplexityAssessor {
        &self.assessor
    }

    /// Evaluate one worker type for a task. Pure: no registry mutation.
    pub fn evaluate(
        &self,
        task: &Task,
        registry: &CapacityRegistry,
        worker_type: &str,
        failures: u32,
        now: DateTime<Utc>,
    ) -> Result<PlanDecision> {
        let mut capacity = registry.adjusted_capacity(worker_type, &task.id, now)?;
        if failures > 0 {
            capacity = capacity.with(PRIOR_FAILURE, -self.config.failure_penalty * f64::from(failures));
        }
        let complexity = task.complexity();
        let gap = f64::from(complexity) - capacity.adjusted;
        let table = &self.config.table;

        let (decision, expected_success) = if gap <= table.direct_max_gap + EPS {
            (Decision::DirectAssign, table.direct_success)
        } else if gap <= table.memory_max_gap + EPS {
            let bonus = gap.clamp(self.config.memory_bonus_min, self.config.memory_bonus_max);
            (
                Decision::AssignWithMemorySupport { memory_bonus: bonus },
                table.memory_success,
            )
        } else if gap <= table.decompose_max_gap + EPS {
            match self.decompose(task, capacity.adjusted) {
                Some(subtasks) => (Decision::Decompose { subtasks }, table.decompose_success),
                None => (
                    Decision::Escalate {
                        reason: format!(
                            "capacity exhausted: no split into at most {} subtasks fits capacity {:.2}",
                            self.config.max_subtasks, capacity.adjusted
                        ),
                    },
                    table.escalate_success,
                ),
            }
        } else {
            (
                Decision::Escalate {
                    reason: format!(
                        "capacity exhausted: gap {gap:.2} exceeds {:.2}",
                        table.decompose_max_gap
                    ),
                },
                table.escalate_success,
            )
        };

        debug!(
            task = %task.id,
            worker_type,
            complexity,
            capacity = capacity.adjusted,
            gap,
            decision = decision.kind(),
            "plan evaluated"
        );

        Ok(PlanDecision {
            task_id: task.id.clone(),
            worker_type: worker_type.to_string(),
            complexity,
            capacity,
            gap,
            decision,
            expected_success,
            failures,
            decided_at: now,
        })
    }

    /// Evaluate, refusing to repeat `avoid`. Each refused repeat is returned
    /// in `loops` and costs one more `prior-failure` step; escalation always
    /// counts as different.
    pub fn evaluate_avoiding(
        &self,
        task: &Task,
        registry: &CapacityRegistry,
        worker_type: &str,
        failures: u32,
        avoid: Option<&AttemptKey>,
        now: DateTime<Utc>,
    ) -> Result<PlanOutcome> {
        let mut loops = Vec::new();
        let mut failures = failures;
        loop {
            let plan = self.evaluate(task, registry, worker_type, failures, now)?;
            let repeats = avoid.is_some_and(|key| *key == plan.key());
            if !repeats || plan.decision.is_escalation() {
                return Ok(PlanOutcome { plan, loops });
            }
            warn!(
                task = %task.id,
                key = %plan.key(),
                failures,
                "re-plan would repeat the failed assignment"
            );
            if loops.len() >= MAX_LOOP_STEPS as usize {
                let mut plan = plan;
                plan.decision = Decision::Escalate {
                    reason: format!("anti-loop: {} kept repeating", plan.key()),
                };
                plan.expected_success = self.config.table.escalate_success;
                return Ok(PlanOutcome { plan, loops });
            }
            loops.push(plan);
            failures += 1;
        }
    }

    /// Evaluate every active worker type and pick the smallest gap among
    /// non-escalating decisions. Falls back to the smallest-gap escalation.
    pub fn plan_any(
        &self,
        task: &Task,
        registry: &CapacityRegistry,
        failures: u32,
        avoid: Option<&AttemptKey>,
        now: DateTime<Utc>,
    ) -> Result<PlanOutcome> {
        let types = registry.active_types();
        if types.is_empty() {
            return Err(CoordError::NoWorkers);
        }
        let mut best: Option<PlanOutcome> = None;
        for worker_type in types {
            let candidate = self.evaluate_avoiding(task, registry, worker_type, failures, avoid, now)?;
            let better = match &best {
                None => true,
                Some(current) => {
                    let (c_esc, b_esc) = (
                        candidate.plan.decision.is_escalation(),
                        current.plan.decision.is_escalation(),
                    );
                    (b_esc && !c_esc) || (b_esc == c_esc && candidate.plan.gap < current.plan.gap - EPS)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        let best = best.ok_or(CoordError::NoWorkers)?;
        info!(
            task = %task.id,
            worker_type = %best.plan.worker_type,
            decision = best.plan.decision.kind(),
            "best worker type selected"
        );
        Ok(best)
    }

    /// Split a task into k = 2..=max_subtasks children, returning the first
    /// split whose every child band fits `capacity`. Criteria are dealt out
    /// in order; when there are fewer than k, later children repeat earlier
    /// ones so no child of a criteria-bearing task is left with none.
    fn decompose(&self, task: &Task, capacity: f64) -> Option<Vec<SubtaskPlan>> {
        let signals = task.score.signals;
        let requirements = u32::try_from(signals.requirements).unwrap_or(0);
        if requirements < 2 {
            return None;
        }
        let max_k = self.config.max_subtasks.min(requirements);
        (2..=max_k).find_map(|k| {
            let children = self.split(task, k);
            let fits = children
                .iter()
                .all(|c| f64::from(c.score.band) <= capacity + EPS);
            if fits {
                Some(children)
            } else {
                debug!(task = %task.id, k, "split does not fit capacity");
                None
            }
        })
    }

    fn split(&self, task: &Task, k: u32) -> Vec<SubtaskPlan> {
        let s = task.score.signals;
        let criteria_len = u32::try_from(task.criteria.len()).unwrap_or(u32::MAX);
        let mut offset = 0usize;
        (0..k)
            .map(|i| {
                let signals = StructuralSignals::new(
                    share(s.requirements, k, i),
                    share(s.interdependencies, k, i),
                    share(s.context_switches, k, i),
                    share(s.validation_checkpoints, k, i),
                );
                let take = usize::try_from(share(i64::from(criteria_len), k, i)).unwrap_or(0);
                let criteria = if take == 0 && !task.criteria.is_empty() {
                    // Fewer criteria than children: reuse one so every child is checkable.
                    let reused = usize::try_from(i).unwrap_or(0) % task.criteria.len();
                    vec![task.criteria[reused].clone()]
                } else {
                    task.criteria.iter().skip(offset).take(take).cloned().collect()
                };
                offset += take;
                let description = format!("{} (part {}/{})", task.description, i + 1, k);
                let score = self.assessor.score(&description, signals);
                SubtaskPlan {
                    description,
                    signals,
                    criteria,
                    score,
                }
            })
            .collect()
    }
}

/// The i-th of k near-equal shares of `total`; earlier shares take the remainder.
fn share(total: i64, k: u32, i: u32) -> i64 {
    let k = i64::from(k);
    let i = i64::from(i);
    let total = total.max(0);
    total / k + i64::from(i < total % k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;
    use crate::coord::capacity::WorkerProfile;
    use crate::coord::evidence::EvidenceCategory;
    use crate::coord::task::TaskStatus;

    fn planner() -> AssignmentPlanner {
        AssignmentPlanner::new(
            PlannerConfig::default(),
            ComplexityAssessor::new(ScoringConfig::default()),
        )
    }

    fn task(signals: StructuralSignals) -> Task {
        let p = planner();
        Task {
            id: "tk-test".into(),
            description: "test task".into(),
            score: p.assessor().score("test task", signals),
            status: TaskStatus::Pending,
            criteria: Vec::new(),
            attempts: Vec::new(),
            snapshot: None,
            parent: None,
            children: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn registry(baseline: f64) -> CapacityRegistry {
        let mut r = CapacityRegistry::new();
        r.register(WorkerProfile::new("w", baseline));
        r
    }

    #[test]
    fn simple_task_direct_assign() {
        let t = task(StructuralSignals::new(2, 0, 0, 1));
        let plan = planner().evaluate(&t, &registry(2.0), "w", 0, Utc::now()).unwrap();
        assert_eq!(plan.decision, Decision::DirectAssign);
        assert!(plan.gap <= 0.0);
        assert!((plan.expected_success.low - 0.80).abs() < 1e-9);
    }

    #[test]
    fn band_five_task_escalates_for_low_capacity() {
        let t = task(StructuralSignals::new(8, 4, 3, 2));
        assert_eq!(t.complexity(), 5);
        let plan = planner().evaluate(&t, &registry(2.0), "w", 0, Utc::now()).unwrap();
        assert!(plan.gap > 2.0);
        assert!(plan.decision.is_escalation());
    }

    #[test]
    fn small_gap_gets_memory_support() {
        // raw 4.0 -> band 2 against baseline 1.5 -> gap 0.5
        let t = task(StructuralSignals::new(3, 0, 0, 1));
        let plan = planner().evaluate(&t, &registry(1.5), "w", 0, Utc::now()).unwrap();
        assert_eq!(
            plan.decision,
            Decision::AssignWithMemorySupport { memory_bonus: 0.5 }
        );
    }

    #[test]
    fn decomposition_fits_three_children() {
        // raw 11.8 -> band 4 against baseline 2.0 -> gap 2.0
        let mut t = task(StructuralSignals::new(9, 2, 1, 1));
        t.criteria = vec![
            AcceptanceCriterion::new("c1", "a", EvidenceCategory::Functional),
            AcceptanceCriterion::new("c2", "b", EvidenceCategory::Functional),
            AcceptanceCriterion::new("c3", "c", EvidenceCategory::Technical),
            AcceptanceCriterion::new("c4", "d", EvidenceCategory::Regression),
        ];
        assert_eq!(t.complexity(), 4);
        let plan = planner().evaluate(&t, &registry(2.0), "w", 0, Utc::now()).unwrap();
        let Decision::Decompose { subtasks } = plan.decision else {
            panic!("expected decomposition, got {:?}", plan.decision);
        };
        assert_eq!(subtasks.len(), 3);
        assert!(subtasks.iter().all(|s| s.score.band <= 2));
        let reqs: i64 = subtasks.iter().map(|s| s.signals.requirements).sum();
        assert_eq!(reqs, 9);
        let crit: usize = subtasks.iter().map(|s| s.criteria.len()).sum();
        assert_eq!(crit, 4);
        assert_eq!(subtasks[0].criteria.len(), 2);
        assert_eq!(subtasks[2].description, "test task (part 3/3)");
    }

    #[test]
    fn every_child_of_a_split_keeps_a_criterion() {
        let mut t = task(StructuralSignals::new(9, 2, 1, 1));
        t.criteria = vec![AcceptanceCriterion::new("c1", "login works", EvidenceCategory::Functional)];
        let plan = planner().evaluate(&t, &registry(2.0), "w", 0, Utc::now()).unwrap();
        let Decision::Decompose { subtasks } = plan.decision else {
            panic!("expected decomposition, got {:?}", plan.decision);
        };
        assert_eq!(subtasks.len(), 3);
        for child in &subtasks {
            assert_eq!(child.criteria.len(), 1, "{} has no criterion", child.description);
            assert_eq!(child.criteria[0].id, "c1");
        }

        t.criteria.push(AcceptanceCriterion::new("c2", "logout works", EvidenceCategory::Regression));
        let plan = planner().evaluate(&t, &registry(2.0), "w", 0, Utc::now()).unwrap();
        let Decision::Decompose { subtasks } = plan.decision else {
            panic!("expected decomposition, got {:?}", plan.decision);
        };
        let ids: Vec<&str> = subtasks.iter().map(|s| s.criteria[0].id.as_str()).collect();
        assert_eq!(ids, ["c1", "c2", "c1"]);
    }

    #[test]
    fn decomposition_that_cannot_fit_escalates() {
        // raw 7.0 -> band 3 against baseline 1.5 -> gap 1.5
        let t = task(StructuralSignals::new(5, 2, 0, 1));
        let plan = planner().evaluate(&t, &registry(1.5), "w", 0, Utc::now()).unwrap();
        assert!((plan.gap - 1.5).abs() < 1e-9);
        let Decision::Escalate { reason } = &plan.decision else {
            panic!("expected escalation, got {:?}", plan.decision);
        };
        assert!(reason.contains("capacity exhausted"));
    }

    #[test]
    fn single_requirement_cannot_decompose() {
        // raw 5.0 -> band 2 against baseline 1.0 -> gap 1.0
        let t = task(StructuralSignals::new(1, 0, 5, 0));
        let plan = planner().evaluate(&t, &registry(1.0), "w", 0, Utc::now()).unwrap();
        assert_eq!(plan.decision.tier(), CapacityTier::MemorySupported);
        // raw 9.0 -> band 3 -> gap 2.0, but one requirement cannot be split
        let t = task(StructuralSignals::new(1, 0, 10, 0));
        let plan = planner().evaluate(&t, &registry(1.0), "w", 0, Utc::now()).unwrap();
        assert!(plan.decision.is_escalation());
    }

    #[test]
    fn prior_failures_shrink_capacity() {
        let t = task(StructuralSignals::new(2, 0, 0, 1));
        let plan = planner().evaluate(&t, &registry(2.0), "w", 2, Utc::now()).unwrap();
        assert!((plan.capacity.adjusted - 1.0).abs() < 1e-9);
        assert!(plan.capacity.applied.iter().any(|m| m.name == PRIOR_FAILURE));
        assert_eq!(plan.decision.tier(), CapacityTier::Direct);
    }

    #[test]
    fn never_direct_assign_with_positive_gap() {
        let p = planner();
        for r in 0..12 {
            for c in 0..4 {
                let t = task(StructuralSignals::new(r, 1, c, 2));
                for baseline in [1.0, 2.5, 4.0] {
                    let plan = p.evaluate(&t, &registry(baseline), "w", 0, Utc::now()).unwrap();
                    if plan.gap > 0.0 {
                        assert_ne!(plan.decision, Decision::DirectAssign);
                    }
                }
            }
        }
    }

    #[test]
    fn anti_loop_forces_different_decision() {
        let t = task(StructuralSignals::new(2, 0, 0, 1));
        let avoid = AttemptKey {
            worker_type: "w".into(),
            tier: CapacityTier::Direct,
        };
        let outcome = planner()
            .evaluate_avoiding(&t, &registry(2.0), "w", 0, Some(&avoid), Utc::now())
            .unwrap();
        // capacity 2.0 -> 1.5 -> 1.0 stays direct; 0.5 finally changes tier
        assert_eq!(outcome.loops.len(), 3);
        assert_ne!(outcome.plan.key(), avoid);
        assert_eq!(outcome.plan.decision.tier(), CapacityTier::MemorySupported);
        assert_eq!(outcome.plan.failures, 3);
    }

    #[test]
    fn plan_any_prefers_smallest_non_escalating_gap() {
        let mut r = CapacityRegistry::new();
        r.register(WorkerProfile::new("junior", 1.0));
        r.register(WorkerProfile::new("senior", 4.0));
        r.register(WorkerProfile::new("staff", 5.0));
        let t = task(StructuralSignals::new(8, 4, 3, 2));
        let outcome = planner().plan_any(&t, &r, 0, None, Utc::now()).unwrap();
        assert_eq!(outcome.plan.worker_type, "staff");
        assert_eq!(outcome.plan.decision, Decision::DirectAssign);
    }

    #[test]
    fn plan_any_without_workers_errors() {
        let mut r = registry(2.0);
        r.deactivate("w").unwrap();
        let t = task(StructuralSignals::new(1, 0, 0, 0));
        assert!(matches!(
            planner().plan_any(&t, &r, 0, None, Utc::now()),
            Err(CoordError::NoWorkers)
        ));
    }

    #[test]
    fn shares_sum_to_total() {
        for total in 0..20 {
            for k in 2..5 {
                let sum: i64 = (0..k).map(|i| share(total, k, i)).sum();
                assert_eq!(sum, total);
            }
        }
    }
}
