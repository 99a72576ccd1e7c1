//! Overload detection and the recovery state machine.
//!
//! `observe` is a pure transition function; the coordinator persists every
//! transition it returns, and `TaskState` replays them.

use serde::{Deserialize, Serialize};

use super::task::{AttemptOutcome, AttemptRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverloadSignal {
    /// Evidence less specific than the same worker's previous report.
    DecliningSpecificity,
    /// Context facts contradict the same worker's previous report.
    InconsistentContext,
    /// Completion claimed without evidence or rejected by the validator.
    FalseCompletion,
    SelfReportedOverload,
    Timeout,
}

impl OverloadSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            OverloadSignal::DecliningSpecificity => "declining-specificity",
            OverloadSignal::InconsistentContext => "inconsistent-context",
            OverloadSignal::FalseCompletion => "false-completion",
            OverloadSignal::SelfReportedOverload => "self-reported-overload",
            OverloadSignal::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for OverloadSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    #[default]
    Monitoring,
    OverloadSuspected,
    Confirmed,
    RecoveryPlanSelected,
    Recovered,
    Escalated,
}

impl RecoveryPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryPhase::Monitoring => "monitoring",
            RecoveryPhase::OverloadSuspected => "overload_suspected",
            RecoveryPhase::Confirmed => "confirmed",
            RecoveryPhase::RecoveryPlanSelected => "recovery_plan_selected",
            RecoveryPhase::Recovered => "recovered",
            RecoveryPhase::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub phase: RecoveryPhase,
    /// Recovery cycles started so far.
    pub cycles: u32,
}

/// What the engine learned from one attempt (or validation).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub signals: Vec<OverloadSignal>,
    /// The attempt succeeded and its evidence was confirmed.
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RecoveryPhase,
    pub to: RecoveryPhase,
    #[serde(default)]
    pub signals: Vec<OverloadSignal>,
    pub cycle: u32,
}

impl Transition {
    /// Apply this transition to a state.
    pub fn apply(&self, state: &mut RecoveryState) {
        state.phase = self.to;
        state.cycles = self.cycle;
    }
}

/// Signals for `current` given the same worker's previous attempt on the task.
pub fn detect_signals(previous: Option<&AttemptRecord>, current: &AttemptRecord) -> Vec<OverloadSignal> {
    let mut signals = Vec::new();
    if let Some(prev) = previous {
        if !prev.evidence.is_empty() && current.evidence.specificity() < prev.evidence.specificity() {
            signals.push(OverloadSignal::DecliningSpecificity);
        }
        let contradicts = current
            .facts
            .iter()
            .any(|(k, v)| prev.facts.get(k).is_some_and(|old| old != v));
        if contradicts {
            signals.push(OverloadSignal::InconsistentContext);
        }
    }
    match current.outcome {
        AttemptOutcome::FalseCompletionSuspected => signals.push(OverloadSignal::FalseCompletion),
        AttemptOutcome::OverloadDetected if !current.signals.contains(&OverloadSignal::Timeout) => {
            signals.push(OverloadSignal::SelfReportedOverload);
        }
        _ => {}
    }
    for carried in &current.signals {
        if !signals.contains(carried) {
            signals.push(*carried);
        }
    }
    signals
}

/// The next transition, if any, for an observation in the current state.
///
/// `retry_ceiling` bounds recovery cycles: a failure in
/// `RecoveryPlanSelected` starts a new cycle until that many have run.
pub fn observe(state: RecoveryState, obs: &Observation, retry_ceiling: u32) -> Option<Transition> {
    let to = |to: RecoveryPhase, cycle: u32| Transition {
        from: state.phase,
        to,
        signals: obs.signals.clone(),
        cycle,
    };
    let timed_out = obs.signals.contains(&OverloadSignal::Timeout);
    match state.phase {
        RecoveryPhase::Monitoring | RecoveryPhase::Recovered => {
            if obs.signals.len() >= 2 || timed_out {
                Some(to(RecoveryPhase::OverloadSuspected, state.cycles))
            } else {
                None
            }
        }
        RecoveryPhase::OverloadSuspected => {
            if !obs.signals.is_empty() && !obs.succeeded {
                Some(to(RecoveryPhase::Confirmed, state.cycles))
            } else {
                Some(to(RecoveryPhase::Monitoring, state.cycles))
            }
        }
        // Confirmed is left only by selecting a recovery plan.
        RecoveryPhase::Confirmed => None,
        RecoveryPhase::RecoveryPlanSelected => {
            if obs.succeeded {
                Some(to(RecoveryPhase::Recovered, state.cycles))
            } else if obs.signals.is_empty() {
                None
            } else if state.cycles >= retry_ceiling {
                Some(to(RecoveryPhase::Escalated, state.cycles))
            } else {
                Some(to(RecoveryPhase::Confirmed, state.cycles))
            }
        }
        RecoveryPhase::Escalated => None,
    }
}

/// Transition from `Confirmed` into a new recovery cycle.
pub fn select_plan(state: RecoveryState) -> Option<Transition> {
    (state.phase == RecoveryPhase::Confirmed).then(|| Transition {
        from: RecoveryPhase::Confirmed,
        to: RecoveryPhase::RecoveryPlanSelected,
        signals: Vec::new(),
        cycle: state.cycles + 1,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::coord::evidence::{ArtifactRef, EvidenceBundle, EvidenceCategory};
    use crate::coord::task::CapacityTier;

    fn record(outcome: AttemptOutcome, evidence: EvidenceBundle, facts: &[(&str, &str)]) -> AttemptRecord {
        AttemptRecord {
            attempt_id: "at-x".into(),
            worker: "w1".into(),
            worker_type: "junior".into(),
            tier: CapacityTier::Direct,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            outcome,
            evidence,
            facts: facts
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
            summary: None,
            signals: Vec::new(),
        }
    }

    fn state(phase: RecoveryPhase, cycles: u32) -> RecoveryState {
        RecoveryState { phase, cycles }
    }

    fn obs(signals: &[OverloadSignal], succeeded: bool) -> Observation {
        Observation {
            signals: signals.to_vec(),
            succeeded,
        }
    }

    #[test]
    fn detects_declining_specificity_and_inconsistency() {
        let rich = EvidenceBundle::new().with(
            EvidenceCategory::Technical,
            ArtifactRef::new("src/lib.rs#L10").covering("c1").reproduced_by("cargo test"),
        );
        let poor = EvidenceBundle::new().with(EvidenceCategory::Technical, ArtifactRef::new("done"));
        let prev = record(AttemptOutcome::OverloadDetected, rich, &[("db", "postgres")]);
        let cur = record(AttemptOutcome::OverloadDetected, poor, &[("db", "sqlite")]);
        let signals = detect_signals(Some(&prev), &cur);
        assert_eq!(
            signals,
            vec![
                OverloadSignal::DecliningSpecificity,
                OverloadSignal::InconsistentContext,
                OverloadSignal::SelfReportedOverload,
            ]
        );
    }

    #[test]
    fn first_attempt_has_no_comparison_signals() {
        let cur = record(AttemptOutcome::FalseCompletionSuspected, EvidenceBundle::new(), &[]);
        assert_eq!(detect_signals(None, &cur), vec![OverloadSignal::FalseCompletion]);
    }

    #[test]
    fn timeout_is_not_self_reported() {
        let mut cur = record(AttemptOutcome::OverloadDetected, EvidenceBundle::new(), &[]);
        cur.signals = vec![OverloadSignal::Timeout];
        assert_eq!(detect_signals(None, &cur), vec![OverloadSignal::Timeout]);
    }

    #[test]
    fn monitoring_needs_two_signals_or_timeout() {
        let s = state(RecoveryPhase::Monitoring, 0);
        assert!(observe(s, &obs(&[OverloadSignal::FalseCompletion], false), 2).is_none());
        let t = observe(
            s,
            &obs(&[OverloadSignal::FalseCompletion, OverloadSignal::InconsistentContext], false),
            2,
        )
        .unwrap();
        assert_eq!(t.to, RecoveryPhase::OverloadSuspected);
        let t = observe(s, &obs(&[OverloadSignal::Timeout], false), 2).unwrap();
        assert_eq!(t.to, RecoveryPhase::OverloadSuspected);
    }

    #[test]
    fn suspected_confirms_or_clears() {
        let s = state(RecoveryPhase::OverloadSuspected, 0);
        let t = observe(s, &obs(&[OverloadSignal::SelfReportedOverload], false), 2).unwrap();
        assert_eq!(t.to, RecoveryPhase::Confirmed);
        let t = observe(s, &obs(&[], true), 2).unwrap();
        assert_eq!(t.to, RecoveryPhase::Monitoring);
    }

    #[test]
    fn plan_selection_starts_a_cycle() {
        let t = select_plan(state(RecoveryPhase::Confirmed, 0)).unwrap();
        assert_eq!(t.to, RecoveryPhase::RecoveryPlanSelected);
        assert_eq!(t.cycle, 1);
        assert!(select_plan(state(RecoveryPhase::Monitoring, 0)).is_none());
    }

    #[test]
    fn recovery_succeeds_or_escalates_at_ceiling() {
        let s = state(RecoveryPhase::RecoveryPlanSelected, 1);
        assert_eq!(observe(s, &obs(&[], true), 2).unwrap().to, RecoveryPhase::Recovered);
        let again = observe(s, &obs(&[OverloadSignal::FalseCompletion], false), 2).unwrap();
        assert_eq!(again.to, RecoveryPhase::Confirmed);
        let s = state(RecoveryPhase::RecoveryPlanSelected, 2);
        let done = observe(s, &obs(&[OverloadSignal::FalseCompletion], false), 2).unwrap();
        assert_eq!(done.to, RecoveryPhase::Escalated);
        assert!(observe(state(RecoveryPhase::Escalated, 2), &obs(&[OverloadSignal::Timeout], false), 2).is_none());
    }

    #[test]
    fn transitions_apply_to_state() {
        let mut s = state(RecoveryPhase::Confirmed, 0);
        select_plan(s).unwrap().apply(&mut s);
        assert_eq!(s, state(RecoveryPhase::RecoveryPlanSelected, 1));
    }
}
