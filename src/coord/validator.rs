//! Evidence validation by an actor other than the worker.
//!
//! Turns a task's acceptance criteria, the attempt's evidence bundle and the
//! validator's own findings into one verdict. The worker's free-text summary
//! is never an input.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{CoordError, Result};
use super::task::{AttemptOutcome, AttemptRecord, Task};

/// What the validator observed independently of the worker's evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorFindings {
    /// Criterion id -> why it fails, as observed by the validator.
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl ValidatorFindings {
    pub fn fail(mut self, criterion: &str, note: &str) -> Self {
        self.failed.insert(criterion.to_string(), note.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Confirmed,
    Rejected {
        reasons: Vec<String>,
        /// Unmet acceptance criteria, verbatim.
        unmet_criteria: Vec<String>,
        /// Ordered steps to observe the failure.
        reproduction: Vec<String>,
    },
}

impl Verdict {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Verdict::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Confirmed => "confirmed",
            Verdict::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub attempt_id: String,
    pub validator: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    #[serde(default)]
    pub notes: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

/// Judge an attempt against the task's acceptance criteria.
pub fn validate(
    task: &Task,
    attempt: &AttemptRecord,
    validator: &str,
    findings: &ValidatorFindings,
) -> Result<VerdictRecord> {
    if validator.trim().is_empty() {
        return Err(CoordError::InvalidInput("validator id must not be empty".into()));
    }
    if validator == attempt.worker {
        return Err(CoordError::SelfCertification {
            validator: validator.to_string(),
            attempt: attempt.attempt_id.clone(),
        });
    }

    let mut reasons = Vec::new();
    let mut unmet = Vec::new();
    let mut reproduction = Vec::new();

    if attempt.outcome != AttemptOutcome::Success {
        reasons.push(format!("attempt outcome is {}, not success", attempt.outcome));
        unmet.extend(task.criteria.iter().map(|c| c.text.clone()));
        reproduction.push(format!("inspect attempt {} on task {}", attempt.attempt_id, task.id));
    } else if task.criteria.is_empty() {
        let reproducible = attempt.evidence.artifacts().any(|(_, a)| a.is_reproducible());
        if !reproducible {
            reasons.push("no reproducible artifact submitted".into());
            reproduction.push(format!(
                "list evidence for attempt {}: no artifact carries reproduction steps",
                attempt.attempt_id
            ));
        }
    } else {
        for criterion in &task.criteria {
            if let Some(note) = findings.failed.get(&criterion.id) {
                reasons.push(format!("{}: validator observed failure: {note}", criterion.id));
                unmet.push(criterion.text.clone());
                reproduction.push(format!("check {} ({}): {note}", criterion.id, criterion.category));
                continue;
            }
            let candidates: Vec<_> = attempt
                .evidence
                .in_category(&criterion.category)
                .iter()
                .filter(|a| a.covers.iter().any(|c| *c == criterion.id))
                .collect();
            if candidates.is_empty() {
                reasons.push(format!(
                    "{}: no {} evidence covers this criterion",
                    criterion.id, criterion.category
                ));
                unmet.push(criterion.text.clone());
                reproduction.push(format!(
                    "list {} evidence for attempt {}: nothing covers {}",
                    criterion.category, attempt.attempt_id, criterion.id
                ));
            } else if !candidates.iter().any(|a| a.is_reproducible()) {
                let artifact = candidates[0];
                reasons.push(format!(
                    "{}: evidence {} has no reproduction steps",
                    criterion.id, artifact.uri
                ));
                unmet.push(criterion.text.clone());
                reproduction.push(format!(
                    "open {} and attempt to reproduce {}: no steps given",
                    artifact.uri, criterion.id
                ));
            }
        }
    }

    let verdict = if reasons.is_empty() {
        info!(task = %task.id, attempt = %attempt.attempt_id, validator, "evidence confirmed");
        Verdict::Confirmed
    } else {
        warn!(
            task = %task.id,
            attempt = %attempt.attempt_id,
            validator,
            unmet = unmet.len(),
            "evidence rejected"
        );
        Verdict::Rejected {
            reasons,
            unmet_criteria: unmet,
            reproduction,
        }
    };

    Ok(VerdictRecord {
        attempt_id: attempt.attempt_id.clone(),
        validator: validator.to_string(),
        verdict,
        notes: findings.notes.clone(),
        validated_at: Utc::now(),
    })
}
