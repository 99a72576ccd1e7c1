//! Per-worker-type capacity: baselines plus expiring modifiers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{CoordError, Result};
use crate::config::{ModifierConfig, WorkerConfig};

pub const MIN_BASELINE: f64 = 1.0;
pub const MAX_BASELINE: f64 = 5.0;

/// Planner-local modifier applied per recorded failure.
pub const PRIOR_FAILURE: &str = "prior-failure";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModifierExpiry {
    Permanent,
    Until { at: DateTime<Utc> },
    /// Applies only when planning this task.
    Task { task_id: String },
    /// Applies to the next `remaining` plans, then lapses.
    Uses { remaining: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityModifier {
    pub name: String,
    pub delta: f64,
    pub expiry: ModifierExpiry,
}

impl CapacityModifier {
    pub fn permanent(name: &str, delta: f64) -> Self {
        Self {
            name: name.to_string(),
            delta,
            expiry: ModifierExpiry::Permanent,
        }
    }

    pub fn for_task(name: &str, delta: f64, task_id: &str) -> Self {
        Self {
            name: name.to_string(),
            delta,
            expiry: ModifierExpiry::Task {
                task_id: task_id.to_string(),
            },
        }
    }

    /// Whether this modifier counts when planning `task_id` at `now`.
    pub fn applies(&self, task_id: &str, now: DateTime<Utc>) -> bool {
        match &self.expiry {
            ModifierExpiry::Permanent => true,
            ModifierExpiry::Until { at } => now < *at,
            ModifierExpiry::Task { task_id: scoped } => scoped == task_id,
            ModifierExpiry::Uses { remaining } => *remaining > 0,
        }
    }

    fn lapsed(&self, now: DateTime<Utc>) -> bool {
        match &self.expiry {
            ModifierExpiry::Until { at } => now >= *at,
            ModifierExpiry::Uses { remaining } => *remaining == 0,
            ModifierExpiry::Permanent | ModifierExpiry::Task { .. } => false,
        }
    }
}

impl From<&ModifierConfig> for CapacityModifier {
    fn from(cfg: &ModifierConfig) -> Self {
        let expiry = if let Some(at) = cfg.expires_at {
            ModifierExpiry::Until { at }
        } else if let Some(task_id) = &cfg.task {
            ModifierExpiry::Task {
                task_id: task_id.clone(),
            }
        } else if let Some(remaining) = cfg.uses {
            ModifierExpiry::Uses { remaining }
        } else {
            ModifierExpiry::Permanent
        };
        Self {
            name: cfg.name.clone(),
            delta: cfg.delta,
            expiry,
        }
    }
}

impl From<&CapacityModifier> for ModifierConfig {
    fn from(modifier: &CapacityModifier) -> Self {
        let mut cfg = Self {
            name: modifier.name.clone(),
            delta: modifier.delta,
            expires_at: None,
            task: None,
            uses: None,
        };
        match &modifier.expiry {
            ModifierExpiry::Permanent => {}
            ModifierExpiry::Until { at } => cfg.expires_at = Some(*at),
            ModifierExpiry::Task { task_id } => cfg.task = Some(task_id.clone()),
            ModifierExpiry::Uses { remaining } => cfg.uses = Some(*remaining),
        }
        cfg
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub worker_type: String,
    pub baseline: f64,
    pub modifiers: Vec<CapacityModifier>,
    pub active: bool,
    #[serde(default)]
    pub dispatch: Option<Vec<String>>,
}

impl WorkerProfile {
    pub fn new(worker_type: &str, baseline: f64) -> Self {
        Self {
            worker_type: worker_type.to_string(),
            baseline: clamp_baseline(baseline),
            modifiers: Vec::new(),
            active: true,
            dispatch: None,
        }
    }
}

fn clamp_baseline(baseline: f64) -> f64 {
    if baseline.is_finite() {
        baseline.clamp(MIN_BASELINE, MAX_BASELINE)
    } else {
        MIN_BASELINE
    }
}

/// A modifier as it contributed to one capacity computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedModifier {
    pub name: String,
    pub delta: f64,
}

/// Capacity arithmetic for one (worker type, task) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityBreakdown {
    pub baseline: f64,
    pub applied: Vec<AppliedModifier>,
    pub adjusted: f64,
}

impl CapacityBreakdown {
    /// Add a modifier that is not stored on the profile (planner-local).
    pub fn with(mut self, name: &str, delta: f64) -> Self {
        self.applied.push(AppliedModifier {
            name: name.to_string(),
            delta,
        });
        self.adjusted += delta;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapacityRegistry {
    profiles: BTreeMap<String, WorkerProfile>,
}

impl CapacityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(workers: &BTreeMap<String, WorkerConfig>) -> Self {
        let mut registry = Self::new();
        for (name, cfg) in workers {
            let mut profile = WorkerProfile::new(name, cfg.baseline);
            profile.modifiers = cfg.modifiers.iter().map(CapacityModifier::from).collect();
            profile.active = cfg.active;
            profile.dispatch.clone_from(&cfg.dispatch);
            registry.register(profile);
        }
        registry
    }

    /// Register or replace a worker type. The baseline is clamped to 1.0-5.0.
    pub fn register(&mut self, mut profile: WorkerProfile) {
        profile.baseline = clamp_baseline(profile.baseline);
        debug!(
            worker_type = %profile.worker_type,
            baseline = profile.baseline,
            "worker type registered"
        );
        self.profiles.insert(profile.worker_type.clone(), profile);
    }

    pub fn get(&self, worker_type: &str) -> Result<&WorkerProfile> {
        self.profiles
            .get(worker_type)
            .ok_or_else(|| CoordError::UnknownWorkerType(worker_type.to_string()))
    }

    fn get_mut(&mut self, worker_type: &str) -> Result<&mut WorkerProfile> {
        self.profiles
            .get_mut(worker_type)
            .ok_or_else(|| CoordError::UnknownWorkerType(worker_type.to_string()))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &WorkerProfile> {
        self.profiles.values()
    }

    /// Active worker types in name order.
    pub fn active_types(&self) -> Vec<&str> {
        self.profiles
            .values()
            .filter(|p| p.active)
            .map(|p| p.worker_type.as_str())
            .collect()
    }

    /// `baseline + sum(applicable modifiers)` for planning `task_id` now.
    pub fn adjusted_capacity(
        &self,
        worker_type: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CapacityBreakdown> {
        let profile = self.get(worker_type)?;
        let applied: Vec<AppliedModifier> = profile
            .modifiers
            .iter()
            .filter(|m| m.applies(task_id, now))
            .map(|m| AppliedModifier {
                name: m.name.clone(),
                delta: m.delta,
            })
            .collect();
        let adjusted = profile.baseline + applied.iter().map(|m| m.delta).sum::<f64>();
        Ok(CapacityBreakdown {
            baseline: profile.baseline,
            applied,
            adjusted,
        })
    }

    pub fn add_modifier(&mut self, worker_type: &str, modifier: CapacityModifier) -> Result<()> {
        let profile = self.get_mut(worker_type)?;
        info!(
            worker_type,
            modifier = %modifier.name,
            delta = modifier.delta,
            "capacity modifier added"
        );
        profile.modifiers.push(modifier);
        Ok(())
    }

    /// Drop lapsed modifiers everywhere. Returns how many were removed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for profile in self.profiles.values_mut() {
            let before = profile.modifiers.len();
            profile.modifiers.retain(|m| !m.lapsed(now));
            removed += before - profile.modifiers.len();
        }
        removed
    }

    /// Count one plan against every use-limited modifier that applied.
    /// Returns whether any use was spent.
    pub fn consume_use(&mut self, worker_type: &str) -> Result<bool> {
        let profile = self.get_mut(worker_type)?;
        let mut spent = false;
        for modifier in &mut profile.modifiers {
            if let ModifierExpiry::Uses { remaining } = &mut modifier.expiry {
                *remaining = remaining.saturating_sub(1);
                spent = true;
            }
        }
        profile
            .modifiers
            .retain(|m| !matches!(m.expiry, ModifierExpiry::Uses { remaining: 0 }));
        Ok(spent)
    }

    /// Copy activity flags and modifiers back onto the config entries the
    /// profiles were built from. Types missing from `workers` are skipped.
    pub fn write_into(&self, workers: &mut BTreeMap<String, WorkerConfig>) {
        for profile in self.profiles.values() {
            if let Some(cfg) = workers.get_mut(&profile.worker_type) {
                cfg.active = profile.active;
                cfg.modifiers = profile.modifiers.iter().map(ModifierConfig::from).collect();
            }
        }
    }

    /// Worker types are never removed, only deactivated.
    pub fn deactivate(&mut self, worker_type: &str) -> Result<()> {
        let profile = self.get_mut(worker_type)?;
        profile.active = false;
        info!(worker_type, "worker type deactivated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn registry() -> CapacityRegistry {
        let mut r = CapacityRegistry::new();
        r.register(WorkerProfile::new("junior", 2.0));
        r.register(WorkerProfile::new("senior", 4.0));
        r
    }

    #[test]
    fn baseline_is_clamped() {
        let mut r = CapacityRegistry::new();
        r.register(WorkerProfile::new("tiny", 0.2));
        r.register(WorkerProfile::new("huge", 9.0));
        assert!((r.get("tiny").unwrap().baseline - 1.0).abs() < f64::EPSILON);
        assert!((r.get("huge").unwrap().baseline - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn adjusted_capacity_sums_applicable_modifiers() {
        let mut r = registry();
        let now = Utc::now();
        r.add_modifier("junior", CapacityModifier::permanent("unfamiliar-domain", -0.5))
            .unwrap();
        r.add_modifier("junior", CapacityModifier::for_task("context-load", -0.3, "tk-a"))
            .unwrap();
        r.add_modifier(
            "junior",
            CapacityModifier {
                name: "expired".into(),
                delta: 2.0,
                expiry: ModifierExpiry::Until {
                    at: now - Duration::minutes(1),
                },
            },
        )
        .unwrap();

        let for_a = r.adjusted_capacity("junior", "tk-a", now).unwrap();
        assert!((for_a.adjusted - 1.2).abs() < 1e-9);
        assert_eq!(for_a.applied.len(), 2);

        let for_b = r.adjusted_capacity("junior", "tk-b", now).unwrap();
        assert!((for_b.adjusted - 1.5).abs() < 1e-9);
    }

    #[test]
    fn use_limited_modifiers_lapse() {
        let mut r = registry();
        r.add_modifier(
            "senior",
            CapacityModifier {
                name: "warmup".into(),
                delta: -1.0,
                expiry: ModifierExpiry::Uses { remaining: 1 },
            },
        )
        .unwrap();
        let now = Utc::now();
        assert!((r.adjusted_capacity("senior", "t", now).unwrap().adjusted - 3.0).abs() < 1e-9);
        assert!(r.consume_use("senior").unwrap());
        assert!((r.adjusted_capacity("senior", "t", now).unwrap().adjusted - 4.0).abs() < 1e-9);
        assert!(r.get("senior").unwrap().modifiers.is_empty());
        assert!(!r.consume_use("senior").unwrap());
    }

    #[test]
    fn expire_removes_only_lapsed() {
        let mut r = registry();
        let now = Utc::now();
        r.add_modifier(
            "junior",
            CapacityModifier {
                name: "sprint".into(),
                delta: 0.5,
                expiry: ModifierExpiry::Until {
                    at: now + Duration::hours(1),
                },
            },
        )
        .unwrap();
        r.add_modifier("junior", CapacityModifier::permanent("pairing", 0.5))
            .unwrap();
        assert_eq!(r.expire(now), 0);
        assert_eq!(r.expire(now + Duration::hours(2)), 1);
        assert_eq!(r.get("junior").unwrap().modifiers.len(), 1);
    }

    #[test]
    fn deactivated_types_are_kept_but_inactive() {
        let mut r = registry();
        r.deactivate("junior").unwrap();
        assert_eq!(r.active_types(), vec!["senior"]);
        assert!(r.get("junior").is_ok());
    }

    #[test]
    fn unknown_worker_type_errors() {
        let r = registry();
        assert!(matches!(
            r.adjusted_capacity("ghost", "t", Utc::now()),
            Err(CoordError::UnknownWorkerType(_))
        ));
    }

    #[test]
    fn config_modifiers_map_to_expiries() {
        let cfg = ModifierConfig {
            name: "pairing".into(),
            delta: 0.5,
            expires_at: None,
            task: None,
            uses: Some(3),
        };
        let m = CapacityModifier::from(&cfg);
        assert_eq!(m.expiry, ModifierExpiry::Uses { remaining: 3 });
    }

    #[test]
    fn write_into_carries_state_back_to_config() {
        let mut workers = BTreeMap::new();
        workers.insert(
            "junior".to_string(),
            WorkerConfig {
                baseline: 2.0,
                description: Some("kept".into()),
                modifiers: vec![ModifierConfig {
                    name: "warmup".into(),
                    delta: 0.5,
                    expires_at: None,
                    task: None,
                    uses: Some(2),
                }],
                dispatch: None,
                active: true,
            },
        );
        let mut r = CapacityRegistry::from_config(&workers);
        r.consume_use("junior").unwrap();
        r.add_modifier("junior", CapacityModifier::for_task("context-load", -0.3, "tk-a"))
            .unwrap();
        r.deactivate("junior").unwrap();
        r.register(WorkerProfile::new("ghost", 3.0));
        r.write_into(&mut workers);

        let junior = &workers["junior"];
        assert!(!junior.active);
        assert_eq!(junior.description.as_deref(), Some("kept"));
        assert_eq!(junior.modifiers.len(), 2);
        assert_eq!(junior.modifiers[0].uses, Some(1));
        assert_eq!(junior.modifiers[1].task.as_deref(), Some("tk-a"));
        assert!(!workers.contains_key("ghost"));
    }

    #[test]
    fn breakdown_with_adds_local_modifier() {
        let r = registry();
        let b = r
            .adjusted_capacity("junior", "t", Utc::now())
            .unwrap()
            .with(PRIOR_FAILURE, -1.0);
        assert!((b.adjusted - 1.0).abs() < 1e-9);
        assert_eq!(b.applied.last().unwrap().name, PRIOR_FAILURE);
    }
}
