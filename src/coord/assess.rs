//! Complexity scoring from structural signals.

use tracing::warn;

use super::task::{ComplexityScore, FactorBreakdown, StructuralSignals};
use crate::config::ScoringConfig;

/// Tolerance for comparing raw scores against band thresholds.
const EPS: f64 = 1e-9;

const MAX_BAND: u8 = 5;

#[derive(Debug, Clone)]
pub struct ComplexityAssessor {
    config: ScoringConfig,
}

impl ComplexityAssessor {
    pub fn new(mut config: ScoringConfig) -> Self {
        config.bands.sort_by(f64::total_cmp);
        Self { config }
    }

    /// Weight applied to each validation checkpoint. Heavily checkpointed
    /// tasks cost more per checkpoint.
    pub fn validation_weight(&self, checkpoints: u32) -> f64 {
        if checkpoints <= self.config.heavy_validation_threshold {
            self.config.validation_weight
        } else {
            self.config.heavy_validation_weight
        }
    }

    /// Score a task. Never fails: negative counts are clamped to zero and
    /// listed in `ComplexityScore::clamped`.
    pub fn score(&self, description: &str, signals: StructuralSignals) -> ComplexityScore {
        let mut clamped = Vec::new();
        let mut clamp = |name: &str, value: i64| -> u32 {
            if value < 0 {
                clamped.push(format!("{name}={value}"));
                0
            } else {
                u32::try_from(value).unwrap_or(u32::MAX)
            }
        };
        let r = clamp("requirements", signals.requirements);
        let d = clamp("interdependencies", signals.interdependencies);
        let c = clamp("context_switches", signals.context_switches);
        let v = clamp("validation_checkpoints", signals.validation_checkpoints);

        if !clamped.is_empty() {
            warn!(
                kind = "assessment_error",
                clamped = %clamped.join(","),
                description = %truncate(description, 60),
                "negative structural signals clamped to zero"
            );
        }

        let factors = FactorBreakdown {
            requirements: f64::from(r) * self.config.requirements_weight,
            interdependencies: f64::from(d) * self.config.interdependency_weight,
            context_switches: f64::from(c) * self.config.context_switch_weight,
            validation: f64::from(v) * self.validation_weight(v),
        };
        let raw = factors.requirements
            + factors.interdependencies
            + factors.context_switches
            + factors.validation;

        ComplexityScore {
            band: self.band_for(raw),
            raw,
            factors,
            signals: StructuralSignals::new(i64::from(r), i64::from(d), i64::from(c), i64::from(v)),
            clamped,
        }
    }

    /// Map a raw score to its band: the first threshold it does not exceed.
    pub fn band_for(&self, raw: f64) -> u8 {
        let idx = self
            .config
            .bands
            .iter()
            .position(|&t| raw <= t + EPS)
            .unwrap_or(self.config.bands.len());
        u8::try_from(idx + 1).unwrap_or(MAX_BAND).min(MAX_BAND)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
