//! Evidence bundles submitted with attempt reports.
//!
//! Categories are a closed set of well-known names plus `Custom` for anything
//! else. Artifact references are opaque to the coordinator; only validators
//! interpret them.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EvidenceCategory {
    Technical,
    Functional,
    UserExperience,
    Integration,
    Regression,
    Custom(String),
}

impl EvidenceCategory {
    pub fn as_str(&self) -> &str {
        match self {
            EvidenceCategory::Technical => "technical",
            EvidenceCategory::Functional => "functional",
            EvidenceCategory::UserExperience => "user-experience",
            EvidenceCategory::Integration => "integration",
            EvidenceCategory::Regression => "regression",
            EvidenceCategory::Custom(name) => name,
        }
    }

    /// Parse a category name, returning `None` for names that are not one of
    /// the built-in categories.
    pub fn known(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "technical" => Some(EvidenceCategory::Technical),
            "functional" => Some(EvidenceCategory::Functional),
            "user-experience" | "user_experience" | "ux" => Some(EvidenceCategory::UserExperience),
            "integration" => Some(EvidenceCategory::Integration),
            "regression" => Some(EvidenceCategory::Regression),
            _ => None,
        }
    }
}

impl From<String> for EvidenceCategory {
    fn from(value: String) -> Self {
        Self::known(&value).unwrap_or_else(|| EvidenceCategory::Custom(value.trim().to_string()))
    }
}

impl From<EvidenceCategory> for String {
    fn from(value: EvidenceCategory) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for EvidenceCategory {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl std::fmt::Display for EvidenceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to one produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
    /// Acceptance criterion ids this artifact claims to cover.
    #[serde(default)]
    pub covers: Vec<String>,
    /// Ordered steps that reproduce what the artifact shows.
    #[serde(default)]
    pub reproduction: Vec<String>,
}

impl ArtifactRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            covers: Vec::new(),
            reproduction: Vec::new(),
        }
    }

    pub fn covering(mut self, criterion: &str) -> Self {
        self.covers.push(criterion.to_string());
        self
    }

    pub fn reproduced_by(mut self, step: &str) -> Self {
        self.reproduction.push(step.to_string());
        self
    }

    pub fn is_reproducible(&self) -> bool {
        self.reproduction.iter().any(|s| !s.trim().is_empty())
    }

    /// How concrete this reference is. A bare label scores 1; file paths,
    /// line numbers, criterion coverage and reproduction steps add to it.
    pub fn specificity(&self) -> u32 {
        let mut score = 1;
        if CONCRETE_URI.as_ref().is_some_and(|re| re.is_match(&self.uri)) {
            score += 1;
        }
        if !self.covers.is_empty() {
            score += 1;
        }
        if self.is_reproducible() {
            score += 1;
        }
        score
    }
}

/// Path separators, schemes, anchors or digits. A pattern that fails to
/// compile scores nothing.
static CONCRETE_URI: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[/\\:#]|\d").ok());

/// Evidence grouped by category, artifacts kept in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceBundle(pub BTreeMap<EvidenceCategory, Vec<ArtifactRef>>);

impl EvidenceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, category: EvidenceCategory, artifact: ArtifactRef) {
        self.0.entry(category).or_default().push(artifact);
    }

    pub fn with(mut self, category: EvidenceCategory, artifact: ArtifactRef) -> Self {
        self.add(category, artifact);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn in_category(&self, category: &EvidenceCategory) -> &[ArtifactRef] {
        self.0.get(category).map_or(&[], Vec::as_slice)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = (&EvidenceCategory, &ArtifactRef)> {
        self.0
            .iter()
            .flat_map(|(cat, items)| items.iter().map(move |a| (cat, a)))
    }

    pub fn artifact_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Total specificity across every artifact.
    pub fn specificity(&self) -> u32 {
        self.artifacts().map(|(_, a)| a.specificity()).sum()
    }
}
