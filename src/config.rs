use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".relay.toml";
pub const CONFIG_JSON: &str = ".relay.json";

/// Find the config file path, preferring .relay.toml over .relay.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Find config for a project root, walking up parent directories until one is
/// found. Returns (config_path, project_dir).
pub fn find_config_in_project(root: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    for dir in root.ancestors() {
        if let Some(path) = find_config(dir) {
            return Ok((path, dir.to_path_buf()));
        }
    }
    Err(ExitError::Config(format!(
        "no {CONFIG_TOML} or {CONFIG_JSON} found in {} or its parents (run `relay init`)",
        root.display()
    ))
    .into())
}

/// Top-level .relay.toml config.
///
/// All structs use snake_case (TOML native) with `alias` attributes so
/// camelCase JSON configs load too.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    pub project: ProjectConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    pub name: String,
    /// Worker type used by `relay assign` when none is given and `plan_any`
    /// is not requested.
    #[serde(default, alias = "defaultWorker")]
    pub default_worker: Option<String>,
    /// Directory holding relay state (ledger, memory snapshots, briefs).
    #[serde(default = "default_state_dir", alias = "stateDir")]
    pub state_dir: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    #[default]
    File,
    Bones,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TrackerConfig {
    #[serde(default)]
    pub kind: TrackerKind,
    /// Ledger directory for the file backend (relative to the project root).
    #[serde(default)]
    pub path: Option<String>,
    /// Base URL for the http backend.
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the http bearer token.
    #[serde(default, alias = "tokenEnv")]
    pub token_env: Option<String>,
    /// Run `bn` through `maw exec <workspace> --` for the bones backend.
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default = "default_tracker_timeout", alias = "timeoutSecs")]
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kind: TrackerKind::File,
            path: None,
            url: None,
            token_env: None,
            workspace: None,
            timeout_secs: default_tracker_timeout(),
        }
    }
}

/// Complexity scoring weights and band thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScoringConfig {
    #[serde(default = "default_weight_requirements", alias = "requirementsWeight")]
    pub requirements_weight: f64,
    #[serde(default = "default_weight_interdependencies", alias = "interdependencyWeight")]
    pub interdependency_weight: f64,
    #[serde(default = "default_weight_context_switches", alias = "contextSwitchWeight")]
    pub context_switch_weight: f64,
    #[serde(default = "default_weight_validation", alias = "validationWeight")]
    pub validation_weight: f64,
    #[serde(default = "default_weight_heavy_validation", alias = "heavyValidationWeight")]
    pub heavy_validation_weight: f64,
    /// Checkpoint counts above this use `heavy_validation_weight`.
    #[serde(default = "default_heavy_validation_threshold", alias = "heavyValidationThreshold")]
    pub heavy_validation_threshold: u32,
    /// Upper raw-score bound (inclusive) of bands 1..=4; anything above the
    /// last threshold is band 5.
    #[serde(default = "default_bands")]
    pub bands: Vec<f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            requirements_weight: default_weight_requirements(),
            interdependency_weight: default_weight_interdependencies(),
            context_switch_weight: default_weight_context_switches(),
            validation_weight: default_weight_validation(),
            heavy_validation_weight: default_weight_heavy_validation(),
            heavy_validation_threshold: default_heavy_validation_threshold(),
            bands: default_bands(),
        }
    }
}

/// Inclusive probability range reported alongside a planner decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SuccessBand {
    pub low: f64,
    pub high: f64,
}

impl SuccessBand {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }
}

impl std::fmt::Display for SuccessBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let low = (self.low * 100.0).round();
        let high = (self.high * 100.0).round();
        if (low - high).abs() < f64::EPSILON {
            write!(f, "~{low}%")
        } else {
            write!(f, "{low}-{high}%")
        }
    }
}

/// Gap thresholds for each decision and the success band reported with it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecisionTable {
    #[serde(default = "default_direct_max_gap", alias = "directMaxGap")]
    pub direct_max_gap: f64,
    #[serde(default = "default_memory_max_gap", alias = "memoryMaxGap")]
    pub memory_max_gap: f64,
    #[serde(default = "default_decompose_max_gap", alias = "decomposeMaxGap")]
    pub decompose_max_gap: f64,
    #[serde(default = "default_direct_success", alias = "directSuccess")]
    pub direct_success: SuccessBand,
    #[serde(default = "default_memory_success", alias = "memorySuccess")]
    pub memory_success: SuccessBand,
    #[serde(default = "default_decompose_success", alias = "decomposeSuccess")]
    pub decompose_success: SuccessBand,
    #[serde(default = "default_escalate_success", alias = "escalateSuccess")]
    pub escalate_success: SuccessBand,
}

impl Default for DecisionTable {
    fn default() -> Self {
        Self {
            direct_max_gap: default_direct_max_gap(),
            memory_max_gap: default_memory_max_gap(),
            decompose_max_gap: default_decompose_max_gap(),
            direct_success: default_direct_success(),
            memory_success: default_memory_success(),
            decompose_success: default_decompose_success(),
            escalate_success: default_escalate_success(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannerConfig {
    #[serde(default = "default_max_subtasks", alias = "maxSubtasks")]
    pub max_subtasks: u32,
    /// Capacity lost per recorded failure on the task.
    #[serde(default = "default_failure_penalty", alias = "failurePenalty")]
    pub failure_penalty: f64,
    #[serde(default = "default_memory_bonus_min", alias = "memoryBonusMin")]
    pub memory_bonus_min: f64,
    #[serde(default = "default_memory_bonus_max", alias = "memoryBonusMax")]
    pub memory_bonus_max: f64,
    #[serde(default)]
    pub table: DecisionTable,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_subtasks: default_max_subtasks(),
            failure_penalty: default_failure_penalty(),
            memory_bonus_min: default_memory_bonus_min(),
            memory_bonus_max: default_memory_bonus_max(),
            table: DecisionTable::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MemoryConfig {
    /// Snapshot store root (relative to the project root).
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_critical_ratio", alias = "criticalRatio")]
    pub critical_ratio: f64,
    #[serde(default = "default_important_ratio", alias = "importantRatio")]
    pub important_ratio: f64,
    #[serde(default = "default_reference_ratio", alias = "referenceRatio")]
    pub reference_ratio: f64,
    /// Share of critical manifest entries that must verify before a handoff.
    #[serde(default = "default_critical_presence_ratio", alias = "criticalPresenceRatio")]
    pub critical_presence_ratio: f64,
    /// Content containing any of these markers counts as unresolved.
    #[serde(default = "default_ambiguity_markers", alias = "ambiguityMarkers")]
    pub ambiguity_markers: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            critical_ratio: default_critical_ratio(),
            important_ratio: default_important_ratio(),
            reference_ratio: default_reference_ratio(),
            critical_presence_ratio: default_critical_presence_ratio(),
            ambiguity_markers: default_ambiguity_markers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecoveryConfig {
    /// Recovery cycles allowed before the task escalates.
    #[serde(default = "default_retry_ceiling", alias = "retryCeiling")]
    pub retry_ceiling: u32,
    /// Failed attempts allowed before the task escalates regardless of state.
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout", alias = "attemptTimeoutSecs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_watch_interval", alias = "watchIntervalSecs")]
    pub watch_interval_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
            watch_interval_secs: default_watch_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerConfig {
    pub baseline: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<ModifierConfig>,
    /// Command spawned on assignment. `{task}`, `{attempt}`, `{worker}`,
    /// `{snapshot}` and `{brief}` are substituted in each argument.
    #[serde(default)]
    pub dispatch: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A capacity modifier declared in config. At most one of `expires_at`,
/// `task` or `uses` may be set; none means permanent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModifierConfig {
    pub name: String,
    pub delta: f64,
    #[serde(default, alias = "expiresAt")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub uses: Option<u32>,
}

// Default value functions for serde
fn default_version() -> String { env!("CARGO_PKG_VERSION").into() }
fn default_state_dir() -> String { ".relay".into() }
fn default_tracker_timeout() -> u64 { 30 }
fn default_weight_requirements() -> f64 { 1.0 }
fn default_weight_interdependencies() -> f64 { 0.5 }
fn default_weight_context_switches() -> f64 { 0.8 }
fn default_weight_validation() -> f64 { 1.0 }
fn default_weight_heavy_validation() -> f64 { 1.25 }
fn default_heavy_validation_threshold() -> u32 { 3 }
fn default_bands() -> Vec<f64> { vec![3.0, 6.0, 9.0, 13.0] }
fn default_direct_max_gap() -> f64 { 0.0 }
fn default_memory_max_gap() -> f64 { 1.0 }
fn default_decompose_max_gap() -> f64 { 2.0 }
fn default_direct_success() -> SuccessBand { SuccessBand::new(0.80, 0.95) }
fn default_memory_success() -> SuccessBand { SuccessBand::new(0.60, 0.80) }
fn default_decompose_success() -> SuccessBand { SuccessBand::new(0.40, 0.40) }
fn default_escalate_success() -> SuccessBand { SuccessBand::new(0.0, 0.20) }
fn default_max_subtasks() -> u32 { 4 }
fn default_failure_penalty() -> f64 { 0.5 }
fn default_memory_bonus_min() -> f64 { 0.5 }
fn default_memory_bonus_max() -> f64 { 1.0 }
fn default_critical_ratio() -> f64 { 0.75 }
fn default_important_ratio() -> f64 { 0.40 }
fn default_reference_ratio() -> f64 { 0.10 }
fn default_critical_presence_ratio() -> f64 { 0.9 }
fn default_ambiguity_markers() -> Vec<String> {
    vec!["TBD".into(), "???".into(), "<unknown>".into()]
}
fn default_retry_ceiling() -> u32 { 2 }
fn default_max_attempts() -> u32 { 6 }
fn default_attempt_timeout() -> u64 { 1800 }
fn default_watch_interval() -> u64 { 30 }
fn default_true() -> bool { true }

impl Config {
    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }?;
        config.check()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    /// Reject values that would make the engine misbehave rather than fail.
    pub fn check(&self) -> anyhow::Result<()> {
        let mut problems = Vec::new();
        if self.scoring.bands.is_empty() {
            problems.push("scoring.bands must not be empty".to_string());
        }
        if self.scoring.bands.iter().any(|b| !b.is_finite()) {
            problems.push("scoring.bands must be finite numbers".to_string());
        }
        let table = &self.planner.table;
        if !(table.direct_max_gap <= table.memory_max_gap
            && table.memory_max_gap <= table.decompose_max_gap)
        {
            problems.push(
                "planner.table gaps must satisfy direct <= memory <= decompose".to_string(),
            );
        }
        if self.planner.max_subtasks < 2 {
            problems.push("planner.max_subtasks must be at least 2".to_string());
        }
        let memory = &self.memory;
        if !(memory.reference_ratio <= memory.important_ratio
            && memory.important_ratio <= memory.critical_ratio)
        {
            problems.push("memory ratios must satisfy reference <= important <= critical".to_string());
        }
        if !(0.0..=1.0).contains(&memory.critical_presence_ratio) {
            problems.push("memory.critical_presence_ratio must be within 0..=1".to_string());
        }
        for (name, worker) in &self.workers {
            if !worker.baseline.is_finite() {
                problems.push(format!("workers.{name}.baseline must be a number"));
            }
            for modifier in &worker.modifiers {
                let expiries = usize::from(modifier.expires_at.is_some())
                    + usize::from(modifier.task.is_some())
                    + usize::from(modifier.uses.is_some());
                if expiries > 1 {
                    problems.push(format!(
                        "workers.{name}.modifiers.{}: set at most one of expires_at, task, uses",
                        modifier.name
                    ));
                }
            }
            if worker.dispatch.as_ref().is_some_and(Vec::is_empty) {
                problems.push(format!("workers.{name}.dispatch must not be empty"));
            }
        }
        if let Some(default) = &self.project.default_worker
            && !self.workers.contains_key(default)
        {
            problems.push(format!("project.default_worker {default:?} is not a configured worker"));
        }
        if self.tracker.kind == TrackerKind::Http && self.tracker.url.is_none() {
            problems.push("tracker.url is required for the http tracker".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ExitError::Config(problems.join("; ")).into())
        }
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# relay project configuration\n# Run `relay schema` for the full JSON Schema.\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            let Some(tbl) = doc.get_mut(key).and_then(toml_edit::Item::as_table_mut) else {
                return;
            };
            if !tbl.is_implicit() {
                tbl.decor_mut().set_prefix(comment);
                return;
            }
            // Implicit parents (`[workers.x]` only) never render their decor.
            if let Some(first) = tbl
                .iter_mut()
                .find_map(|(_, item)| item.as_table_mut())
            {
                first.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "tracker", "\n# Where the coordination ledger lives (file, bones, http)\n");
        set_table_comment(&mut doc, "scoring", "\n# Complexity scoring: raw = R*w_r + D*w_d + C*w_c + V*w_v, banded 1-5\n");
        set_table_comment(&mut doc, "planner", "\n# Capacity gap thresholds and decomposition limits\n");
        set_table_comment(&mut doc, "memory", "\n# External memory tiering and handoff verification\n");
        set_table_comment(&mut doc, "recovery", "\n# Overload recovery: cycles, attempt ceiling, timeouts\n");
        set_table_comment(&mut doc, "workers", "\n# Worker types: baseline capacity (1.0-5.0), modifiers, dispatch command\n");

        Ok(doc.to_string())
    }

    /// A starter config with two example worker types.
    pub fn starter(name: &str) -> Self {
        let mut workers = BTreeMap::new();
        workers.insert(
            "generalist".to_string(),
            WorkerConfig {
                baseline: 3.0,
                description: Some("Handles most single-concern tasks".into()),
                modifiers: Vec::new(),
                dispatch: None,
                active: true,
            },
        );
        workers.insert(
            "specialist".to_string(),
            WorkerConfig {
                baseline: 4.0,
                description: Some("Deep context, slower turnaround".into()),
                modifiers: Vec::new(),
                dispatch: None,
                active: true,
            },
        );
        Self {
            version: default_version(),
            project: ProjectConfig {
                name: name.to_string(),
                default_worker: Some("generalist".into()),
                state_dir: default_state_dir(),
            },
            tracker: TrackerConfig::default(),
            scoring: ScoringConfig::default(),
            planner: PlannerConfig::default(),
            memory: MemoryConfig::default(),
            recovery: RecoveryConfig::default(),
            workers,
        }
    }

    /// Directory for relay state, resolved against the project root.
    pub fn state_dir(&self, root: &Path) -> PathBuf {
        resolve_path(root, &self.project.state_dir)
    }

    /// Ledger directory for the file tracker.
    pub fn ledger_dir(&self, root: &Path) -> PathBuf {
        self.tracker.path.as_deref().map_or_else(
            || self.state_dir(root).join("ledger"),
            |p| resolve_path(root, p),
        )
    }

    /// Snapshot store root.
    pub fn memory_dir(&self, root: &Path) -> PathBuf {
        self.memory.path.as_deref().map_or_else(
            || self.state_dir(root).join("memory"),
            |p| resolve_path(root, p),
        )
    }
}

/// Resolve a config path: `~/` expands to the home directory, relative paths
/// are joined to `root`.
pub fn resolve_path(root: &Path, path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Load the config at `path`, let `edit` change its worker types, then write
/// the `workers` section back. The rest of a TOML file, comments included, is
/// left as written.
pub fn update_workers<F>(path: &Path, edit: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut BTreeMap<String, WorkerConfig>) -> anyhow::Result<()>,
{
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let mut config = if json {
        Config::parse_json(&raw)?
    } else {
        Config::parse_toml(&raw)?
    };
    edit(&mut config.workers)?;
    config.check()?;
    let updated = if json {
        workers_json(&raw, &config.workers)?
    } else {
        workers_toml(&raw, &config.workers)?
    };
    std::fs::write(path, updated).with_context(|| format!("writing {}", path.display()))
}

fn workers_json(raw: &str, workers: &BTreeMap<String, WorkerConfig>) -> anyhow::Result<String> {
    let mut value: serde_json::Value = serde_json::from_str(raw).context("parsing config JSON")?;
    value
        .as_object_mut()
        .context("config JSON must be an object")?
        .insert("workers".into(), serde_json::to_value(workers)?);
    let mut out = serde_json::to_string_pretty(&value)?;
    out.push('\n');
    Ok(out)
}

/// Existing worker tables keep their scalar keys; only `active` and the
/// modifier list are rewritten. New worker types get a full table.
fn workers_toml(raw: &str, workers: &BTreeMap<String, WorkerConfig>) -> anyhow::Result<String> {
    use toml_edit::{Item, Table, value};

    let mut doc: toml_edit::DocumentMut = raw.parse().context("parsing config TOML")?;
    let section = doc
        .entry("workers")
        .or_insert_with(|| {
            let mut t = Table::new();
            t.set_implicit(true);
            Item::Table(t)
        })
        .as_table_mut()
        .context("`workers` must be a table")?;
    section.retain(|name, _| workers.contains_key(name));

    for (name, worker) in workers {
        let fresh = !section.contains_key(name);
        let table = section
            .entry(name)
            .or_insert_with(toml_edit::table)
            .as_table_mut()
            .with_context(|| format!("`workers.{name}` must be a table"))?;
        if fresh {
            table.insert("baseline", value(worker.baseline));
            if let Some(description) = &worker.description {
                table.insert("description", value(description.as_str()));
            }
            if let Some(args) = &worker.dispatch {
                let args: toml_edit::Array = args.iter().map(String::as_str).collect();
                table.insert("dispatch", value(args));
            }
        }
        if !worker.active || table.contains_key("active") {
            table.insert("active", value(worker.active));
        }
        if worker.modifiers.is_empty() {
            table.remove("modifiers");
        } else {
            table.insert("modifiers", Item::ArrayOfTables(modifier_tables(&worker.modifiers)));
        }
    }
    Ok(doc.to_string())
}

fn modifier_tables(modifiers: &[ModifierConfig]) -> toml_edit::ArrayOfTables {
    use toml_edit::value;

    let mut out = toml_edit::ArrayOfTables::new();
    for modifier in modifiers {
        let mut t = toml_edit::Table::new();
        t.insert("name", value(modifier.name.as_str()));
        t.insert("delta", value(modifier.delta));
        if let Some(at) = modifier.expires_at {
            t.insert("expires_at", value(at.to_rfc3339()));
        }
        if let Some(task) = &modifier.task {
            t.insert("task", value(task.as_str()));
        }
        if let Some(uses) = modifier.uses {
            t.insert("uses", value(i64::from(uses)));
        }
        out.push(t);
    }
    out
}
