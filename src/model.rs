//src/model.rs
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::log_store::LogStore;

/// Identifies one set's log inside a session: `"{exercise}-{set}"`.
/// Only meaningful for the lifetime of a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetKey {
    pub exercise: usize,
    pub set: usize,
}

impl SetKey {
    #[must_use]
    pub const fn new(exercise: usize, set: usize) -> Self {
        Self { exercise, set }
    }
}

impl fmt::Display for SetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.exercise, self.set)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid set key: '{0}'")]
pub struct ParseSetKeyError(pub String);

impl FromStr for SetKey {
    type Err = ParseSetKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ex, set) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| ParseSetKeyError(s.to_string()))?;
        let exercise = ex
            .trim()
            .parse()
            .map_err(|_| ParseSetKeyError(s.to_string()))?;
        let set = set
            .trim()
            .parse()
            .map_err(|_| ParseSetKeyError(s.to_string()))?;
        Ok(Self { exercise, set })
    }
}

impl Serialize for SetKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SetKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("number pattern is valid"))
}

/// Parses free-text training input ("82,5 kg", "10 reps", "8") into a number.
/// Takes the first numeric token; a comma is accepted as decimal separator.
#[must_use]
pub fn parse_training_number(raw: &str) -> Option<f64> {
    let normalized = raw.replacen(',', ".", 1);
    let token = number_pattern().find(&normalized)?;
    token.as_str().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Like [`parse_training_number`] but only accepts strictly positive values.
#[must_use]
pub fn parse_positive(raw: Option<&str>) -> Option<f64> {
    raw.and_then(parse_training_number).filter(|n| *n > 0.0)
}

/// Folds free text for matching: strips diacritics, lowercases and
/// collapses whitespace. `"  Supino   Inclinado "` and `"supino inclinado"`
/// fold to the same string.
#[must_use]
pub fn fold_text(raw: &str) -> String {
    let stripped: String = raw.nfd().filter(|c| !is_combining_mark(*c)).collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Serde helpers that accept the loosely-typed values found in stored sessions
/// (numbers as strings, strings as numbers, `null` everywhere).
pub(crate) mod lenient {
    use super::parse_training_number;
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        opt_text(d).map(Option::unwrap_or_default)
    }

    pub fn opt_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()),
            Some(Value::String(s)) => parse_training_number(&s),
            _ => None,
        })
    }

    pub fn opt_count<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        opt_number(d).map(|n| {
            n.filter(|v| *v >= 0.0)
                .map(|v| v.trunc().min(f64::from(u32::MAX)) as u32)
        })
    }

    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        opt_count(d).map(Option::unwrap_or_default)
    }

    pub fn opt_flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Bool(b)) => Some(b),
            Some(Value::String(s)) => Some(s.trim().eq_ignore_ascii_case("true")),
            Some(Value::Number(n)) => Some(n.as_f64().map_or(false, |v| v != 0.0)),
            _ => None,
        })
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        opt_flag(d).map(Option::unwrap_or_default)
    }

    /// Anything that fails to match the expected shape becomes `None`
    /// instead of failing the enclosing record.
    pub fn opt_value<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        Ok(Option::<Value>::deserialize(d)?
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v).ok()))
    }
}

/// Execution method declared on an exercise header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, EnumIter, Serialize, Deserialize)]
#[strum(ascii_case_insensitive)]
#[serde(from = "String", into = "String")]
pub enum Method {
    #[default]
    #[strum(to_string = "Normal")]
    Normal,
    #[strum(to_string = "Drop-set", serialize = "Dropset", serialize = "Drop set")]
    DropSet,
    #[strum(to_string = "Rest-Pause", serialize = "RestPause", serialize = "Rest Pause")]
    RestPause,
    #[strum(to_string = "Bi-Set", serialize = "BiSet", serialize = "Bi Set")]
    BiSet,
    #[strum(to_string = "Cluster")]
    Cluster,
}

// Unknown methods fall back to Normal rather than rejecting the workout.
impl From<String> for Method {
    fn from(value: String) -> Self {
        Self::from_str(value.trim()).unwrap_or_default()
    }
}

impl From<Method> for String {
    fn from(value: Method) -> Self {
        value.to_string()
    }
}

/// Cluster / rest-pause parameters carried on a planned set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanParams {
    #[serde(deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub total_reps: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub cluster_size: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub cluster_blocks_count: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub intra_rest_sec: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub mini_sets: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub rest_time_sec: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub initial_reps: Option<f64>,
}

impl PlanParams {
    /// Any two of cluster size, intra-set rest and total reps identify a cluster plan.
    #[must_use]
    pub fn looks_like_cluster(&self) -> bool {
        let size = self.cluster_size.is_some();
        let intra = self.intra_rest_sec.is_some();
        let total = self.total_reps.is_some();
        (size && intra) || (size && total) || (intra && total)
    }

    /// Any two of mini-set count, pause and initial reps identify a rest-pause plan.
    #[must_use]
    pub fn looks_like_rest_pause(&self) -> bool {
        let minis = self.mini_sets.is_some();
        let rest = self.rest_time_sec.is_some();
        let initial = self.initial_reps.is_some();
        (minis && rest) || (minis && initial) || (rest && initial)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    #[serde(default, deserialize_with = "lenient::opt_number")]
    pub weight: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_number")]
    pub reps: Option<f64>,
}

/// Stored advanced configuration of a planned set: either a list of drop-set
/// stages or a parameter object (cluster / rest-pause).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdvancedConfig {
    Stages(Vec<StagePlan>),
    Params(PlanParams),
}

impl AdvancedConfig {
    #[must_use]
    pub fn stages(&self) -> Option<&[StagePlan]> {
        match self {
            Self::Stages(stages) if !stages.is_empty() => Some(stages),
            _ => None,
        }
    }

    #[must_use]
    pub const fn params(&self) -> Option<&PlanParams> {
        match self {
            Self::Params(p) => Some(p),
            Self::Stages(_) => None,
        }
    }
}

/// The coach's plan for one set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannedSet {
    #[serde(alias = "setNumber", deserialize_with = "lenient::opt_count")]
    pub set_number: Option<u32>,
    #[serde(deserialize_with = "lenient::opt_text")]
    pub weight: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text")]
    pub reps: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text")]
    pub rpe: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text")]
    pub notes: Option<String>,
    #[serde(alias = "isWarmup", deserialize_with = "lenient::flag")]
    pub is_warmup: bool,
    #[serde(alias = "advancedConfig", deserialize_with = "lenient::opt_value")]
    pub advanced_config: Option<AdvancedConfig>,
    /// Set when the drop-set stages were derived from exercise notes.
    #[serde(skip)]
    pub inferred: bool,
}

impl PlannedSet {
    /// A blank slot numbered `set_number`.
    #[must_use]
    pub fn blank(set_number: u32) -> Self {
        Self {
            set_number: Some(set_number),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Exercise {
    #[serde(alias = "exercise_id", deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(deserialize_with = "lenient::count")]
    pub sets: u32,
    #[serde(alias = "rest_time", deserialize_with = "lenient::opt_count")]
    pub rest_time: Option<u32>,
    pub method: Method,
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub reps: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub rpe: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(alias = "set_details")]
    pub set_details: Vec<PlannedSet>,
}

impl Exercise {
    #[must_use]
    pub fn new(name: &str, sets: u32) -> Self {
        Self {
            name: name.trim().to_string(),
            sets,
            ..Self::default()
        }
    }

    /// True set count: the larger of the header count and the detailed plan.
    #[must_use]
    pub fn set_count(&self) -> usize {
        (self.sets as usize).max(self.set_details.len())
    }

    #[must_use]
    pub fn display_name(&self, index: usize) -> String {
        let trimmed = self.name.trim();
        if trimmed.is_empty() {
            format!("Exercise {}", index + 1)
        } else {
            trimmed.to_string()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workout {
    #[serde(alias = "workout_id", deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub title: String,
    pub exercises: Vec<Exercise>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterPlanned {
    #[serde(deserialize_with = "lenient::opt_number")]
    pub total_reps: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number")]
    pub cluster_size: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number")]
    pub cluster_blocks_count: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_number")]
    pub intra_rest_sec: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterBlock {
    #[serde(deserialize_with = "lenient::text")]
    pub weight: String,
    #[serde(deserialize_with = "lenient::count")]
    pub reps: u32,
    #[serde(deserialize_with = "lenient::opt_count")]
    pub rest_sec_after: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterLog {
    pub planned: ClusterPlanned,
    pub planned_blocks: Option<Vec<u32>>,
    pub blocks: Vec<u32>,
    pub blocks_detailed: Vec<ClusterBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestPauseLog {
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
    #[serde(deserialize_with = "lenient::count")]
    pub activation_reps: u32,
    pub mini_reps: Vec<u32>,
    #[serde(deserialize_with = "lenient::count")]
    pub rest_time_sec: u32,
    pub planned_mini_sets: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropStage {
    #[serde(deserialize_with = "lenient::text")]
    pub weight: String,
    #[serde(deserialize_with = "lenient::count")]
    pub reps: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropSetLog {
    pub stages: Vec<DropStage>,
}

/// Marker left on a set log when a deload was applied to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeloadMark {
    pub applied_at: DateTime<Utc>,
    pub original_weight: f64,
    pub suggested_weight: f64,
    pub reduction_pct: f64,
    pub reason: String,
    pub history_count: usize,
}

/// Execution record for a single set. Created lazily, updated by merging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetLog {
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub reps: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub rpe: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(alias = "isDone", alias = "completed", deserialize_with = "lenient::opt_flag", skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(alias = "advancedConfig", deserialize_with = "lenient::opt_value", skip_serializing_if = "Option::is_none")]
    pub advanced_config: Option<AdvancedConfig>,
    #[serde(deserialize_with = "lenient::opt_value", skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterLog>,
    #[serde(deserialize_with = "lenient::opt_value", skip_serializing_if = "Option::is_none")]
    pub rest_pause: Option<RestPauseLog>,
    #[serde(deserialize_with = "lenient::opt_value", skip_serializing_if = "Option::is_none")]
    pub drop_set: Option<DropSetLog>,
    #[serde(deserialize_with = "lenient::opt_value", skip_serializing_if = "Option::is_none")]
    pub deload: Option<DeloadMark>,
    #[serde(alias = "executionSeconds", deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub execution_seconds: Option<f64>,
    #[serde(alias = "restSeconds", deserialize_with = "lenient::opt_number", skip_serializing_if = "Option::is_none")]
    pub rest_seconds: Option<f64>,
}

/// Partial update for a [`SetLog`]; `Some` fields overwrite, `None` keeps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetLogPatch {
    pub weight: Option<String>,
    pub reps: Option<String>,
    pub rpe: Option<String>,
    pub notes: Option<String>,
    pub done: Option<bool>,
    pub advanced_config: Option<AdvancedConfig>,
    pub cluster: Option<ClusterLog>,
    pub rest_pause: Option<RestPauseLog>,
    pub drop_set: Option<DropSetLog>,
    pub deload: Option<DeloadMark>,
    pub execution_seconds: Option<f64>,
    pub rest_seconds: Option<f64>,
}

impl SetLog {
    pub fn merge(&mut self, patch: SetLogPatch) {
        fn set<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        set(&mut self.weight, patch.weight);
        set(&mut self.reps, patch.reps);
        set(&mut self.rpe, patch.rpe);
        set(&mut self.notes, patch.notes);
        set(&mut self.done, patch.done);
        set(&mut self.advanced_config, patch.advanced_config);
        set(&mut self.cluster, patch.cluster);
        set(&mut self.rest_pause, patch.rest_pause);
        set(&mut self.drop_set, patch.drop_set);
        set(&mut self.deload, patch.deload);
        set(&mut self.execution_seconds, patch.execution_seconds);
        set(&mut self.rest_seconds, patch.rest_seconds);
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.unwrap_or(false)
    }

    /// Effective weight of the set: the scalar weight, else the average of the
    /// structured drop-set stages, cluster blocks, or the rest-pause weight.
    #[must_use]
    pub fn effective_weight(&self) -> Option<f64> {
        if let Some(w) = parse_positive(self.weight.as_deref()) {
            return Some(w);
        }
        if let Some(drop) = &self.drop_set {
            let weights: Vec<f64> = drop
                .stages
                .iter()
                .filter_map(|s| parse_positive(Some(&s.weight)))
                .collect();
            if let Some(avg) = average(&weights) {
                return Some(avg);
            }
        }
        if let Some(cluster) = &self.cluster {
            let weights: Vec<f64> = cluster
                .blocks_detailed
                .iter()
                .filter_map(|b| parse_positive(Some(&b.weight)))
                .collect();
            if let Some(avg) = average(&weights) {
                return Some(avg);
            }
        }
        self.rest_pause
            .as_ref()
            .and_then(|rp| parse_positive(rp.weight.as_deref()))
    }
}

/// Arithmetic mean, `None` for an empty slice.
#[must_use]
pub fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// The in-progress training session owned by the engine.
pub struct Session {
    pub id: String,
    pub workout: Workout,
    pub logs: LogStore,
    pub ui: serde_json::Value,
    started_at: Option<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn new(id: &str, workout: Workout, logs: LogStore, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.to_string(),
            workout,
            logs,
            ui: serde_json::Value::Null,
            started_at,
        }
    }

    #[must_use]
    pub fn with_ui(mut self, ui: serde_json::Value) -> Self {
        self.ui = ui;
        self
    }

    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Whole seconds since start, 0 when the session never started.
    #[must_use]
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|start| (now - start).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}
