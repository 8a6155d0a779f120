//src/deload.rs
//! Deload analysis: classifies the recent trend of an exercise and proposes a
//! reduced working weight bounded below by a fraction of the estimated 1RM.
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use strum_macros::Display;
use thiserror::Error;

use crate::collaborators::KvCache;
use crate::config::DeloadSettings;
use crate::history::{HistoryItem, SetSample};
use crate::log_store::LogStore;
use crate::model::{average, parse_training_number, DeloadMark, Exercise, SetKey, SetLogPatch};
use crate::protocol::{plan_config, planned_set, DropSetKeywords};

pub const DELOAD_AUDIT_KEY: &str = "deload.audit.v1";
pub const AUDIT_LIMIT: usize = 100;
const EPSILON: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeloadError {
    #[error("Deload unavailable: no load in history, session or plan.")]
    NoBaseWeight,
    #[error("Exercise index {0} is out of range.")]
    InvalidExercise(usize),
    #[error("Invalid weight for applying a deload.")]
    InvalidWeight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStatus {
    #[strum(to_string = "overtraining")]
    Overtraining,
    #[strum(to_string = "stagnation")]
    Stagnation,
    #[strum(to_string = "stable")]
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeloadAnalysis {
    pub status: TrendStatus,
    pub volume_delta: Option<f64>,
    pub weight_delta: Option<f64>,
}

fn positive_mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let list: Vec<f64> = values.flatten().filter(|v| v.is_finite() && *v > 0.0).collect();
    average(&list)
}

fn relative_delta(older: Option<f64>, recent: Option<f64>) -> Option<f64> {
    let (older, recent) = (older?, recent?);
    (older > 0.0).then(|| (recent - older) / older)
}

/// Compares the most recent sessions with the earlier ones.
///
/// Only the newest `window` items are considered. The recent group is the
/// last `recent_window` items and the older group is the rest; at least one
/// item always stays older, so two sessions are already enough to compare.
#[must_use]
pub fn analyze(items: &[HistoryItem], window: usize, settings: &DeloadSettings) -> DeloadAnalysis {
    let ordered = &items[items.len().saturating_sub(window)..];
    let recent_len = settings.recent_window.min(ordered.len().saturating_sub(1));
    let (older, recent) = ordered.split_at(ordered.len() - recent_len);

    let volume_delta = relative_delta(
        positive_mean(older.iter().map(|i| Some(i.total_volume))),
        positive_mean(recent.iter().map(|i| Some(i.total_volume))),
    );
    let weight_delta = relative_delta(
        positive_mean(older.iter().map(|i| i.avg_weight)),
        positive_mean(recent.iter().map(|i| i.avg_weight)),
    );

    let deltas = [volume_delta, weight_delta];
    let regressed = deltas
        .iter()
        .flatten()
        .any(|d| *d <= -settings.regression_threshold);
    let stagnant = !regressed
        && deltas
            .iter()
            .flatten()
            .any(|d| d.abs() <= settings.stagnation_threshold);

    let status = if regressed {
        TrendStatus::Overtraining
    } else if stagnant {
        TrendStatus::Stagnation
    } else {
        TrendStatus::Stable
    };
    DeloadAnalysis {
        status,
        volume_delta,
        weight_delta,
    }
}

/// Epley estimate `w * (1 + r / 30)`.
#[must_use]
pub fn estimate_1rm(weight: Option<f64>, reps: Option<f64>) -> Option<f64> {
    let (w, r) = (weight?, reps?);
    (w.is_finite() && r.is_finite() && w > 0.0 && r > 0.0).then(|| w * (1.0 + r / 30.0))
}

#[must_use]
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).round() * step
}

/// Rounds `value` (raised to `floor` first) to the nearest step, moving up one
/// step when rounding would land under the floor.
#[must_use]
pub fn round_above_floor(value: f64, step: f64, floor: f64) -> f64 {
    let rounded = round_to_step(value.max(floor), step);
    if rounded + EPSILON < floor && step > 0.0 {
        (floor / step).ceil() * step
    } else {
        rounded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BaseSource {
    #[strum(to_string = "history")]
    History,
    #[strum(to_string = "current sets")]
    CurrentSets,
    #[strum(to_string = "plan")]
    Plan,
    #[strum(to_string = "AI recommendation")]
    Ai,
}

/// Everything the suggestion is computed from.
#[derive(Debug, Clone, Copy)]
pub struct DeloadInputs<'a> {
    pub name: &'a str,
    pub exercise_index: usize,
    pub history: &'a [HistoryItem],
    pub current_sets: &'a [SetSample],
    pub planned_sets: &'a [SetSample],
    pub ai_weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeloadSuggestion {
    pub name: String,
    pub exercise_index: usize,
    pub base_weight: f64,
    pub base_source: BaseSource,
    pub suggested_weight: f64,
    /// Reduction actually obtained after rounding and flooring.
    pub applied_reduction: f64,
    /// Reduction the trend asked for.
    pub target_reduction: f64,
    pub history_count: usize,
    pub min_weight: f64,
    pub analysis: DeloadAnalysis,
}

/// Proposes a deload for one exercise.
///
/// The base weight comes from history, else the current sets, else the plan,
/// else the AI weight. The suggestion never goes below
/// `min_1rm_factor * estimated 1RM`.
pub fn build_suggestion(
    inputs: &DeloadInputs<'_>,
    window: usize,
    settings: &DeloadSettings,
) -> Result<DeloadSuggestion, DeloadError> {
    let from_history = positive_mean(inputs.history.iter().map(|i| i.avg_weight));
    let from_current = positive_mean(inputs.current_sets.iter().map(|s| s.weight));
    let from_plan = positive_mean(inputs.planned_sets.iter().map(|s| s.weight));
    let from_ai = inputs.ai_weight.filter(|w| w.is_finite() && *w > 0.0);

    let (base_weight, base_source, est_sets): (f64, BaseSource, &[SetSample]) =
        match (from_history, from_current, from_plan, from_ai) {
            (Some(w), ..) => (w, BaseSource::History, &[]),
            (None, Some(w), ..) => (w, BaseSource::CurrentSets, inputs.current_sets),
            (None, None, Some(w), _) => (w, BaseSource::Plan, inputs.planned_sets),
            (None, None, None, Some(w)) => (w, BaseSource::Ai, &[]),
            _ => return Err(DeloadError::NoBaseWeight),
        };

    let analysis = analyze(inputs.history, window, settings);
    let target_reduction = match analysis.status {
        TrendStatus::Overtraining => settings.reduction_overtraining,
        TrendStatus::Stagnation => settings.reduction_stagnation,
        TrendStatus::Stable => settings.reduction_stable,
    };

    let est_1rm = est_sets
        .iter()
        .filter_map(|s| estimate_1rm(s.weight, s.reps))
        .chain(
            inputs
                .history
                .iter()
                .filter_map(|h| estimate_1rm(h.top_weight, h.avg_reps)),
        )
        .reduce(f64::max);
    let min_weight = est_1rm.map_or(0.0, |e| e * settings.min_1rm_factor);

    let suggested_weight = round_above_floor(
        base_weight * (1.0 - target_reduction),
        settings.round_step,
        min_weight,
    );
    let history_count = if !inputs.history.is_empty() {
        inputs.history.len()
    } else {
        usize::from(!inputs.current_sets.is_empty())
    };

    Ok(DeloadSuggestion {
        name: inputs.name.to_string(),
        exercise_index: inputs.exercise_index,
        base_weight,
        base_source,
        suggested_weight,
        applied_reduction: applied_reduction(suggested_weight, base_weight),
        target_reduction,
        history_count,
        min_weight,
        analysis,
    })
}

fn applied_reduction(suggested: f64, base: f64) -> f64 {
    if base > 0.0 {
        (1.0 - suggested / base).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl DeloadSuggestion {
    /// Re-targets the suggestion to a reduction percentage (e.g. `15.0`),
    /// clamped to the manual adjustment range.
    pub fn adjust_percent(&mut self, percent: f64, settings: &DeloadSettings) {
        let pct = (percent / 100.0).clamp(settings.manual_reduction_min, settings.manual_reduction_max);
        self.suggested_weight = round_above_floor(
            self.base_weight * (1.0 - pct),
            settings.round_step,
            self.min_weight,
        );
        self.applied_reduction = applied_reduction(self.suggested_weight, self.base_weight);
    }

    /// Re-targets the suggestion to an explicit weight, still respecting the floor.
    pub fn adjust_weight(&mut self, weight: f64, settings: &DeloadSettings) {
        if !weight.is_finite() {
            return;
        }
        self.suggested_weight = round_above_floor(weight, settings.round_step, self.min_weight);
        self.applied_reduction = applied_reduction(self.suggested_weight, self.base_weight);
    }

    /// Human-readable explanation shown next to the suggestion.
    #[must_use]
    pub fn reason(&self, history_min: usize) -> String {
        let pct = (self.applied_reduction * 1000.0).round() / 10.0;
        let label = match self.analysis.status {
            TrendStatus::Overtraining => "regression",
            TrendStatus::Stagnation => "stagnation",
            TrendStatus::Stable => "stable progression",
        };
        let span = if self.history_count >= history_min {
            format!("over the last {} sessions", self.history_count)
        } else {
            format!("over a short history ({} sessions)", self.history_count)
        };
        format!("{pct}% reduction due to {label} {span}.")
    }
}

/// Weight / reps / RPE parsed out of a free-text coaching recommendation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AiRecommendation {
    pub weight: Option<f64>,
    pub reps: Option<f64>,
    pub rpe: Option<f64>,
}

fn recommendation_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(?:kg|lbs?)").expect("weight pattern is valid"),
            Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*reps?").expect("reps pattern is valid"),
            Regex::new(r"(?i)rpe\s*(\d+(?:[.,]\d+)?)").expect("rpe pattern is valid"),
        ]
    })
}

/// Extracts "80 kg", "8 reps" and "RPE 7" style values from a recommendation.
#[must_use]
pub fn parse_ai_recommendation(text: &str) -> AiRecommendation {
    let [weight, reps, rpe] = recommendation_patterns();
    let grab = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| parse_training_number(m.as_str()))
            .filter(|v| *v > 0.0)
    };
    AiRecommendation {
        weight: grab(weight),
        reps: grab(reps),
        rpe: grab(rpe),
    }
}

/// Per-set values to pre-fill while deloading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SetSuggestion {
    pub weight: Option<f64>,
    pub reps: Option<f64>,
    pub rpe: Option<f64>,
}

impl SetSuggestion {
    /// Values from an AI recommendation override the computed ones.
    #[must_use]
    pub fn overridden_by(self, ai: &AiRecommendation) -> Self {
        Self {
            weight: ai.weight.or(self.weight),
            reps: ai.reps.or(self.reps),
            rpe: ai.rpe.or(self.rpe),
        }
    }
}

fn base_set_weight(
    ex: &Exercise,
    exercise_index: usize,
    set: usize,
    logs: &LogStore,
    keywords: &DropSetKeywords,
    fallback: Option<f64>,
) -> Option<f64> {
    logs.get_log(SetKey::new(exercise_index, set))
        .effective_weight()
        .or_else(|| plan_config(ex, set).and_then(|c| c.weight))
        .or_else(|| {
            planned_set(ex, set, keywords)
                .and_then(|p| p.weight)
                .and_then(|w| parse_training_number(&w))
        })
        .or(fallback)
        .filter(|w| *w > 0.0)
}

/// Suggested weight, reps and RPE for every set of an exercise, scaled by the
/// ratio of the exercise-level suggestion when one is available.
#[must_use]
pub fn set_suggestions(
    ex: &Exercise,
    exercise_index: usize,
    logs: &LogStore,
    keywords: &DropSetKeywords,
    history: &[HistoryItem],
    base: Option<&DeloadSuggestion>,
    settings: &DeloadSettings,
) -> BTreeMap<SetKey, SetSuggestion> {
    let latest = history.iter().max_by_key(|i| i.ts);
    let latest_weight = latest.and_then(|i| i.avg_weight);
    let latest_reps = latest.and_then(|i| i.avg_reps);
    let (base_weight, ratio, min_weight) = match base {
        Some(s) if s.base_weight > 0.0 => (
            Some(s.base_weight),
            s.suggested_weight / s.base_weight,
            s.min_weight,
        ),
        _ => (latest_weight, 1.0, 0.0),
    };

    let mut entries = BTreeMap::new();
    for set in 0..ex.set_count() {
        let planned = planned_set(ex, set, keywords);
        let weight = base_set_weight(ex, exercise_index, set, logs, keywords, base_weight.or(latest_weight))
            .map(|w| round_above_floor(w * ratio, settings.round_step, min_weight));
        let reps = planned
            .as_ref()
            .and_then(|p| p.reps.as_deref())
            .or(ex.reps.as_deref())
            .and_then(parse_training_number)
            .or(latest_reps);
        let rpe = planned
            .as_ref()
            .and_then(|p| p.rpe.as_deref())
            .or(ex.rpe.as_deref())
            .and_then(parse_training_number)
            .or_else(|| (weight.is_some() || reps.is_some()).then_some(settings.default_suggested_rpe));
        if weight.is_some() || reps.is_some() || rpe.is_some() {
            entries.insert(SetKey::new(exercise_index, set), SetSuggestion { weight, reps, rpe });
        }
    }
    entries
}

/// One applied deload, newest first in the audit list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeloadAuditEntry {
    pub ts: i64,
    pub exercise_index: usize,
    pub name: String,
    pub base_weight: f64,
    pub suggested_weight: f64,
    pub reduction_pct: f64,
    pub history_count: usize,
    pub applied_at: DateTime<Utc>,
    pub weights: Vec<f64>,
    pub workout_id: Option<String>,
}

/// Writes the deloaded weight into every set that has a base weight, filling
/// empty reps / RPE from `suggestions`. Returns the audit entry to record.
#[allow(clippy::too_many_arguments)]
pub fn apply_to_logs(
    ex: &Exercise,
    logs: &mut LogStore,
    suggestion: &DeloadSuggestion,
    suggestions: &BTreeMap<SetKey, SetSuggestion>,
    keywords: &DropSetKeywords,
    settings: &DeloadSettings,
    workout_id: Option<String>,
    now: DateTime<Utc>,
) -> Result<DeloadAuditEntry, DeloadError> {
    let base = suggestion.base_weight;
    let target = suggestion.suggested_weight;
    if !(base.is_finite() && target.is_finite() && base > 0.0 && target > 0.0) {
        return Err(DeloadError::InvalidWeight);
    }
    let ratio = target / base;
    let reason = suggestion.reason(settings.history_min);
    let exercise_index = suggestion.exercise_index;
    let mut weights = Vec::new();

    for set in 0..ex.set_count() {
        let key = SetKey::new(exercise_index, set);
        let Some(set_base) = base_set_weight(ex, exercise_index, set, logs, keywords, Some(base)) else {
            continue;
        };
        let next = round_above_floor(set_base * ratio, settings.round_step, suggestion.min_weight);
        let log = logs.get_log(key);
        let hint = suggestions.get(&key);
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        let reps = blank(&log.reps)
            .then(|| hint.and_then(|h| h.reps).map(|r| r.to_string()))
            .flatten();
        let rpe = blank(&log.rpe)
            .then(|| hint.and_then(|h| h.rpe).map(|r| r.to_string()))
            .flatten();
        logs.update_log(
            key,
            SetLogPatch {
                weight: Some(next.to_string()),
                reps,
                rpe,
                deload: Some(DeloadMark {
                    applied_at: now,
                    original_weight: set_base,
                    suggested_weight: next,
                    reduction_pct: suggestion.applied_reduction,
                    reason: reason.clone(),
                    history_count: suggestion.history_count,
                }),
                advanced_config: plan_config(ex, set)
                    .cloned()
                    .map(crate::model::AdvancedConfig::Params),
                ..SetLogPatch::default()
            },
        );
        weights.push(next);
    }

    Ok(DeloadAuditEntry {
        ts: now.timestamp_millis(),
        exercise_index,
        name: suggestion.name.clone(),
        base_weight: base,
        suggested_weight: target,
        reduction_pct: suggestion.applied_reduction,
        history_count: suggestion.history_count,
        applied_at: now,
        weights,
        workout_id,
    })
}

/// Prepends `entry` to the audit list kept in `cache`, capped at [`AUDIT_LIMIT`].
pub fn append_audit(cache: &dyn KvCache, entry: DeloadAuditEntry, now: DateTime<Utc>) {
    let mut list: Vec<DeloadAuditEntry> = cache
        .read(DELOAD_AUDIT_KEY)
        .and_then(|blob| serde_json::from_str(&blob.value).ok())
        .unwrap_or_default();
    list.insert(0, entry);
    list.truncate(AUDIT_LIMIT);
    match serde_json::to_string(&list) {
        Ok(raw) => cache.write(DELOAD_AUDIT_KEY, &raw, now),
        Err(e) => tracing::warn!("Could not serialize deload audit: {}", e),
    }
}
