//src/history.rs
//! Per-exercise performance history: aggregation of set samples, the report
//! history rebuilt from past sessions, and the cache that serves it.
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::collaborators::{AuthProvider, Clock, HistorySource, KvCache, RemoteError, StoredSessionRow};
use crate::config::HistorySettings;
use crate::model::{fold_text, parse_training_number, SetKey, SetLog};

pub const REPORT_HISTORY_KEY: &str = "report.history.v1";
pub const DELOAD_HISTORY_KEY: &str = "deload.history.v1";
const HISTORY_VERSION: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("Timed out loading reports")]
    Timeout,
    #[error("User unavailable")]
    NoUser,
    #[error("Failed to load reports: {0}")]
    Remote(#[from] RemoteError),
}

/// Canonical key of an exercise name: accents, case and spacing are ignored.
#[must_use]
pub fn normalize_exercise_key(name: &str) -> String {
    fold_text(name)
}

/// Weight and reps of one set, either of which may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SetSample {
    pub weight: Option<f64>,
    pub reps: Option<f64>,
}

/// Summary of one exercise in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    #[serde(default)]
    pub avg_weight: Option<f64>,
    #[serde(default)]
    pub avg_reps: Option<f64>,
    #[serde(default)]
    pub total_volume: f64,
    #[serde(default)]
    pub top_weight: Option<f64>,
    #[serde(default)]
    pub sets_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|n| n.is_finite() && *n > 0.0)
}

/// Aggregates set samples into a history item stamped `ts`.
///
/// Averages and the top weight only consider strictly positive values;
/// volume only counts sets where both weight and reps are positive.
/// Returns `None` when nothing meaningful was recorded.
#[must_use]
pub fn aggregate(samples: &[SetSample], ts: i64) -> Option<HistoryItem> {
    if samples.is_empty() {
        return None;
    }
    let weights: Vec<f64> = samples.iter().filter_map(|s| positive(s.weight)).collect();
    let reps: Vec<f64> = samples.iter().filter_map(|s| positive(s.reps)).collect();
    let total_volume: f64 = samples
        .iter()
        .filter_map(|s| Some(positive(s.weight)? * positive(s.reps)?))
        .sum();
    let avg_weight = crate::model::average(&weights);
    let avg_reps = crate::model::average(&reps);
    if avg_weight.is_none() && avg_reps.is_none() && total_volume == 0.0 {
        return None;
    }
    Some(HistoryItem {
        ts,
        avg_weight,
        avg_reps,
        total_volume,
        top_weight: weights.iter().copied().reduce(f64::max),
        sets_count: samples.len(),
        name: None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSeries {
    pub name: String,
    #[serde(default)]
    pub items: Vec<HistoryItem>,
}

/// Map from normalized exercise name to its most recent history items,
/// oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportHistory {
    pub version: u32,
    #[serde(default)]
    pub exercises: BTreeMap<String, ExerciseSeries>,
}

impl Default for ReportHistory {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            exercises: BTreeMap::new(),
        }
    }
}

impl ReportHistory {
    #[must_use]
    pub fn series(&self, name: &str) -> &[HistoryItem] {
        self.exercises
            .get(&normalize_exercise_key(name))
            .map_or(&[][..], |s| s.items.as_slice())
    }

    /// Adds an item and keeps only the newest `window` items, ordered by time.
    pub fn push(&mut self, name: &str, mut item: HistoryItem, window: usize) {
        let key = normalize_exercise_key(name);
        if key.is_empty() {
            return;
        }
        let display = name.trim().to_string();
        item.name = Some(display.clone());
        let series = self.exercises.entry(key).or_default();
        series.name = display;
        series.items.push(item);
        series.items.sort_by_key(|i| i.ts);
        let excess = series.items.len().saturating_sub(window);
        series.items.drain(..excess);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exercises.values().all(|s| s.items.is_empty())
    }

    /// Reads a history blob from the cache. Corrupt or missing blobs read as empty.
    #[must_use]
    pub fn read_from(cache: &dyn KvCache, key: &str) -> (Self, Option<DateTime<Utc>>) {
        let Some(blob) = cache.read(key) else {
            return (Self::default(), None);
        };
        match serde_json::from_str::<Self>(&blob.value) {
            Ok(history) => (history, Some(blob.written_at)),
            Err(e) => {
                warn!("Ignoring unreadable history cache '{}': {}", key, e);
                (Self::default(), None)
            }
        }
    }

    pub fn write_to(&self, cache: &dyn KvCache, key: &str, now: DateTime<Utc>) {
        match serde_json::to_string(self) {
            Ok(raw) => cache.write(key, &raw, now),
            Err(e) => warn!("Could not serialize history for '{}': {}", key, e),
        }
    }
}

fn parse_timestamp_ms(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().filter(|ms| *ms > 0),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn decode_notes(notes: Option<&Value>) -> Option<serde_json::Map<String, Value>> {
    match notes? {
        Value::Object(map) => Some(map.clone()),
        Value::String(raw) => match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// Builds the history entry of exercise `exercise_index` from a stored
/// session's logs.
fn entry_from_stored_logs(
    logs: &serde_json::Map<String, Value>,
    exercise_index: usize,
    ts: i64,
) -> Option<HistoryItem> {
    let samples: Vec<SetSample> = logs
        .iter()
        .filter_map(|(raw_key, raw_log)| {
            let key: SetKey = raw_key.parse().ok()?;
            if key.exercise != exercise_index || !raw_log.is_object() {
                return None;
            }
            let log: SetLog = serde_json::from_value(raw_log.clone()).ok()?;
            let weight = log.effective_weight();
            let reps = log.reps.as_deref().and_then(parse_training_number);
            (weight.is_some() || reps.is_some()).then_some(SetSample { weight, reps })
        })
        .collect();
    aggregate(&samples, ts)
}

/// Rebuilds the report history from stored sessions (newest first), keeping
/// the newest `window` items per exercise.
#[must_use]
pub fn build_report_history(rows: &[StoredSessionRow], window: usize, now: DateTime<Utc>) -> ReportHistory {
    let mut history = ReportHistory::default();
    for row in rows {
        let Some(payload) = decode_notes(row.notes.as_ref()) else {
            debug!("Skipping session {} without a readable payload", row.id);
            continue;
        };
        let Some(exercises) = payload.get("exercises").and_then(Value::as_array) else {
            continue;
        };
        let empty = serde_json::Map::new();
        let logs = payload.get("logs").and_then(Value::as_object).unwrap_or(&empty);
        let row_date = row.date.clone().map(Value::String);
        let row_created = row.created_at.clone().map(Value::String);
        let ts = parse_timestamp_ms(payload.get("date"))
            .or_else(|| parse_timestamp_ms(payload.get("completed_at")))
            .or_else(|| parse_timestamp_ms(payload.get("completedAt")))
            .or_else(|| parse_timestamp_ms(row_date.as_ref()))
            .or_else(|| parse_timestamp_ms(row_created.as_ref()))
            .unwrap_or_else(|| now.timestamp_millis());

        for (exercise_index, exercise) in exercises.iter().enumerate() {
            let name = exercise
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            let key = normalize_exercise_key(name);
            if key.is_empty() {
                continue;
            }
            let Some(mut item) = entry_from_stored_logs(logs, exercise_index, ts) else {
                continue;
            };
            item.name = Some(name.to_string());
            let series = history.exercises.entry(key).or_insert_with(|| ExerciseSeries {
                name: name.to_string(),
                items: Vec::new(),
            });
            series.items.push(item);
        }
    }
    for series in history.exercises.values_mut() {
        series.items.sort_by_key(|i| i.ts);
        let excess = series.items.len().saturating_sub(window);
        series.items.drain(..excess);
    }
    history
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LoadStatus {
    #[strum(to_string = "idle")]
    Idle,
    #[strum(to_string = "loading")]
    Loading,
    #[strum(to_string = "ready")]
    Ready,
    #[strum(to_string = "error")]
    Error,
}

/// Where the currently served history came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum HistoryOrigin {
    #[strum(to_string = "cache")]
    Cache,
    #[strum(to_string = "cache-stale")]
    CacheStale,
    #[strum(to_string = "network")]
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStatus {
    pub status: LoadStatus,
    pub error: Option<String>,
    pub source: Option<HistoryOrigin>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Fresh cache served; no network request made.
    FromCache,
    /// A rebuild was already running.
    AlreadyLoading,
    Refreshed,
    Failed(HistoryError),
}

struct CacheState {
    history: ReportHistory,
    status: HistoryStatus,
}

/// Serves the report history stale-while-revalidate: a cached copy is served
/// immediately and refreshed from the backend when missing or stale. Only
/// one rebuild runs at a time and a failed rebuild never clears what is
/// already being served.
pub struct HistoryCache {
    settings: HistorySettings,
    state: RefCell<CacheState>,
    loading: Cell<bool>,
    loading_since: Cell<Option<DateTime<Utc>>>,
}

struct LoadingGuard<'a> {
    loading: &'a Cell<bool>,
    since: &'a Cell<Option<DateTime<Utc>>>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.loading.set(false);
        self.since.set(None);
    }
}

impl HistoryCache {
    #[must_use]
    pub fn new(settings: HistorySettings) -> Self {
        Self {
            settings,
            state: RefCell::new(CacheState {
                history: ReportHistory::default(),
                status: HistoryStatus {
                    status: LoadStatus::Idle,
                    error: None,
                    source: None,
                    updated_at: None,
                },
            }),
            loading: Cell::new(false),
            loading_since: Cell::new(None),
        }
    }

    #[must_use]
    pub fn history(&self) -> ReportHistory {
        self.state.borrow().history.clone()
    }

    /// History items of one exercise, oldest first.
    #[must_use]
    pub fn series(&self, name: &str) -> Vec<HistoryItem> {
        self.state.borrow().history.series(name).to_vec()
    }

    #[must_use]
    pub fn status(&self) -> HistoryStatus {
        self.state.borrow().status.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading.get()
    }

    fn budget(&self) -> Duration {
        Duration::from_millis(self.settings.fetch_timeout_ms + self.settings.watchdog_grace_ms)
    }

    fn fail(&self, error: &HistoryError, now: DateTime<Utc>) {
        let mut state = self.state.borrow_mut();
        state.status.status = LoadStatus::Error;
        state.status.error = Some(error.to_string());
        state.status.updated_at.get_or_insert(now);
    }

    /// Serves the cached blob if present. Returns `Some(stale)` when served.
    fn serve_cached(&self, cache: &dyn KvCache, now: DateTime<Utc>) -> Option<bool> {
        let (history, written_at) = ReportHistory::read_from(cache, REPORT_HISTORY_KEY);
        let written_at = written_at?;
        let stale = (now - written_at).num_seconds() > self.settings.cache_ttl_secs;
        let mut state = self.state.borrow_mut();
        state.history = history;
        state.status = HistoryStatus {
            status: LoadStatus::Ready,
            error: None,
            source: Some(if stale {
                HistoryOrigin::CacheStale
            } else {
                HistoryOrigin::Cache
            }),
            updated_at: Some(written_at),
        };
        Some(stale)
    }

    /// Serves the cached history, then rebuilds it from the backend when the
    /// cache is missing or stale.
    pub async fn load(
        &self,
        auth: &dyn AuthProvider,
        source: &dyn HistorySource,
        cache: &dyn KvCache,
        clock: &dyn Clock,
    ) -> LoadOutcome {
        self.run(auth, source, cache, clock, false).await
    }

    /// Like [`HistoryCache::load`] but rebuilds even when the cache is fresh.
    pub async fn refresh(
        &self,
        auth: &dyn AuthProvider,
        source: &dyn HistorySource,
        cache: &dyn KvCache,
        clock: &dyn Clock,
    ) -> LoadOutcome {
        self.run(auth, source, cache, clock, true).await
    }

    async fn run(
        &self,
        auth: &dyn AuthProvider,
        source: &dyn HistorySource,
        cache: &dyn KvCache,
        clock: &dyn Clock,
        force: bool,
    ) -> LoadOutcome {
        let now = clock.now();
        if self.serve_cached(cache, now) == Some(false) && !force {
            debug!("Serving fresh report history from cache");
            return LoadOutcome::FromCache;
        }
        if self.loading.get() {
            debug!("Report history rebuild already in flight");
            return LoadOutcome::AlreadyLoading;
        }
        self.loading.set(true);
        self.loading_since.set(Some(now));
        let _guard = LoadingGuard {
            loading: &self.loading,
            since: &self.loading_since,
        };
        {
            let mut state = self.state.borrow_mut();
            state.status.status = LoadStatus::Loading;
            state.status.error = None;
        }

        let result = match tokio::time::timeout(self.budget(), self.rebuild(auth, source, now)).await {
            Ok(result) => result,
            Err(_) => Err(HistoryError::Timeout),
        };
        let finished = clock.now();
        match result {
            Ok(history) => {
                history.write_to(cache, REPORT_HISTORY_KEY, finished);
                let mut state = self.state.borrow_mut();
                info!("Report history rebuilt: {} exercises", history.exercises.len());
                state.history = history;
                state.status = HistoryStatus {
                    status: LoadStatus::Ready,
                    error: None,
                    source: Some(HistoryOrigin::Network),
                    updated_at: Some(finished),
                };
                LoadOutcome::Refreshed
            }
            Err(e) => {
                warn!("Report history rebuild failed: {}", e);
                self.fail(&e, finished);
                LoadOutcome::Failed(e)
            }
        }
    }

    async fn rebuild(
        &self,
        auth: &dyn AuthProvider,
        source: &dyn HistorySource,
        now: DateTime<Utc>,
    ) -> Result<ReportHistory, HistoryError> {
        let timeout = Duration::from_millis(self.settings.fetch_timeout_ms);
        let user = tokio::time::timeout(timeout, auth.current_user())
            .await
            .map_err(|_| HistoryError::Timeout)?
            .map_err(|e| match e {
                RemoteError::Unauthenticated => HistoryError::NoUser,
                other => HistoryError::Remote(other),
            })?;
        if user.id.trim().is_empty() {
            return Err(HistoryError::NoUser);
        }
        let rows = tokio::time::timeout(
            timeout,
            source.list_recent_sessions(&user.id, self.settings.fetch_limit),
        )
        .await
        .map_err(|_| HistoryError::Timeout)??;
        Ok(build_report_history(&rows, self.settings.window, now))
    }

    /// Forces a stuck rebuild into the error state once its time budget has
    /// passed. Returns `true` if it fired.
    pub fn check_watchdog(&self, now: DateTime<Utc>) -> bool {
        let Some(since) = self.loading_since.get() else {
            return false;
        };
        let elapsed = (now - since).to_std().unwrap_or_default();
        if !self.loading.get() || elapsed <= self.budget() {
            return false;
        }
        self.loading.set(false);
        self.loading_since.set(None);
        self.fail(&HistoryError::Timeout, now);
        true
    }
}
