//src/finish.rs
//! Finish pipeline pieces: the payload sent when a session ends, the local
//! history update, and the state of the finish dialog sequence.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use strum_macros::Display;
use tracing::debug;
use uuid::Uuid;

use crate::collaborators::KvCache;
use crate::history::{aggregate, ReportHistory, DELOAD_HISTORY_KEY};
use crate::model::{Exercise, Session, SetKey, SetLog};
use crate::protocol::{current_set_inputs, DropSetKeywords};

const DEFAULT_TITLE: &str = "Workout";

/// Answers of the optional post-workout check-in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCheckin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpe: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfaction: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soreness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// What the backend receives when a session is finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishPayload {
    pub workout_title: String,
    pub date: DateTime<Utc>,
    pub total_time: u64,
    pub real_total_time: u64,
    pub execution_total_seconds: u64,
    pub rest_total_seconds: u64,
    pub logs: BTreeMap<SetKey, SetLog>,
    pub exercises: Vec<Exercise>,
    pub origin_workout_id: Option<String>,
    pub pre_checkin: Option<serde_json::Value>,
    pub post_checkin: Option<PostCheckin>,
    /// One key per finish; the online submit and any queued retry share it.
    #[serde(default)]
    pub idempotency_key: String,
}

fn whole_seconds(value: Option<f64>) -> u64 {
    value
        .filter(|v| v.is_finite() && *v > 0.0)
        .map_or(0, |v| v.round() as u64)
}

/// Builds the finish payload under a fresh idempotency key.
///
/// Exercises without a name are dropped and the remaining logs are re-keyed
/// so every log still points at its exercise.
#[must_use]
pub fn build_finish_payload(
    session: &Session,
    elapsed_seconds: u64,
    post_checkin: Option<PostCheckin>,
    now: DateTime<Utc>,
) -> FinishPayload {
    let mut exercises = Vec::new();
    let mut index_map = BTreeMap::new();
    for (old, ex) in session.workout.exercises.iter().enumerate() {
        let name = ex.name.trim();
        if name.is_empty() {
            continue;
        }
        let mut clean = ex.clone();
        clean.name = name.to_string();
        clean.sets = clean.set_count() as u32;
        index_map.insert(old, exercises.len());
        exercises.push(clean);
    }

    let mut logs = BTreeMap::new();
    let (mut execution, mut rest) = (0, 0);
    for (key, log) in session.logs.entries() {
        execution += whole_seconds(log.execution_seconds);
        rest += whole_seconds(log.rest_seconds);
        if let Some(new_index) = index_map.get(&key.exercise) {
            logs.insert(SetKey::new(*new_index, key.set), log.clone());
        }
    }

    let title = session.workout.title.trim();
    FinishPayload {
        workout_title: if title.is_empty() {
            DEFAULT_TITLE.to_string()
        } else {
            title.to_string()
        },
        date: now,
        total_time: elapsed_seconds,
        real_total_time: elapsed_seconds,
        execution_total_seconds: execution,
        rest_total_seconds: rest,
        logs,
        exercises,
        origin_workout_id: session.workout.id.clone(),
        pre_checkin: session
            .ui
            .get("preCheckin")
            .filter(|v| !v.is_null())
            .cloned(),
        post_checkin,
        idempotency_key: Uuid::new_v4().to_string(),
    }
}

/// Appends this session's per-exercise summary to the local deload history.
/// Returns how many exercises were recorded.
pub fn record_local_history(
    session: &Session,
    cache: &dyn KvCache,
    keywords: &DropSetKeywords,
    window: usize,
    now: DateTime<Utc>,
) -> usize {
    let (mut history, _) = ReportHistory::read_from(cache, DELOAD_HISTORY_KEY);
    let mut recorded = 0;
    for (index, ex) in session.workout.exercises.iter().enumerate() {
        if ex.name.trim().is_empty() {
            continue;
        }
        let samples = current_set_inputs(ex, index, &session.logs, keywords);
        if let Some(item) = aggregate(&samples, now.timestamp_millis()) {
            history.push(&ex.name, item, window);
            recorded += 1;
        }
    }
    history.write_to(cache, DELOAD_HISTORY_KEY, now);
    debug!("Recorded {} exercises into local deload history", recorded);
    recorded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FinishState {
    Idle,
    ConfirmFinish,
    ShortSessionConfirm,
    ReportPrompt,
    PostCheckinPrompt,
    Persisting,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Another finish was already running.
    Ignored,
    /// The user declined to finish.
    Cancelled,
    /// The user chose not to keep a short session: nothing was submitted or
    /// queued.
    NotRecorded { show_report: bool },
    /// Stored in the offline queue for later delivery.
    Queued { job_id: String, show_report: bool },
    Submitted { show_report: bool, insights_requested: bool },
    /// The backend rejected or missed the submission; the payload was queued
    /// for retry when possible.
    SubmitFailed {
        error: String,
        job_id: Option<String>,
        show_report: bool,
    },
    Failed { error: String },
}

/// Re-entrancy guard and observable state of the finish sequence.
#[derive(Debug)]
pub struct FinishGate {
    finishing: Cell<bool>,
    state: Cell<FinishState>,
}

impl Default for FinishGate {
    fn default() -> Self {
        Self {
            finishing: Cell::new(false),
            state: Cell::new(FinishState::Idle),
        }
    }
}

/// Held for the duration of one finish; resets the gate when dropped.
pub struct FinishTicket<'a> {
    gate: &'a FinishGate,
}

impl FinishTicket<'_> {
    pub fn advance(&self, state: FinishState) {
        debug!("Finish state: {} -> {}", self.gate.state.get(), state);
        self.gate.state.set(state);
    }
}

impl Drop for FinishTicket<'_> {
    fn drop(&mut self) {
        self.gate.finishing.set(false);
        self.gate.state.set(FinishState::Idle);
    }
}

impl FinishGate {
    /// `None` while another finish holds the gate.
    pub fn try_enter(&self) -> Option<FinishTicket<'_>> {
        if self.finishing.replace(true) {
            return None;
        }
        self.state.set(FinishState::ConfirmFinish);
        Some(FinishTicket { gate: self })
    }

    #[must_use]
    pub fn is_finishing(&self) -> bool {
        self.finishing.get()
    }

    #[must_use]
    pub fn state(&self) -> FinishState {
        self.state.get()
    }
}
