use anyhow::{bail, Context, Result};
// Use anyhow::Result as standard Result for the service layer
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

// --- Declare modules ---
pub mod collaborators;
mod config;
pub mod db;
pub mod deload;
pub mod finish;
pub mod history;
pub mod log_store;
pub mod model;
pub mod mutators;
pub mod offline;
pub mod protocol;
pub mod sync_client;

// --- Expose public types ---
pub use config::{
    get_config_path as get_config_path_util, load_config as load_config_util,
    save_config as save_config_util, Config, ConfigError, DeloadSettings, HistorySettings,
    OfflineSettings, SessionLimits, Units,
};

pub use collaborators::{Collaborators, NetworkStatus, RemoteError, SystemClock};
pub use db::{get_db_path as get_db_path_util, DbError, LocalStore};
pub use deload::{
    parse_ai_recommendation, AiRecommendation, DeloadAuditEntry, DeloadError, DeloadSuggestion,
    SetSuggestion, TrendStatus,
};
pub use finish::{FinishOutcome, FinishPayload, FinishState, PostCheckin};
pub use history::{HistoryItem, HistoryStatus, LoadOutcome, LoadStatus, ReportHistory};
pub use log_store::{LogSink, LogStore};
pub use model::{Exercise, Session, SetKey, SetLog, SetLogPatch, Workout};
pub use mutators::{DraftItem, ExerciseEdit, MutationError, NewExercise};
pub use offline::{FlushReport, OfflineJob, QueueSummary};
pub use protocol::{
    BlockInput, ClusterEntry, DropSetKeywords, ProtocolError, ResolvedSet, RestPauseEntry,
    SetProtocol,
};
pub use sync_client::RemoteClient;

use deload::{DeloadInputs, DELOAD_AUDIT_KEY};
use finish::FinishGate;
use history::{HistoryCache, DELOAD_HISTORY_KEY, REPORT_HISTORY_KEY};
use mutators::ReorderDraft;
use protocol::{current_set_inputs, planned_set_inputs};

/// Drives one in-progress session: set logging, structured set editors,
/// history, deload suggestions, structural edits and the finish sequence.
///
/// Everything runs on a single thread. Async methods never hold a borrow of
/// the session across an await point.
pub struct SessionEngine {
    config: Config,
    deps: Collaborators,
    keywords: DropSetKeywords,
    session: RefCell<Session>,
    history: HistoryCache,
    gate: FinishGate,
    reorder: RefCell<Option<ReorderDraft>>,
}

impl SessionEngine {
    #[must_use]
    pub fn new(config: Config, deps: Collaborators, session: Session) -> Self {
        let history = HistoryCache::new(config.history.clone());
        Self {
            config,
            deps,
            keywords: DropSetKeywords::default(),
            session: RefCell::new(session),
            history,
            gate: FinishGate::default(),
            reorder: RefCell::new(None),
        }
    }

    /// Replaces the phrases used to infer drop-sets from exercise notes.
    #[must_use]
    pub fn with_keywords(mut self, keywords: DropSetKeywords) -> Self {
        self.keywords = keywords;
        self
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `f` against the current session.
    pub fn with_session<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.session.borrow())
    }

    #[must_use]
    pub fn exercises(&self) -> Vec<Exercise> {
        self.session.borrow().workout.exercises.clone()
    }

    #[must_use]
    pub fn elapsed_seconds(&self) -> u64 {
        self.session.borrow().elapsed_seconds(self.deps.clock.now())
    }

    // --- Log Store ---

    #[must_use]
    pub fn get_log(&self, key: SetKey) -> SetLog {
        self.session.borrow().logs.get_log(key)
    }

    pub fn update_log(&self, key: SetKey, patch: SetLogPatch) -> bool {
        self.session.borrow_mut().logs.update_log(key, patch)
    }

    // --- Set protocols ---

    /// `None` when the exercise does not exist.
    #[must_use]
    pub fn resolve_set(&self, exercise_index: usize, set_index: usize) -> Option<ResolvedSet> {
        let session = self.session.borrow();
        let ex = session.workout.exercises.get(exercise_index)?;
        Some(protocol::resolve_set(ex, exercise_index, set_index, &self.keywords))
    }

    /// Cluster editor pre-filled from the plan and the current log.
    #[must_use]
    pub fn cluster_entry(&self, key: SetKey) -> Option<ClusterEntry> {
        let resolved = self.resolve_set(key.exercise, key.set)?;
        ClusterEntry::from_plan(&resolved, &self.get_log(key))
    }

    /// # Errors
    /// Returns the validation error to show inline; nothing is written.
    pub fn save_cluster(&self, key: SetKey, entry: &ClusterEntry) -> Result<(), ProtocolError> {
        let patch = protocol::cluster_patch(entry, &self.get_log(key))?;
        self.update_log(key, patch);
        Ok(())
    }

    /// # Errors
    /// Returns the validation error to show inline; nothing is written.
    pub fn save_rest_pause(&self, key: SetKey, entry: &RestPauseEntry) -> Result<(), ProtocolError> {
        let config = {
            let session = self.session.borrow();
            session
                .workout
                .exercises
                .get(key.exercise)
                .and_then(|ex| protocol::plan_config(ex, key.set))
                .cloned()
                .map(model::AdvancedConfig::Params)
        };
        let patch = protocol::rest_pause_patch(entry, &self.get_log(key), config)?;
        self.update_log(key, patch);
        Ok(())
    }

    /// # Errors
    /// Returns the validation error to show inline; nothing is written.
    pub fn save_drop_set(&self, key: SetKey, stages: &[BlockInput]) -> Result<(), ProtocolError> {
        let patch = protocol::drop_set_patch(
            stages,
            &self.get_log(key),
            self.config.limits.drop_set_stage_limit,
        )?;
        self.update_log(key, patch);
        Ok(())
    }

    // --- History ---

    /// Serves cached history and refreshes it when missing or stale.
    pub async fn load_history(&self) -> LoadOutcome {
        self.history
            .load(
                self.deps.auth.as_ref(),
                self.deps.history.as_ref(),
                self.deps.cache.as_ref(),
                self.deps.clock.as_ref(),
            )
            .await
    }

    #[must_use]
    pub fn history_status(&self) -> HistoryStatus {
        self.history.status()
    }

    #[must_use]
    pub fn history_series(&self, name: &str) -> Vec<HistoryItem> {
        self.history.series(name)
    }

    /// Call periodically while history is loading; see [`HistoryCache::check_watchdog`].
    pub fn check_history_watchdog(&self) -> bool {
        self.history.check_watchdog(self.deps.clock.now())
    }

    // --- Deload ---

    /// Report history of `name`, falling back to the history recorded locally
    /// by previous finishes.
    fn deload_items(&self, name: &str) -> Vec<HistoryItem> {
        let series = self.history.series(name);
        if !series.is_empty() {
            return series;
        }
        let (local, _) = ReportHistory::read_from(self.deps.cache.as_ref(), DELOAD_HISTORY_KEY);
        local.series(name).to_vec()
    }

    /// The weight of an AI recommendation is used when neither history nor
    /// the current sets carry a load.
    /// # Errors
    /// - `DeloadError::InvalidExercise` for an unknown index.
    /// - `DeloadError::NoBaseWeight` when no load is known anywhere.
    pub fn deload_suggestion(
        &self,
        exercise_index: usize,
        ai: Option<&AiRecommendation>,
    ) -> Result<DeloadSuggestion, DeloadError> {
        let session = self.session.borrow();
        let ex = session
            .workout
            .exercises
            .get(exercise_index)
            .ok_or(DeloadError::InvalidExercise(exercise_index))?;
        let name = ex.display_name(exercise_index);
        let items = self.deload_items(&ex.name);
        let current = current_set_inputs(ex, exercise_index, &session.logs, &self.keywords);
        let planned = planned_set_inputs(ex, &self.keywords);
        deload::build_suggestion(
            &DeloadInputs {
                name: &name,
                exercise_index,
                history: &items,
                current_sets: &current,
                planned_sets: &planned,
                ai_weight: ai.and_then(|a| a.weight),
            },
            self.config.history.window,
            &self.config.deload,
        )
    }

    /// Values found in `ai` take precedence over the computed ones.
    /// # Errors
    /// Returns `DeloadError::InvalidExercise` for an unknown index.
    pub fn deload_set_suggestions(
        &self,
        exercise_index: usize,
        base: Option<&DeloadSuggestion>,
        ai: Option<&AiRecommendation>,
    ) -> Result<BTreeMap<SetKey, SetSuggestion>, DeloadError> {
        let session = self.session.borrow();
        let ex = session
            .workout
            .exercises
            .get(exercise_index)
            .ok_or(DeloadError::InvalidExercise(exercise_index))?;
        let items = self.deload_items(&ex.name);
        let hints = deload::set_suggestions(
            ex,
            exercise_index,
            &session.logs,
            &self.keywords,
            &items,
            base,
            &self.config.deload,
        );
        Ok(match ai {
            Some(ai) => hints
                .into_iter()
                .map(|(key, hint)| (key, hint.overridden_by(ai)))
                .collect(),
            None => hints,
        })
    }

    /// Writes the suggestion into the exercise's set logs and records it in
    /// the local audit list.
    /// # Errors
    /// - `DeloadError::InvalidExercise` if the exercise no longer exists.
    /// - `DeloadError::InvalidWeight` for a non-positive base or target.
    pub fn apply_deload(&self, suggestion: &DeloadSuggestion) -> Result<DeloadAuditEntry, DeloadError> {
        let index = suggestion.exercise_index;
        let now = self.deps.clock.now();
        let ex = self
            .session
            .borrow()
            .workout
            .exercises
            .get(index)
            .cloned()
            .ok_or(DeloadError::InvalidExercise(index))?;
        let items = self.deload_items(&ex.name);
        let entry = {
            let mut guard = self.session.borrow_mut();
            let session = &mut *guard;
            let hints = deload::set_suggestions(
                &ex,
                index,
                &session.logs,
                &self.keywords,
                &items,
                Some(suggestion),
                &self.config.deload,
            );
            deload::apply_to_logs(
                &ex,
                &mut session.logs,
                suggestion,
                &hints,
                &self.keywords,
                &self.config.deload,
                session.workout.id.clone(),
                now,
            )?
        };
        deload::append_audit(self.deps.cache.as_ref(), entry.clone(), now);
        info!(
            "Applied deload to '{}': {} -> {}",
            entry.name, entry.base_weight, entry.suggested_weight
        );
        Ok(entry)
    }

    /// Applied deloads, newest first.
    #[must_use]
    pub fn deload_audit(&self) -> Vec<DeloadAuditEntry> {
        self.deps
            .cache
            .read(DELOAD_AUDIT_KEY)
            .and_then(|blob| serde_json::from_str(&blob.value).ok())
            .unwrap_or_default()
    }

    // --- Session mutators ---

    /// # Errors
    /// `MutationError::InvalidExercise` or `MutationError::TooManySets`.
    pub fn add_extra_set(&self, exercise_index: usize) -> Result<usize, MutationError> {
        let mut session = self.session.borrow_mut();
        mutators::add_extra_set(&mut session.workout, exercise_index, &self.config.limits)
    }

    /// Editor state for an exercise.
    /// # Errors
    /// Returns `MutationError::InvalidExercise` for an unknown index.
    pub fn edit_draft(&self, exercise_index: usize) -> Result<ExerciseEdit, MutationError> {
        let session = self.session.borrow();
        let ex = session
            .workout
            .exercises
            .get(exercise_index)
            .ok_or(MutationError::InvalidExercise(exercise_index))?;
        Ok(ExerciseEdit::from_exercise(ex, exercise_index, &self.config.limits))
    }

    /// Applies an edit; shrinking the set count deletes the dropped sets' logs.
    /// Returns how many logs were removed.
    /// # Errors
    /// `MutationError::EmptyName` or `MutationError::InvalidExercise`.
    pub fn edit_exercise(&self, exercise_index: usize, edit: &ExerciseEdit) -> Result<usize, MutationError> {
        let mut guard = self.session.borrow_mut();
        let session = &mut *guard;
        mutators::edit_exercise(
            &mut session.workout,
            &mut session.logs,
            exercise_index,
            edit,
            &self.config.limits,
        )
    }

    /// # Errors
    /// `MutationError::EmptyName` or `MutationError::TooManyExercises`.
    pub fn add_extra_exercise(&self, draft: &NewExercise) -> Result<usize, MutationError> {
        let mut session = self.session.borrow_mut();
        mutators::add_extra_exercise(&mut session.workout, draft, &self.config.limits)
    }

    // --- Reorder ---

    /// Opens a fresh reorder draft, discarding any previous one.
    pub fn open_reorder(&self) -> Vec<DraftItem> {
        let draft = ReorderDraft::open(&self.session.borrow().workout.exercises);
        let items = draft.items().to_vec();
        *self.reorder.borrow_mut() = Some(draft);
        items
    }

    #[must_use]
    pub fn reorder_items(&self) -> Option<Vec<DraftItem>> {
        self.reorder.borrow().as_ref().map(|d| d.items().to_vec())
    }

    #[must_use]
    pub fn reorder_error(&self) -> Option<String> {
        self.reorder.borrow().as_ref().and_then(|d| d.error.clone())
    }

    pub fn move_reorder_item(&self, from: usize, to: usize) -> bool {
        self.reorder
            .borrow_mut()
            .as_mut()
            .is_some_and(|d| d.move_item(from, to))
    }

    /// Closes the reorder draft, asking first when it has unsaved moves.
    /// Returns `true` if the draft is closed.
    pub async fn request_close_reorder(&self) -> bool {
        let dirty = match self.reorder.borrow().as_ref() {
            None => return true,
            Some(draft) if draft.saving => return false,
            Some(draft) => draft.is_dirty(),
        };
        if dirty
            && !self
                .deps
                .prompter
                .confirm("Discard changes?", "The new exercise order has not been saved.")
                .await
        {
            return false;
        }
        *self.reorder.borrow_mut() = None;
        true
    }

    /// Persists the draft order remotely, then applies it to the session
    /// (exercises and their logs) and closes the draft.
    /// # Errors
    /// - `MutationError::ReorderClosed` / `MutationError::SaveInProgress`.
    /// - `MutationError::MissingWorkoutId` when the workout was never saved.
    /// - `MutationError::SaveFailed` when the backend rejects it; the draft
    ///   stays open with the error attached.
    pub async fn save_reorder(&self) -> Result<(), MutationError> {
        let (workout_id, snapshot, order) = {
            let mut slot = self.reorder.borrow_mut();
            let draft = slot.as_mut().ok_or(MutationError::ReorderClosed)?;
            if draft.saving {
                return Err(MutationError::SaveInProgress);
            }
            let session = self.session.borrow();
            let Some(workout_id) = session
                .workout
                .id
                .clone()
                .filter(|id| !id.trim().is_empty())
            else {
                let err = MutationError::MissingWorkoutId;
                draft.error = Some(err.to_string());
                return Err(err);
            };
            let order = draft.order_for(&session.workout.exercises);
            let mut snapshot = session.workout.clone();
            snapshot.exercises = order
                .iter()
                .filter_map(|i| session.workout.exercises.get(*i).cloned())
                .collect();
            draft.saving = true;
            draft.error = None;
            (workout_id, snapshot, order)
        };

        let result = self.deps.workouts.update_workout(&workout_id, &snapshot).await;

        if let Err(e) = result {
            warn!("Saving exercise order of {} failed: {}", workout_id, e);
            let err = MutationError::SaveFailed(e.to_string());
            if let Some(draft) = self.reorder.borrow_mut().as_mut() {
                draft.saving = false;
                draft.error = Some(err.to_string());
            }
            return Err(err);
        }

        {
            let mut guard = self.session.borrow_mut();
            let session = &mut *guard;
            mutators::apply_order(&mut session.workout, &mut session.logs, &order);
        }
        if let Some(draft) = self.reorder.borrow_mut().as_mut() {
            draft.mark_saved();
        }
        *self.reorder.borrow_mut() = None;
        debug!("Exercise order of {} saved", workout_id);
        self.deps.prompter.alert("Exercise order saved.").await;
        Ok(())
    }

    // --- Invite ---

    /// Sends a snapshot of the workout to `target_user`; failures are alerted.
    /// # Errors
    /// Returns the collaborator's error after alerting.
    pub async fn send_invite(&self, target_user: &str) -> Result<(), RemoteError> {
        let snapshot = self.session.borrow().workout.clone();
        match self.deps.invites.send_invite(target_user, &snapshot).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Invite to {} failed: {}", target_user, e);
                self.deps
                    .prompter
                    .alert(&format!("Failed to send invite: {e}"))
                    .await;
                Err(e)
            }
        }
    }

    // --- Finish ---

    #[must_use]
    pub fn finish_state(&self) -> FinishState {
        self.gate.state()
    }

    #[must_use]
    pub fn is_finishing(&self) -> bool {
        self.gate.is_finishing()
    }

    /// Runs the finish sequence: confirmation, short-session and report
    /// prompts, optional check-in, then persistence online or to the offline
    /// queue. Calls made while a finish is running are ignored.
    pub async fn finish_workout(&self) -> FinishOutcome {
        let Some(ticket) = self.gate.try_enter() else {
            debug!("Finish already in progress; ignoring request");
            return FinishOutcome::Ignored;
        };
        let prompter = self.deps.prompter.as_ref();
        let elapsed = self.elapsed_seconds();

        if !prompter
            .confirm("Finish workout", "Do you want to finish this workout?")
            .await
        {
            return FinishOutcome::Cancelled;
        }

        let mut save_history = true;
        let min_minutes = self.config.min_full_session_minutes;
        if elapsed > 0 && elapsed < u64::from(min_minutes) * 60 {
            ticket.advance(FinishState::ShortSessionConfirm);
            save_history = prompter
                .confirm(
                    "Short session",
                    &format!(
                        "This session lasted less than {min_minutes} minutes. Save it to your history anyway?"
                    ),
                )
                .await;
        }

        ticket.advance(FinishState::ReportPrompt);
        let show_report = prompter
            .confirm("Workout report", "Generate the workout report?")
            .await;

        let post_checkin = if save_history && self.config.prompt_post_workout_checkin {
            ticket.advance(FinishState::PostCheckinPrompt);
            prompter.post_checkin().await
        } else {
            None
        };

        ticket.advance(FinishState::Persisting);
        match self
            .persist_finish(elapsed, save_history, show_report, post_checkin)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                ticket.advance(FinishState::Error);
                error!("Finishing the workout failed: {}", e);
                prompter
                    .alert("Could not finish the workout. Please try again.")
                    .await;
                FinishOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn persist_finish(
        &self,
        elapsed: u64,
        save_history: bool,
        show_report: bool,
        post_checkin: Option<PostCheckin>,
    ) -> Result<FinishOutcome, DbError> {
        if !save_history {
            info!("Short session not recorded");
            self.deps.listener.on_finish(None, show_report);
            return Ok(FinishOutcome::NotRecorded { show_report });
        }

        let now = self.deps.clock.now();
        let payload = {
            let session = self.session.borrow();
            finish::record_local_history(
                &session,
                self.deps.cache.as_ref(),
                &self.keywords,
                self.config.history.window,
                now,
            );
            finish::build_finish_payload(&session, elapsed, post_checkin, now)
        };

        if !self.deps.connectivity.is_online() {
            let job_id = self.deps.queue.enqueue(&payload)?;
            info!("Offline: finished session queued as {}", job_id);
            self.deps.listener.on_finish(None, show_report);
            return Ok(FinishOutcome::Queued { job_id, show_report });
        }

        let outcome = match self.deps.finish.submit_finish(&payload).await {
            Ok(()) => {
                let origin = payload
                    .origin_workout_id
                    .as_deref()
                    .filter(|id| !id.trim().is_empty());
                let insights_requested = match origin {
                    Some(id) => {
                        self.deps.insights.request_insights(id);
                        true
                    }
                    None => false,
                };
                info!("Finished session '{}' submitted", payload.workout_title);
                FinishOutcome::Submitted {
                    show_report,
                    insights_requested,
                }
            }
            Err(e) => {
                warn!("Submitting the finished session failed: {}", e);
                let job_id = if e.is_retryable() {
                    match self.deps.queue.enqueue(&payload) {
                        Ok(id) => Some(id),
                        Err(queue_err) => {
                            error!("Could not queue the finished session either: {}", queue_err);
                            None
                        }
                    }
                } else {
                    None
                };
                let message = if !e.is_retryable() {
                    format!("The server rejected the workout ({e}). It was not saved.")
                } else if job_id.is_some() {
                    format!("Could not save the workout online ({e}). It was kept for the next sync.")
                } else {
                    format!("Could not save the workout online ({e}).")
                };
                self.deps.prompter.alert(&message).await;
                FinishOutcome::SubmitFailed {
                    error: e.to_string(),
                    job_id,
                    show_report,
                }
            }
        };
        self.deps.listener.on_finish(None, show_report);
        Ok(outcome)
    }
}

/// Local state used by the command line: configuration plus the SQLite store.
pub struct AppContext {
    pub config: Config,
    store: LocalStore,
    db_path: PathBuf,
    config_path: PathBuf,
}

impl AppContext {
    /// Loads the config and opens the local store.
    /// # Errors
    /// Returns `anyhow::Error` if config/db path determination, loading, or initialization fails.
    pub fn initialize() -> Result<Self> {
        let config_path =
            config::get_config_path().context("Failed to determine configuration file path")?;
        let config = config::load_config(&config_path)
            .context(format!("Failed to load config from {config_path:?}"))?;

        let db_path = db::get_db_path().context("Failed to determine database path")?;
        let store = LocalStore::open(&db_path)
            .with_context(|| format!("Failed to open database at {db_path:?}"))?
            .with_max_attempts(config.offline.max_attempts);

        Ok(Self {
            config,
            store,
            db_path,
            config_path,
        })
    }

    pub fn get_config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn get_db_path(&self) -> &Path {
        &self.db_path
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Saves the current configuration state.
    /// # Errors
    /// Returns `ConfigError` if saving fails.
    pub fn save_config(&self) -> Result<(), ConfigError> {
        config::save_config(&self.config_path, &self.config)
    }

    /// # Errors
    /// - `ConfigError::InvalidServerUrl` for a non-http(s) URL.
    /// - `ConfigError` variants if saving fails.
    pub fn set_server(&mut self, url: &str, token: Option<String>) -> Result<(), ConfigError> {
        self.config.set_server(url, token)?;
        self.save_config()
    }

    /// HTTP client for the configured server.
    /// # Errors
    /// Fails when no server is configured or the client cannot be built.
    pub fn remote_client(&self) -> Result<RemoteClient> {
        let url = self.config.require_server_url(&self.config_path)?;
        RemoteClient::new(url, self.config.api_token.clone())
            .context("Failed to create HTTP client")
    }

    /// Report history as last cached, plus when it was written.
    pub fn cached_history(&self) -> (ReportHistory, Option<chrono::DateTime<chrono::Utc>>) {
        ReportHistory::read_from(&self.store, REPORT_HISTORY_KEY)
    }

    /// History recorded locally by finished sessions.
    pub fn local_deload_history(&self) -> ReportHistory {
        ReportHistory::read_from(&self.store, DELOAD_HISTORY_KEY).0
    }

    /// Rebuilds the report history from the server and caches it.
    /// # Errors
    /// Fails when no server is configured or the rebuild fails.
    pub async fn refresh_history(&self) -> Result<ReportHistory> {
        let client = self.remote_client()?;
        let cache = HistoryCache::new(self.config.history.clone());
        match cache.refresh(&client, &client, &self.store, &SystemClock).await {
            LoadOutcome::Failed(e) => Err(e).context("Failed to rebuild report history"),
            _ => Ok(cache.history()),
        }
    }

    /// Deload suggestion for `exercise` from cached history only.
    /// # Errors
    /// Fails when there is no usable history and no AI weight.
    pub fn deload_for(&self, exercise: &str, ai_weight: Option<f64>) -> Result<DeloadSuggestion> {
        let name = exercise.trim();
        if name.is_empty() {
            bail!("Exercise name cannot be empty.");
        }
        let (report, _) = self.cached_history();
        let mut items = report.series(name).to_vec();
        if items.is_empty() {
            items = self.local_deload_history().series(name).to_vec();
        }
        deload::build_suggestion(
            &DeloadInputs {
                name,
                exercise_index: 0,
                history: &items,
                current_sets: &[],
                planned_sets: &[],
                ai_weight,
            },
            self.config.history.window,
            &self.config.deload,
        )
        .with_context(|| format!("No deload suggestion for '{name}'"))
    }

    /// # Errors
    /// Returns `DbError` if the queue cannot be read.
    pub fn queue_summary(&self, online: bool) -> Result<QueueSummary, DbError> {
        Ok(offline::summarize(
            self.store.jobs()?,
            online,
            chrono::Utc::now(),
        ))
    }

    /// Delivers due offline jobs to the server.
    /// # Errors
    /// Fails when no server is configured or the queue cannot be updated.
    pub async fn sync(&self, force: bool) -> Result<FlushReport> {
        let client = self.remote_client()?;
        let max = self.store.jobs()?.len();
        let report = offline::flush_offline_queue(
            &self.store,
            &client,
            &self.config.offline,
            chrono::Utc::now(),
            max,
            force,
        )
        .await?;
        Ok(report)
    }

    /// # Errors
    /// Returns `DbError::JobNotFound` for an unknown id.
    pub fn bump_job(&self, id: &str) -> Result<(), DbError> {
        if offline::bump_job(&self.store, id)? {
            Ok(())
        } else {
            Err(DbError::JobNotFound(id.to_string()))
        }
    }
}
