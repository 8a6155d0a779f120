use active_session_lib::collaborators::{
    AuthProvider, Clock, Collaborators, CurrentUser, FinishEndpoint, FinishListener, HistorySource,
    InsightsGenerator, InviteSender, KvCache, NetworkStatus, Prompter, RemoteError,
    StoredSessionRow, WorkoutStore,
};
use active_session_lib::history::{DELOAD_HISTORY_KEY, REPORT_HISTORY_KEY};
use active_session_lib::model::{AdvancedConfig, Method, PlanParams, PlannedSet};
use active_session_lib::{
    parse_ai_recommendation, BlockInput, Config, Exercise, FinishOutcome, FinishPayload,
    FinishState, HistoryItem, LoadOutcome, LoadStatus, LocalStore, LogSink, LogStore,
    MutationError, NewExercise, PostCheckin, ProtocolError, ReportHistory, Session,
    SessionEngine, SetKey, SetLog, SetLogPatch, SetProtocol, TrendStatus, Workout,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

// --- Test doubles ---

struct MockClock {
    now: Cell<DateTime<Utc>>,
}

impl MockClock {
    fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

#[derive(Default)]
struct MockRemote {
    hang_auth: Cell<bool>,
    history_delay_ms: Cell<u64>,
    rows: RefCell<Vec<StoredSessionRow>>,
    fail_history: Cell<bool>,
    fail_finish: Cell<Option<u16>>,
    fail_update: Cell<bool>,
    fail_invite: Cell<bool>,
    history_calls: Cell<usize>,
    finished: RefCell<Vec<FinishPayload>>,
    updates: RefCell<Vec<(String, Workout)>>,
    invites: RefCell<Vec<String>>,
    insights: RefCell<Vec<String>>,
}

#[async_trait(?Send)]
impl AuthProvider for MockRemote {
    async fn current_user(&self) -> Result<CurrentUser, RemoteError> {
        if self.hang_auth.get() {
            std::future::pending::<()>().await;
        }
        Ok(CurrentUser { id: "user-1".into() })
    }
}

#[async_trait(?Send)]
impl HistorySource for MockRemote {
    async fn list_recent_sessions(
        &self,
        _user_id: &str,
        _limit: usize,
    ) -> Result<Vec<StoredSessionRow>, RemoteError> {
        self.history_calls.set(self.history_calls.get() + 1);
        let delay = self.history_delay_ms.get();
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.fail_history.get() {
            return Err(RemoteError::Transport("connection reset".into()));
        }
        Ok(self.rows.borrow().clone())
    }
}

#[async_trait(?Send)]
impl FinishEndpoint for MockRemote {
    async fn submit_finish(&self, payload: &FinishPayload) -> Result<(), RemoteError> {
        self.finished.borrow_mut().push(payload.clone());
        if let Some(status) = self.fail_finish.get() {
            return Err(RemoteError::Status {
                status,
                message: "boom".into(),
            });
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl WorkoutStore for MockRemote {
    async fn update_workout(&self, workout_id: &str, workout: &Workout) -> Result<(), RemoteError> {
        if self.fail_update.get() {
            return Err(RemoteError::Status {
                status: 409,
                message: "conflict".into(),
            });
        }
        self.updates
            .borrow_mut()
            .push((workout_id.to_string(), workout.clone()));
        Ok(())
    }
}

#[async_trait(?Send)]
impl InviteSender for MockRemote {
    async fn send_invite(&self, target_user: &str, _workout: &Workout) -> Result<(), RemoteError> {
        if self.fail_invite.get() {
            return Err(RemoteError::Transport("offline".into()));
        }
        self.invites.borrow_mut().push(target_user.to_string());
        Ok(())
    }
}

impl InsightsGenerator for MockRemote {
    fn request_insights(&self, workout_id: &str) {
        self.insights.borrow_mut().push(workout_id.to_string());
    }
}

/// Answers confirmations from a script (then `true`) and records everything.
#[derive(Default)]
struct ScriptedPrompter {
    answers: RefCell<VecDeque<bool>>,
    titles: RefCell<Vec<String>>,
    alerts: RefCell<Vec<String>>,
    checkin: RefCell<Option<PostCheckin>>,
    checkin_calls: Cell<usize>,
}

impl ScriptedPrompter {
    fn answer(&self, answers: &[bool]) {
        self.answers.borrow_mut().extend(answers.iter().copied());
    }
}

#[async_trait(?Send)]
impl Prompter for ScriptedPrompter {
    async fn confirm(&self, title: &str, _message: &str) -> bool {
        self.titles.borrow_mut().push(title.to_string());
        // Dialogs resolve on a later tick, like a real UI.
        tokio::task::yield_now().await;
        self.answers.borrow_mut().pop_front().unwrap_or(true)
    }

    async fn alert(&self, message: &str) {
        self.alerts.borrow_mut().push(message.to_string());
    }

    async fn post_checkin(&self) -> Option<PostCheckin> {
        self.checkin_calls.set(self.checkin_calls.get() + 1);
        self.checkin.borrow().clone()
    }
}

#[derive(Default)]
struct RecordingListener {
    calls: RefCell<Vec<(bool, bool)>>,
}

impl FinishListener for RecordingListener {
    fn on_finish(&self, session: Option<&Session>, show_report: bool) {
        self.calls.borrow_mut().push((session.is_some(), show_report));
    }
}

#[derive(Default)]
struct RecordingSink {
    updates: RefCell<Vec<SetKey>>,
}

impl LogSink for RecordingSink {
    fn on_log_updated(&self, key: SetKey, _log: &SetLog) {
        self.updates.borrow_mut().push(key);
    }
}

struct Mocks {
    remote: Rc<MockRemote>,
    prompter: Rc<ScriptedPrompter>,
    listener: Rc<RecordingListener>,
    network: Rc<NetworkStatus>,
    store: Rc<LocalStore>,
    clock: Rc<MockClock>,
    sink: Rc<RecordingSink>,
}

fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

fn create_test_workout() -> Workout {
    let mut bench = Exercise::new("Bench Press", 3);
    bench.reps = Some("8".into());
    Workout {
        id: Some("w-1".into()),
        title: "Push Day".into(),
        exercises: vec![bench, Exercise::new("Overhead Press", 2)],
    }
}

// Helper function to create a test engine over an in-memory store
fn create_test_engine(workout: Workout, started_at: Option<DateTime<Utc>>) -> Result<(SessionEngine, Mocks)> {
    let store = Rc::new(LocalStore::in_memory()?);
    let mocks = Mocks {
        remote: Rc::new(MockRemote::default()),
        prompter: Rc::new(ScriptedPrompter::default()),
        listener: Rc::new(RecordingListener::default()),
        network: Rc::new(NetworkStatus::new(true)),
        store,
        clock: Rc::new(MockClock {
            now: Cell::new(test_now()),
        }),
        sink: Rc::new(RecordingSink::default()),
    };
    let deps = Collaborators {
        auth: mocks.remote.clone(),
        history: mocks.remote.clone(),
        finish: mocks.remote.clone(),
        insights: mocks.remote.clone(),
        workouts: mocks.remote.clone(),
        invites: mocks.remote.clone(),
        connectivity: mocks.network.clone(),
        queue: mocks.store.clone(),
        cache: mocks.store.clone(),
        prompter: mocks.prompter.clone(),
        listener: mocks.listener.clone(),
        clock: mocks.clock.clone(),
    };
    let logs = LogStore::new(Some(mocks.sink.clone()));
    let session = Session::new("session-1", workout, logs, started_at);
    Ok((SessionEngine::new(Config::default(), deps, session), mocks))
}

fn log_set(engine: &SessionEngine, key: SetKey, weight: &str, reps: &str) {
    engine.update_log(
        key,
        SetLogPatch {
            weight: Some(weight.into()),
            reps: Some(reps.into()),
            done: Some(true),
            ..SetLogPatch::default()
        },
    );
}

fn history_item(ts: i64, weight: f64, reps: f64) -> HistoryItem {
    HistoryItem {
        ts,
        avg_weight: Some(weight),
        avg_reps: Some(reps),
        total_volume: weight * reps,
        top_weight: Some(weight),
        sets_count: 1,
        name: None,
    }
}

fn seed_history(store: &LocalStore, key: &str, name: &str, items: Vec<HistoryItem>, at: DateTime<Utc>) {
    let mut history = ReportHistory::default();
    for item in items {
        history.push(name, item, 6);
    }
    history.write_to(store, key, at);
}

// --- Log Store ---

#[test]
fn test_update_log_merges_patches_in_order() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    let key = SetKey::new(0, 1);

    assert_eq!(engine.get_log(key), SetLog::default());
    log_set(&engine, key, "60", "8");
    engine.update_log(
        key,
        SetLogPatch {
            weight: Some("62,5".into()),
            notes: Some("felt light".into()),
            ..SetLogPatch::default()
        },
    );

    let log = engine.get_log(key);
    assert_eq!(log.weight.as_deref(), Some("62,5"));
    assert_eq!(log.reps.as_deref(), Some("8"));
    assert_eq!(log.notes.as_deref(), Some("felt light"));
    assert!(log.is_done());
    assert_eq!(log.effective_weight(), Some(62.5));
    assert_eq!(engine.get_log(SetKey::new(0, 0)), SetLog::default());
    assert_eq!(*mocks.sink.updates.borrow(), vec![key, key]);
    Ok(())
}

#[test]
fn test_detached_log_store_ignores_updates() {
    let mut logs = LogStore::new(None);
    let changed = logs.update_log(
        SetKey::new(0, 0),
        SetLogPatch {
            weight: Some("50".into()),
            ..SetLogPatch::default()
        },
    );
    assert!(!changed);
    assert!(logs.is_empty());
}

// --- Set protocols ---

#[test]
fn test_drop_set_inferred_from_notes_on_last_set_only() -> Result<()> {
    let mut workout = create_test_workout();
    workout.exercises[0].notes = Some("Drop na ÚLTIMA série".into());
    let (engine, _mocks) = create_test_engine(workout, None)?;

    let first = engine.resolve_set(0, 0).unwrap();
    assert_eq!(first.protocol, SetProtocol::Normal);

    let last = engine.resolve_set(0, 2).unwrap();
    match last.protocol {
        SetProtocol::DropSet { stages, inferred } => {
            assert_eq!(stages.len(), 2);
            assert!(inferred);
        }
        other => panic!("expected a drop-set, got {other:?}"),
    }
    assert!(engine.resolve_set(9, 0).is_none());
    Ok(())
}

#[test]
fn test_drop_set_save_validates_and_totals_reps() -> Result<()> {
    let (engine, _mocks) = create_test_engine(create_test_workout(), None)?;
    let key = SetKey::new(0, 2);

    let err = engine
        .save_drop_set(key, &[BlockInput::new("80", "8")])
        .unwrap_err();
    assert_eq!(err, ProtocolError::TooFewStages);
    let err = engine
        .save_drop_set(key, &[BlockInput::new("80", "8"), BlockInput::new("", "6")])
        .unwrap_err();
    assert_eq!(err, ProtocolError::MissingStageWeight(2));
    assert_eq!(engine.get_log(key), SetLog::default());

    engine.save_drop_set(key, &[BlockInput::new("80", "8"), BlockInput::new("60", "6")])?;
    let log = engine.get_log(key);
    assert_eq!(log.reps.as_deref(), Some("14"));
    assert_eq!(log.weight.as_deref(), Some("60"));
    assert_eq!(log.drop_set.map(|d| d.stages.len()), Some(2));
    Ok(())
}

#[test]
fn test_cluster_entry_from_plan_and_save() -> Result<()> {
    let mut workout = create_test_workout();
    let squat = &mut workout.exercises[1];
    squat.method = Method::Cluster;
    squat.set_details = vec![PlannedSet {
        advanced_config: Some(AdvancedConfig::Params(PlanParams {
            total_reps: Some(12.0),
            cluster_size: Some(4.0),
            intra_rest_sec: Some(20.0),
            ..PlanParams::default()
        })),
        ..PlannedSet::blank(1)
    }];
    let (engine, _mocks) = create_test_engine(workout, None)?;
    let key = SetKey::new(1, 0);

    let mut entry = engine.cluster_entry(key).unwrap();
    assert_eq!(entry.blocks.len(), 3);
    assert_eq!(entry.rests_by_gap, vec![Some(20), Some(20)]);

    for block in &mut entry.blocks {
        block.weight = "40".into();
    }
    entry.blocks[0].reps = "4".into();
    let err = engine.save_cluster(key, &entry).unwrap_err();
    assert_eq!(err, ProtocolError::MissingBlockReps(2));

    entry.blocks[1].reps = "4".into();
    entry.blocks[2].reps = "3".into();
    engine.save_cluster(key, &entry)?;
    let log = engine.get_log(key);
    assert_eq!(log.reps.as_deref(), Some("11"));
    let cluster = log.cluster.unwrap();
    assert_eq!(cluster.blocks, vec![4, 4, 3]);
    assert_eq!(cluster.blocks_detailed[0].rest_sec_after, Some(20));
    assert_eq!(cluster.blocks_detailed[2].rest_sec_after, None);
    Ok(())
}

// --- History Cache ---

#[tokio::test]
async fn test_fresh_cache_skips_network() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    seed_history(
        &mocks.store,
        REPORT_HISTORY_KEY,
        "Bench Press",
        vec![history_item(1, 80.0, 8.0)],
        test_now() - Duration::seconds(60),
    );

    assert_eq!(engine.load_history().await, LoadOutcome::FromCache);
    assert_eq!(mocks.remote.history_calls.get(), 0);
    let status = engine.history_status();
    assert_eq!(status.status, LoadStatus::Ready);
    assert_eq!(status.source.map(|s| s.to_string()).as_deref(), Some("cache"));
    assert_eq!(engine.history_series("bench press").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_stale_cache_is_refreshed_from_network() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    seed_history(
        &mocks.store,
        REPORT_HISTORY_KEY,
        "Bench Press",
        vec![history_item(1, 80.0, 8.0)],
        test_now() - Duration::hours(1),
    );
    mocks.remote.rows.borrow_mut().push(StoredSessionRow {
        id: "s-1".into(),
        notes: Some(json!({
            "date": "2024-04-30T09:00:00Z",
            "exercises": [{ "name": "Squat" }],
            "logs": { "0-0": { "weight": "100", "reps": "5" }, "0-1": { "weight": "0", "reps": "5" } }
        })),
        ..StoredSessionRow::default()
    });

    assert_eq!(engine.load_history().await, LoadOutcome::Refreshed);
    assert_eq!(mocks.remote.history_calls.get(), 1);
    let status = engine.history_status();
    assert_eq!(status.source.map(|s| s.to_string()).as_deref(), Some("network"));

    let squat = engine.history_series("SQUAT");
    assert_eq!(squat.len(), 1);
    assert_eq!(squat[0].total_volume, 500.0);
    assert_eq!(squat[0].avg_weight, Some(100.0));

    // The rebuilt history replaced the cached blob.
    let (cached, _) = ReportHistory::read_from(mocks.store.as_ref(), REPORT_HISTORY_KEY);
    assert_eq!(cached.series("Squat").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_refresh_keeps_served_history() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    seed_history(
        &mocks.store,
        REPORT_HISTORY_KEY,
        "Bench Press",
        vec![history_item(1, 80.0, 8.0)],
        test_now() - Duration::hours(1),
    );
    mocks.remote.fail_history.set(true);

    let outcome = engine.load_history().await;
    assert!(matches!(outcome, LoadOutcome::Failed(_)));
    let status = engine.history_status();
    assert_eq!(status.status, LoadStatus::Error);
    assert!(status.error.is_some());
    assert_eq!(engine.history_series("Bench Press").len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_only_one_history_rebuild_in_flight() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    mocks.remote.history_delay_ms.set(50);

    let (first, second) = tokio::join!(engine.load_history(), engine.load_history());
    assert_eq!(first, LoadOutcome::Refreshed);
    assert_eq!(second, LoadOutcome::AlreadyLoading);
    assert_eq!(mocks.remote.history_calls.get(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_flips_stuck_load_to_error() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    mocks.remote.hang_auth.set(true);

    let (outcome, fired) = tokio::join!(engine.load_history(), async {
        tokio::task::yield_now().await;
        assert_eq!(engine.history_status().status, LoadStatus::Loading);
        assert!(!engine.check_history_watchdog());
        mocks.clock.advance(Duration::seconds(11));
        engine.check_history_watchdog()
    });

    assert!(fired);
    assert!(matches!(outcome, LoadOutcome::Failed(_)));
    assert_eq!(engine.history_status().status, LoadStatus::Error);
    assert_eq!(mocks.remote.history_calls.get(), 0);
    Ok(())
}

// --- Deload ---

#[test]
fn test_deload_from_regressing_local_history() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    seed_history(
        &mocks.store,
        DELOAD_HISTORY_KEY,
        "Bench Press",
        vec![history_item(1, 100.0, 10.0), history_item(2, 100.0, 5.0)],
        test_now(),
    );

    let suggestion = engine.deload_suggestion(0, None)?;
    assert_eq!(suggestion.analysis.status, TrendStatus::Overtraining);
    assert_eq!(suggestion.analysis.volume_delta, Some(-0.5));
    assert_eq!(suggestion.base_weight, 100.0);
    assert_eq!(suggestion.suggested_weight, 78.0);
    assert!(suggestion.suggested_weight >= suggestion.min_weight);
    assert_eq!(suggestion.history_count, 2);

    let entry = engine.apply_deload(&suggestion)?;
    assert_eq!(entry.weights, vec![78.0, 78.0, 78.0]);
    assert_eq!(entry.workout_id.as_deref(), Some("w-1"));
    for set in 0..3 {
        let log = engine.get_log(SetKey::new(0, set));
        assert_eq!(log.weight.as_deref(), Some("78"));
        assert_eq!(log.reps.as_deref(), Some("8"));
        let mark = log.deload.unwrap();
        assert_eq!(mark.original_weight, 100.0);
        assert_eq!(mark.history_count, 2);
    }
    assert_eq!(engine.deload_audit().len(), 1);
    Ok(())
}

#[test]
fn test_deload_without_any_load_is_unavailable() -> Result<()> {
    let (engine, _mocks) = create_test_engine(create_test_workout(), None)?;
    assert!(engine.deload_suggestion(1, None).is_err());
    let ai = parse_ai_recommendation("Try 50 kg for 8 reps");
    let suggestion = engine.deload_suggestion(1, Some(&ai))?;
    assert_eq!(suggestion.base_weight, 50.0);
    assert!(engine.deload_suggestion(7, None).is_err());
    Ok(())
}

#[test]
fn test_ai_recommendation_overrides_set_suggestions() -> Result<()> {
    let (engine, _mocks) = create_test_engine(create_test_workout(), None)?;

    let computed = engine.deload_set_suggestions(0, None, None)?;
    assert_eq!(computed.len(), 3);
    assert_eq!(computed[&SetKey::new(0, 0)].reps, Some(8.0));
    assert_eq!(computed[&SetKey::new(0, 0)].weight, None);

    let ai = parse_ai_recommendation("Next time go for 60 kg x 6 reps @ RPE 7.5");
    let hinted = engine.deload_set_suggestions(0, None, Some(&ai))?;
    assert_eq!(hinted.len(), 3);
    for hint in hinted.values() {
        assert_eq!(hint.weight, Some(60.0));
        assert_eq!(hint.reps, Some(6.0));
        assert_eq!(hint.rpe, Some(7.5));
    }
    assert!(engine.deload_set_suggestions(9, None, Some(&ai)).is_err());
    Ok(())
}

#[test]
fn test_normalized_names_share_one_series() {
    let mut history = ReportHistory::default();
    for (ts, name) in [(1, "Supino Reto"), (2, "supino  reto"), (3, "SUPINO RETO")] {
        history.push(name, history_item(ts, 60.0, 10.0), 6);
    }
    assert_eq!(history.exercises.len(), 1);
    assert_eq!(history.series("Supino Reto").len(), 3);
}

// --- Session mutators ---

#[test]
fn test_shrinking_sets_removes_only_dropped_logs() -> Result<()> {
    let mut workout = create_test_workout();
    workout.exercises[0].sets = 5;
    let (engine, _mocks) = create_test_engine(workout, None)?;
    for set in 0..5 {
        log_set(&engine, SetKey::new(0, set), "50", "10");
    }
    log_set(&engine, SetKey::new(1, 3), "30", "12");

    let mut edit = engine.edit_draft(0)?;
    edit.sets = "2".into();
    let removed = engine.edit_exercise(0, &edit)?;

    assert_eq!(removed, 3);
    assert_eq!(engine.exercises()[0].set_count(), 2);
    assert!(engine.get_log(SetKey::new(0, 1)).is_done());
    for set in 2..5 {
        assert_eq!(engine.get_log(SetKey::new(0, set)), SetLog::default());
    }
    assert!(engine.get_log(SetKey::new(1, 3)).is_done());

    edit.name = "   ".into();
    assert_eq!(engine.edit_exercise(0, &edit), Err(MutationError::EmptyName));
    Ok(())
}

#[test]
fn test_add_extra_set_and_exercise_respect_limits() -> Result<()> {
    let (engine, _mocks) = create_test_engine(create_test_workout(), None)?;
    assert_eq!(engine.add_extra_set(1)?, 3);
    assert_eq!(engine.add_extra_set(5), Err(MutationError::InvalidExercise(5)));

    let index = engine.add_extra_exercise(&NewExercise {
        name: "Dips".into(),
        ..NewExercise::default()
    })?;
    assert_eq!(index, 2);
    assert_eq!(engine.exercises()[2].set_count(), 3);
    assert_eq!(
        engine.add_extra_exercise(&NewExercise::default()),
        Err(MutationError::EmptyName)
    );
    Ok(())
}

#[tokio::test]
async fn test_reorder_saves_remotely_and_moves_logs() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    log_set(&engine, SetKey::new(0, 0), "70", "8");

    engine.open_reorder();
    assert!(engine.move_reorder_item(1, 0));
    engine.save_reorder().await?;

    let names: Vec<String> = engine.exercises().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["Overhead Press", "Bench Press"]);
    assert!(engine.get_log(SetKey::new(1, 0)).is_done());
    assert_eq!(engine.get_log(SetKey::new(0, 0)), SetLog::default());

    let updates = mocks.remote.updates.borrow();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "w-1");
    assert_eq!(updates[0].1.exercises[0].name, "Overhead Press");
    assert!(engine.reorder_items().is_none());
    assert_eq!(mocks.prompter.alerts.borrow().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_reorder_failures_keep_draft_open() -> Result<()> {
    let mut workout = create_test_workout();
    workout.id = None;
    let (engine, mocks) = create_test_engine(workout, None)?;

    assert_eq!(engine.save_reorder().await, Err(MutationError::ReorderClosed));
    engine.open_reorder();
    engine.move_reorder_item(0, 1);
    assert_eq!(engine.save_reorder().await, Err(MutationError::MissingWorkoutId));
    assert!(engine.reorder_error().is_some());

    // Declining the discard prompt keeps the dirty draft.
    mocks.prompter.answer(&[false]);
    assert!(!engine.request_close_reorder().await);
    assert!(engine.reorder_items().is_some());
    assert!(engine.request_close_reorder().await);
    assert!(engine.reorder_items().is_none());
    assert!(mocks.remote.updates.borrow().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_reorder_save_reports_error() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    mocks.remote.fail_update.set(true);
    engine.open_reorder();
    engine.move_reorder_item(0, 1);

    let err = engine.save_reorder().await.unwrap_err();
    assert!(matches!(err, MutationError::SaveFailed(_)));
    assert_eq!(engine.exercises()[0].name, "Bench Press");
    assert!(engine.reorder_error().is_some());
    Ok(())
}

#[tokio::test]
async fn test_failed_invite_is_alerted() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    engine.send_invite("friend").await?;
    mocks.remote.fail_invite.set(true);
    assert!(engine.send_invite("other").await.is_err());
    assert_eq!(*mocks.remote.invites.borrow(), vec!["friend".to_string()]);
    assert_eq!(mocks.prompter.alerts.borrow().len(), 1);
    Ok(())
}

// --- Finish Pipeline ---

#[tokio::test]
async fn test_offline_finish_is_queued_without_remote_call() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    log_set(&engine, SetKey::new(0, 0), "80", "8");
    mocks.network.set_online(false);
    mocks.prompter.answer(&[true, false]);

    let outcome = engine.finish_workout().await;
    assert!(matches!(outcome, FinishOutcome::Queued { show_report: false, .. }));
    assert!(mocks.remote.finished.borrow().is_empty());

    let jobs = mocks.store.jobs()?;
    assert_eq!(jobs.len(), 1);
    let payload: FinishPayload = serde_json::from_str(&jobs[0].payload)?;
    assert_eq!(payload.workout_title, "Push Day");
    assert_eq!(*mocks.listener.calls.borrow(), vec![(false, false)]);
    assert_eq!(engine.finish_state(), FinishState::Idle);
    assert!(!engine.is_finishing());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_finish_submits_once() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    mocks.network.set_online(false);

    let (first, second) = tokio::join!(engine.finish_workout(), engine.finish_workout());
    assert!(matches!(first, FinishOutcome::Queued { .. }));
    assert_eq!(second, FinishOutcome::Ignored);
    assert_eq!(mocks.store.jobs()?.len(), 1);
    assert_eq!(mocks.listener.calls.borrow().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_declined_finish_has_no_side_effects() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    mocks.prompter.answer(&[false]);

    assert_eq!(engine.finish_workout().await, FinishOutcome::Cancelled);
    assert!(mocks.remote.finished.borrow().is_empty());
    assert!(mocks.store.jobs()?.is_empty());
    assert!(mocks.store.read(DELOAD_HISTORY_KEY).is_none());
    assert!(mocks.listener.calls.borrow().is_empty());
    assert!(!engine.is_finishing());
    Ok(())
}

#[tokio::test]
async fn test_online_finish_records_history_and_requests_insights() -> Result<()> {
    let started = test_now() - Duration::minutes(45);
    let (engine, mocks) = create_test_engine(create_test_workout(), Some(started))?;
    log_set(&engine, SetKey::new(0, 0), "80", "8");
    log_set(&engine, SetKey::new(0, 1), "80", "6");
    *mocks.prompter.checkin.borrow_mut() = Some(PostCheckin {
        rpe: Some(8),
        ..PostCheckin::default()
    });

    let outcome = engine.finish_workout().await;
    assert_eq!(
        outcome,
        FinishOutcome::Submitted {
            show_report: true,
            insights_requested: true
        }
    );
    assert_eq!(*mocks.prompter.titles.borrow(), vec!["Finish workout", "Workout report"]);

    let finished = mocks.remote.finished.borrow();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].total_time, 45 * 60);
    assert_eq!(finished[0].post_checkin.as_ref().and_then(|c| c.rpe), Some(8));
    assert_eq!(*mocks.remote.insights.borrow(), vec!["w-1".to_string()]);

    let local = ReportHistory::read_from(mocks.store.as_ref(), DELOAD_HISTORY_KEY).0;
    let bench = local.series("bench press");
    assert_eq!(bench.len(), 1);
    assert_eq!(bench[0].total_volume, 80.0 * 8.0 + 80.0 * 6.0);
    assert_eq!(*mocks.listener.calls.borrow(), vec![(false, true)]);
    Ok(())
}

#[tokio::test]
async fn test_short_session_can_skip_history() -> Result<()> {
    let started = test_now() - Duration::minutes(10);
    let (engine, mocks) = create_test_engine(create_test_workout(), Some(started))?;
    log_set(&engine, SetKey::new(0, 0), "80", "8");
    mocks.prompter.answer(&[true, false, true]);

    let outcome = engine.finish_workout().await;
    assert_eq!(outcome, FinishOutcome::NotRecorded { show_report: true });
    assert_eq!(
        *mocks.prompter.titles.borrow(),
        vec!["Finish workout", "Short session", "Workout report"]
    );
    assert_eq!(mocks.prompter.checkin_calls.get(), 0);
    assert!(mocks.store.read(DELOAD_HISTORY_KEY).is_none());
    assert!(mocks.remote.finished.borrow().is_empty());
    assert!(mocks.store.jobs()?.is_empty());
    assert!(mocks.remote.insights.borrow().is_empty());
    assert_eq!(*mocks.listener.calls.borrow(), vec![(false, true)]);
    assert!(!engine.is_finishing());
    Ok(())
}

#[tokio::test]
async fn test_short_session_offline_skip_queues_nothing() -> Result<()> {
    let started = test_now() - Duration::minutes(10);
    let (engine, mocks) = create_test_engine(create_test_workout(), Some(started))?;
    mocks.network.set_online(false);
    mocks.prompter.answer(&[true, false, false]);

    let outcome = engine.finish_workout().await;
    assert_eq!(outcome, FinishOutcome::NotRecorded { show_report: false });
    assert!(mocks.store.jobs()?.is_empty());
    assert!(mocks.remote.finished.borrow().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_submit_alerts_and_keeps_payload() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    mocks.remote.fail_finish.set(Some(500));

    let outcome = engine.finish_workout().await;
    match outcome {
        FinishOutcome::SubmitFailed { job_id, show_report, .. } => {
            assert!(job_id.is_some());
            assert!(show_report);
        }
        other => panic!("expected a failed submit, got {other:?}"),
    }
    let jobs = mocks.store.jobs()?;
    assert_eq!(jobs.len(), 1);
    let queued: FinishPayload = serde_json::from_str(&jobs[0].payload)?;
    let posted = mocks.remote.finished.borrow();
    assert_eq!(posted.len(), 1);
    assert!(!queued.idempotency_key.is_empty());
    assert_eq!(queued.idempotency_key, posted[0].idempotency_key);

    assert_eq!(mocks.prompter.alerts.borrow().len(), 1);
    assert!(mocks.remote.insights.borrow().is_empty());
    assert_eq!(mocks.listener.calls.borrow().len(), 1);
    assert!(!engine.is_finishing());
    Ok(())
}

#[tokio::test]
async fn test_rejected_submit_is_alerted_and_not_queued() -> Result<()> {
    let (engine, mocks) = create_test_engine(create_test_workout(), None)?;
    mocks.remote.fail_finish.set(Some(422));

    let outcome = engine.finish_workout().await;
    match outcome {
        FinishOutcome::SubmitFailed { job_id, .. } => assert!(job_id.is_none()),
        other => panic!("expected a failed submit, got {other:?}"),
    }
    assert!(mocks.store.jobs()?.is_empty());
    let alerts = mocks.prompter.alerts.borrow();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("rejected"));
    assert!(!alerts[0].contains("next sync"));
    assert_eq!(mocks.listener.calls.borrow().len(), 1);
    Ok(())
}
