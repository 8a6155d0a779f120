//src/log_store.rs
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::debug;

use crate::model::{SetKey, SetLog, SetLogPatch};

/// Receives every committed change to the session's set logs.
pub trait LogSink {
    fn on_log_updated(&self, key: SetKey, log: &SetLog);

    fn on_log_removed(&self, _key: SetKey) {}
}

/// Per-set execution records of one session, keyed by [`SetKey`].
///
/// Reads never fail: an absent key reads as an empty log. Writes are merges
/// and are forwarded to the configured [`LogSink`]. A store without a sink is
/// a read-only view and silently ignores updates, so set editing can never
/// crash an in-progress workout.
#[derive(Default)]
pub struct LogStore {
    entries: BTreeMap<SetKey, SetLog>,
    sink: Option<Rc<dyn LogSink>>,
}

impl LogStore {
    #[must_use]
    pub fn new(sink: Option<Rc<dyn LogSink>>) -> Self {
        Self {
            entries: BTreeMap::new(),
            sink,
        }
    }

    #[must_use]
    pub fn get_log(&self, key: SetKey) -> SetLog {
        self.entries.get(&key).cloned().unwrap_or_default()
    }

    /// Merges `patch` onto the current log for `key`.
    /// Returns `false` (and changes nothing) when no sink is configured.
    pub fn update_log(&mut self, key: SetKey, patch: SetLogPatch) -> bool {
        let Some(sink) = self.sink.clone() else {
            debug!("Ignoring log update for {key}: no sink configured");
            return false;
        };
        let log = self.entries.entry(key).or_default();
        log.merge(patch);
        sink.on_log_updated(key, log);
        true
    }

    /// Removes logs of `exercise` for set indices in `from..to`.
    /// Returns the number of entries actually removed.
    pub fn remove_sets(&mut self, exercise: usize, from: usize, to: usize) -> usize {
        let mut removed = 0;
        for set in from..to {
            let key = SetKey::new(exercise, set);
            if self.entries.remove(&key).is_some() {
                removed += 1;
                if let Some(sink) = &self.sink {
                    sink.on_log_removed(key);
                }
            }
        }
        removed
    }

    /// Moves logs along with their exercises after a reorder.
    /// `new_to_old[i]` is the previous index of the exercise now at `i`.
    pub fn reorder_exercises(&mut self, new_to_old: &[usize]) {
        let old_to_new: BTreeMap<usize, usize> = new_to_old
            .iter()
            .enumerate()
            .map(|(new, old)| (*old, new))
            .collect();
        let previous = std::mem::take(&mut self.entries);
        for (key, log) in previous {
            let exercise = old_to_new.get(&key.exercise).copied().unwrap_or(key.exercise);
            let moved = SetKey::new(exercise, key.set);
            if moved != key {
                if let Some(sink) = &self.sink {
                    sink.on_log_removed(key);
                    sink.on_log_updated(moved, &log);
                }
            }
            self.entries.insert(moved, log);
        }
    }

    #[must_use]
    pub const fn entries(&self) -> &BTreeMap<SetKey, SetLog> {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        updates: RefCell<Vec<(SetKey, SetLog)>>,
    }

    impl LogSink for RecordingSink {
        fn on_log_updated(&self, key: SetKey, log: &SetLog) {
            self.updates.borrow_mut().push((key, log.clone()));
        }
    }

    fn patch_weight(w: &str) -> SetLogPatch {
        SetLogPatch {
            weight: Some(w.to_string()),
            ..SetLogPatch::default()
        }
    }

    #[test]
    fn absent_key_reads_as_empty_log() {
        let store = LogStore::new(None);
        assert_eq!(store.get_log(SetKey::new(0, 0)), SetLog::default());
        assert!(store.is_empty());
    }

    #[test]
    fn updates_without_sink_are_ignored() {
        let mut store = LogStore::new(None);
        assert!(!store.update_log(SetKey::new(0, 0), patch_weight("50")));
        assert!(store.is_empty());
    }

    #[test]
    fn updates_merge_and_reach_the_sink() {
        let sink = Rc::new(RecordingSink::default());
        let mut store = LogStore::new(Some(sink.clone()));
        let key = SetKey::new(1, 2);

        store.update_log(key, patch_weight("50"));
        store.update_log(
            key,
            SetLogPatch {
                reps: Some("8".into()),
                ..SetLogPatch::default()
            },
        );
        store.update_log(key, patch_weight("55"));

        let log = store.get_log(key);
        assert_eq!(log.weight.as_deref(), Some("55"));
        assert_eq!(log.reps.as_deref(), Some("8"));
        assert_eq!(sink.updates.borrow().len(), 3);
        assert_eq!(store.get_log(SetKey::new(1, 3)), SetLog::default());
    }

    #[test]
    fn remove_and_reorder_follow_exercises() {
        let sink = Rc::new(RecordingSink::default());
        let mut store = LogStore::new(Some(sink));
        for ex in 0..2 {
            for set in 0..3 {
                store.update_log(SetKey::new(ex, set), patch_weight(&format!("{ex}{set}")));
            }
        }
        assert_eq!(store.remove_sets(0, 1, 5), 2);
        store.reorder_exercises(&[1, 0]);
        assert_eq!(store.get_log(SetKey::new(1, 0)).weight.as_deref(), Some("00"));
        assert_eq!(store.get_log(SetKey::new(0, 2)).weight.as_deref(), Some("12"));
        assert_eq!(store.len(), 4);
    }
}
